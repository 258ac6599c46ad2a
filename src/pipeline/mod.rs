#[cfg(feature = "camera-nokhwa")]
pub mod camera;
pub mod preview;
pub mod recognizer;
pub mod rgba_converter;
pub mod skeleton;
pub mod smoothing;

#[cfg(feature = "camera-nokhwa")]
pub use camera::{CameraPoll, CameraStream, camera_label};
pub(crate) use recognizer::{HolisticEngine, OrtEngine};
pub use smoothing::HolisticSmoother;
