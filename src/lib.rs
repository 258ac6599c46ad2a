//! Holistic (pose, hand and face) landmark tracking behind a flat C ABI.
//!
//! Every export returns `1` on success and `0` on failure. Failures are logged
//! through the `log` facade; set `RUST_LOG` to see them.

pub mod config;
pub mod detect;
pub mod error;
pub mod gesture;
pub mod model_download;
pub mod pipeline;
pub mod types;

use std::{
    ffi::{CStr, c_char, c_int, c_void},
    panic::{self, AssertUnwindSafe},
    path::Path,
    slice,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

pub use config::{HolisticConfig, OutputStreams};
pub use detect::HolisticTrackingDetect;
pub use error::{HolisticError, Result};
pub use types::{
    ArmState, DetectResult, Frame, HandGesture, HolisticOutput, ImageFormat, RESULT_CODES_LEN,
    RESULT_DATA_LEN,
};

use pipeline::rgba_converter;

static DETECTOR: Mutex<HolisticTrackingDetect> = Mutex::new(HolisticTrackingDetect::new());

// Raised by Release before it waits for the detector lock, so a camera loop
// holding the lock on another thread winds down.
static CAMERA_STOP: AtomicBool = AtomicBool::new(false);

fn lock_detector() -> MutexGuard<'static, HolisticTrackingDetect> {
    DETECTOR.lock().unwrap_or_else(PoisonError::into_inner)
}

fn run_export<F>(name: &str, op: F) -> c_int
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(op)) {
        Ok(Ok(())) => 1,
        Ok(Err(err)) => {
            log::error!("{name} failed: {err}");
            0
        }
        Err(_) => {
            log::error!("{name} panicked");
            0
        }
    }
}

/// Copies a caller-owned pixel buffer into an RGBA frame.
///
/// # Safety
/// `image_data` must be null or point to at least
/// `format.buffer_len(width, height)` readable bytes.
unsafe fn host_frame(
    format: ImageFormat,
    width: c_int,
    height: c_int,
    image_data: *const c_void,
) -> Result<Frame> {
    if image_data.is_null() {
        return Err(HolisticError::InvalidArgument("image_data is null"));
    }
    if width <= 0 || height <= 0 {
        return Err(HolisticError::InvalidArgument("image size must be positive"));
    }
    let (width, height) = (width as u32, height as u32);
    let len = format.buffer_len(width, height);
    let data = unsafe { slice::from_raw_parts(image_data.cast::<u8>(), len) };
    let rgba = rgba_converter::convert_host_frame(format, data, width, height)?;
    Ok(Frame::new(rgba.rgba, rgba.width, rgba.height))
}

/// # Safety
/// `detect_result` must be null or point to [`RESULT_CODES_LEN`] writable `int`s.
unsafe fn write_codes(detect_result: *mut c_int, result: &DetectResult) {
    let out = unsafe { slice::from_raw_parts_mut(detect_result, RESULT_CODES_LEN) };
    out.copy_from_slice(&result.codes());
}

/// Loads the holistic graph.
///
/// `model_path` is a directory holding the model files (and optionally
/// `holistic.toml`) or the path of a TOML config next to the models. The
/// flags select which output streams the graph produces. A graph that is
/// already loaded is released first.
///
/// # Safety
/// `model_path` must be null or a valid NUL-terminated string.
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn MediapipeHolisticTrackingInit(
    model_path: *const c_char,
    is_need_video_outputstream: bool,
    is_need_pose_outputstream: bool,
    is_need_hand_outputstream: bool,
    is_need_face_outputstream: bool,
) -> c_int {
    let _ = env_logger::try_init();

    run_export("MediapipeHolisticTrackingInit", || {
        if model_path.is_null() {
            return Err(HolisticError::InvalidArgument("model_path is null"));
        }
        let path = unsafe { CStr::from_ptr(model_path) }
            .to_str()
            .map_err(|_| HolisticError::InvalidArgument("model_path is not valid UTF-8"))?;
        let streams = OutputStreams {
            video: is_need_video_outputstream,
            pose: is_need_pose_outputstream,
            hand: is_need_hand_outputstream,
            face: is_need_face_outputstream,
        };

        let mut detector = lock_detector();
        CAMERA_STOP.store(false, Ordering::SeqCst);
        detector.init_model(Path::new(path), streams)
    })
}

/// Detects one packed BGR frame and writes the four result codes.
///
/// # Safety
/// `image_data` must point to `image_width * image_height * 3` readable
/// bytes and `detect_result` to four writable `int`s; either may be null, in
/// which case the call fails.
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn MediapipeHolisticTrackingDetectFrameDirect(
    image_width: c_int,
    image_height: c_int,
    image_data: *mut c_void,
    detect_result: *mut c_int,
    show_result_image: bool,
) -> c_int {
    run_export("MediapipeHolisticTrackingDetectFrameDirect", || {
        if detect_result.is_null() {
            return Err(HolisticError::InvalidArgument("detect_result is null"));
        }
        let mut detector = lock_detector();
        if !detector.is_initialized() {
            return Err(HolisticError::NotInitialized);
        }
        let frame = unsafe { host_frame(ImageFormat::Bgr, image_width, image_height, image_data) }?;
        let result = detector.detect_image_direct(&frame, show_result_image)?;
        unsafe { write_codes(detect_result, &result) };
        Ok(())
    })
}

/// Detects one frame in the pixel layout tagged by `type` and writes the
/// result codes plus, when `detect_result_data` is not null, the
/// [`RESULT_DATA_LEN`] float landmark payload.
///
/// # Safety
/// `image_data` must hold a full frame in the tagged layout,
/// `detect_result` must point to four writable `int`s and
/// `detect_result_data` must be null or point to [`RESULT_DATA_LEN`]
/// writable `float`s.
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn MediapipeHolisticTrackingDetectFrame(
    image_width: c_int,
    image_height: c_int,
    r#type: c_int,
    image_data: *mut c_void,
    detect_result: *mut c_int,
    detect_result_data: *mut c_void,
) -> c_int {
    run_export("MediapipeHolisticTrackingDetectFrame", || {
        if detect_result.is_null() {
            return Err(HolisticError::InvalidArgument("detect_result is null"));
        }
        let format = ImageFormat::from_raw(r#type).ok_or(HolisticError::UnsupportedFormat(r#type))?;
        let mut detector = lock_detector();
        if !detector.is_initialized() {
            return Err(HolisticError::NotInitialized);
        }
        let frame = unsafe { host_frame(format, image_width, image_height, image_data) }?;
        let (result, output) = detector.detect_image(&frame)?;

        unsafe { write_codes(detect_result, &result) };
        if !detect_result_data.is_null() {
            let data = unsafe {
                slice::from_raw_parts_mut(detect_result_data.cast::<f32>(), RESULT_DATA_LEN)
            };
            output.pack_into(data);
        }
        Ok(())
    })
}

/// Runs detection on the configured camera until Release is called, the
/// preview window is closed or the camera disconnects. Blocks the caller.
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub extern "C" fn MediapipeHolisticTrackingDetectCamera(show_image: bool) -> c_int {
    run_export("MediapipeHolisticTrackingDetectCamera", || {
        lock_detector().detect_camera(show_image, &CAMERA_STOP)
    })
}

/// Releases the graph. Fails when nothing is loaded.
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub extern "C" fn MediapipeHolisticTrackingRelease() -> c_int {
    run_export("MediapipeHolisticTrackingRelease", || {
        CAMERA_STOP.store(true, Ordering::SeqCst);
        lock_detector().release()
    })
}
