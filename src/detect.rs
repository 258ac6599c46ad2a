use std::{path::Path, sync::atomic::AtomicBool};

use image::RgbaImage;

use crate::{
    config::{HolisticConfig, OutputStreams, ResolvedConfig},
    error::{HolisticError, Result},
    gesture,
    pipeline::{HolisticEngine, HolisticSmoother, OrtEngine, preview, skeleton},
    types::{DetectResult, Frame, HolisticOutput},
};

/// Loaded graph plus the per-session state that goes with it.
struct ActiveGraph {
    engine: Box<dyn HolisticEngine>,
    streams: OutputStreams,
    config: HolisticConfig,
    smoother: HolisticSmoother,
}

impl ActiveGraph {
    fn process(&mut self, frame: &Frame) -> Result<(DetectResult, HolisticOutput)> {
        let mut output = self.engine.infer(frame)?;
        self.smoother.apply(&mut output, frame.timestamp);

        let result = gesture::recognize(&output, self.config.thresholds.visibility);
        if !self.streams.pose {
            output.pose = None;
        }

        if self.streams.video {
            let mut image = RgbaImage::from_raw(frame.width, frame.height, frame.rgba.clone())
                .ok_or(HolisticError::InvalidArgument("frame buffer does not match its size"))?;
            skeleton::annotate(&mut image, &output, self.config.thresholds.visibility);
            output.annotated = Some(image);
        }

        log::debug!(
            "frame {}x{} -> codes {:?}",
            frame.width,
            frame.height,
            result.codes()
        );
        Ok((result, output))
    }

    fn show(&self, output: &HolisticOutput) -> Result<bool> {
        match &output.annotated {
            Some(image) => Ok(preview::show(&self.config.camera.window_title, image)?),
            None => {
                log::warn!("video output stream is disabled, nothing to show");
                Ok(true)
            }
        }
    }
}

/// The process-wide holistic tracker. At most one graph is loaded at a time.
pub struct HolisticTrackingDetect {
    active: Option<ActiveGraph>,
}

impl Default for HolisticTrackingDetect {
    fn default() -> Self {
        Self::new()
    }
}

impl HolisticTrackingDetect {
    pub const fn new() -> Self {
        Self { active: None }
    }

    pub fn is_initialized(&self) -> bool {
        self.active.is_some()
    }

    /// Loads the models for `streams` from `model_path`, replacing any graph
    /// that is already loaded.
    pub fn init_model(&mut self, model_path: &Path, streams: OutputStreams) -> Result<()> {
        self.init_from(model_path, streams, |resolved, streams| {
            let engine: Box<dyn HolisticEngine> = Box::new(OrtEngine::new(resolved, streams)?);
            Ok(engine)
        })
    }

    pub(crate) fn init_from<F>(
        &mut self,
        model_path: &Path,
        streams: OutputStreams,
        build_engine: F,
    ) -> Result<()>
    where
        F: FnOnce(&ResolvedConfig, OutputStreams) -> anyhow::Result<Box<dyn HolisticEngine>>,
    {
        if self.active.is_some() {
            log::info!("re-initializing, releasing the current graph first");
            self.release()?;
        }

        let resolved = HolisticConfig::resolve(model_path)?;
        let engine = build_engine(&resolved, streams)?;
        self.init_with_engine(engine, resolved.config, streams);
        log::info!(
            "holistic tracking initialized from {} with streams {:?}",
            model_path.display(),
            streams
        );
        Ok(())
    }

    pub(crate) fn init_with_engine(
        &mut self,
        engine: Box<dyn HolisticEngine>,
        config: HolisticConfig,
        streams: OutputStreams,
    ) {
        let smoother = HolisticSmoother::new(config.smoothing.clone());
        self.active = Some(ActiveGraph {
            engine,
            streams,
            config,
            smoother,
        });
    }

    fn graph(&mut self) -> Result<&mut ActiveGraph> {
        self.active.as_mut().ok_or(HolisticError::NotInitialized)
    }

    pub fn detect_image_direct(&mut self, frame: &Frame, show: bool) -> Result<DetectResult> {
        let graph = self.graph()?;
        let (result, output) = graph.process(frame)?;
        if show {
            graph.show(&output)?;
        }
        Ok(result)
    }

    pub fn detect_image(&mut self, frame: &Frame) -> Result<(DetectResult, HolisticOutput)> {
        self.graph()?.process(frame)
    }

    /// Runs until `stop` is raised, the preview window is closed or the
    /// camera goes away.
    #[cfg(feature = "camera-nokhwa")]
    pub fn detect_camera(&mut self, show: bool, stop: &AtomicBool) -> Result<()> {
        use std::{sync::atomic::Ordering, time::Duration};

        use crate::pipeline::{CameraPoll, CameraStream, camera_label};

        let graph = self.graph()?;
        let index = graph.config.camera.index;
        match camera_label(index) {
            Some(label) => log::info!("starting camera {index}: {label}"),
            None => log::info!("starting camera {index}"),
        }
        if show && !graph.streams.video {
            log::warn!("video output stream is disabled, the camera preview stays hidden");
        }

        let stream =
            CameraStream::open(index).map_err(|err| HolisticError::Camera(format!("{err:#}")))?;
        graph.smoother.reset();

        let mut processed = 0u64;
        let outcome = loop {
            if stop.load(Ordering::SeqCst) {
                log::info!("camera loop stopped after {processed} frames");
                break Ok(());
            }

            let frame = match stream.poll(Duration::from_millis(100)) {
                CameraPoll::Frame(frame) => frame,
                CameraPoll::Idle => continue,
                CameraPoll::Closed if processed > 0 => {
                    log::warn!("camera disconnected after {processed} frames");
                    break Ok(());
                }
                CameraPoll::Closed => {
                    break Err(HolisticError::Camera("camera produced no frames".to_string()));
                }
            };

            let (_result, output) = match graph.process(&frame) {
                Ok(done) => done,
                Err(err) => {
                    log::warn!("camera frame detection failed: {err}");
                    continue;
                }
            };
            processed += 1;

            if show && graph.streams.video {
                match graph.show(&output) {
                    Ok(true) => {}
                    Ok(false) => {
                        log::info!("preview window closed");
                        break Ok(());
                    }
                    Err(err) => break Err(err),
                }
            }
        };

        stream.stop();
        preview::close();
        graph.smoother.reset();
        outcome
    }

    #[cfg(not(feature = "camera-nokhwa"))]
    pub fn detect_camera(&mut self, _show: bool, _stop: &AtomicBool) -> Result<()> {
        self.graph()?;
        Err(HolisticError::Camera(
            "built without the camera-nokhwa feature".to_string(),
        ))
    }

    pub fn release(&mut self) -> Result<()> {
        let graph = self.active.take().ok_or(HolisticError::NotInitialized)?;
        drop(graph);
        preview::close();
        log::info!("holistic tracking released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;
    use crate::types::{
        HAND_LANDMARKS, HandLandmarks, Handedness, Landmark, POSE_LANDMARKS, PoseLandmarks,
    };

    struct FakeEngine {
        output: HolisticOutput,
        fail: bool,
    }

    impl HolisticEngine for FakeEngine {
        fn infer(&mut self, frame: &Frame) -> anyhow::Result<HolisticOutput> {
            if self.fail {
                return Err(anyhow!("inference failed"));
            }
            let mut output = self.output.clone();
            output.width = frame.width;
            output.height = frame.height;
            Ok(output)
        }
    }

    fn arms_up_pose() -> PoseLandmarks {
        let mut landmarks = vec![Landmark::new(32.0, 32.0, 0.0, 0.9); POSE_LANDMARKS];
        landmarks[15].y = 10.0;
        landmarks[16].y = 10.0;
        PoseLandmarks {
            landmarks,
            score: 0.9,
        }
    }

    fn fake_output() -> HolisticOutput {
        let mut output = HolisticOutput::empty(64, 48);
        output.pose = Some(arms_up_pose());
        output.left_hand = Some(HandLandmarks {
            landmarks: vec![Landmark::new(20.0, 20.0, 0.0, 1.0); HAND_LANDMARKS],
            score: 0.8,
            handedness: Handedness::Left,
        });
        output
    }

    fn detector(streams: OutputStreams, fail: bool) -> HolisticTrackingDetect {
        let mut config = HolisticConfig::default();
        config.smoothing.enabled = false;
        let mut detect = HolisticTrackingDetect::new();
        detect.init_with_engine(
            Box::new(FakeEngine {
                output: fake_output(),
                fail,
            }),
            config,
            streams,
        );
        detect
    }

    fn frame() -> Frame {
        Frame::new(vec![0u8; 64 * 48 * 4], 64, 48)
    }

    #[test]
    fn test_uninitialized_detector_rejects_calls() {
        let mut detect = HolisticTrackingDetect::new();
        assert!(!detect.is_initialized());
        assert!(matches!(
            detect.detect_image(&frame()),
            Err(HolisticError::NotInitialized)
        ));
        assert!(matches!(
            detect.release(),
            Err(HolisticError::NotInitialized)
        ));
    }

    #[test]
    fn test_detect_image_reports_codes_and_landmarks() {
        let mut detect = detector(OutputStreams::default(), false);
        let (result, output) = detect.detect_image(&frame()).unwrap();

        // Collapsed hand landmarks read as a closed fist.
        assert_eq!(result.codes(), [1, 1, 9, -1]);
        assert!(output.pose.is_some());
        assert!(output.left_hand.is_some());
        let annotated = output.annotated.expect("video stream renders a frame");
        assert_eq!(annotated.dimensions(), (64, 48));
    }

    #[test]
    fn test_disabled_streams_are_not_reported() {
        let streams = OutputStreams {
            video: false,
            pose: false,
            hand: true,
            face: false,
        };
        let mut detect = detector(streams, false);
        let (result, output) = detect.detect_image(&frame()).unwrap();

        // Arm states still come from the internally computed pose.
        assert_eq!(result.codes()[..2], [1, 1]);
        assert!(output.pose.is_none());
        assert!(output.annotated.is_none());
    }

    #[test]
    fn test_direct_detection_without_preview() {
        let mut detect = detector(OutputStreams::default(), false);
        let result = detect.detect_image_direct(&frame(), false).unwrap();
        assert_eq!(result.left_arm.code(), 1);
    }

    #[test]
    fn test_engine_failure_is_an_error() {
        let mut detect = detector(OutputStreams::default(), true);
        assert!(matches!(
            detect.detect_image(&frame()),
            Err(HolisticError::Engine(_))
        ));
        assert!(detect.is_initialized());
    }

    #[test]
    fn test_release_then_detect_fails() {
        let mut detect = detector(OutputStreams::default(), false);
        detect.release().unwrap();
        assert!(!detect.is_initialized());
        assert!(detect.detect_image(&frame()).is_err());
    }

    #[test]
    fn test_mismatched_frame_is_rejected_when_rendering() {
        let mut detect = detector(OutputStreams::default(), false);
        let bad = Frame::new(vec![0u8; 10], 64, 48);
        assert!(matches!(
            detect.detect_image(&bad),
            Err(HolisticError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_init_with_missing_model_dir_fails() {
        let mut detect = HolisticTrackingDetect::new();
        let missing = Path::new("/definitely/not/a/model/dir");
        assert!(matches!(
            detect.init_model(missing, OutputStreams::default()),
            Err(HolisticError::ModelPathMissing(_))
        ));
        assert!(!detect.is_initialized());
    }

    fn engine_reporting(hand_x: f32) -> Box<dyn HolisticEngine> {
        let mut output = fake_output();
        if let Some(hand) = output.left_hand.as_mut() {
            hand.landmarks = vec![Landmark::new(hand_x, 20.0, 0.0, 1.0); HAND_LANDMARKS];
        }
        Box::new(FakeEngine {
            output,
            fail: false,
        })
    }

    fn left_hand_x(detect: &mut HolisticTrackingDetect) -> f32 {
        let (_, output) = detect.detect_image(&frame()).unwrap();
        output.left_hand.unwrap().landmarks[0].x
    }

    #[test]
    fn test_second_init_replaces_loaded_graph() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("holistic.toml"),
            "[smoothing]\nenabled = false\n",
        )
        .unwrap();

        let mut detect = HolisticTrackingDetect::new();
        detect
            .init_from(dir.path(), OutputStreams::default(), |_, _| {
                Ok(engine_reporting(10.0))
            })
            .unwrap();
        assert_eq!(left_hand_x(&mut detect), 10.0);

        let mut built = 0;
        detect
            .init_from(dir.path(), OutputStreams::default(), |resolved, _| {
                built += 1;
                assert!(!resolved.config.smoothing.enabled);
                Ok(engine_reporting(30.0))
            })
            .unwrap();
        assert_eq!(built, 1);
        assert_eq!(left_hand_x(&mut detect), 30.0);

        detect.release().unwrap();
        assert!(matches!(
            detect.detect_image(&frame()),
            Err(HolisticError::NotInitialized)
        ));
        assert!(matches!(detect.release(), Err(HolisticError::NotInitialized)));
    }

    #[test]
    fn test_failed_reinit_leaves_nothing_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut detect = detector(OutputStreams::default(), false);

        let err = detect
            .init_from(dir.path(), OutputStreams::default(), |_, _| {
                Err(anyhow!("model rejected"))
            })
            .unwrap_err();
        assert!(matches!(err, HolisticError::Engine(_)));
        assert!(!detect.is_initialized());
    }
}
