use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    query,
    utils::{ApiBackend, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
};

use super::rgba_converter;
use crate::types::Frame;

// macOS built-in cameras often reject YUYV even though it is reported.
const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
    FrameFormat::RAWRGB,
    FrameFormat::RAWBGR,
    FrameFormat::GRAY,
    FrameFormat::YUYV,
    FrameFormat::NV12,
    FrameFormat::MJPEG,
];

// Consecutive failed reads after which the camera counts as unplugged.
const MAX_READ_FAILURES: u32 = 30;

fn requested_formats() -> [RequestedFormat<'static>; 4] {
    [
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestFrameRate,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestResolution,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
    ]
}

/// Outcome of waiting on the capture thread for one frame.
#[derive(Debug)]
pub enum CameraPoll {
    Frame(Frame),
    Idle,
    Closed,
}

/// A camera captured on a background thread. Only the newest frame is
/// kept, so a slow consumer always sees the latest image.
#[derive(Debug)]
pub struct CameraStream {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    frames: Receiver<Frame>,
}

impl CameraStream {
    /// Opens camera `index` and starts capturing. Fails if the device cannot
    /// be opened in any supported format.
    pub fn open(index: u32) -> Result<Self> {
        let (frame_tx, frames) = bounded(1);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let stop = Arc::new(AtomicBool::new(false));

        let stale = frames.clone();
        let stop_flag = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("camera-{index}"))
            .spawn(move || {
                // nokhwa cameras are not Send, so the device lives on this thread.
                let camera = match build_camera(CameraIndex::Index(index)) {
                    Ok(camera) => {
                        let _ = ready_tx.send(Ok(()));
                        camera
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                log::info!("camera {index} streaming {:?}", camera.camera_format());
                capture_loop(camera, &stop_flag, &frame_tx, &stale);
            })
            .context("failed to spawn camera thread")?;

        ready_rx
            .recv()
            .context("camera thread exited before opening the device")??;

        Ok(Self {
            stop,
            handle: Some(handle),
            frames,
        })
    }

    pub fn poll(&self, timeout: Duration) -> CameraPoll {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => CameraPoll::Frame(frame),
            Err(RecvTimeoutError::Timeout) => CameraPoll::Idle,
            Err(RecvTimeoutError::Disconnected) => CameraPoll::Closed,
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Human readable name of the camera at `index`, if one is attached.
pub fn camera_label(index: u32) -> Option<String> {
    let cameras = match query(ApiBackend::Auto) {
        Ok(cameras) => cameras,
        Err(err) => {
            log::warn!("failed to enumerate cameras: {err:?}");
            return None;
        }
    };
    cameras
        .into_iter()
        .find(|info| info.index() == &CameraIndex::Index(index))
        .map(|info| info.human_name())
}

fn build_camera(index: CameraIndex) -> Result<Camera> {
    let mut last_err = None;

    for requested in requested_formats() {
        match Camera::new(index.clone(), requested) {
            Ok(mut camera) => match camera.open_stream() {
                Ok(()) => return Ok(camera),
                Err(err) => last_err = Some(err.into()),
            },
            Err(err) => last_err = Some(err.into()),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("failed to open camera with any supported format")))
}

/// Reads until stopped or the device keeps failing. Returning drops the only
/// sender, which the consumer sees as [`CameraPoll::Closed`].
fn capture_loop(
    mut camera: Camera,
    stop: &AtomicBool,
    frame_tx: &Sender<Frame>,
    stale: &Receiver<Frame>,
) {
    let mut failures = 0u32;

    while !stop.load(Ordering::Relaxed) {
        let buffer = match camera.frame() {
            Ok(buffer) => buffer,
            Err(err) => {
                failures += 1;
                if failures >= MAX_READ_FAILURES {
                    log::error!("camera stopped delivering frames: {err:?}");
                    break;
                }
                log::warn!("camera frame read failed: {err:?}");
                continue;
            }
        };
        failures = 0;

        let converted = match rgba_converter::convert_camera_frame(&buffer) {
            Ok(rgba) => rgba,
            Err(err) => {
                log::warn!("failed to decode camera frame {err:?}");
                continue;
            }
        };

        publish_latest(
            frame_tx,
            stale,
            Frame {
                rgba: converted.rgba,
                width: converted.width,
                height: converted.height,
                timestamp: Instant::now(),
            },
        );
    }

    if let Err(err) = camera.stop_stream() {
        log::warn!("failed to stop camera stream: {err:?}");
    }
}

/// Replaces an unread frame instead of queueing behind it.
fn publish_latest(frame_tx: &Sender<Frame>, stale: &Receiver<Frame>, frame: Frame) {
    if let Err(TrySendError::Full(frame)) = frame_tx.try_send(frame) {
        let _ = stale.try_recv();
        let _ = frame_tx.try_send(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32) -> Frame {
        Frame::new(vec![0u8; width as usize * 4], width, 1)
    }

    #[test]
    fn test_publish_latest_keeps_newest_frame() {
        let (tx, rx) = bounded(1);
        publish_latest(&tx, &rx, frame(1));
        publish_latest(&tx, &rx, frame(2));
        publish_latest(&tx, &rx, frame(3));

        assert_eq!(rx.try_recv().unwrap().width, 3);
        assert!(rx.try_recv().is_err());
    }
}
