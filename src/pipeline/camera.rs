use std::time::Duration;

use thiserror::Error;

use crate::types::LatestFrame;

pub const PREFERRED_WIDTH: u32 = 1280;
pub const PREFERRED_HEIGHT: u32 = 720;

/// What a caller asks the platform for when acquiring a camera.
///
/// Desktop capture backends have no facing mode, so the operator-facing
/// camera is chosen by index (0 is the built-in one).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConstraints {
    pub camera_index: u32,
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub audio: bool,
}

impl Default for StreamConstraints {
    fn default() -> Self {
        Self {
            camera_index: 0,
            ideal_width: PREFERRED_WIDTH,
            ideal_height: PREFERRED_HEIGHT,
            audio: false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("no camera found: {0}")]
    DeviceNotFound(String),
    #[error("camera is busy: {0}")]
    DeviceBusy(String),
    #[error("camera stream failed to start playing: {0}")]
    PlaybackFailure(String),
    #[error("camera access failed: {0}")]
    Other(String),
}

impl CaptureError {
    /// Short message suitable for showing to an operator.
    pub fn user_message(&self) -> &'static str {
        match self {
            CaptureError::PermissionDenied(_) => "Camera permission denied",
            CaptureError::DeviceNotFound(_) => "No camera found",
            CaptureError::DeviceBusy(_) => "Camera is in use",
            CaptureError::PlaybackFailure(_) => "Failed to play video",
            CaptureError::Other(_) => "Failed to access camera",
        }
    }
}

/// Sorts a backend error message into the acquisition error taxonomy.
///
/// Platform camera APIs mostly report failures as strings, so this matches
/// on the wording drivers and OS permission layers actually use.
pub fn classify_device_error(message: &str) -> CaptureError {
    let lowered = message.to_ascii_lowercase();
    let detail = message.to_string();

    if ["permission", "denied", "not authorized", "unauthorized", "eacces"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        CaptureError::PermissionDenied(detail)
    } else if ["busy", "in use", "ebusy", "locked"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        CaptureError::DeviceBusy(detail)
    } else if ["not found", "no such", "no camera", "no device", "enoent", "enodev"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        CaptureError::DeviceNotFound(detail)
    } else {
        CaptureError::Other(detail)
    }
}

#[derive(Clone, Debug)]
pub struct CameraDevice {
    pub index: u32,
    pub label: String,
}

/// Permission-gated access to capture hardware.
pub trait MediaDevices: Send + Sync + 'static {
    fn open_stream(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn MediaStream>, CaptureError>;
}

/// A live, exclusively owned camera stream.
pub trait MediaStream: Send {
    /// Blocks until the first frame is available for rendering.
    fn wait_until_playing(&mut self, timeout: Duration) -> Result<(), CaptureError>;

    /// Handle to the stream's most recent frame.
    fn frames(&self) -> LatestFrame;

    /// Stops every track and detaches the frame slot. Safe to call twice.
    fn stop_tracks(&mut self);

    fn label(&self) -> &str;
}

#[cfg(feature = "camera-nokhwa")]
pub use self::native::{NokhwaDevices, available_cameras};

#[cfg(feature = "camera-nokhwa")]
mod native {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::{Duration, Instant},
    };

    use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
    use nokhwa::{
        Camera,
        pixel_format::RgbFormat,
        query,
        utils::{
            ApiBackend, CameraFormat, CameraIndex, CameraInfo, FrameFormat, RequestedFormat,
            RequestedFormatType, Resolution,
        },
    };

    use super::{CameraDevice, CaptureError, MediaDevices, MediaStream, StreamConstraints};
    use crate::{
        pipeline::rgb_converter,
        types::{Frame, LatestFrame},
    };

    // Prefer pixel formats that are widely supported on macOS (the built-in cameras
    // often reject YUYV even though Nokhwa reports it).
    const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
        FrameFormat::MJPEG,
        FrameFormat::RAWRGB,
        FrameFormat::RAWBGR,
        FrameFormat::YUYV,
        FrameFormat::NV12,
        FrameFormat::GRAY,
    ];

    // Consecutive read failures after which the stream is considered dead.
    const MAX_CONSECUTIVE_READ_FAILURES: u32 = 30;

    fn requested_formats(constraints: &StreamConstraints) -> [RequestedFormat<'static>; 3] {
        let ideal = CameraFormat::new(
            Resolution::new(constraints.ideal_width, constraints.ideal_height),
            FrameFormat::MJPEG,
            30,
        );
        [
            RequestedFormat::with_formats(
                RequestedFormatType::Closest(ideal),
                PREFERRED_PIXEL_FORMATS,
            ),
            RequestedFormat::with_formats(
                RequestedFormatType::AbsoluteHighestFrameRate,
                PREFERRED_PIXEL_FORMATS,
            ),
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
        ]
    }

    pub fn available_cameras() -> anyhow::Result<Vec<CameraDevice>> {
        let cameras = query(ApiBackend::Auto)?;
        Ok(cameras
            .into_iter()
            .enumerate()
            .map(|(position, info)| CameraDevice {
                index: camera_index_number(&info).unwrap_or(position as u32),
                label: info.human_name(),
            })
            .collect())
    }

    fn camera_index_number(info: &CameraInfo) -> Option<u32> {
        match info.index() {
            CameraIndex::Index(index) => Some(*index),
            CameraIndex::String(_) => None,
        }
    }

    fn build_camera(index: CameraIndex, constraints: &StreamConstraints) -> Result<Camera, CaptureError> {
        let mut last_err = None;

        for requested in requested_formats(constraints) {
            match Camera::new(index.clone(), requested) {
                Ok(mut camera) => match camera.open_stream() {
                    Ok(()) => return Ok(camera),
                    Err(err) => last_err = Some(super::classify_device_error(&err.to_string())),
                },
                Err(err) => last_err = Some(super::classify_device_error(&err.to_string())),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            CaptureError::Other("failed to open camera with any supported format".to_string())
        }))
    }

    /// Native capture devices through Nokhwa.
    #[derive(Clone, Debug, Default)]
    pub struct NokhwaDevices;

    impl NokhwaDevices {
        pub fn new() -> Self {
            Self
        }
    }

    impl MediaDevices for NokhwaDevices {
        fn open_stream(
            &self,
            constraints: &StreamConstraints,
        ) -> Result<Box<dyn MediaStream>, CaptureError> {
            if constraints.audio {
                return Err(CaptureError::Other(
                    "audio capture is not supported".to_string(),
                ));
            }
            let cameras =
                query(ApiBackend::Auto).map_err(|err| super::classify_device_error(&err.to_string()))?;
            let info = cameras
                .into_iter()
                .find(|info| camera_index_number(info) == Some(constraints.camera_index))
                .ok_or_else(|| {
                    CaptureError::DeviceNotFound(format!(
                        "no capture device at index {}",
                        constraints.camera_index
                    ))
                })?;

            let index = info.index().clone();
            // Fail fast before spawning the capture thread.
            drop(build_camera(index.clone(), constraints)?);

            Ok(Box::new(CameraStream::spawn(
                index,
                info.human_name(),
                constraints.clone(),
            )))
        }
    }

    #[derive(Debug)]
    pub struct CameraStream {
        label: String,
        frames: LatestFrame,
        stop: Arc<AtomicBool>,
        ready_rx: Receiver<Result<(), CaptureError>>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl CameraStream {
        fn spawn(index: CameraIndex, label: String, constraints: StreamConstraints) -> Self {
            let frames = LatestFrame::default();
            let stop = Arc::new(AtomicBool::new(false));
            let (ready_tx, ready_rx) = bounded(1);

            let handle = {
                let frames = frames.clone();
                let stop_flag = stop.clone();
                thread::spawn(move || capture_loop(index, constraints, frames, stop_flag, ready_tx))
            };

            Self {
                label,
                frames,
                stop,
                ready_rx,
                handle: Some(handle),
            }
        }

        fn shutdown(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
                log::info!("track stopped: {}", self.label);
            }
            self.frames.clear();
        }
    }

    impl MediaStream for CameraStream {
        fn wait_until_playing(&mut self, timeout: Duration) -> Result<(), CaptureError> {
            match self.ready_rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(CaptureError::PlaybackFailure(format!(
                    "no frame within {} ms",
                    timeout.as_millis()
                ))),
                Err(RecvTimeoutError::Disconnected) => Err(CaptureError::PlaybackFailure(
                    "capture thread exited before the first frame".to_string(),
                )),
            }
        }

        fn frames(&self) -> LatestFrame {
            self.frames.clone()
        }

        fn stop_tracks(&mut self) {
            self.shutdown();
        }

        fn label(&self) -> &str {
            &self.label
        }
    }

    impl Drop for CameraStream {
        fn drop(&mut self) {
            self.shutdown();
        }
    }

    /// The device can be grabbed by another process between the probe in
    /// `open_stream` and this thread's own open; keep the classified error.
    fn signal_open_failure(ready_tx: &Sender<Result<(), CaptureError>>, err: CaptureError) {
        log::error!("failed to open camera: {err:?}");
        let _ = ready_tx.try_send(Err(err));
    }

    fn capture_loop(
        index: CameraIndex,
        constraints: StreamConstraints,
        frames: LatestFrame,
        stop_flag: Arc<AtomicBool>,
        ready_tx: Sender<Result<(), CaptureError>>,
    ) {
        let mut camera = match build_camera(index, &constraints) {
            Ok(cam) => cam,
            Err(err) => {
                signal_open_failure(&ready_tx, err);
                return;
            }
        };

        let mut signalled_ready = false;
        let mut consecutive_failures = 0u32;

        while !stop_flag.load(Ordering::Relaxed) {
            let frame_start = Instant::now();
            let buffer = match camera.frame() {
                Ok(buffer) => buffer,
                Err(err) => {
                    consecutive_failures += 1;
                    log::warn!(
                        "camera frame read failed (after {:?}): {err:?}",
                        frame_start.elapsed()
                    );
                    if consecutive_failures >= MAX_CONSECUTIVE_READ_FAILURES {
                        let message = format!("camera stopped delivering frames: {err}");
                        if signalled_ready {
                            frames.report_fault(message);
                        } else {
                            let _ = ready_tx.try_send(Err(CaptureError::PlaybackFailure(message)));
                        }
                        break;
                    }
                    continue;
                }
            };
            consecutive_failures = 0;

            let converted = match rgb_converter::convert_camera_frame(&buffer) {
                Ok(rgb) => rgb,
                Err(err) => {
                    log::warn!("failed to decode camera frame {err:?}");
                    continue;
                }
            };

            frames.publish(Frame {
                rgb: converted.rgb,
                width: converted.width,
                height: converted.height,
                timestamp: Instant::now(),
            });

            if !signalled_ready {
                signalled_ready = true;
                log::info!("video playing");
                let _ = ready_tx.try_send(Ok(()));
            }
        }

        if let Err(err) = camera.stop_stream() {
            log::warn!("failed to stop camera stream: {err:?}");
        }
    }

}
