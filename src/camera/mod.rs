//! Camera capture module
//!
//! Cross-platform webcam capture using the nokhwa crate. Frames are captured
//! on a background thread and published into a single latest-frame slot; the
//! render thread polls the slot and never blocks on capture. The slot is
//! last-write-wins: a slow reader simply skips frames.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nokhwa::pixel_format::RgbAFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use parking_lot::Mutex;
use thiserror::Error;

/// Errors raised while opening or running a camera
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("failed to open camera {index}: {reason}")]
    Open { index: u32, reason: String },
    #[error("camera {0} produced no opening confirmation")]
    NoConfirmation(u32),
    #[error("failed to spawn capture thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// One captured camera frame
#[derive(Clone)]
pub struct CameraFrame {
    /// RGBA pixel data
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic frame number, starting at 1
    pub frame_number: u64,
    pub timestamp: Instant,
}

/// Information about an available camera
#[derive(Clone, Debug)]
pub struct CameraInfo {
    pub index: u32,
    pub name: String,
}

/// Camera capture interface
pub struct CameraCapture {
    /// Latest captured frame
    latest: Arc<Mutex<Option<CameraFrame>>>,
    /// Whether capture is running
    running: Arc<AtomicBool>,
    /// Capture thread handle
    thread_handle: Option<std::thread::JoinHandle<()>>,
    /// Frame counter
    frame_count: Arc<AtomicU64>,
}

impl CameraCapture {
    /// List available cameras
    pub fn list_cameras() -> Vec<CameraInfo> {
        match nokhwa::query(nokhwa::utils::ApiBackend::Auto) {
            Ok(camera_list) => camera_list
                .iter()
                .enumerate()
                .map(|(idx, info)| CameraInfo {
                    index: idx as u32,
                    name: info.human_name().to_string(),
                })
                .collect(),
            Err(e) => {
                log::warn!("Failed to enumerate cameras: {:?}", e);
                Vec::new()
            }
        }
    }

    /// Open a camera and start capturing.
    ///
    /// The camera is opened on the capture thread (some backends require it),
    /// but the open result is reported back synchronously so a denied or
    /// missing camera surfaces here as an error instead of a silent dead
    /// feed.
    pub fn new(camera_index: u32, width: u32, height: u32, fps: u32) -> Result<Self, CameraError> {
        let latest = Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(true));
        let frame_count = Arc::new(AtomicU64::new(0));

        let (opened_tx, opened_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);

        let latest_clone = latest.clone();
        let running_clone = running.clone();
        let frame_count_clone = frame_count.clone();

        let thread_handle = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || {
                Self::capture_thread(
                    camera_index,
                    CameraFormat::new_from(width, height, FrameFormat::MJPEG, fps),
                    latest_clone,
                    running_clone,
                    frame_count_clone,
                    opened_tx,
                );
            })?;

        match opened_rx.recv_timeout(Duration::from_secs(10)) {
            Ok(Ok(())) => Ok(Self {
                latest,
                running,
                thread_handle: Some(thread_handle),
                frame_count,
            }),
            Ok(Err(reason)) => {
                running.store(false, Ordering::Release);
                let _ = thread_handle.join();
                Err(CameraError::Open {
                    index: camera_index,
                    reason,
                })
            }
            Err(_) => {
                running.store(false, Ordering::Release);
                Err(CameraError::NoConfirmation(camera_index))
            }
        }
    }

    /// Camera capture thread
    fn capture_thread(
        camera_index: u32,
        format: CameraFormat,
        latest: Arc<Mutex<Option<CameraFrame>>>,
        running: Arc<AtomicBool>,
        frame_count: Arc<AtomicU64>,
        opened_tx: crossbeam_channel::Sender<Result<(), String>>,
    ) {
        log::info!(
            "Starting camera capture thread (camera {}, requested {})",
            camera_index,
            format
        );

        let index = CameraIndex::Index(camera_index);
        let requested = RequestedFormat::new::<RgbAFormat>(RequestedFormatType::Closest(format));

        let mut camera = match Camera::new(index.clone(), requested) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("Failed to open camera with requested format: {:?}", e);

                // Fall back to whatever format the backend picks
                let requested = RequestedFormat::new::<RgbAFormat>(RequestedFormatType::None);
                match Camera::new(index, requested) {
                    Ok(c) => c,
                    Err(e2) => {
                        let _ = opened_tx.send(Err(format!("{e2}")));
                        return;
                    }
                }
            }
        };

        if let Err(e) = camera.open_stream() {
            let _ = opened_tx.send(Err(format!("{e}")));
            return;
        }

        log::info!(
            "Camera opened: {} ({}x{})",
            camera.info().human_name(),
            camera.resolution().width(),
            camera.resolution().height()
        );
        let _ = opened_tx.send(Ok(()));

        while running.load(Ordering::Acquire) {
            match camera.frame() {
                Ok(frame) => match frame.decode_image::<RgbAFormat>() {
                    Ok(image) => {
                        let frame_number = frame_count.fetch_add(1, Ordering::Relaxed) + 1;
                        let camera_frame = CameraFrame {
                            data: image.into_raw(),
                            width: frame.resolution().width(),
                            height: frame.resolution().height(),
                            frame_number,
                            timestamp: Instant::now(),
                        };
                        *latest.lock() = Some(camera_frame);
                    }
                    Err(e) => {
                        log::warn!("Failed to decode frame: {:?}", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to capture frame: {:?}", e);
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }

        log::info!("Camera capture thread stopped");
    }

    /// Get the latest captured frame
    pub fn latest_frame(&self) -> Option<CameraFrame> {
        self.latest.lock().clone()
    }

    /// Check if capture is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Total frames captured so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    /// Stop capturing
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CameraCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
