//! Landmark detection engine
//!
//! Runs hand/face/pose landmark models via ONNX Runtime on a background
//! thread. Camera frames are fed in over a bounded channel and results are
//! published into a single latest-frame slot: one writer, one reader, the
//! writer simply overwrites and the reader never blocks. Stale reads are
//! expected when detection runs slower than rendering.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use ndarray::Array4;
use parking_lot::Mutex;
use thiserror::Error;

use crate::camera::CameraFrame;

use super::{LandmarkFrame, LandmarkModel, LandmarkPoint, TrackedObject};

/// Errors raised while setting up or running the detection engine
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("models directory not found; create a 'models' directory next to the executable")]
    ModelDirNotFound,
    #[error("landmark model not found: {0}")]
    ModelNotFound(PathBuf),
    #[error("onnx runtime: {0}")]
    Runtime(String),
    #[error("failed to spawn detection thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Frame data handed to the detection thread
struct DetectionInput {
    /// RGBA pixel data
    data: Vec<u8>,
    width: u32,
    height: u32,
    frame_number: u64,
}

/// Landmark detection engine
pub struct LandmarkEngine {
    /// Latest result from the detection thread
    latest: Arc<Mutex<LandmarkFrame>>,
    /// Channel to send frames to the detection thread
    frame_sender: Option<Sender<DetectionInput>>,
    /// Whether the model finished loading
    ready: Arc<AtomicBool>,
    /// Detection thread handle
    thread_handle: Option<std::thread::JoinHandle<()>>,
    model: LandmarkModel,
}

impl LandmarkEngine {
    /// Start the detection engine for the given model.
    ///
    /// The ONNX model is loaded on the detection thread; until loading
    /// completes `latest_frame` returns the empty frame and `is_ready`
    /// reports false. A model that fails to load leaves the engine in that
    /// state permanently, which callers treat as "no detection".
    pub fn new(model: LandmarkModel, max_tracked: u32) -> Result<Self, DetectorError> {
        let latest = Arc::new(Mutex::new(LandmarkFrame::default()));
        let ready = Arc::new(AtomicBool::new(false));

        // Detection runs slower than rendering; a shallow channel with
        // try_send drops frames rather than queueing them.
        let (frame_sender, frame_receiver) = crossbeam_channel::bounded::<DetectionInput>(2);

        let latest_clone = latest.clone();
        let ready_clone = ready.clone();

        let thread_handle = std::thread::Builder::new()
            .name("landmark-detect".to_string())
            .spawn(move || {
                Self::detection_thread(frame_receiver, latest_clone, ready_clone, model, max_tracked);
            })?;

        Ok(Self {
            latest,
            frame_sender: Some(frame_sender),
            ready,
            thread_handle: Some(thread_handle),
            model,
        })
    }

    /// Detection thread main loop
    fn detection_thread(
        frame_receiver: Receiver<DetectionInput>,
        latest: Arc<Mutex<LandmarkFrame>>,
        ready: Arc<AtomicBool>,
        model: LandmarkModel,
        max_tracked: u32,
    ) {
        log::info!("Landmark detection thread started ({})", model.display_name());

        let mut session = match Self::init_session(model) {
            Ok(s) => {
                ready.store(true, Ordering::Release);
                log::info!("Loaded {} landmark model", model.display_name());
                Some(s)
            }
            Err(e) => {
                log::warn!("Failed to load landmark model: {e}. Detection disabled.");
                None
            }
        };

        // Keep draining the channel even without a session so senders never
        // see a disconnected channel while the engine is alive.
        while let Ok(input) = frame_receiver.recv() {
            let Some(session) = session.as_mut() else {
                continue;
            };
            match Self::run_detection(session, &input, model, max_tracked) {
                Ok(frame) => {
                    *latest.lock() = frame;
                }
                Err(e) => {
                    log::warn!("Landmark inference error: {e}");
                }
            }
        }

        ready.store(false, Ordering::Release);
        log::info!("Landmark detection thread stopped");
    }

    /// Initialize ONNX Runtime and load the landmark model
    fn init_session(model: LandmarkModel) -> Result<ort::session::Session, DetectorError> {
        let model_dir = Self::find_model_dir()?;
        let model_path = model_dir.join(model.model_file());
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path));
        }

        ort::init()
            .with_name("FireflyMirror")
            .commit()
            .map_err(|e| DetectorError::Runtime(e.to_string()))?;

        let session = ort::session::Session::builder()
            .map_err(|e| DetectorError::Runtime(e.to_string()))?
            .with_intra_threads(2)
            .map_err(|e| DetectorError::Runtime(e.to_string()))?
            .commit_from_file(&model_path)
            .map_err(|e| DetectorError::Runtime(e.to_string()))?;

        log::info!("Loaded landmark model from {:?}", model_path);
        Ok(session)
    }

    /// Find the models directory: next to the executable, then the working
    /// directory.
    fn find_model_dir() -> Result<PathBuf, DetectorError> {
        if let Ok(exe_path) = std::env::current_exe() {
            let mut dir = exe_path.parent();
            while let Some(parent) = dir {
                let model_dir = parent.join("models");
                if model_dir.exists() {
                    return Ok(model_dir);
                }
                dir = parent.parent();
            }
        }

        let cwd = std::env::current_dir().map_err(|_| DetectorError::ModelDirNotFound)?;
        let model_dir = cwd.join("models");
        if model_dir.exists() {
            return Ok(model_dir);
        }

        Err(DetectorError::ModelDirNotFound)
    }

    /// Run one detection pass over a camera frame
    fn run_detection(
        session: &mut ort::session::Session,
        input: &DetectionInput,
        model: LandmarkModel,
        max_tracked: u32,
    ) -> Result<LandmarkFrame, DetectorError> {
        let (in_width, in_height) = model.input_size();

        let pixels = preprocess_frame_nhwc(input, in_width, in_height);
        let input_array = Array4::from_shape_vec(
            (1, in_height as usize, in_width as usize, 3),
            pixels,
        )
        .map_err(|e| DetectorError::Runtime(e.to_string()))?;

        let input_tensor = ort::value::Tensor::from_array(input_array)
            .map_err(|e| DetectorError::Runtime(e.to_string()))?;

        let outputs = session
            .run(ort::inputs![input_tensor])
            .map_err(|e| DetectorError::Runtime(e.to_string()))?;

        let output = outputs
            .iter()
            .next()
            .ok_or_else(|| DetectorError::Runtime("no output from landmark model".into()))?;

        let (_shape, data) = output
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::Runtime(e.to_string()))?;

        let objects = parse_landmarks(
            data,
            model.landmark_count() as usize,
            max_tracked as usize,
            in_width as f32,
            in_height as f32,
        );

        Ok(LandmarkFrame {
            objects,
            frame_number: input.frame_number,
        })
    }

    /// Send a camera frame for detection (non-blocking; drops the frame when
    /// the detection thread is busy)
    pub fn submit(&self, frame: &CameraFrame) {
        if let Some(ref sender) = self.frame_sender {
            let _ = sender.try_send(DetectionInput {
                data: frame.data.clone(),
                width: frame.width,
                height: frame.height,
                frame_number: frame.frame_number,
            });
        }
    }

    /// Get the most recent detection result, or the empty frame if nothing
    /// has been detected yet
    pub fn latest_frame(&self) -> LandmarkFrame {
        self.latest.lock().clone()
    }

    /// Whether the model is loaded and detection is running
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// The model this engine was started with
    pub fn model(&self) -> LandmarkModel {
        self.model
    }

    /// Stop the detection thread
    pub fn stop(&mut self) {
        // Drop the sender to signal the thread to stop
        self.frame_sender = None;
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LandmarkEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Resize to the model input and convert RGBA bytes to RGB float HWC in [0, 1]
fn preprocess_frame_nhwc(frame: &DetectionInput, target_width: u32, target_height: u32) -> Vec<f32> {
    let mut output = vec![0.0f32; (target_width * target_height * 3) as usize];

    let x_ratio = frame.width as f32 / target_width as f32;
    let y_ratio = frame.height as f32 / target_height as f32;

    for y in 0..target_height {
        for x in 0..target_width {
            let src_x = (x as f32 * x_ratio) as u32;
            let src_y = (y as f32 * y_ratio) as u32;
            let src_idx = ((src_y * frame.width + src_x) * 4) as usize;

            if src_idx + 2 < frame.data.len() {
                let out_idx = ((y * target_width + x) * 3) as usize;
                output[out_idx] = frame.data[src_idx] as f32 / 255.0;
                output[out_idx + 1] = frame.data[src_idx + 1] as f32 / 255.0;
                output[out_idx + 2] = frame.data[src_idx + 2] as f32 / 255.0;
            }
        }
    }

    output
}

/// Split a flat landmark tensor into tracked objects.
///
/// The landmark models emit coordinates in input-pixel scale as consecutive
/// (x, y, z) triples, one block of `landmark_count` triples per tracked
/// object; trailing partial blocks are discarded.
fn parse_landmarks(
    data: &[f32],
    landmark_count: usize,
    max_tracked: usize,
    in_width: f32,
    in_height: f32,
) -> Vec<TrackedObject> {
    let block = landmark_count * 3;
    if block == 0 {
        return Vec::new();
    }

    data.chunks_exact(block)
        .take(max_tracked)
        .map(|chunk| TrackedObject {
            points: chunk
                .chunks_exact(3)
                .map(|p| LandmarkPoint {
                    x: p[0] / in_width,
                    y: p[1] / in_height,
                    z: p[2] / in_width,
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_landmarks_blocks() {
        // Two objects of 2 landmarks each, plus a trailing partial block
        let data: Vec<f32> = vec![
            10.0, 20.0, 0.0, 30.0, 40.0, 0.0, // object 0
            50.0, 60.0, 0.0, 70.0, 80.0, 0.0, // object 1
            90.0, // partial, dropped
        ];
        let objects = parse_landmarks(&data, 2, 4, 100.0, 100.0);
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].points.len(), 2);
        assert!((objects[0].points[1].x - 0.3).abs() < 1e-6);
        assert!((objects[1].points[0].y - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_parse_landmarks_respects_max_tracked() {
        let data = vec![0.5f32; 3 * 3 * 4]; // four objects of 3 landmarks
        let objects = parse_landmarks(&data, 3, 2, 1.0, 1.0);
        assert_eq!(objects.len(), 2);
    }
}
