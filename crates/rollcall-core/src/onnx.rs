//! ONNX Runtime bindings for the model and detector ports.
//!
//! `OnnxEmbeddingModel` runs a MobileFaceNet-style network taking NHWC
//! `[1, 112, 112, 3]` input. `ScrfdDetector` runs SCRFD on a letterboxed
//! 640×640 NCHW tensor and reports the strongest face, if any.

use crate::ports::{EmbeddingModel, FaceDetector, ModelError};
use crate::types::Detection;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
pub const DEFAULT_DETECTION_CONFIDENCE: f32 = 0.5;

fn open_session(model_path: &str) -> Result<Session, ModelError> {
    if !Path::new(model_path).exists() {
        return Err(ModelError::ModelNotFound(model_path.to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(model_path)?;

    tracing::info!(
        path = model_path,
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );

    Ok(session)
}

/// Face embedding network behind ONNX Runtime.
pub struct OnnxEmbeddingModel {
    session: Session,
}

impl OnnxEmbeddingModel {
    pub fn load(model_path: &str) -> Result<Self, ModelError> {
        Ok(Self {
            session: open_session(model_path)?,
        })
    }
}

impl EmbeddingModel for OnnxEmbeddingModel {
    fn invoke(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, ModelError> {
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InvocationFailed(format!("embedding extraction: {e}")))?;

        Ok(raw.to_vec())
    }
}

/// Scale and padding applied when fitting a frame into the detector input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let size = SCRFD_INPUT_SIZE as f32;
        let scale = (size / width as f32).min(size / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((size - new_w) / 2.0).floor(),
            pad_y: ((size - new_h) / 2.0).floor(),
        }
    }

    /// Map a point in detector input space back to the original frame.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions of one stride level: (score, keypoints).
type StrideOutputs = (usize, usize);

/// SCRFD face detector reduced to "is there a face, and where are its landmarks".
pub struct ScrfdDetector {
    session: Session,
    confidence_threshold: f32,
    outputs: [StrideOutputs; 3],
}

impl ScrfdDetector {
    pub fn load(model_path: &str, confidence_threshold: f32) -> Result<Self, ModelError> {
        let session = open_session(model_path)?;
        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        if names.len() < 9 {
            return Err(ModelError::InvocationFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                names.len()
            )));
        }

        let outputs = stride_outputs(&names);
        tracing::debug!(?outputs, "SCRFD output mapping");

        Ok(Self {
            session,
            confidence_threshold,
            outputs,
        })
    }

    fn input_tensor(image: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
        let (width, height) = image.dimensions();
        let new_w = ((width as f32 * letterbox.scale).round() as u32).max(1);
        let new_h = ((height as f32 * letterbox.scale).round() as u32).max(1);
        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

        // Zero is the normalized value of the padding colour (SCRFD_MEAN).
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
        let (off_x, off_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);

        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = (x as usize + off_x, y as usize + off_y);
            if tx >= SCRFD_INPUT_SIZE || ty >= SCRFD_INPUT_SIZE {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        tensor
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Option<Detection>, ModelError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(None);
        }

        let letterbox = Letterbox::fit(width, height);
        let input = Self::input_tensor(image, &letterbox);
        let threshold = self.confidence_threshold;
        let layout = self.outputs;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut best: Option<Detection> = None;

        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, kps_idx) = layout[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::InvocationFailed(format!("scores stride {stride}: {e}")))?;

            let Some((anchor, score)) = strongest_anchor(scores, threshold) else {
                continue;
            };
            if best.as_ref().is_some_and(|b| b.confidence >= score) {
                continue;
            }

            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::InvocationFailed(format!("kps stride {stride}: {e}")))?;

            best = Some(Detection {
                confidence: score,
                landmarks: decode_landmarks(kps, anchor, stride, &letterbox),
            });
        }

        if let Some(det) = &best {
            tracing::debug!(confidence = det.confidence, "face detected");
        }
        Ok(best)
    }
}

/// Map stride levels to output tensor positions by name (`score_8`, `kps_8`, ...),
/// falling back to the standard positional export order.
fn stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let mut mapped = [(0usize, 0usize); 3];
    for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("kps", stride)) {
            (Some(s), Some(k)) => mapped[pos] = (s, k),
            _ => {
                tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
                return [(0, 6), (1, 7), (2, 8)];
            }
        }
    }
    mapped
}

/// Highest-scoring anchor strictly above `threshold`.
fn strongest_anchor(scores: &[f32], threshold: f32) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .filter(|&(_, s)| s > threshold)
        .fold(None, |best: Option<(usize, f32)>, (i, s)| match best {
            Some((_, bs)) if bs >= s => best,
            _ => Some((i, s)),
        })
}

fn decode_landmarks(
    kps: &[f32],
    anchor: usize,
    stride: usize,
    letterbox: &Letterbox,
) -> Option<[(f32, f32); 5]> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let cell = anchor / SCRFD_ANCHORS_PER_CELL;
    let cx = (cell % grid_w) as f32 * stride as f32;
    let cy = (cell / grid_w) as f32 * stride as f32;

    let off = anchor * 10;
    let raw = kps.get(off..off + 10)?;

    let mut landmarks = [(0.0f32, 0.0f32); 5];
    for (i, lm) in landmarks.iter_mut().enumerate() {
        let x = cx + raw[i * 2] * stride as f32;
        let y = cy + raw[i * 2 + 1] * stride as f32;
        *lm = letterbox.unmap(x, y);
    }
    Some(landmarks)
}
