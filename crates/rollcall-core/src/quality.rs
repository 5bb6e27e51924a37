//! Pre-embedding quality gate: resolution and exposure checks.

use crate::preprocess;
use image::RgbImage;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MIN_WIDTH: u32 = 200;
pub const DEFAULT_MIN_HEIGHT: u32 = 200;
pub const DEFAULT_MIN_BRIGHTNESS: f32 = 0.2;
pub const DEFAULT_MAX_BRIGHTNESS: f32 = 0.8;

/// Reason an image was rejected by the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityIssue {
    ResolutionTooLow { width: u32, height: u32 },
    BrightnessOutOfRange { brightness: f32 },
    DecodeFailure { message: String },
}

impl std::fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityIssue::ResolutionTooLow { width, height } => {
                write!(f, "resolution too low ({width}x{height})")
            }
            QualityIssue::BrightnessOutOfRange { brightness } => {
                write!(f, "brightness out of range ({brightness:.3})")
            }
            QualityIssue::DecodeFailure { message } => write!(f, "decode failure: {message}"),
        }
    }
}

/// Outcome of a quality check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "issue", rename_all = "snake_case")]
pub enum QualityVerdict {
    Pass,
    Reject(QualityIssue),
}

impl QualityVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, QualityVerdict::Pass)
    }

    pub fn issue(&self) -> Option<&QualityIssue> {
        match self {
            QualityVerdict::Pass => None,
            QualityVerdict::Reject(issue) => Some(issue),
        }
    }
}

/// Rejects captures that are too small or badly exposed to embed reliably.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGate {
    pub min_width: u32,
    pub min_height: u32,
    /// Inclusive lower bound of mean normalized brightness.
    pub min_brightness: f32,
    /// Inclusive upper bound of mean normalized brightness.
    pub max_brightness: f32,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            min_width: DEFAULT_MIN_WIDTH,
            min_height: DEFAULT_MIN_HEIGHT,
            min_brightness: DEFAULT_MIN_BRIGHTNESS,
            max_brightness: DEFAULT_MAX_BRIGHTNESS,
        }
    }
}

impl QualityGate {
    /// Check a decoded image. Resolution is checked before exposure.
    pub fn check(&self, image: &RgbImage) -> QualityVerdict {
        let (width, height) = image.dimensions();
        if width < self.min_width || height < self.min_height {
            tracing::debug!(width, height, "quality: resolution too low");
            return QualityVerdict::Reject(QualityIssue::ResolutionTooLow { width, height });
        }

        let brightness = mean_brightness(image);
        if !(self.min_brightness..=self.max_brightness).contains(&brightness) {
            tracing::debug!(brightness, "quality: brightness out of range");
            return QualityVerdict::Reject(QualityIssue::BrightnessOutOfRange { brightness });
        }

        QualityVerdict::Pass
    }

    /// Decode and check an encoded image. Undecodable input is a rejection, not an error.
    pub fn check_encoded(&self, bytes: &[u8]) -> QualityVerdict {
        match preprocess::decode_image(bytes) {
            Ok(image) => self.check(&image),
            Err(e) => QualityVerdict::Reject(QualityIssue::DecodeFailure {
                message: e.to_string(),
            }),
        }
    }
}

/// Mean of per-pixel `round((R + G + B) / 3)` over every pixel, normalized to [0, 1].
///
/// Returns 0.0 for an empty image.
pub fn mean_brightness(image: &RgbImage) -> f32 {
    let count = image.width() as u64 * image.height() as u64;
    if count == 0 {
        return 0.0;
    }

    let total: u64 = image
        .pixels()
        .map(|p| {
            let sum = p[0] as u32 + p[1] as u32 + p[2] as u32;
            // Integer round-half-up of sum / 3.
            ((sum + 1) / 3) as u64
        })
        .sum();

    (total as f64 / count as f64 / 255.0) as f32
}
