//! rollcall-core — Face recognition pipeline for attendance.
//!
//! Quality gating, augmentation, embedding extraction, cosine matching and
//! registration aggregation. The embedding model and face detector run via
//! ONNX Runtime behind the traits in [`ports`].

pub mod aggregate;
pub mod augment;
pub mod extractor;
pub mod matcher;
pub mod onnx;
pub mod ports;
pub mod preprocess;
pub mod quality;
pub mod service;
pub mod types;

pub use aggregate::aggregate_registration;
pub use extractor::EmbeddingExtractor;
pub use matcher::{cosine_similarity, find_best_match, CosineMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use onnx::{OnnxEmbeddingModel, ScrfdDetector};
pub use ports::{EmbeddingModel, FaceDetector, IdentityStore, ModelError};
pub use quality::{QualityGate, QualityIssue, QualityVerdict};
pub use service::{CaptureOutcome, Enrollment, FaceService, ServiceConfig, ServiceError, ServiceState};
pub use types::{Detection, Embedding, Match, RegisteredIdentity, EMBEDDING_DIM};

use std::path::PathBuf;

/// Default directory for ONNX model files.
///
/// Checks `/usr/share/rollcall/models` (system install) first, then
/// `$XDG_DATA_HOME/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    let system = PathBuf::from("/usr/share/rollcall/models");
    if system.is_dir() {
        return system;
    }

    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}
