//! Collaborator boundaries: the embedding model, the face detector and the
//! identity store. Production bindings live in [`crate::onnx`] and the
//! `rollcall-store` crate; tests substitute deterministic stubs.

use crate::types::{Detection, Embedding, RegisteredIdentity};
use image::RgbImage;
use ndarray::Array4;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InvocationFailed(String),
    #[error("expected {expected}-dim embedding, got {actual}")]
    UnexpectedLength { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Pretrained embedding model: `[1, 112, 112, 3]` tensor in, raw vector out.
///
/// Implementations must be deterministic for identical input and weights.
pub trait EmbeddingModel: Send {
    fn invoke(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, ModelError>;
}

/// Face presence detector. `Ok(None)` means no face, which is not an error.
pub trait FaceDetector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Option<Detection>, ModelError>;
}

/// Durable registry of identities and their attendance state.
pub trait IdentityStore {
    type Error: std::error::Error + Send + Sync + 'static;

    fn list_registered(&self) -> Result<Vec<RegisteredIdentity>, Self::Error>;

    fn write_registration(
        &mut self,
        id: &str,
        name: &str,
        embedding: &Embedding,
    ) -> Result<(), Self::Error>;

    fn update_attendance_state(&mut self, id: &str, checked_in: bool) -> Result<(), Self::Error>;
}
