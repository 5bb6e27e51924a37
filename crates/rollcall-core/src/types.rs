use crate::matcher;
use serde::{Deserialize, Serialize};

/// Number of components produced by the embedding model.
pub const EMBEDDING_DIM: usize = 128;

/// Face embedding vector (128-dimensional for the MobileFaceNet-style model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Mismatched lengths are compared over their common prefix.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        matcher::cosine_similarity(&self.values, &other.values)
    }

    /// Little-endian f32 encoding used for storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode a little-endian f32 blob. Returns `None` if the length is not a multiple of 4.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }
}

/// A registered identity as supplied by the storage collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredIdentity {
    pub id: String,
    pub name: String,
    pub embedding: Embedding,
}

/// Best candidate for a probe embedding that cleared the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub identity_id: String,
    pub name: String,
    /// Cosine similarity of the match [-1, 1].
    pub similarity: f32,
}

/// A face found by the detector, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}
