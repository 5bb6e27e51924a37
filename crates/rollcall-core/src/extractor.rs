//! Embedding extraction, single-shot and augmentation-stabilized.

use crate::aggregate::mean_embedding;
use crate::augment;
use crate::ports::{EmbeddingModel, ModelError};
use crate::preprocess::{self, PreprocessError, MODEL_INPUT_SIZE};
use crate::types::{Embedding, EMBEDDING_DIM};
use image::RgbImage;
use rand::Rng;
use thiserror::Error;

/// Randomized variants averaged by [`EmbeddingExtractor::embed_stabilized`].
pub const DEFAULT_STABILIZE_SAMPLES: usize = 5;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Runs the embedding model over preprocessed images.
pub struct EmbeddingExtractor<M> {
    model: M,
    samples: usize,
}

impl<M: EmbeddingModel> EmbeddingExtractor<M> {
    pub fn new(model: M) -> Self {
        Self::with_samples(model, DEFAULT_STABILIZE_SAMPLES)
    }

    /// `samples` is clamped to at least one variant.
    pub fn with_samples(model: M, samples: usize) -> Self {
        Self {
            model,
            samples: samples.max(1),
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Preprocess once, run the model once.
    pub fn embed(&mut self, image: &RgbImage) -> Result<Embedding, ExtractError> {
        let input = preprocess::preprocess(image, MODEL_INPUT_SIZE)?;
        let raw = self.model.invoke(&input)?;

        if raw.len() != EMBEDDING_DIM {
            return Err(ModelError::UnexpectedLength {
                expected: EMBEDDING_DIM,
                actual: raw.len(),
            }
            .into());
        }

        Ok(Embedding::new(raw))
    }

    /// Embed each of `samples` randomized variants and return their mean.
    ///
    /// Any failing variant fails the whole call; no partial average is returned.
    pub fn embed_stabilized<R: Rng + ?Sized>(
        &mut self,
        image: &RgbImage,
        rng: &mut R,
    ) -> Result<Embedding, ExtractError> {
        let variants = augment::augment_set(image, self.samples, rng);
        let embeddings = self.embed_all(&variants)?;

        tracing::debug!(samples = embeddings.len(), "stabilized embedding");
        Ok(mean_embedding(&embeddings))
    }

    /// Embed every image independently, stopping at the first failure.
    pub fn embed_all(&mut self, images: &[RgbImage]) -> Result<Vec<Embedding>, ExtractError> {
        images.iter().map(|img| self.embed(img)).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::Array4;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Returns the same vector for every call and counts invocations.
    pub(crate) struct FixedModel {
        pub output: Vec<f32>,
        pub calls: usize,
    }

    impl FixedModel {
        pub fn new(output: Vec<f32>) -> Self {
            Self { output, calls: 0 }
        }
    }

    impl EmbeddingModel for FixedModel {
        fn invoke(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, ModelError> {
            assert_eq!(input.shape(), &[1, 112, 112, 3]);
            self.calls += 1;
            Ok(self.output.clone())
        }
    }

    /// Maps the input tensor to a vector derived from its mean, so different
    /// images give different embeddings.
    pub(crate) struct MeanModel;

    impl EmbeddingModel for MeanModel {
        fn invoke(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, ModelError> {
            let mean = input.iter().sum::<f32>() / input.len() as f32;
            Ok((0..EMBEDDING_DIM).map(|i| mean + i as f32 * 0.01).collect())
        }
    }

    struct FailingModel;

    impl EmbeddingModel for FailingModel {
        fn invoke(&mut self, _input: &Array4<f32>) -> Result<Vec<f32>, ModelError> {
            Err(ModelError::InvocationFailed("backend unavailable".into()))
        }
    }

    pub(crate) fn face_image() -> RgbImage {
        RgbImage::from_fn(240, 240, |x, y| Rgb([(x % 200) as u8 + 30, (y % 180) as u8 + 40, 120]))
    }

    pub(crate) fn unit_vector() -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[0] = 1.0;
        v
    }

    #[test]
    fn test_embed_returns_model_output() {
        let mut ex = EmbeddingExtractor::new(FixedModel::new(unit_vector()));
        let e = ex.embed(&face_image()).unwrap();
        assert_eq!(e.values, unit_vector());
    }

    #[test]
    fn test_embed_rejects_wrong_length() {
        let mut ex = EmbeddingExtractor::new(FixedModel::new(vec![0.5; 64]));
        match ex.embed(&face_image()) {
            Err(ExtractError::Model(ModelError::UnexpectedLength { expected, actual })) => {
                assert_eq!((expected, actual), (128, 64));
            }
            other => panic!("expected UnexpectedLength, got {other:?}"),
        }
    }

    #[test]
    fn test_embed_propagates_model_failure() {
        let mut ex = EmbeddingExtractor::new(FailingModel);
        assert!(matches!(
            ex.embed(&face_image()),
            Err(ExtractError::Model(ModelError::InvocationFailed(_)))
        ));
    }

    #[test]
    fn test_embed_degenerate_image_is_resize_error() {
        let mut ex = EmbeddingExtractor::new(FixedModel::new(unit_vector()));
        assert!(matches!(
            ex.embed(&RgbImage::new(0, 0)),
            Err(ExtractError::Preprocess(PreprocessError::Resize { .. }))
        ));
    }

    #[test]
    fn test_stabilized_invokes_model_per_variant() {
        let mut ex = EmbeddingExtractor::new(FixedModel::new(unit_vector()));
        let mut rng = StdRng::seed_from_u64(1);
        let e = ex.embed_stabilized(&face_image(), &mut rng).unwrap();
        assert_eq!(ex.model.calls, DEFAULT_STABILIZE_SAMPLES);
        // Mean of identical outputs is the output.
        for (a, b) in e.values.iter().zip(unit_vector().iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_stabilized_is_reproducible_with_seed() {
        let img = face_image();
        let mut ex = EmbeddingExtractor::new(MeanModel);
        let a = ex.embed_stabilized(&img, &mut StdRng::seed_from_u64(42)).unwrap();
        let b = ex.embed_stabilized(&img, &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_stabilized_failure_returns_no_partial() {
        let mut ex = EmbeddingExtractor::new(FailingModel);
        let result = ex.embed_stabilized(&face_image(), &mut StdRng::seed_from_u64(0));
        assert!(result.is_err());
    }

    #[test]
    fn test_embed_all_keeps_order_and_counts_calls() {
        let dark = RgbImage::from_pixel(120, 120, Rgb([40, 40, 40]));
        let light = RgbImage::from_pixel(120, 120, Rgb([200, 200, 200]));
        let mut ex = EmbeddingExtractor::new(MeanModel);
        let all = ex.embed_all(&[dark.clone(), light.clone()]).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], ex.embed(&dark).unwrap());
        assert_eq!(all[1], ex.embed(&light).unwrap());

        let mut ex = EmbeddingExtractor::new(FixedModel::new(unit_vector()));
        ex.embed_all(&[face_image(), face_image(), face_image()]).unwrap();
        assert_eq!(ex.model.calls, 3);
    }

    #[test]
    fn test_embed_all_stops_at_degenerate_image() {
        let mut ex = EmbeddingExtractor::new(FixedModel::new(unit_vector()));
        let result = ex.embed_all(&[face_image(), RgbImage::new(0, 0), face_image()]);
        assert!(matches!(
            result,
            Err(ExtractError::Preprocess(PreprocessError::Resize { .. }))
        ));
        assert_eq!(ex.model.calls, 1);
    }

    #[test]
    fn test_stabilized_is_mean_of_augmented_set() {
        let img = face_image();
        let mut ex = EmbeddingExtractor::new(MeanModel);
        let stabilized = ex.embed_stabilized(&img, &mut StdRng::seed_from_u64(8)).unwrap();

        let variants = augment::augment_set(&img, DEFAULT_STABILIZE_SAMPLES, &mut StdRng::seed_from_u64(8));
        let expected = mean_embedding(&ex.embed_all(&variants).unwrap());
        assert_eq!(stabilized, expected);
    }

    #[test]
    fn test_samples_clamped_to_one() {
        let mut ex = EmbeddingExtractor::with_samples(FixedModel::new(unit_vector()), 0);
        assert_eq!(ex.samples(), 1);
        ex.embed_stabilized(&face_image(), &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(ex.model.calls, 1);
    }
}
