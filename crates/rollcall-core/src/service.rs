//! Lifecycle-managed entry point to the recognition pipeline.
//!
//! A [`FaceService`] owns the model and detector handles. Every public
//! operation checks the lifecycle state once at entry and fails with
//! [`ServiceError::NotInitialized`] outside [`ServiceState::Ready`].

use crate::aggregate;
use crate::augment;
use crate::extractor::{EmbeddingExtractor, ExtractError, DEFAULT_STABILIZE_SAMPLES};
use crate::matcher::{CosineMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
use crate::ports::{EmbeddingModel, FaceDetector, ModelError};
use crate::preprocess::PreprocessError;
use crate::quality::{QualityGate, QualityIssue, QualityVerdict};
use crate::types::{Embedding, Match, RegisteredIdentity};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Uninitialized,
    Ready,
    Closed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Uninitialized => "uninitialized",
            ServiceState::Ready => "ready",
            ServiceState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("service not initialized (state: {0})")]
    NotInitialized(ServiceState),
    #[error("service already initialized (state: {0})")]
    AlreadyInitialized(ServiceState),
    #[error("initialization failed: {0}")]
    InitializationFailed(#[source] ModelError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

impl From<ExtractError> for ServiceError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::Preprocess(e) => ServiceError::Preprocess(e),
            ExtractError::Model(e) => ServiceError::Model(e),
        }
    }
}

/// Tunables of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Default cosine similarity threshold for a match.
    pub match_threshold: f32,
    /// Randomized variants averaged per stabilized embedding.
    pub stabilize_samples: usize,
    /// Seed for augmentation randomness; `None` seeds from OS entropy.
    pub augment_seed: Option<u64>,
    pub quality: QualityGate,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            stabilize_samples: DEFAULT_STABILIZE_SAMPLES,
            augment_seed: None,
            quality: QualityGate::default(),
        }
    }
}

/// Result of running one capture through gate, detector and extractor.
#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    Rejected(QualityIssue),
    NoFace,
    Embedded(Embedding),
}

/// Canonical embedding produced by an enrollment, with bookkeeping.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub embedding: Embedding,
    /// Capture steps that contributed embeddings.
    pub steps_used: usize,
    /// Capture steps skipped by the gate or for lack of a face, by index.
    pub steps_skipped: Vec<(usize, SkipReason)>,
    /// Total embeddings averaged.
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    Quality { issue: QualityIssue },
    NoFace,
}

struct Handles<M, D> {
    extractor: EmbeddingExtractor<M>,
    detector: D,
}

/// Recognition and registration pipeline with an explicit lifecycle.
pub struct FaceService<M, D> {
    state: ServiceState,
    handles: Option<Handles<M, D>>,
    config: ServiceConfig,
    rng: StdRng,
}

impl<M: EmbeddingModel, D: FaceDetector> FaceService<M, D> {
    pub fn new(config: ServiceConfig) -> Self {
        let rng = match config.augment_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            state: ServiceState::Uninitialized,
            handles: None,
            config,
            rng,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Load the model and detector. On failure the instance is closed for good.
    pub fn initialize<F>(&mut self, load: F) -> Result<(), ServiceError>
    where
        F: FnOnce() -> Result<(M, D), ModelError>,
    {
        if self.state != ServiceState::Uninitialized {
            return Err(ServiceError::AlreadyInitialized(self.state));
        }

        match load() {
            Ok((model, detector)) => {
                self.handles = Some(Handles {
                    extractor: EmbeddingExtractor::with_samples(model, self.config.stabilize_samples),
                    detector,
                });
                self.state = ServiceState::Ready;
                tracing::info!(
                    samples = self.config.stabilize_samples,
                    threshold = self.config.match_threshold,
                    "face service ready"
                );
                Ok(())
            }
            Err(e) => {
                self.state = ServiceState::Closed;
                tracing::error!(error = %e, "face service failed to initialize");
                Err(ServiceError::InitializationFailed(e))
            }
        }
    }

    /// Release the model and detector handles. Later calls are no-ops.
    pub fn teardown(&mut self) {
        if let Some(handles) = self.handles.take() {
            drop(handles);
            tracing::info!("face service closed");
        }
        self.state = ServiceState::Closed;
    }

    /// Fail with [`ServiceError::NotInitialized`] unless the service is ready.
    pub fn ensure_ready(&self) -> Result<(), ServiceError> {
        match self.state {
            ServiceState::Ready => Ok(()),
            other => Err(ServiceError::NotInitialized(other)),
        }
    }

    fn handles_mut(&mut self) -> Result<&mut Handles<M, D>, ServiceError> {
        let state = self.state;
        match (state, self.handles.as_mut()) {
            (ServiceState::Ready, Some(h)) => Ok(h),
            _ => Err(ServiceError::NotInitialized(state)),
        }
    }

    pub fn check_quality(&self, image: &RgbImage) -> Result<QualityVerdict, ServiceError> {
        self.ensure_ready()?;
        Ok(self.config.quality.check(image))
    }

    /// Quality-check an encoded image; decode failures come back as a verdict.
    pub fn check_quality_encoded(&self, bytes: &[u8]) -> Result<QualityVerdict, ServiceError> {
        self.ensure_ready()?;
        Ok(self.config.quality.check_encoded(bytes))
    }

    /// Detect a face and, if present, return its stabilized embedding.
    pub fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Option<Embedding>, ServiceError> {
        self.ensure_ready()?;
        let handles = self.handles.as_mut().ok_or(ServiceError::NotInitialized(self.state))?;

        if handles.detector.detect(image)?.is_none() {
            tracing::debug!("no face detected");
            return Ok(None);
        }

        let embedding = handles.extractor.embed_stabilized(image, &mut self.rng)?;
        Ok(Some(embedding))
    }

    /// Single-shot embedding without detection or augmentation.
    pub fn embed_single(&mut self, image: &RgbImage) -> Result<Embedding, ServiceError> {
        let handles = self.handles_mut()?;
        Ok(handles.extractor.embed(image)?)
    }

    /// Quality gate, then detection, then stabilized embedding.
    pub fn process_capture(&mut self, image: &RgbImage) -> Result<CaptureOutcome, ServiceError> {
        if let QualityVerdict::Reject(issue) = self.check_quality(image)? {
            tracing::info!(%issue, "capture rejected by quality gate");
            return Ok(CaptureOutcome::Rejected(issue));
        }

        Ok(match self.detect_and_embed(image)? {
            Some(embedding) => CaptureOutcome::Embedded(embedding),
            None => CaptureOutcome::NoFace,
        })
    }

    /// Best candidate at or above `threshold` (the configured default when `None`).
    pub fn best_match(
        &self,
        query: &Embedding,
        candidates: &[RegisteredIdentity],
        threshold: Option<f32>,
    ) -> Result<Option<Match>, ServiceError> {
        self.ensure_ready()?;
        let threshold = threshold.unwrap_or(self.config.match_threshold);
        Ok(CosineMatcher.best_match(query, candidates, threshold))
    }

    /// # Panics
    ///
    /// See [`aggregate::aggregate_registration`].
    pub fn aggregate_registration(&self, embeddings: &[Embedding]) -> Result<Embedding, ServiceError> {
        self.ensure_ready()?;
        Ok(aggregate::aggregate_registration(embeddings))
    }

    /// Build one canonical embedding from a sequence of pose-step captures.
    ///
    /// Each usable step contributes its original capture plus the fixed
    /// registration variants. Returns `Ok(None)` when no step was usable.
    pub fn enroll(&mut self, captures: &[RgbImage]) -> Result<Option<Enrollment>, ServiceError> {
        self.ensure_ready()?;

        let mut embeddings = Vec::new();
        let mut steps_used = 0;
        let mut steps_skipped = Vec::new();

        for (step, capture) in captures.iter().enumerate() {
            if let QualityVerdict::Reject(issue) = self.config.quality.check(capture) {
                tracing::info!(step, %issue, "enroll: step rejected");
                steps_skipped.push((step, SkipReason::Quality { issue }));
                continue;
            }

            let handles = self.handles_mut()?;
            if handles.detector.detect(capture)?.is_none() {
                tracing::info!(step, "enroll: no face in step");
                steps_skipped.push((step, SkipReason::NoFace));
                continue;
            }

            let mut views = Vec::with_capacity(1 + augment::REGISTRATION_VARIANT_COUNT);
            views.push(capture.clone());
            views.extend(augment::registration_variants(capture));
            embeddings.extend(handles.extractor.embed_all(&views)?);
            steps_used += 1;
        }

        if embeddings.is_empty() {
            tracing::warn!(steps = captures.len(), "enroll: no usable capture");
            return Ok(None);
        }

        let embedding = aggregate::aggregate_registration(&embeddings);
        tracing::info!(steps_used, samples = embeddings.len(), "enroll: canonical embedding built");

        Ok(Some(Enrollment {
            embedding,
            steps_used,
            steps_skipped,
            samples: embeddings.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::tests::{face_image, unit_vector, FixedModel, MeanModel};
    use crate::types::Detection;
    use image::Rgb;

    struct StubDetector {
        present: bool,
    }

    impl FaceDetector for StubDetector {
        fn detect(&mut self, _image: &RgbImage) -> Result<Option<Detection>, ModelError> {
            Ok(self.present.then_some(Detection {
                confidence: 0.99,
                landmarks: None,
            }))
        }
    }

    fn seeded() -> ServiceConfig {
        ServiceConfig {
            augment_seed: Some(1234),
            ..ServiceConfig::default()
        }
    }

    fn ready(present: bool) -> FaceService<FixedModel, StubDetector> {
        let mut svc = FaceService::new(seeded());
        svc.initialize(|| Ok((FixedModel::new(unit_vector()), StubDetector { present })))
            .unwrap();
        svc
    }

    #[test]
    fn test_operations_fail_before_initialize() {
        let mut svc: FaceService<FixedModel, StubDetector> = FaceService::new(seeded());
        assert_eq!(svc.state(), ServiceState::Uninitialized);
        assert!(matches!(
            svc.check_quality(&face_image()),
            Err(ServiceError::NotInitialized(ServiceState::Uninitialized))
        ));
        assert!(matches!(
            svc.detect_and_embed(&face_image()),
            Err(ServiceError::NotInitialized(_))
        ));
        assert!(matches!(
            svc.best_match(&Embedding::new(unit_vector()), &[], None),
            Err(ServiceError::NotInitialized(_))
        ));
        assert!(matches!(
            svc.aggregate_registration(&[Embedding::new(unit_vector())]),
            Err(ServiceError::NotInitialized(_))
        ));
    }

    #[test]
    fn test_operations_fail_after_teardown() {
        let mut svc = ready(true);
        svc.teardown();
        assert_eq!(svc.state(), ServiceState::Closed);
        assert!(matches!(
            svc.embed_single(&face_image()),
            Err(ServiceError::NotInitialized(ServiceState::Closed))
        ));
        assert!(matches!(
            svc.enroll(&[face_image()]),
            Err(ServiceError::NotInitialized(ServiceState::Closed))
        ));
        // Second teardown is harmless.
        svc.teardown();
        assert_eq!(svc.state(), ServiceState::Closed);
    }

    #[test]
    fn test_failed_initialize_closes_instance() {
        let mut svc: FaceService<FixedModel, StubDetector> = FaceService::new(seeded());
        let err = svc
            .initialize(|| Err(ModelError::ModelNotFound("/models/missing.onnx".into())))
            .unwrap_err();
        assert!(matches!(err, ServiceError::InitializationFailed(_)));
        assert_eq!(svc.state(), ServiceState::Closed);
        assert!(matches!(
            svc.check_quality(&face_image()),
            Err(ServiceError::NotInitialized(ServiceState::Closed))
        ));
        // No retry on a dead instance.
        assert!(matches!(
            svc.initialize(|| Ok((FixedModel::new(unit_vector()), StubDetector { present: true }))),
            Err(ServiceError::AlreadyInitialized(ServiceState::Closed))
        ));
    }

    #[test]
    fn test_double_initialize_rejected() {
        let mut svc = ready(true);
        assert!(matches!(
            svc.initialize(|| Ok((FixedModel::new(unit_vector()), StubDetector { present: true }))),
            Err(ServiceError::AlreadyInitialized(ServiceState::Ready))
        ));
        assert_eq!(svc.state(), ServiceState::Ready);
    }

    #[test]
    fn test_detect_and_embed_no_face_is_none() {
        let mut svc = ready(false);
        assert!(svc.detect_and_embed(&face_image()).unwrap().is_none());
    }

    #[test]
    fn test_detect_and_embed_stabilized() {
        let mut svc = ready(true);
        let e = svc.detect_and_embed(&face_image()).unwrap().expect("embedding");
        assert_eq!(e.len(), 128);
        assert!((e.similarity(&Embedding::new(unit_vector())) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_seeded_services_are_reproducible() {
        let build = || {
            let mut svc: FaceService<MeanModel, StubDetector> = FaceService::new(seeded());
            svc.initialize(|| Ok((MeanModel, StubDetector { present: true }))).unwrap();
            svc
        };
        let a = build().detect_and_embed(&face_image()).unwrap();
        let b = build().detect_and_embed(&face_image()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_process_capture_rejects_small_image() {
        let mut svc = ready(true);
        let small = RgbImage::from_pixel(120, 120, Rgb([128, 128, 128]));
        match svc.process_capture(&small).unwrap() {
            CaptureOutcome::Rejected(QualityIssue::ResolutionTooLow { width, height }) => {
                assert_eq!((width, height), (120, 120));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_process_capture_embeds_good_image() {
        let mut svc = ready(true);
        assert!(matches!(
            svc.process_capture(&face_image()).unwrap(),
            CaptureOutcome::Embedded(_)
        ));
        let mut svc = ready(false);
        assert!(matches!(svc.process_capture(&face_image()).unwrap(), CaptureOutcome::NoFace));
    }

    #[test]
    fn test_best_match_uses_configured_threshold() {
        let svc = ready(true);
        let query = Embedding::new(vec![1.0, 0.0]);
        let candidates = vec![RegisteredIdentity {
            id: "u1".into(),
            name: "Ada".into(),
            embedding: Embedding::new(vec![0.6, 0.8]),
        }];
        // Similarity 0.6: below default 0.7, above explicit 0.5.
        assert!(svc.best_match(&query, &candidates, None).unwrap().is_none());
        let m = svc.best_match(&query, &candidates, Some(0.5)).unwrap().unwrap();
        assert_eq!(m.identity_id, "u1");
    }

    #[test]
    fn test_enroll_skips_bad_steps_and_aggregates() {
        let mut svc = ready(true);
        let captures = vec![
            face_image(),
            RgbImage::from_pixel(100, 100, Rgb([128, 128, 128])),
            face_image(),
        ];
        let enrollment = svc.enroll(&captures).unwrap().expect("enrollment");
        assert_eq!(enrollment.steps_used, 2);
        assert_eq!(enrollment.samples, 2 * (1 + augment::REGISTRATION_VARIANT_COUNT));
        assert_eq!(enrollment.steps_skipped.len(), 1);
        assert_eq!(enrollment.steps_skipped[0].0, 1);
        assert_eq!(enrollment.embedding.len(), 128);
    }

    #[test]
    fn test_enroll_without_usable_step_is_none() {
        let mut svc = ready(false);
        let enrollment = svc.enroll(&[face_image(), face_image()]).unwrap();
        assert!(enrollment.is_none());
    }
}
