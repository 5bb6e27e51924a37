use rollcall_core::preprocess::{self, PreprocessError};
use rollcall_core::service::SkipReason;
use rollcall_core::{
    CaptureOutcome, EmbeddingModel, FaceDetector, FaceService, IdentityStore, OnnxEmbeddingModel,
    QualityIssue, QualityVerdict, ScrfdDetector, ServiceConfig, ServiceError, ServiceState,
};
use rollcall_store::{SqliteStore, StoreError};
use serde::Serialize;
use std::path::PathBuf;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("face service: {0}")]
    Service(#[from] ServiceError),
    #[error("image: {0}")]
    Image(#[from] PreprocessError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("no usable capture: every step failed the quality gate or showed no face")]
    NoUsableCapture,
    #[error("registration needs at least one capture")]
    NoCaptures,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Outcome of one recognition attempt, as reported to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecognitionReport {
    Matched {
        identity_id: String,
        name: String,
        similarity: f32,
        /// Attendance state written for the match, if the request asked for one.
        checked_in: Option<bool>,
    },
    NoMatch,
    NoFace,
    Rejected {
        issue: QualityIssue,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationReport {
    pub identity_id: String,
    pub name: String,
    pub steps_used: usize,
    pub steps_skipped: Vec<SkippedStep>,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedStep {
    pub path: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub id: String,
    pub name: String,
    pub checked_in: bool,
    pub attendance_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: ServiceState,
    pub identities: usize,
    pub match_threshold: f32,
    pub stabilize_samples: usize,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    CheckQuality {
        path: PathBuf,
        reply: oneshot::Sender<Result<QualityVerdict, EngineError>>,
    },
    Recognize {
        path: PathBuf,
        attendance: Option<bool>,
        reply: oneshot::Sender<Result<RecognitionReport, EngineError>>,
    },
    Register {
        id: String,
        name: String,
        paths: Vec<PathBuf>,
        reply: oneshot::Sender<Result<RegistrationReport, EngineError>>,
    },
    List {
        reply: oneshot::Sender<Result<Vec<IdentitySummary>, EngineError>>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Result<EngineStatus, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Run the quality gate on an image file.
    pub async fn check_quality(&self, path: PathBuf) -> Result<QualityVerdict, EngineError> {
        self.call(|reply| EngineRequest::CheckQuality { path, reply }).await
    }

    /// Recognize the face in an image file; optionally record attendance for the match.
    pub async fn recognize(
        &self,
        path: PathBuf,
        attendance: Option<bool>,
    ) -> Result<RecognitionReport, EngineError> {
        self.call(|reply| EngineRequest::Recognize {
            path,
            attendance,
            reply,
        })
        .await
    }

    /// Enroll an identity from a sequence of pose-step captures.
    pub async fn register(
        &self,
        id: String,
        name: String,
        paths: Vec<PathBuf>,
    ) -> Result<RegistrationReport, EngineError> {
        self.call(|reply| EngineRequest::Register {
            id,
            name,
            paths,
            reply,
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        self.call(|reply| EngineRequest::List { reply }).await
    }

    pub async fn remove(&self, id: String) -> Result<bool, EngineError> {
        self.call(|reply| EngineRequest::Remove { id, reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }
}

/// Join handle of the engine thread. Yields the final service state.
pub type EngineThread = JoinHandle<ServiceState>;

/// Load both ONNX models and the identity store, then spawn the engine.
///
/// Fails fast at startup if any resource is unavailable.
pub fn spawn_engine(
    service_config: ServiceConfig,
    embedding_model_path: &str,
    detector_model_path: &str,
    detection_confidence: f32,
    db_path: &std::path::Path,
) -> Result<(EngineHandle, EngineThread), EngineError> {
    let mut service = FaceService::new(service_config);
    service.initialize(|| {
        let model = OnnxEmbeddingModel::load(embedding_model_path)?;
        tracing::info!(path = embedding_model_path, "embedding model loaded");
        let detector = ScrfdDetector::load(detector_model_path, detection_confidence)?;
        tracing::info!(path = detector_model_path, "face detector loaded");
        Ok((model, detector))
    })?;

    let store = SqliteStore::open(db_path)?;
    spawn_with(service, store)
}

/// Spawn the engine on a dedicated OS thread around an initialized service.
///
/// The thread owns the service and the store, so registration writes and
/// recognition reads are serialized. The service is torn down when every
/// handle has been dropped; join the returned thread to wait for that.
pub fn spawn_with<M, D>(
    mut service: FaceService<M, D>,
    mut store: SqliteStore,
) -> Result<(EngineHandle, EngineThread), EngineError>
where
    M: EmbeddingModel + 'static,
    D: FaceDetector + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    let thread = std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle_request(&mut service, &mut store, req);
            }
            service.teardown();
            tracing::info!("engine thread exiting");
            service.state()
        })
        .map_err(EngineError::Spawn)?;

    Ok((EngineHandle { tx }, thread))
}

fn handle_request<M: EmbeddingModel, D: FaceDetector>(
    service: &mut FaceService<M, D>,
    store: &mut SqliteStore,
    req: EngineRequest,
) {
    // A dropped receiver means the caller gave up; the result is discarded.
    match req {
        EngineRequest::CheckQuality { path, reply } => {
            let _ = reply.send(run_check_quality(service, &path));
        }
        EngineRequest::Recognize {
            path,
            attendance,
            reply,
        } => {
            let _ = reply.send(run_recognize(service, store, &path, attendance));
        }
        EngineRequest::Register {
            id,
            name,
            paths,
            reply,
        } => {
            let _ = reply.send(run_register(service, store, &id, &name, &paths));
        }
        EngineRequest::List { reply } => {
            let _ = reply.send(run_list(store));
        }
        EngineRequest::Remove { id, reply } => {
            let _ = reply.send(store.remove_identity(&id).map_err(EngineError::from));
        }
        EngineRequest::Status { reply } => {
            let _ = reply.send(run_status(service, store));
        }
    }
}

fn run_check_quality<M: EmbeddingModel, D: FaceDetector>(
    service: &FaceService<M, D>,
    path: &std::path::Path,
) -> Result<QualityVerdict, EngineError> {
    let verdict = match std::fs::read(path) {
        Ok(bytes) => service.check_quality_encoded(&bytes)?,
        Err(e) => {
            service.ensure_ready()?;
            QualityVerdict::Reject(QualityIssue::DecodeFailure {
                message: format!("{}: {e}", path.display()),
            })
        }
    };
    tracing::info!(path = %path.display(), ?verdict, "quality check");
    Ok(verdict)
}

/// Quality gate, detect, stabilized embed, then match against a snapshot of the store.
fn run_recognize<M: EmbeddingModel, D: FaceDetector>(
    service: &mut FaceService<M, D>,
    store: &mut SqliteStore,
    path: &std::path::Path,
    attendance: Option<bool>,
) -> Result<RecognitionReport, EngineError> {
    let image = preprocess::load_image(path)?;

    let embedding = match service.process_capture(&image)? {
        CaptureOutcome::Rejected(issue) => return Ok(RecognitionReport::Rejected { issue }),
        CaptureOutcome::NoFace => return Ok(RecognitionReport::NoFace),
        CaptureOutcome::Embedded(embedding) => embedding,
    };

    let candidates = store.list_registered()?;
    let Some(found) = service.best_match(&embedding, &candidates, None)? else {
        tracing::info!(candidates = candidates.len(), "recognize: no match");
        return Ok(RecognitionReport::NoMatch);
    };

    if let Some(checked_in) = attendance {
        store.update_attendance_state(&found.identity_id, checked_in)?;
    }

    tracing::info!(
        identity = %found.identity_id,
        similarity = found.similarity,
        "recognize: matched"
    );

    Ok(RecognitionReport::Matched {
        identity_id: found.identity_id,
        name: found.name,
        similarity: found.similarity,
        checked_in: attendance,
    })
}

fn run_register<M: EmbeddingModel, D: FaceDetector>(
    service: &mut FaceService<M, D>,
    store: &mut SqliteStore,
    id: &str,
    name: &str,
    paths: &[PathBuf],
) -> Result<RegistrationReport, EngineError> {
    if paths.is_empty() {
        return Err(EngineError::NoCaptures);
    }

    let captures = paths
        .iter()
        .map(preprocess::load_image)
        .collect::<Result<Vec<_>, _>>()?;

    let enrollment = service.enroll(&captures)?.ok_or(EngineError::NoUsableCapture)?;
    store.write_registration(id, name, &enrollment.embedding)?;

    Ok(RegistrationReport {
        identity_id: id.to_string(),
        name: name.to_string(),
        steps_used: enrollment.steps_used,
        steps_skipped: enrollment
            .steps_skipped
            .into_iter()
            .map(|(step, reason)| SkippedStep {
                path: paths[step].display().to_string(),
                reason,
            })
            .collect(),
        samples: enrollment.samples,
    })
}

fn run_list(store: &SqliteStore) -> Result<Vec<IdentitySummary>, EngineError> {
    store
        .list_registered()?
        .into_iter()
        .map(|identity| -> Result<IdentitySummary, EngineError> {
            let attendance = store.attendance(&identity.id)?;
            Ok(IdentitySummary {
                id: identity.id,
                name: identity.name,
                checked_in: attendance.checked_in,
                attendance_at: attendance.updated_at,
            })
        })
        .collect()
}

fn run_status<M: EmbeddingModel, D: FaceDetector>(
    service: &FaceService<M, D>,
    store: &SqliteStore,
) -> Result<EngineStatus, EngineError> {
    Ok(EngineStatus {
        state: service.state(),
        identities: store.list_registered()?.len(),
        match_threshold: service.config().match_threshold,
        stabilize_samples: service.config().stabilize_samples,
    })
}
