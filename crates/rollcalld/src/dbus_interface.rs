use crate::engine::{EngineError, EngineHandle};
use serde::Serialize;
use std::path::PathBuf;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Every method returns a JSON document; failures map to `org.freedesktop.DBus.Error.Failed`.
pub struct AttendanceService {
    engine: EngineHandle,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("encoding reply: {e}")))
}

fn failed(op: &str, e: EngineError) -> zbus::fdo::Error {
    tracing::warn!(op, error = %e, "request failed");
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Run the quality gate on an image file.
    async fn check_quality(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "check_quality requested");
        let verdict = self
            .engine
            .check_quality(PathBuf::from(path))
            .await
            .map_err(|e| failed("check_quality", e))?;
        to_json(&verdict)
    }

    /// Identify the face in an image file without touching attendance.
    async fn recognize(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "recognize requested");
        let report = self
            .engine
            .recognize(PathBuf::from(path), None)
            .await
            .map_err(|e| failed("recognize", e))?;
        to_json(&report)
    }

    /// Identify the face and mark the matched identity as checked in.
    async fn check_in(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "check_in requested");
        let report = self
            .engine
            .recognize(PathBuf::from(path), Some(true))
            .await
            .map_err(|e| failed("check_in", e))?;
        to_json(&report)
    }

    /// Identify the face and mark the matched identity as checked out.
    async fn check_out(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "check_out requested");
        let report = self
            .engine
            .recognize(PathBuf::from(path), Some(false))
            .await
            .map_err(|e| failed("check_out", e))?;
        to_json(&report)
    }

    /// Enroll an identity from one image per pose step.
    async fn register(&self, id: &str, name: &str, paths: Vec<String>) -> zbus::fdo::Result<String> {
        tracing::info!(id, name, steps = paths.len(), "register requested");
        let report = self
            .engine
            .register(
                id.to_string(),
                name.to_string(),
                paths.into_iter().map(PathBuf::from).collect(),
            )
            .await
            .map_err(|e| failed("register", e))?;
        to_json(&report)
    }

    /// List registered identities with their attendance state.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self.engine.list().await.map_err(|e| failed("list_identities", e))?;
        to_json(&identities)
    }

    /// Remove a registered identity by ID.
    async fn remove_identity(&self, id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "remove_identity requested");
        self.engine
            .remove(id.to_string())
            .await
            .map_err(|e| failed("remove_identity", e))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(|e| failed("status", e))?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": status,
        })
        .to_string())
    }
}
