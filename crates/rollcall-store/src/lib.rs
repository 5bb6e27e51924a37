//! rollcall-store — SQLite registry of identities, embeddings and attendance state.
//!
//! Embeddings are stored as little-endian f32 blobs alongside their length.

use chrono::Utc;
use rollcall_core::{Embedding, IdentityStore, RegisteredIdentity};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    embedding     BLOB NOT NULL,
    dim           INTEGER NOT NULL,
    checked_in    INTEGER NOT NULL DEFAULT 0,
    registered_at TEXT NOT NULL,
    attendance_at TEXT
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("corrupt embedding for identity {id}: {bytes} bytes, expected {dim} floats")]
    CorruptEmbedding { id: String, bytes: usize, dim: usize },
}

/// Attendance row for a single identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Attendance {
    pub checked_in: bool,
    /// RFC 3339 timestamp of the last state change, if any.
    pub updated_at: Option<String>,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating its parent directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened identity store");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Delete an identity. Returns whether a row was removed.
    pub fn remove_identity(&mut self, id: &str) -> Result<bool, StoreError> {
        let removed = self.conn.execute("DELETE FROM identities WHERE id = ?1", params![id])?;
        tracing::info!(id, removed = removed > 0, "remove identity");
        Ok(removed > 0)
    }

    pub fn attendance(&self, id: &str) -> Result<Attendance, StoreError> {
        self.conn
            .query_row(
                "SELECT checked_in, attendance_at FROM identities WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Attendance {
                        checked_in: row.get::<_, i64>(0)? != 0,
                        updated_at: row.get(1)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::UnknownIdentity(id.to_string()))
    }
}

impl IdentityStore for SqliteStore {
    type Error = StoreError;

    fn list_registered(&self) -> Result<Vec<RegisteredIdentity>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, embedding, dim FROM identities ORDER BY registered_at, id")?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut identities = Vec::new();
        for row in rows {
            let (id, name, blob, dim) = row?;
            let dim = dim.max(0) as usize;
            let embedding = match Embedding::from_le_bytes(&blob) {
                Some(e) if e.len() == dim => e,
                _ => {
                    return Err(StoreError::CorruptEmbedding {
                        id,
                        bytes: blob.len(),
                        dim,
                    })
                }
            };
            identities.push(RegisteredIdentity { id, name, embedding });
        }

        tracing::debug!(count = identities.len(), "listed registered identities");
        Ok(identities)
    }

    /// Insert an identity, or replace name and embedding of an existing one.
    fn write_registration(
        &mut self,
        id: &str,
        name: &str,
        embedding: &Embedding,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO identities (id, name, embedding, dim, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 embedding = excluded.embedding,
                 dim = excluded.dim",
            params![id, name, embedding.to_le_bytes(), embedding.len() as i64, now],
        )?;
        tracing::info!(id, name, dim = embedding.len(), "registration written");
        Ok(())
    }

    fn update_attendance_state(&mut self, id: &str, checked_in: bool) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn.execute(
            "UPDATE identities SET checked_in = ?2, attendance_at = ?3 WHERE id = ?1",
            params![id, checked_in as i64, now],
        )?;
        if updated == 0 {
            return Err(StoreError::UnknownIdentity(id.to_string()));
        }
        tracing::info!(id, checked_in, "attendance updated");
        Ok(())
    }
}
