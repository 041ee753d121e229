use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use runway_common::{RuntimeRecord, RuntimeStatus};

use crate::errors::RuntimeError;

/// Async-safe handle to the runtime database.
///
/// Wraps `RuntimeDb` behind `Arc<Mutex>` and runs every statement on tokio's
/// blocking pool via `spawn_blocking`, so SQLite I/O never ties up the
/// request-handling workers. Each method is a single statement, which makes
/// every mutation atomic at the record level.
#[derive(Clone)]
pub struct RuntimeStore {
    inner: Arc<std::sync::Mutex<RuntimeDb>>,
}

impl RuntimeStore {
    pub fn new(db: RuntimeDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self, RuntimeError> {
        Ok(Self::new(RuntimeDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self, RuntimeError> {
        Ok(Self::new(RuntimeDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R, RuntimeError>
    where
        F: FnOnce(&RuntimeDb) -> Result<R, RuntimeError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| RuntimeError::StoreUnavailable(format!("lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| RuntimeError::StoreUnavailable(format!("store task failed: {}", e)))?
    }

    pub async fn create(
        &self,
        project_name: &str,
        project_root: &str,
        image: &str,
        container_name: &str,
    ) -> Result<RuntimeRecord, RuntimeError> {
        let (project_name, project_root, image, container_name) = (
            project_name.to_string(),
            project_root.to_string(),
            image.to_string(),
            container_name.to_string(),
        );
        self.call(move |db| db.create(&project_name, &project_root, &image, &container_name))
            .await
    }

    pub async fn get(&self, project_name: &str) -> Result<RuntimeRecord, RuntimeError> {
        let project_name = project_name.to_string();
        self.call(move |db| db.get(&project_name)).await
    }

    pub async fn list_all(&self) -> Result<Vec<RuntimeRecord>, RuntimeError> {
        self.call(|db| db.list_all()).await
    }

    pub async fn update_status(
        &self,
        project_name: &str,
        status: RuntimeStatus,
    ) -> Result<(), RuntimeError> {
        let project_name = project_name.to_string();
        self.call(move |db| db.update_status(&project_name, status))
            .await
    }

    pub async fn update_last_command(
        &self,
        project_name: &str,
        command: &str,
    ) -> Result<(), RuntimeError> {
        let (project_name, command) = (project_name.to_string(), command.to_string());
        self.call(move |db| db.update_last_command(&project_name, &command))
            .await
    }

    pub async fn delete(&self, project_name: &str) -> Result<(), RuntimeError> {
        let project_name = project_name.to_string();
        self.call(move |db| db.delete(&project_name)).await
    }
}

pub struct RuntimeDb {
    conn: Connection,
}

const RECORD_COLUMNS: &str = "project_name, project_root, container_name, image, status, \
                              last_command, created_at, updated_at";

impl RuntimeDb {
    /// Open (or create) a SQLite database at the given path and create the schema.
    pub fn new(path: &Path) -> Result<Self, RuntimeError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self, RuntimeError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), RuntimeError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS project_runtime (
                project_name TEXT PRIMARY KEY,
                project_root TEXT NOT NULL,
                container_name TEXT NOT NULL UNIQUE,
                image TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'stopped'
                    CHECK (status IN ('stopped', 'running')),
                last_command TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Insert a new record in the `stopped` state.
    pub fn create(
        &self,
        project_name: &str,
        project_root: &str,
        image: &str,
        container_name: &str,
    ) -> Result<RuntimeRecord, RuntimeError> {
        let now = Utc::now();
        let inserted = self.conn.execute(
            "INSERT INTO project_runtime
                (project_name, project_root, container_name, image, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                project_name,
                project_root,
                container_name,
                image,
                RuntimeStatus::Stopped.as_str(),
                now
            ],
        );

        match inserted {
            Ok(_) => self.get(project_name),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(RuntimeError::AlreadyExists {
                    project: project_name.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, project_name: &str) -> Result<RuntimeRecord, RuntimeError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM project_runtime WHERE project_name = ?1",
                    RECORD_COLUMNS
                ),
                params![project_name],
                row_to_record,
            )
            .optional()?
            .ok_or_else(|| RuntimeError::RuntimeNotFound {
                project: project_name.to_string(),
            })
    }

    pub fn list_all(&self) -> Result<Vec<RuntimeRecord>, RuntimeError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM project_runtime ORDER BY project_name",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn update_status(
        &self,
        project_name: &str,
        status: RuntimeStatus,
    ) -> Result<(), RuntimeError> {
        let updated = self.conn.execute(
            "UPDATE project_runtime SET status = ?1, updated_at = ?2 WHERE project_name = ?3",
            params![status.as_str(), Utc::now(), project_name],
        )?;
        require_row(updated, project_name)
    }

    /// Record the last one-shot command. Informational only.
    pub fn update_last_command(&self, project_name: &str, command: &str) -> Result<(), RuntimeError> {
        let updated = self.conn.execute(
            "UPDATE project_runtime SET last_command = ?1, updated_at = ?2 WHERE project_name = ?3",
            params![command, Utc::now(), project_name],
        )?;
        require_row(updated, project_name)
    }

    /// Remove a record. Callers must remove the container first.
    pub fn delete(&self, project_name: &str) -> Result<(), RuntimeError> {
        let deleted = self.conn.execute(
            "DELETE FROM project_runtime WHERE project_name = ?1",
            params![project_name],
        )?;
        require_row(deleted, project_name)
    }
}

fn require_row(changed: usize, project_name: &str) -> Result<(), RuntimeError> {
    if changed == 0 {
        return Err(RuntimeError::RuntimeNotFound {
            project: project_name.to_string(),
        });
    }
    Ok(())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RuntimeRecord> {
    let status: String = row.get(4)?;
    let status = status.parse::<RuntimeStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
    })?;
    let created_at: DateTime<Utc> = row.get(6)?;
    let updated_at: DateTime<Utc> = row.get(7)?;
    Ok(RuntimeRecord {
        project_name: row.get(0)?,
        project_root: row.get(1)?,
        container_name: row.get(2)?,
        image: row.get(3)?,
        status,
        last_command: row.get(5)?,
        created_at,
        updated_at,
    })
}
