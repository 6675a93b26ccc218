//! SQLite-backed store implementation.
//!
//! This module provides [`SqliteStore`], a persistent implementation of
//! [`RecordStore`] backed by SQLite. Rows are stored as JSON alongside the
//! columns the store itself needs to enforce its rules: primary keys for
//! uniqueness, `version` for optimistic concurrency, `scope`/`seq` for the
//! number issuer.

use crate::config::WardflowConfig;
use crate::record::PipelineRecord;
use crate::sequence::{SequenceScope, SequenceSource};
use crate::task::{SecondaryRecord, TaskAssignment};
use crate::{Result, WardflowError};
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::RecordStore;

/// Schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

/// SQL for creating the records table.
const CREATE_RECORDS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS records (
        id TEXT NOT NULL PRIMARY KEY,
        pipeline TEXT NOT NULL,
        scope TEXT,
        seq INTEGER,
        version INTEGER NOT NULL,
        record_json TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
"#;

/// SQL for creating the tasks table.
const CREATE_TASKS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS tasks (
        task_no TEXT NOT NULL PRIMARY KEY,
        scope TEXT NOT NULL,
        seq INTEGER NOT NULL,
        version INTEGER NOT NULL,
        task_json TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
"#;

/// SQL for creating the secondary records table.
const CREATE_SECONDARY_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS secondary_records (
        id TEXT NOT NULL PRIMARY KEY,
        source_task_no TEXT NOT NULL,
        record_json TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
"#;

/// SQL for creating the schema_version table.
const CREATE_SCHEMA_VERSION_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    )
"#;

/// Index on records for per-pipeline listing.
const CREATE_PIPELINE_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_records_pipeline
    ON records (pipeline)
"#;

/// Index on both numbered tables for the issuer's max lookup.
const CREATE_SCOPE_INDEXES: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_records_scope ON records (scope, seq);
    CREATE INDEX IF NOT EXISTS idx_tasks_scope ON tasks (scope, seq);
"#;

/// Result of a guarded write, resolved into an error outside the blocking
/// closure.
enum Guarded<T> {
    Written(T),
    Missing,
    Stale(u64),
    Duplicate(String),
}

/// A SQLite-backed implementation of [`RecordStore`].
///
/// # Thread Safety
///
/// The store wraps the SQLite connection in a `Mutex` and uses
/// `spawn_blocking` for all database operations, making it safe
/// for use in async contexts. Clones share the connection.
///
/// # Example
///
/// ```rust,ignore
/// use wardflow::SqliteStore;
///
/// // Open or create a database file
/// let store = SqliteStore::open("wardflow.db").await?;
///
/// // Or use an in-memory database for testing
/// let store = SqliteStore::open_in_memory().await?;
/// ```
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn join_error(e: tokio::task::JoinError) -> WardflowError {
    WardflowError::Storage(format!("spawn_blocking failed: {}", e))
}

fn db_error(context: &'static str) -> impl Fn(rusqlite::Error) -> WardflowError {
    move |e| WardflowError::Database(format!("{}: {}", context, e))
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::ConstraintViolation
    )
}

fn from_json<T: DeserializeOwned>(json: &str) -> rusqlite::Result<T> {
    serde_json::from_str(json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn json_column(row: &rusqlite::Row<'_>) -> rusqlite::Result<String> {
    row.get(0)
}

/// Splits `LAB-007` into `("LAB", 7)`.
fn scope_of(id: &str) -> (Option<String>, Option<i64>) {
    match id.rsplit_once('-') {
        Some((scope, _)) => {
            let seq = SequenceScope::new(scope)
                .parse(id)
                .and_then(|n| i64::try_from(n).ok());
            (Some(scope.to_string()), seq)
        }
        None => (None, None),
    }
}

fn version_param(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|_| WardflowError::Storage("version overflow".to_string()))
}

impl SqliteStore {
    /// Opens a SQLite database at the given path.
    ///
    /// Creates the database and schema if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the
    /// schema cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let conn = tokio::task::spawn_blocking(move || Connection::open(&path))
            .await
            .map_err(join_error)?
            .map_err(db_error("failed to open database"))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.run_migrations().await?;
        Ok(store)
    }

    /// Opens an in-memory SQLite database.
    ///
    /// Useful for testing. The database is lost when the last clone is
    /// dropped.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(Connection::open_in_memory)
            .await
            .map_err(join_error)?
            .map_err(db_error("failed to open in-memory database"))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.run_migrations().await?;
        Ok(store)
    }

    /// Opens the database named by `config.database_path`, or an
    /// in-memory database when none is set.
    pub async fn from_config(config: &WardflowConfig) -> Result<Self> {
        match &config.database_path {
            Some(path) => Self::open(path).await,
            None => Self::open_in_memory().await,
        }
    }

    /// Runs schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();

            conn.execute(CREATE_SCHEMA_VERSION_TABLE, [])?;

            let version: Option<i32> = conn
                .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                    row.get(0)
                })
                .optional()?;

            if version.map_or(true, |v| v < SCHEMA_VERSION) {
                conn.execute(CREATE_RECORDS_TABLE, [])?;
                conn.execute(CREATE_TASKS_TABLE, [])?;
                conn.execute(CREATE_SECONDARY_TABLE, [])?;
                conn.execute(CREATE_PIPELINE_INDEX, [])?;
                conn.execute_batch(CREATE_SCOPE_INDEXES)?;

                conn.execute("DELETE FROM schema_version", [])?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }

            Ok::<(), rusqlite::Error>(())
        })
        .await
        .map_err(join_error)?
        .map_err(db_error("migration failed"))
    }

    /// Checks if the required tables exist.
    pub async fn tables_exist(&self) -> Result<bool> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
                 ('records', 'tasks', 'secondary_records', 'schema_version')",
                [],
                |row| row.get(0),
            )?;
            Ok::<bool, rusqlite::Error>(count == 4)
        })
        .await
        .map_err(join_error)?
        .map_err(db_error("table check failed"))
    }

    /// Runs a read-only query returning JSON rows.
    async fn query_json<T>(&self, sql: &'static str, arg: Option<String>) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(sql)?;
            let rows = match arg {
                Some(arg) => stmt.query_map(params![arg], json_column)?,
                None => stmt.query_map([], json_column)?,
            };

            let mut result = Vec::new();
            for row in rows {
                result.push(from_json(&row?)?);
            }
            Ok::<Vec<T>, rusqlite::Error>(result)
        })
        .await
        .map_err(join_error)?
        .map_err(db_error("query failed"))
    }
}

// Debug implementation that doesn't expose connection details
impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl SequenceSource for SqliteStore {
    async fn max_issued(&self, scope: &str) -> Result<Option<u64>> {
        let conn = Arc::clone(&self.conn);
        let scope = scope.to_string();

        let max: Option<i64> = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row(
                "SELECT MAX(seq) FROM (
                    SELECT seq FROM records WHERE scope = ?1
                    UNION ALL
                    SELECT seq FROM tasks WHERE scope = ?1
                )",
                params![scope],
                |row| row.get(0),
            )
        })
        .await
        .map_err(join_error)?
        .map_err(db_error("sequence lookup failed"))?;

        Ok(max.and_then(|m| u64::try_from(m).ok()))
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert_record(&mut self, record: &PipelineRecord) -> Result<PipelineRecord> {
        let conn = Arc::clone(&self.conn);
        let mut stored = record.clone();
        stored.version = 1;
        let record_json = serde_json::to_string(&stored)?;
        let (scope, seq) = scope_of(&stored.id);
        let id = stored.id.clone();
        let pipeline = stored.pipeline.clone();
        let updated_at = chrono::Utc::now().to_rfc3339();

        let outcome = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let inserted = conn.execute(
                "INSERT INTO records (id, pipeline, scope, seq, version, record_json, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)",
                params![id, pipeline, scope, seq, record_json, updated_at],
            );
            match inserted {
                Ok(_) => Ok::<Guarded<()>, rusqlite::Error>(Guarded::Written(())),
                Err(e) if is_unique_violation(&e) => Ok(Guarded::Duplicate(id)),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(join_error)?
        .map_err(db_error("insert failed"))?;

        match outcome {
            Guarded::Duplicate(id) => Err(WardflowError::DuplicateNumber(id)),
            _ => Ok(stored),
        }
    }

    async fn get_record(&self, id: &str) -> Result<Option<PipelineRecord>> {
        let mut rows = self
            .query_json(
                "SELECT record_json FROM records WHERE id = ?1",
                Some(id.to_string()),
            )
            .await?;
        Ok(rows.pop())
    }

    async fn update_record(
        &mut self,
        record: &PipelineRecord,
        expected_version: u64,
    ) -> Result<PipelineRecord> {
        let conn = Arc::clone(&self.conn);
        let mut stored = record.clone();
        stored.version = expected_version + 1;
        let record_json = serde_json::to_string(&stored)?;
        let id = stored.id.clone();
        let expected = version_param(expected_version)?;
        let next = version_param(stored.version)?;
        let updated_at = chrono::Utc::now().to_rfc3339();

        let outcome = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let changed = conn.execute(
                "UPDATE records SET version = ?1, record_json = ?2, updated_at = ?3 \
                 WHERE id = ?4 AND version = ?5",
                params![next, record_json, updated_at, id, expected],
            )?;
            if changed == 1 {
                return Ok(Guarded::Written(()));
            }

            let found: Option<i64> = conn
                .query_row(
                    "SELECT version FROM records WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok::<Guarded<()>, rusqlite::Error>(match found {
                Some(found) => Guarded::Stale(found.max(0).unsigned_abs()),
                None => Guarded::Missing,
            })
        })
        .await
        .map_err(join_error)?
        .map_err(db_error("update failed"))?;

        match outcome {
            Guarded::Written(()) => Ok(stored),
            Guarded::Stale(found) => Err(WardflowError::StaleWrite {
                id: stored.id,
                expected: expected_version,
                found,
            }),
            Guarded::Missing | Guarded::Duplicate(_) => {
                Err(WardflowError::RecordNotFound(stored.id))
            }
        }
    }

    async fn list_records(&self, pipeline: &str) -> Result<Vec<PipelineRecord>> {
        self.query_json(
            "SELECT record_json FROM records WHERE pipeline = ?1 ORDER BY id",
            Some(pipeline.to_string()),
        )
        .await
    }

    async fn insert_tasks(&mut self, tasks: &[TaskAssignment]) -> Result<Vec<TaskAssignment>> {
        let conn = Arc::clone(&self.conn);
        let stored: Vec<TaskAssignment> = tasks
            .iter()
            .map(|task| TaskAssignment {
                version: 1,
                ..task.clone()
            })
            .collect();

        let mut rows = Vec::with_capacity(stored.len());
        for task in &stored {
            let seq = i64::try_from(task.sequence)
                .map_err(|_| WardflowError::Storage("sequence overflow".to_string()))?;
            rows.push((
                task.task_no.clone(),
                task.scope.clone(),
                seq,
                serde_json::to_string(task)?,
            ));
        }
        let updated_at = chrono::Utc::now().to_rfc3339();

        let outcome = tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            for (task_no, scope, seq, task_json) in &rows {
                let inserted = tx.execute(
                    "INSERT INTO tasks (task_no, scope, seq, version, task_json, updated_at) \
                     VALUES (?1, ?2, ?3, 1, ?4, ?5)",
                    params![task_no, scope, seq, task_json, updated_at],
                );
                match inserted {
                    Ok(_) => {}
                    // Dropping the transaction rolls back earlier rows
                    Err(e) if is_unique_violation(&e) => {
                        return Ok(Guarded::Duplicate(task_no.clone()))
                    }
                    Err(e) => return Err(e),
                }
            }
            tx.commit()?;
            Ok::<Guarded<()>, rusqlite::Error>(Guarded::Written(()))
        })
        .await
        .map_err(join_error)?
        .map_err(db_error("task insert failed"))?;

        match outcome {
            Guarded::Duplicate(task_no) => Err(WardflowError::DuplicateNumber(task_no)),
            _ => Ok(stored),
        }
    }

    async fn get_task(&self, task_no: &str) -> Result<Option<TaskAssignment>> {
        let mut rows = self
            .query_json(
                "SELECT task_json FROM tasks WHERE task_no = ?1",
                Some(task_no.to_string()),
            )
            .await?;
        Ok(rows.pop())
    }

    async fn list_tasks(&self) -> Result<Vec<TaskAssignment>> {
        self.query_json("SELECT task_json FROM tasks ORDER BY scope, seq, task_no", None)
            .await
    }

    async fn commit_task_completion(
        &mut self,
        task: &TaskAssignment,
        expected_version: u64,
        secondary: Option<&SecondaryRecord>,
    ) -> Result<TaskAssignment> {
        let conn = Arc::clone(&self.conn);
        let mut stored = task.clone();
        stored.version = expected_version + 1;
        let task_json = serde_json::to_string(&stored)?;
        let task_no = stored.task_no.clone();
        let expected = version_param(expected_version)?;
        let next = version_param(stored.version)?;
        let secondary_row = match secondary {
            Some(s) => Some((
                s.id.clone(),
                s.source_task_no.clone(),
                serde_json::to_string(s)?,
                s.created_at.to_rfc3339(),
            )),
            None => None,
        };
        let updated_at = chrono::Utc::now().to_rfc3339();

        let outcome = tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;

            let changed = tx.execute(
                "UPDATE tasks SET version = ?1, task_json = ?2, updated_at = ?3 \
                 WHERE task_no = ?4 AND version = ?5",
                params![next, task_json, updated_at, task_no, expected],
            )?;
            if changed != 1 {
                let found: Option<i64> = tx
                    .query_row(
                        "SELECT version FROM tasks WHERE task_no = ?1",
                        params![task_no],
                        |row| row.get(0),
                    )
                    .optional()?;
                return Ok(match found {
                    Some(found) => Guarded::Stale(found.max(0).unsigned_abs()),
                    None => Guarded::Missing,
                });
            }

            if let Some((id, source_task_no, record_json, created_at)) = &secondary_row {
                let inserted = tx.execute(
                    "INSERT INTO secondary_records (id, source_task_no, record_json, created_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, source_task_no, record_json, created_at],
                );
                match inserted {
                    Ok(_) => {}
                    Err(e) if is_unique_violation(&e) => {
                        return Ok(Guarded::Duplicate(id.clone()))
                    }
                    Err(e) => return Err(e),
                }
            }

            tx.commit()?;
            Ok::<Guarded<()>, rusqlite::Error>(Guarded::Written(()))
        })
        .await
        .map_err(join_error)?
        .map_err(db_error("task completion failed"))?;

        match outcome {
            Guarded::Written(()) => Ok(stored),
            Guarded::Stale(found) => Err(WardflowError::StaleWrite {
                id: stored.task_no,
                expected: expected_version,
                found,
            }),
            Guarded::Missing => Err(WardflowError::TaskNotFound(stored.task_no)),
            Guarded::Duplicate(id) => Err(WardflowError::DuplicateNumber(id)),
        }
    }

    async fn list_secondary_records(&self) -> Result<Vec<SecondaryRecord>> {
        self.query_json(
            "SELECT record_json FROM secondary_records ORDER BY id",
            None,
        )
        .await
    }
}
