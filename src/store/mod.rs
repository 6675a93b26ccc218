//! Storage for pipeline records, task assignments and secondary records.
//!
//! This module provides the [`RecordStore`] trait the handlers write
//! through, along with concrete implementations:
//!
//! - [`MemoryStore`]: Thread-safe in-memory storage for tests and demos
//! - `SqliteStore`: SQLite-backed storage (feature `sqlite`)
//!
//! Stores own two rules the handlers depend on:
//!
//! - every row carries a version; updates naming a stale version are
//!   rejected with [`WardflowError::StaleWrite`](crate::WardflowError::StaleWrite)
//! - record ids and task numbers are unique; colliding inserts are
//!   rejected with [`WardflowError::DuplicateNumber`](crate::WardflowError::DuplicateNumber)
//!   and write nothing
//!
//! # Example
//!
//! ```
//! use wardflow::{MemoryStore, PipelineRecord, RecordStore, SubjectContext};
//!
//! # async fn example() -> wardflow::Result<()> {
//! let mut store = MemoryStore::new();
//! let record = PipelineRecord::new(
//!     "LAB-001",
//!     "lab",
//!     SubjectContext::new("IPD-1", "Asha Verma"),
//!     chrono::Utc::now(),
//! );
//! let stored = store.insert_record(&record).await?;
//! assert_eq!(stored.version, 1);
//! # Ok(())
//! # }
//! ```

mod memory;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use crate::live_view::Partition;
use crate::record::PipelineRecord;
use crate::sequence::SequenceSource;
use crate::stage::StageIndex;
use crate::task::{SecondaryRecord, TaskAssignment};
use crate::Result;
use async_trait::async_trait;

/// Persistence contract for the workflow core.
///
/// Reads take `&self`; writes take `&mut self`. Implementations are
/// expected to be cheap to clone and to share state between clones, so
/// each actor can hold its own handle.
///
/// # Object Safety
///
/// This trait is object-safe, so backends can be swapped at runtime as
/// `Box<dyn RecordStore>`.
#[async_trait]
pub trait RecordStore: SequenceSource {
    /// Inserts a new record.
    ///
    /// Returns the stored row (version 1).
    ///
    /// # Errors
    ///
    /// [`WardflowError::DuplicateNumber`](crate::WardflowError::DuplicateNumber)
    /// if the id is taken.
    async fn insert_record(&mut self, record: &PipelineRecord) -> Result<PipelineRecord>;

    /// Reads a record by id.
    async fn get_record(&self, id: &str) -> Result<Option<PipelineRecord>>;

    /// Replaces a record if its stored version equals `expected_version`.
    ///
    /// Returns the stored row with its version bumped.
    ///
    /// # Errors
    ///
    /// [`WardflowError::StaleWrite`](crate::WardflowError::StaleWrite) on a
    /// version mismatch, `RecordNotFound` if the id is unknown.
    async fn update_record(
        &mut self,
        record: &PipelineRecord,
        expected_version: u64,
    ) -> Result<PipelineRecord>;

    /// All records of a pipeline, ordered by id.
    async fn list_records(&self, pipeline: &str) -> Result<Vec<PipelineRecord>>;

    /// Records of a pipeline pending at `stage`, oldest planned first.
    ///
    /// The default implementation filters [`list_records`](Self::list_records).
    async fn pending_records(
        &self,
        pipeline: &str,
        stage: StageIndex,
    ) -> Result<Vec<PipelineRecord>> {
        let records = self.list_records(pipeline).await?;
        Ok(Partition::of(records, stage).pending)
    }

    /// Inserts a batch of tasks atomically: all rows or none.
    ///
    /// # Errors
    ///
    /// [`WardflowError::DuplicateNumber`](crate::WardflowError::DuplicateNumber)
    /// if any task number is taken or repeated within the batch.
    async fn insert_tasks(&mut self, tasks: &[TaskAssignment]) -> Result<Vec<TaskAssignment>>;

    /// Reads a task by number.
    async fn get_task(&self, task_no: &str) -> Result<Option<TaskAssignment>>;

    /// All tasks in issue order: by scope, then numeric sequence.
    async fn list_tasks(&self) -> Result<Vec<TaskAssignment>>;

    /// Writes a completed task and, optionally, its secondary record in one
    /// atomic step.
    ///
    /// If the secondary record cannot be written, the task is left as it
    /// was.
    async fn commit_task_completion(
        &mut self,
        task: &TaskAssignment,
        expected_version: u64,
        secondary: Option<&SecondaryRecord>,
    ) -> Result<TaskAssignment>;

    /// All secondary records, ordered by id.
    async fn list_secondary_records(&self) -> Result<Vec<SecondaryRecord>>;
}
