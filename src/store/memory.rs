//! In-memory store implementation.
//!
//! This module provides [`MemoryStore`], a thread-safe in-memory
//! implementation of [`RecordStore`] suitable for testing and development.

use crate::record::PipelineRecord;
use crate::sequence::{SequenceScope, SequenceSource};
use crate::task::{SecondaryRecord, TaskAssignment};
use crate::{Result, WardflowError};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::RecordStore;

/// Internal storage for the memory store.
#[derive(Debug, Default)]
struct Storage {
    /// Pipeline records indexed by id.
    records: BTreeMap<String, PipelineRecord>,
    /// Task assignments indexed by task number.
    tasks: BTreeMap<String, TaskAssignment>,
    /// Secondary records indexed by id.
    secondary: BTreeMap<String, SecondaryRecord>,
}

/// An in-memory implementation of [`RecordStore`].
///
/// This implementation uses `Arc<RwLock<...>>` internally, making it safe
/// to clone and share across async tasks. Clones see each other's writes,
/// which is how tests model several actors on one shared store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    storage: Arc<RwLock<Storage>>,
}

impl MemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of pipeline records stored.
    pub async fn record_count(&self) -> usize {
        self.storage.read().await.records.len()
    }

    /// Returns the number of task rows stored.
    pub async fn task_count(&self) -> usize {
        self.storage.read().await.tasks.len()
    }

    /// Returns the number of secondary records stored.
    pub async fn secondary_count(&self) -> usize {
        self.storage.read().await.secondary.len()
    }

    /// Inserts a secondary record directly, e.g. when importing an existing
    /// registry.
    pub async fn insert_secondary_record(&self, record: SecondaryRecord) -> Result<()> {
        let mut storage = self.storage.write().await;
        if storage.secondary.contains_key(&record.id) {
            return Err(WardflowError::DuplicateNumber(record.id));
        }
        storage.secondary.insert(record.id.clone(), record);
        Ok(())
    }

    /// Clears all stored data.
    pub async fn clear(&self) {
        let mut storage = self.storage.write().await;
        storage.records.clear();
        storage.tasks.clear();
        storage.secondary.clear();
    }
}

#[async_trait]
impl SequenceSource for MemoryStore {
    async fn max_issued(&self, scope: &str) -> Result<Option<u64>> {
        let storage = self.storage.read().await;
        let parser = SequenceScope::new(scope);

        let from_records = storage.records.keys().filter_map(|id| parser.parse(id));
        let from_tasks = storage
            .tasks
            .values()
            .filter(|task| task.scope == scope)
            .map(|task| task.sequence);

        Ok(from_records.chain(from_tasks).max())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_record(&mut self, record: &PipelineRecord) -> Result<PipelineRecord> {
        let mut storage = self.storage.write().await;
        if storage.records.contains_key(&record.id) {
            return Err(WardflowError::DuplicateNumber(record.id.clone()));
        }

        let mut stored = record.clone();
        stored.version = 1;
        storage.records.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_record(&self, id: &str) -> Result<Option<PipelineRecord>> {
        let storage = self.storage.read().await;
        Ok(storage.records.get(id).cloned())
    }

    async fn update_record(
        &mut self,
        record: &PipelineRecord,
        expected_version: u64,
    ) -> Result<PipelineRecord> {
        let mut storage = self.storage.write().await;
        let current = storage
            .records
            .get_mut(&record.id)
            .ok_or_else(|| WardflowError::RecordNotFound(record.id.clone()))?;

        if current.version != expected_version {
            return Err(WardflowError::StaleWrite {
                id: record.id.clone(),
                expected: expected_version,
                found: current.version,
            });
        }

        let mut stored = record.clone();
        stored.version = expected_version + 1;
        *current = stored.clone();
        Ok(stored)
    }

    async fn list_records(&self, pipeline: &str) -> Result<Vec<PipelineRecord>> {
        let storage = self.storage.read().await;
        Ok(storage
            .records
            .values()
            .filter(|record| record.pipeline == pipeline)
            .cloned()
            .collect())
    }

    async fn insert_tasks(&mut self, tasks: &[TaskAssignment]) -> Result<Vec<TaskAssignment>> {
        let mut storage = self.storage.write().await;

        // Check the whole batch before writing any row
        let mut seen = BTreeSet::new();
        for task in tasks {
            if storage.tasks.contains_key(&task.task_no) || !seen.insert(task.task_no.as_str()) {
                return Err(WardflowError::DuplicateNumber(task.task_no.clone()));
            }
        }

        let stored: Vec<TaskAssignment> = tasks
            .iter()
            .map(|task| TaskAssignment {
                version: 1,
                ..task.clone()
            })
            .collect();
        for task in &stored {
            storage.tasks.insert(task.task_no.clone(), task.clone());
        }
        Ok(stored)
    }

    async fn get_task(&self, task_no: &str) -> Result<Option<TaskAssignment>> {
        let storage = self.storage.read().await;
        Ok(storage.tasks.get(task_no).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<TaskAssignment>> {
        let storage = self.storage.read().await;
        let mut tasks: Vec<TaskAssignment> = storage.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| {
            (&a.scope, a.sequence, &a.task_no).cmp(&(&b.scope, b.sequence, &b.task_no))
        });
        Ok(tasks)
    }

    async fn commit_task_completion(
        &mut self,
        task: &TaskAssignment,
        expected_version: u64,
        secondary: Option<&SecondaryRecord>,
    ) -> Result<TaskAssignment> {
        let mut storage = self.storage.write().await;

        let found = storage
            .tasks
            .get(&task.task_no)
            .map(|current| current.version)
            .ok_or_else(|| WardflowError::TaskNotFound(task.task_no.clone()))?;
        if found != expected_version {
            return Err(WardflowError::StaleWrite {
                id: task.task_no.clone(),
                expected: expected_version,
                found,
            });
        }
        if let Some(secondary) = secondary {
            if storage.secondary.contains_key(&secondary.id) {
                return Err(WardflowError::DuplicateNumber(secondary.id.clone()));
            }
        }

        let mut stored = task.clone();
        stored.version = expected_version + 1;
        storage.tasks.insert(stored.task_no.clone(), stored.clone());
        if let Some(secondary) = secondary {
            storage
                .secondary
                .insert(secondary.id.clone(), secondary.clone());
        }
        Ok(stored)
    }

    async fn list_secondary_records(&self) -> Result<Vec<SecondaryRecord>> {
        let storage = self.storage.read().await;
        Ok(storage.secondary.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SubjectContext;
    use crate::task::tests::sample_task;
    use crate::task::BranchType;
    use chrono::Utc;

    fn record(id: &str, pipeline: &str) -> PipelineRecord {
        PipelineRecord::new(id, pipeline, SubjectContext::new("IPD-1", "Asha"), Utc::now())
    }

    fn task(task_no: &str, sequence: u64) -> TaskAssignment {
        let mut task = sample_task(task_no, "Dressing");
        task.sequence = sequence;
        task
    }

    #[tokio::test]
    async fn test_tasks_listed_in_issue_order() {
        let mut store = MemoryStore::new();
        store
            .insert_tasks(&[task("TASK-1000", 1000), task("TASK-999", 999)])
            .await
            .unwrap();

        let numbers: Vec<String> = store
            .list_tasks()
            .await
            .unwrap()
            .into_iter()
            .map(|task| task.task_no)
            .collect();
        assert_eq!(numbers, vec!["TASK-999", "TASK-1000"]);
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = MemoryStore::new();
        assert_eq!(store.record_count().await, 0);
        assert_eq!(store.task_count().await, 0);
        assert_eq!(store.max_issued("LAB").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_and_get_record() {
        let mut store = MemoryStore::new();
        let stored = store.insert_record(&record("LAB-001", "lab")).await.unwrap();
        assert_eq!(stored.version, 1);

        let fetched = store.get_record("LAB-001").await.unwrap().unwrap();
        assert_eq!(fetched, stored);
        assert!(store.get_record("LAB-002").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_record_rejected() {
        let mut store = MemoryStore::new();
        store.insert_record(&record("LAB-001", "lab")).await.unwrap();
        let err = store
            .insert_record(&record("LAB-001", "lab"))
            .await
            .unwrap_err();
        assert!(matches!(err, WardflowError::DuplicateNumber(_)));
    }

    #[tokio::test]
    async fn test_update_checks_version() {
        let mut store = MemoryStore::new();
        let stored = store.insert_record(&record("LAB-001", "lab")).await.unwrap();

        let updated = store.update_record(&stored, 1).await.unwrap();
        assert_eq!(updated.version, 2);

        let err = store.update_record(&stored, 1).await.unwrap_err();
        assert!(matches!(
            err,
            WardflowError::StaleWrite {
                expected: 1,
                found: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let mut store = MemoryStore::new();
        let err = store
            .update_record(&record("LAB-404", "lab"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, WardflowError::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_records_filters_pipeline() {
        let mut store = MemoryStore::new();
        store.insert_record(&record("LAB-001", "lab")).await.unwrap();
        store.insert_record(&record("DIS-001", "discharge")).await.unwrap();
        store.insert_record(&record("LAB-002", "lab")).await.unwrap();

        let lab = store.list_records("lab").await.unwrap();
        let ids: Vec<&str> = lab.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["LAB-001", "LAB-002"]);
    }

    #[tokio::test]
    async fn test_max_issued_spans_records_and_tasks() {
        let mut store = MemoryStore::new();
        store.insert_record(&record("LAB-041", "lab")).await.unwrap();
        store.insert_record(&record("LAB-007", "lab")).await.unwrap();
        store.insert_tasks(&[task("TASK-003", 3)]).await.unwrap();

        assert_eq!(store.max_issued("LAB").await.unwrap(), Some(41));
        assert_eq!(store.max_issued("TASK").await.unwrap(), Some(3));
        assert_eq!(store.max_issued("DIS").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_tasks_is_all_or_nothing() {
        let mut store = MemoryStore::new();
        store.insert_tasks(&[task("TASK-002", 2)]).await.unwrap();

        let err = store
            .insert_tasks(&[task("TASK-001", 1), task("TASK-002", 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, WardflowError::DuplicateNumber(ref n) if n == "TASK-002"));
        assert_eq!(store.task_count().await, 1);
        assert!(store.get_task("TASK-001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_tasks_rejects_repeats_within_batch() {
        let mut store = MemoryStore::new();
        let err = store
            .insert_tasks(&[task("TASK-001", 1), task("TASK-001", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, WardflowError::DuplicateNumber(_)));
        assert_eq!(store.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_commit_task_with_secondary() {
        let mut store = MemoryStore::new();
        let stored = store.insert_tasks(&[task("TASK-001", 1)]).await.unwrap();

        let mut done = stored[0].clone();
        done.actual_at = Some(Utc::now());
        done.branch_type = Some(BranchType::Primary);
        let secondary = SecondaryRecord::snapshot(
            &done,
            BranchType::Primary,
            Default::default(),
            Utc::now(),
        );

        let committed = store
            .commit_task_completion(&done, 1, Some(&secondary))
            .await
            .unwrap();
        assert_eq!(committed.version, 2);
        assert_eq!(store.secondary_count().await, 1);
    }

    #[tokio::test]
    async fn test_commit_leaves_task_when_secondary_collides() {
        let mut store = MemoryStore::new();
        let stored = store.insert_tasks(&[task("TASK-001", 1)]).await.unwrap();

        let mut done = stored[0].clone();
        done.actual_at = Some(Utc::now());
        let secondary = SecondaryRecord::snapshot(
            &done,
            BranchType::Primary,
            Default::default(),
            Utc::now(),
        );
        store
            .insert_secondary_record(secondary.clone())
            .await
            .unwrap();

        let err = store
            .commit_task_completion(&done, 1, Some(&secondary))
            .await
            .unwrap_err();
        assert!(matches!(err, WardflowError::DuplicateNumber(_)));

        let task = store.get_task("TASK-001").await.unwrap().unwrap();
        assert!(task.actual_at.is_none());
        assert_eq!(task.version, 1);
    }

    #[tokio::test]
    async fn test_commit_rejects_stale_version() {
        let mut store = MemoryStore::new();
        store.insert_tasks(&[task("TASK-001", 1)]).await.unwrap();
        let done = store.get_task("TASK-001").await.unwrap().unwrap();

        store.commit_task_completion(&done, 1, None).await.unwrap();
        let err = store
            .commit_task_completion(&done, 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WardflowError::StaleWrite { .. }));
    }

    #[tokio::test]
    async fn test_store_trait_object() {
        let mut store: Box<dyn RecordStore> = Box::new(MemoryStore::new());
        store.insert_record(&record("LAB-001", "lab")).await.unwrap();
        assert!(store.get_record("LAB-001").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_is_clone() {
        let mut store1 = MemoryStore::new();
        let store2 = store1.clone();

        store1.insert_record(&record("LAB-001", "lab")).await.unwrap();

        // Changes visible through clone
        assert!(store2.get_record("LAB-001").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_inserts() {
        let store = MemoryStore::new();
        let mut handles = Vec::new();

        for i in 0..10 {
            let mut store_clone = store.clone();
            handles.push(tokio::spawn(async move {
                store_clone
                    .insert_record(&record(&format!("LAB-{:03}", i + 1), "lab"))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.record_count().await, 10);
        assert_eq!(store.max_issued("LAB").await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_clear() {
        let mut store = MemoryStore::new();
        store.insert_record(&record("LAB-001", "lab")).await.unwrap();
        store.insert_tasks(&[task("TASK-001", 1)]).await.unwrap();

        store.clear().await;

        assert_eq!(store.record_count().await, 0);
        assert_eq!(store.task_count().await, 0);
    }
}
