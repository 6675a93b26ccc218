//! Completion of task assignments, with branch sub-workflows.
//!
//! Some task names (by default "OT Information") require the completing
//! actor to classify the outcome. A [`BranchType::Primary`] classification
//! spawns a [`SecondaryRecord`] snapshot of the task; the task completion
//! and the secondary record are committed together or not at all.

use crate::config::WardflowConfig;
use crate::event::{EventBus, PipelineEvent};
use crate::store::RecordStore;
use crate::task::{BranchType, SecondaryRecord, TaskAssignment, TASK_STAGE};
use crate::{Result, WardflowError};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Task names whose completion requires a branch classification.
///
/// Matching ignores case and surrounding whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRegistry {
    markers: Vec<String>,
}

impl BranchRegistry {
    /// Creates a registry from marker task names.
    pub fn new<I, M>(markers: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        let mut registry = Self {
            markers: Vec::new(),
        };
        for marker in markers {
            registry.register(marker);
        }
        registry
    }

    /// Creates a registry from the configured markers.
    pub fn from_config(config: &WardflowConfig) -> Self {
        Self::new(config.branch_markers.iter().cloned())
    }

    /// Adds a marker. Blank and repeated markers are ignored.
    pub fn register(&mut self, marker: impl Into<String>) {
        let marker = marker.into().trim().to_string();
        if !marker.is_empty() && !self.requires_branch(&marker) {
            self.markers.push(marker);
        }
    }

    /// Returns true if `task_name` matches a marker.
    pub fn requires_branch(&self, task_name: &str) -> bool {
        let name = task_name.trim();
        self.markers.iter().any(|m| m.eq_ignore_ascii_case(name))
    }

    /// The registered markers.
    pub fn markers(&self) -> &[String] {
        &self.markers
    }
}

impl Default for BranchRegistry {
    fn default() -> Self {
        Self::new([crate::config::DEFAULT_BRANCH_MARKER])
    }
}

/// Input for completing a task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskCompletion {
    /// Name of the completing actor.
    pub actor: String,

    /// Branch classification, required for marked tasks only.
    pub branch_type: Option<BranchType>,

    /// Free-text remarks.
    pub remarks: Option<String>,

    /// Extra details copied onto a secondary record.
    pub extra: BTreeMap<String, JsonValue>,
}

impl TaskCompletion {
    /// A completion by `actor` with no branch.
    pub fn by(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            ..Self::default()
        }
    }

    /// Sets the branch classification.
    pub fn with_branch(mut self, branch_type: BranchType) -> Self {
        self.branch_type = Some(branch_type);
        self
    }

    /// Sets the remarks.
    pub fn with_remarks(mut self, remarks: impl Into<String>) -> Self {
        self.remarks = Some(remarks.into());
        self
    }

    /// Adds an extra detail.
    pub fn with_extra(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Result of a task completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOutcome {
    /// The task as stored.
    pub task: TaskAssignment,

    /// The secondary record, when the primary branch was taken.
    pub secondary: Option<SecondaryRecord>,
}

/// Completes task assignments, spawning secondary records on the primary
/// branch.
#[derive(Debug, Clone)]
pub struct BranchHandler {
    registry: BranchRegistry,
    events: EventBus,
    write_attempts: u32,
}

impl BranchHandler {
    /// Creates a handler with its own event channel.
    pub fn new(registry: BranchRegistry) -> Self {
        Self {
            registry,
            events: EventBus::default(),
            write_attempts: 3,
        }
    }

    /// Creates a handler from configuration, emitting on `events`.
    pub fn from_config(config: &WardflowConfig, events: EventBus) -> Self {
        Self {
            registry: BranchRegistry::from_config(config),
            events,
            write_attempts: config.write_attempts.max(1),
        }
    }

    /// Emits events on `bus`.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = bus;
        self
    }

    /// The marker registry.
    pub fn registry(&self) -> &BranchRegistry {
        &self.registry
    }

    /// Returns true if completing `task` needs a branch classification.
    pub fn requires_branch(&self, task: &TaskAssignment) -> bool {
        task.requires_branch || self.registry.requires_branch(&task.task_name)
    }

    /// Checks a completion against a task and builds the rows to write.
    fn prepare(
        &self,
        task: &TaskAssignment,
        completion: &TaskCompletion,
        at: DateTime<Utc>,
    ) -> Result<(TaskAssignment, Option<SecondaryRecord>)> {
        if task.is_completed() {
            return Err(WardflowError::validation("Task already completed"));
        }
        if completion.actor.trim().is_empty() {
            return Err(WardflowError::validation("Completing user is required"));
        }

        let branch = match (self.requires_branch(task), completion.branch_type) {
            (true, None) => {
                return Err(WardflowError::validation(format!(
                    "Please select Surgical or Non-Surgical for {}",
                    task.task_name
                )))
            }
            (false, Some(_)) => {
                return Err(WardflowError::validation(format!(
                    "{} does not take a branch type",
                    task.task_name
                )))
            }
            (_, branch) => branch,
        };

        let mut updated = task.clone();
        updated.actual_at = Some(at);
        updated.completed_by = Some(completion.actor.clone());
        updated.branch_type = branch;
        updated.remarks = completion.remarks.clone();

        let secondary = branch
            .filter(BranchType::spawns_secondary)
            .map(|b| SecondaryRecord::snapshot(&updated, b, completion.extra.clone(), at));

        Ok((updated, secondary))
    }

    /// Completes task `task_no` now.
    ///
    /// See [`complete_task_at`](Self::complete_task_at).
    pub async fn complete_task<S>(
        &self,
        store: &mut S,
        task_no: &str,
        completion: TaskCompletion,
    ) -> Result<CompletionOutcome>
    where
        S: RecordStore + ?Sized,
    {
        self.complete_task_at(store, task_no, completion, Utc::now())
            .await
    }

    /// Completes task `task_no` at `at`.
    ///
    /// The task and, on the primary branch, its secondary record are
    /// written with one atomic store call. If that call fails the task
    /// stays pending.
    ///
    /// # Errors
    ///
    /// - [`WardflowError::Validation`] if the task is already completed, a
    ///   marked task has no branch, or an unmarked task has one
    /// - [`WardflowError::Conflict`] if another writer completed the task
    ///   between the read and the write
    /// - [`WardflowError::TaskNotFound`] or a storage error
    pub async fn complete_task_at<S>(
        &self,
        store: &mut S,
        task_no: &str,
        completion: TaskCompletion,
        at: DateTime<Utc>,
    ) -> Result<CompletionOutcome>
    where
        S: RecordStore + ?Sized,
    {
        let span = info_span!("complete_task", task_no = %task_no);

        async {
            let mut last_error = None;

            for attempt in 1..=self.write_attempts {
                let task = store
                    .get_task(task_no)
                    .await?
                    .ok_or_else(|| WardflowError::TaskNotFound(task_no.to_string()))?;

                let (updated, secondary) = match self.prepare(&task, &completion, at) {
                    Ok(prepared) => prepared,
                    Err(e) if attempt > 1 && task.is_completed() => {
                        warn!(reason = %e, "lost completion race");
                        self.events.emit(PipelineEvent::CompletionConflict {
                            record_id: task_no.to_string(),
                            stage: TASK_STAGE,
                        });
                        return Err(WardflowError::Conflict {
                            id: task_no.to_string(),
                            stage: TASK_STAGE,
                        });
                    }
                    Err(e) => return Err(e),
                };

                match store
                    .commit_task_completion(&updated, task.version, secondary.as_ref())
                    .await
                {
                    Ok(stored) => {
                        info!(
                            actor = %completion.actor,
                            branch = ?stored.branch_type,
                            "task completed"
                        );
                        self.events.emit(PipelineEvent::TaskCompleted {
                            task_no: stored.task_no.clone(),
                        });
                        if let Some(record) = &secondary {
                            self.events.emit(PipelineEvent::SecondaryRecordCreated {
                                secondary_id: record.id.clone(),
                                source_task_no: record.source_task_no.clone(),
                            });
                        }
                        return Ok(CompletionOutcome {
                            task: stored,
                            secondary,
                        });
                    }
                    Err(e @ WardflowError::StaleWrite { .. }) => {
                        debug!(attempt, error = %e, "stale write; reloading");
                        last_error = Some(e);
                    }
                    Err(e) => {
                        error!(error = %e, "task completion not committed; task left pending");
                        return Err(e);
                    }
                }
            }

            Err(last_error
                .unwrap_or_else(|| WardflowError::Storage("no write attempted".to_string())))
        }
        .instrument(span)
        .await
    }
}

impl Default for BranchHandler {
    fn default() -> Self {
        Self::new(BranchRegistry::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StagedRecord;
    use crate::stage::StagePhase;
    use crate::store::MemoryStore;
    use crate::task::tests::sample_task;
    use serde_json::json;

    async fn store_with(tasks: &[TaskAssignment]) -> MemoryStore {
        let mut store = MemoryStore::new();
        store.insert_tasks(tasks).await.unwrap();
        store
    }

    #[test]
    fn test_registry_matching() {
        let mut registry = BranchRegistry::default();
        assert!(registry.requires_branch("OT Information"));
        assert!(registry.requires_branch("  ot information "));
        assert!(!registry.requires_branch("Dressing"));

        registry.register("Cath Lab");
        registry.register("cath lab");
        registry.register("  ");
        assert_eq!(registry.markers().len(), 2);
    }

    #[tokio::test]
    async fn test_primary_branch_creates_one_secondary() {
        let task = sample_task("TASK-001", "OT Information");
        let mut store = store_with(&[task.clone()]).await;
        let handler = BranchHandler::default();

        let outcome = handler
            .complete_task(
                &mut store,
                "TASK-001",
                TaskCompletion::by("Dr. Mehta")
                    .with_branch(BranchType::Primary)
                    .with_extra("procedure", json!("Appendectomy")),
            )
            .await
            .unwrap();

        assert_eq!(outcome.task.phase(TASK_STAGE), StagePhase::Completed);
        let secondary = outcome.secondary.unwrap();
        assert_eq!(secondary.source_task_no, "TASK-001");
        assert_eq!(secondary.subject, task.subject);
        assert_eq!(secondary.task_name, task.task_name);
        assert_eq!(secondary.shift, task.shift);
        assert_eq!(secondary.assigned_resource, task.assigned_resource);
        assert_eq!(secondary.extra["procedure"], json!("Appendectomy"));
        assert_eq!(store.list_secondary_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_secondary_branch_creates_none() {
        let mut store = store_with(&[sample_task("TASK-001", "OT Information")]).await;
        let outcome = BranchHandler::default()
            .complete_task(
                &mut store,
                "TASK-001",
                TaskCompletion::by("Dr. Mehta").with_branch(BranchType::Secondary),
            )
            .await
            .unwrap();

        assert!(outcome.secondary.is_none());
        assert!(outcome.task.is_completed());
        assert_eq!(outcome.task.branch_type, Some(BranchType::Secondary));
        assert!(store.list_secondary_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_marked_task_requires_branch() {
        let mut store = store_with(&[sample_task("TASK-001", "OT Information")]).await;
        let err = BranchHandler::default()
            .complete_task(&mut store, "TASK-001", TaskCompletion::by("Dr. Mehta"))
            .await
            .unwrap_err();

        assert!(err.is_validation());
        let task = store.get_task("TASK-001").await.unwrap().unwrap();
        assert!(!task.is_completed());
    }

    #[tokio::test]
    async fn test_flagged_task_requires_branch_even_if_renamed() {
        let mut task = sample_task("TASK-001", "Pre-op review");
        task.requires_branch = true;
        let mut store = store_with(&[task]).await;

        let err = BranchHandler::default()
            .complete_task(&mut store, "TASK-001", TaskCompletion::by("Dr. Mehta"))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_plain_task_rejects_branch() {
        let mut store = store_with(&[sample_task("TASK-001", "Dressing")]).await;
        let handler = BranchHandler::default();

        let err = handler
            .complete_task(
                &mut store,
                "TASK-001",
                TaskCompletion::by("Dr. Mehta").with_branch(BranchType::Primary),
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let outcome = handler
            .complete_task(
                &mut store,
                "TASK-001",
                TaskCompletion::by("Dr. Mehta").with_remarks("dressing changed"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.task.remarks.as_deref(), Some("dressing changed"));
        assert!(outcome.secondary.is_none());
    }

    #[tokio::test]
    async fn test_double_completion_is_rejected() {
        let mut store = store_with(&[sample_task("TASK-001", "OT Information")]).await;
        let handler = BranchHandler::default();
        let completion = TaskCompletion::by("Dr. Mehta").with_branch(BranchType::Primary);

        handler
            .complete_task(&mut store, "TASK-001", completion.clone())
            .await
            .unwrap();
        let err = handler
            .complete_task(&mut store, "TASK-001", completion)
            .await
            .unwrap_err();

        assert!(err.is_validation());
        assert_eq!(store.list_secondary_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_secondary_failure_leaves_task_pending() {
        let task = sample_task("TASK-001", "OT Information");
        let mut store = store_with(&[task.clone()]).await;
        // Occupy the id the snapshot will use
        store
            .insert_secondary_record(SecondaryRecord::snapshot(
                &task,
                BranchType::Primary,
                BTreeMap::new(),
                Utc::now(),
            ))
            .await
            .unwrap();

        let err = BranchHandler::default()
            .complete_task(
                &mut store,
                "TASK-001",
                TaskCompletion::by("Dr. Mehta").with_branch(BranchType::Primary),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, WardflowError::DuplicateNumber(_)));
        let task = store.get_task("TASK-001").await.unwrap().unwrap();
        assert_eq!(task.phase(TASK_STAGE), StagePhase::Pending);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let mut store = MemoryStore::new();
        let err = BranchHandler::default()
            .complete_task(&mut store, "TASK-404", TaskCompletion::by("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, WardflowError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let mut store = store_with(&[sample_task("TASK-001", "OT Information")]).await;
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let handler = BranchHandler::default().with_events(bus);

        handler
            .complete_task(
                &mut store,
                "TASK-001",
                TaskCompletion::by("Dr. Mehta").with_branch(BranchType::Primary),
            )
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            PipelineEvent::TaskCompleted {
                task_no: "TASK-001".to_string()
            }
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::SecondaryRecordCreated { .. }
        ));
    }
}
