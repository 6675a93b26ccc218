//! Expansion of one shift assignment form into task rows.
//!
//! Each `(shift, task name)` pair of a staffed shift becomes its own
//! [`TaskAssignment`] with its own task number. A submission is either
//! written whole or not at all.

use crate::branch::BranchRegistry;
use crate::config::WardflowConfig;
use crate::event::{EventBus, PipelineEvent};
use crate::record::SubjectContext;
use crate::sequence::{SequenceScope, TaskNumberIssuer};
use crate::store::RecordStore;
use crate::task::{Shift, TaskAssignment};
use crate::{Result, WardflowError};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn, Instrument};

/// The tasks given to one resource for one shift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftAssignment {
    /// The shift.
    pub shift: Shift,

    /// Assigned staff member. Blank means the shift is not staffed.
    pub resource: String,

    /// Whether the assignee wants a reminder.
    pub reminder: bool,

    /// First day the tasks apply to.
    pub start_date: NaiveDate,

    /// Task names, one row each.
    pub task_names: Vec<String>,
}

impl ShiftAssignment {
    /// Creates an assignment with no tasks.
    pub fn new(shift: Shift, resource: impl Into<String>, start_date: NaiveDate) -> Self {
        Self {
            shift,
            resource: resource.into(),
            reminder: false,
            start_date,
            task_names: Vec::new(),
        }
    }

    /// Adds a task name.
    pub fn task(mut self, name: impl Into<String>) -> Self {
        self.task_names.push(name.into());
        self
    }

    /// Adds several task names.
    pub fn tasks<I, T>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.task_names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Requests a reminder.
    pub fn with_reminder(mut self) -> Self {
        self.reminder = true;
        self
    }

    /// Returns true if a resource is set.
    pub fn is_staffed(&self) -> bool {
        !self.resource.trim().is_empty()
    }
}

/// Creates task rows from shift assignments.
#[derive(Debug, Clone)]
pub struct TaskFanOut {
    scope: SequenceScope,
    registry: BranchRegistry,
    events: EventBus,
    issue_attempts: u32,
}

impl TaskFanOut {
    /// Creates a fan-out engine issuing numbers in `scope`.
    pub fn new(scope: SequenceScope, registry: BranchRegistry) -> Self {
        Self {
            scope,
            registry,
            events: EventBus::default(),
            issue_attempts: 3,
        }
    }

    /// Creates a fan-out engine from configuration, emitting on `events`.
    pub fn from_config(config: &WardflowConfig, events: EventBus) -> Self {
        Self {
            scope: config.task_scope.clone(),
            registry: BranchRegistry::from_config(config),
            events,
            issue_attempts: config.issue_attempts.max(1),
        }
    }

    /// Emits events on `bus`.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = bus;
        self
    }

    /// Checks a submission and returns the staffed assignments with their
    /// task names, in submission order.
    ///
    /// # Errors
    ///
    /// [`WardflowError::Validation`] if a staffed shift has no tasks or a
    /// blank task name, or no shift is staffed at all.
    pub fn plan<'a>(
        &self,
        assignments: &'a [ShiftAssignment],
    ) -> Result<Vec<(&'a ShiftAssignment, &'a str)>> {
        let mut rows = Vec::new();

        for assignment in assignments.iter().filter(|a| a.is_staffed()) {
            if assignment.task_names.is_empty() {
                return Err(WardflowError::validation(format!(
                    "Please select at least one task for shift {}",
                    assignment.shift
                )));
            }
            for name in &assignment.task_names {
                if name.trim().is_empty() {
                    return Err(WardflowError::validation(format!(
                        "Task name cannot be empty for shift {}",
                        assignment.shift
                    )));
                }
                rows.push((assignment, name.trim()));
            }
        }

        if rows.is_empty() {
            return Err(WardflowError::validation(
                "Please assign a resource to at least one shift",
            ));
        }
        Ok(rows)
    }

    /// Creates the task rows for `subject` now.
    ///
    /// See [`assign_at`](Self::assign_at).
    pub async fn assign<S>(
        &self,
        store: &mut S,
        subject: &SubjectContext,
        assignments: &[ShiftAssignment],
    ) -> Result<Vec<TaskAssignment>>
    where
        S: RecordStore + ?Sized,
    {
        self.assign_at(store, subject, assignments, Utc::now())
            .await
    }

    /// Creates the task rows for `subject`, planned at `at`.
    ///
    /// One base number is issued per attempt and row `i` takes `base + i`.
    /// All rows are inserted with one atomic call; a number collision
    /// re-issues a fresh base.
    ///
    /// # Errors
    ///
    /// Validation errors as for [`plan`](Self::plan), with zero rows
    /// created; [`WardflowError::DuplicateNumber`] if every attempt
    /// collided; or a storage error.
    pub async fn assign_at<S>(
        &self,
        store: &mut S,
        subject: &SubjectContext,
        assignments: &[ShiftAssignment],
        at: DateTime<Utc>,
    ) -> Result<Vec<TaskAssignment>>
    where
        S: RecordStore + ?Sized,
    {
        let span = info_span!("assign", subject = %subject.subject_ref);

        async {
            let rows = self.plan(assignments)?;
            let issuer = TaskNumberIssuer::new();
            let mut last_error = None;

            for attempt in 1..=self.issue_attempts {
                let base = issuer.next(&*store, &self.scope).await;
                let tasks: Vec<TaskAssignment> = rows
                    .iter()
                    .zip(0u64..)
                    .map(|((assignment, name), i)| {
                        let (sequence, task_no) = base.offset(i);
                        TaskAssignment {
                            task_no,
                            scope: self.scope.prefix.clone(),
                            sequence,
                            subject: subject.clone(),
                            shift: assignment.shift,
                            assigned_resource: assignment.resource.trim().to_string(),
                            task_name: name.to_string(),
                            planned_at: at,
                            actual_at: None,
                            reminder: assignment.reminder,
                            start_date: assignment.start_date,
                            requires_branch: self.registry.requires_branch(name),
                            branch_type: None,
                            completed_by: None,
                            remarks: None,
                            version: 0,
                            created_at: at,
                        }
                    })
                    .collect();

                match store.insert_tasks(&tasks).await {
                    Ok(stored) => {
                        let task_nos: Vec<String> =
                            stored.iter().map(|t| t.task_no.clone()).collect();
                        info!(
                            count = stored.len(),
                            first = %base.id(),
                            degraded = base.degraded,
                            "tasks assigned"
                        );
                        self.events.emit(PipelineEvent::TasksAssigned { task_nos });
                        return Ok(stored);
                    }
                    Err(e @ WardflowError::DuplicateNumber(_)) => {
                        warn!(attempt, error = %e, "task number collided; re-issuing");
                        last_error = Some(e);
                    }
                    Err(e) => {
                        error!(error = %e, "failed to insert tasks");
                        return Err(e);
                    }
                }
            }

            Err(last_error
                .unwrap_or_else(|| WardflowError::Storage("no insert attempted".to_string())))
        }
        .instrument(span)
        .await
    }
}

impl Default for TaskFanOut {
    fn default() -> Self {
        Self::new(SequenceScope::new("TASK"), BranchRegistry::default())
    }
}
