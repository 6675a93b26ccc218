//! One actor's entry point to the workflow core.
//!
//! A [`Desk`] wires a store, the configured pipelines, task fan-out, the
//! branch handler, an event bus and a notifier. Every operation reports its
//! outcome to the notifier the way a screen would show it: specific
//! messages for validation failures, a neutral notice for lost races, and a
//! generic retry prompt for storage failures.

use crate::branch::{BranchHandler, CompletionOutcome, TaskCompletion};
use crate::collab::{Actor, Notifier, ReportUploader, Severity};
use crate::config::WardflowConfig;
use crate::domains::{discharge, lab};
use crate::error::CONFLICT_MESSAGE;
use crate::event::EventBus;
use crate::fanout::{ShiftAssignment, TaskFanOut};
use crate::live_view::{LiveView, PipelineQuery, TaskQuery};
use crate::pipeline::{BatchOutcome, Pipeline};
use crate::record::{PipelineRecord, SubjectContext};
use crate::stage::{StageIndex, StagePayload};
use crate::status::RecordStatus;
use crate::store::RecordStore;
use crate::task::{BranchType, TaskAssignment};
use crate::{Result, WardflowError};
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

/// Workflow operations performed by one actor.
pub struct Desk<S> {
    store: S,
    actor: Actor,
    config: WardflowConfig,
    pipelines: BTreeMap<String, Arc<Pipeline>>,
    fanout: TaskFanOut,
    branch: BranchHandler,
    events: EventBus,
    notifier: Arc<dyn Notifier>,
}

impl<S: RecordStore + Clone + 'static> Desk<S> {
    /// Creates a desk with the lab and discharge pipelines.
    ///
    /// # Errors
    ///
    /// Returns [`WardflowError::Config`] if `config` does not validate.
    pub fn new(
        store: S,
        actor: Actor,
        config: WardflowConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new(config.event_capacity);

        let mut pipelines = BTreeMap::new();
        for pipeline in [
            lab::pipeline(&config, events.clone())?,
            discharge::pipeline(&config, events.clone())?,
        ] {
            pipelines.insert(pipeline.name().to_string(), Arc::new(pipeline));
        }

        Ok(Self {
            fanout: TaskFanOut::from_config(&config, events.clone()),
            branch: BranchHandler::from_config(&config, events.clone()),
            store,
            actor,
            config,
            pipelines,
            events,
            notifier,
        })
    }

    /// A desk sharing this one's store, pipelines and events for another
    /// actor.
    pub fn for_actor(&self, actor: Actor) -> Self {
        Self {
            store: self.store.clone(),
            actor,
            config: self.config.clone(),
            pipelines: self.pipelines.clone(),
            fanout: self.fanout.clone(),
            branch: self.branch.clone(),
            events: self.events.clone(),
            notifier: Arc::clone(&self.notifier),
        }
    }

    /// Routes this desk's messages to `notifier`.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Adds a pipeline, replacing any with the same name.
    pub fn register(&mut self, pipeline: Pipeline) {
        self.pipelines
            .insert(pipeline.name().to_string(), Arc::new(pipeline));
    }

    /// The acting user.
    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    /// The store handle.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The shared event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Looks up a pipeline by name.
    ///
    /// # Errors
    ///
    /// Returns [`WardflowError::InvalidPipeline`] for an unknown name.
    pub fn pipeline(&self, name: &str) -> Result<Arc<Pipeline>> {
        self.pipelines
            .get(name)
            .cloned()
            .ok_or_else(|| WardflowError::InvalidPipeline(format!("unknown pipeline {}", name)))
    }

    /// Per-stage status of record `id`.
    ///
    /// # Errors
    ///
    /// `InvalidPipeline` for an unknown pipeline, `RecordNotFound` for an
    /// unknown id, or a storage error.
    pub async fn status(&self, pipeline: &str, id: &str) -> Result<RecordStatus> {
        let pipeline = self.pipeline(pipeline)?;
        let record = self
            .store
            .get_record(id)
            .await?
            .ok_or_else(|| WardflowError::RecordNotFound(id.to_string()))?;
        Ok(pipeline.status(&record))
    }

    /// Sends the outcome of an operation to the notifier.
    fn report<T>(&self, result: Result<T>, success: &str) -> Result<T> {
        match &result {
            Ok(_) => self.notifier.notify(success, Severity::Success),
            Err(e) if e.is_conflict() => self.notifier.notify(&e.user_message(), Severity::Info),
            Err(e) if e.is_validation() => self.notifier.notify(&e.user_message(), Severity::Error),
            Err(e) => {
                error!(actor = %self.actor.name, error = %e, "operation failed");
                self.notifier.notify(&e.user_message(), Severity::Error);
            }
        }
        result
    }

    /// Creates a record in `pipeline`.
    pub async fn create(
        &mut self,
        pipeline: &str,
        subject: SubjectContext,
        fields: BTreeMap<String, JsonValue>,
    ) -> Result<PipelineRecord> {
        let result = match self.pipeline(pipeline) {
            Ok(p) => p.create(&mut self.store, subject, fields).await,
            Err(e) => Err(e),
        };
        self.report(result, "Created successfully")
    }

    /// Completes a stage of a record.
    pub async fn complete(
        &mut self,
        pipeline: &str,
        id: &str,
        stage: StageIndex,
        payload: &StagePayload,
    ) -> Result<PipelineRecord> {
        let result = match self.pipeline(pipeline) {
            Ok(p) => {
                p.complete(&mut self.store, id, stage, payload, &self.actor.name)
                    .await
            }
            Err(e) => Err(e),
        };
        self.report(result, "Updated successfully")
    }

    /// Completes a stage for several records.
    pub async fn complete_many(
        &mut self,
        pipeline: &str,
        ids: &[String],
        stage: StageIndex,
        payload: &StagePayload,
    ) -> Result<BatchOutcome> {
        let result = match self.pipeline(pipeline) {
            Ok(p) => {
                p.complete_many(&mut self.store, ids, stage, payload, &self.actor.name)
                    .await
            }
            Err(e) => Err(e),
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return self.report(Err(e), ""),
        };

        if !outcome.completed.is_empty() {
            self.notifier.notify(
                &format!("{} record(s) updated", outcome.completed.len()),
                Severity::Success,
            );
        }
        for (id, message) in &outcome.rejected {
            self.notifier
                .notify(&format!("{}: {}", id, message), Severity::Error);
        }
        for id in &outcome.conflicts {
            self.notifier
                .notify(&format!("{}: {}", id, CONFLICT_MESSAGE), Severity::Info);
        }
        Ok(outcome)
    }

    /// Schedules a stage manually.
    pub async fn schedule(
        &mut self,
        pipeline: &str,
        id: &str,
        stage: StageIndex,
    ) -> Result<PipelineRecord> {
        let result = match self.pipeline(pipeline) {
            Ok(p) => p.schedule(&mut self.store, id, stage).await,
            Err(e) => Err(e),
        };
        self.report(result, "Scheduled successfully")
    }

    /// Uploads a lab report and completes the report stage with its URL.
    ///
    /// Nothing is uploaded when `remarks` is blank or the report stage is
    /// not pending.
    pub async fn upload_lab_report(
        &mut self,
        uploader: &dyn ReportUploader,
        id: &str,
        bytes: Vec<u8>,
        content_type: &str,
        remarks: &str,
    ) -> Result<PipelineRecord> {
        if remarks.trim().is_empty() {
            return self.report(
                Err(WardflowError::validation("Please enter remarks")),
                "",
            );
        }

        // Check the stage before storing anything
        if let Err(e) = self.check_report_stage(id, remarks).await {
            return self.report(Err(e), "");
        }

        let url = match uploader.upload(bytes, content_type).await {
            Ok(url) => url,
            Err(e) => return self.report(Err(e), ""),
        };

        let mut payload = StagePayload::new();
        payload.insert("report_url".to_string(), JsonValue::String(url));
        payload.insert("remarks".to_string(), JsonValue::String(remarks.to_string()));
        self.complete(lab::NAME, id, lab::REPORT_UPLOAD, &payload)
            .await
    }

    /// Runs the report stage validation with a stand-in URL.
    async fn check_report_stage(&self, id: &str, remarks: &str) -> Result<()> {
        let pipeline = self.pipeline(lab::NAME)?;
        let record = self
            .store
            .get_record(id)
            .await?
            .filter(|record| record.pipeline == lab::NAME)
            .ok_or_else(|| WardflowError::RecordNotFound(id.to_string()))?;

        let mut payload = StagePayload::new();
        payload.insert(
            "report_url".to_string(),
            JsonValue::String("pending-upload".to_string()),
        );
        payload.insert("remarks".to_string(), JsonValue::String(remarks.to_string()));
        pipeline
            .apply_completion(
                &record,
                lab::REPORT_UPLOAD,
                &payload,
                &self.actor.name,
                Utc::now(),
            )
            .map(|_| ())
    }

    /// Fans shift assignments out into task rows.
    pub async fn assign_tasks(
        &mut self,
        subject: &SubjectContext,
        assignments: &[ShiftAssignment],
    ) -> Result<Vec<TaskAssignment>> {
        let result = self
            .fanout
            .assign(&mut self.store, subject, assignments)
            .await;
        let message = match &result {
            Ok(tasks) => format!("{} task(s) assigned", tasks.len()),
            Err(_) => String::new(),
        };
        self.report(result, &message)
    }

    /// Completes a task as this desk's actor.
    pub async fn complete_task(
        &mut self,
        task_no: &str,
        branch_type: Option<BranchType>,
        remarks: Option<String>,
        extra: BTreeMap<String, JsonValue>,
    ) -> Result<CompletionOutcome> {
        let completion = TaskCompletion {
            actor: self.actor.name.clone(),
            branch_type,
            remarks,
            extra,
        };
        let result = self
            .branch
            .complete_task(&mut self.store, task_no, completion)
            .await;
        self.report(result, "Task completed")
    }

    /// Starts a live view of `pipeline` at `stage`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn pipeline_view(
        &self,
        pipeline: &str,
        stage: StageIndex,
    ) -> Result<LiveView<PipelineRecord>> {
        let pipeline = self.pipeline(pipeline)?;
        pipeline.spec(stage)?;
        Ok(LiveView::spawn(
            PipelineQuery::gated(self.store.clone(), pipeline, stage),
            self.config.refresh_interval(),
            Some(&self.events),
        ))
    }

    /// Starts a live view of the tasks this actor may see.
    ///
    /// Must be called from within a tokio runtime.
    pub fn task_view(&self) -> LiveView<TaskAssignment> {
        LiveView::spawn(
            TaskQuery::for_actor(self.store.clone(), &self.actor),
            self.config.refresh_interval(),
            Some(&self.events),
        )
    }
}

impl<S> std::fmt::Debug for Desk<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Desk")
            .field("actor", &self.actor)
            .field("pipelines", &self.pipelines.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
