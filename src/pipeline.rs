//! Pipeline definition and the stage completion handler.
//!
//! This module provides [`Pipeline`] and [`PipelineBuilder`]. A pipeline is
//! a fixed, ordered list of stages backed by a petgraph DAG: every stage
//! depends on the one before it, and extra gating edges can be declared.
//! Completing a stage validates the payload, stamps the actual time and, in
//! the same write, schedules the next stage unless the stage is marked
//! conditional.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::WardflowConfig;
use crate::delay::Delay;
use crate::event::{EventBus, PipelineEvent};
use crate::record::{PipelineRecord, StagedRecord, SubjectContext};
use crate::sequence::{SequenceScope, TaskNumberIssuer};
use crate::stage::{StageIndex, StagePayload, StagePhase, StageSpec};
use crate::status::{RecordStatus, StageStatusEntry};
use crate::store::RecordStore;
use crate::{Result, WardflowError};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

/// Default number of attempts for writes and number issuance.
const DEFAULT_ATTEMPTS: u32 = 3;

/// Result of completing one stage across several records.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Records completed by this call, as stored.
    pub completed: Vec<PipelineRecord>,

    /// Ids whose stage another writer completed first.
    pub conflicts: Vec<String>,

    /// Ids rejected by validation, with the message.
    pub rejected: Vec<(String, String)>,
}

impl BatchOutcome {
    /// Returns true if every id was completed by this call.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.rejected.is_empty()
    }
}

/// A stage-chained pipeline definition.
///
/// # Construction
///
/// Use [`Pipeline::builder()`] to create a new pipeline:
///
/// ```
/// use wardflow::{Pipeline, SequenceScope, StageSpec};
///
/// let pipeline = Pipeline::builder("lab", SequenceScope::new("LAB"))
///     .stage(StageSpec::new(1, "Sample Collection"))
///     .stage(StageSpec::new(2, "Report Upload").require("report_url", "Please upload the report"))
///     .build()?;
///
/// assert_eq!(pipeline.stages(), &[1, 2]);
/// assert_eq!(pipeline.chained_successor(1), Some(2));
/// # Ok::<(), wardflow::WardflowError>(())
/// ```
///
/// # Thread Safety
///
/// `Pipeline` is `Send + Sync` and can be shared across async tasks.
pub struct Pipeline {
    /// Pipeline name stored on every record.
    name: String,
    /// Number scope for record ids.
    scope: SequenceScope,
    /// The underlying directed graph.
    graph: DiGraph<StageSpec, ()>,
    /// Mapping from stage index to node index.
    index_of: BTreeMap<StageIndex, NodeIndex>,
    /// Cached topological order of stage indices.
    topo_order: Vec<StageIndex>,
    /// Stages whose successor is scheduled manually.
    conditional: BTreeSet<StageIndex>,
    /// Event channel.
    events: EventBus,
    /// Attempts for a completion that hits a stale version.
    write_attempts: u32,
    /// Attempts for a create whose issued id collides.
    issue_attempts: u32,
}

impl Pipeline {
    /// Creates a new pipeline builder.
    pub fn builder(name: impl Into<String>, scope: SequenceScope) -> PipelineBuilder {
        PipelineBuilder::new(name.into(), scope)
    }

    /// Pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number scope for record ids.
    pub fn scope(&self) -> &SequenceScope {
        &self.scope
    }

    /// Subscribes to events emitted by this pipeline.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// The event bus this pipeline emits on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Returns the stage indices in topological order.
    pub fn stages(&self) -> &[StageIndex] {
        &self.topo_order
    }

    /// Returns the number of stages.
    pub fn stage_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the definition of a stage.
    ///
    /// # Errors
    ///
    /// Returns [`WardflowError::StageNotFound`] if the stage doesn't exist.
    pub fn spec(&self, stage: StageIndex) -> Result<&StageSpec> {
        let node = self
            .index_of
            .get(&stage)
            .ok_or(WardflowError::StageNotFound(stage))?;
        Ok(&self.graph[*node])
    }

    /// Returns the stages that must be completed before `stage`.
    ///
    /// # Errors
    ///
    /// Returns [`WardflowError::StageNotFound`] if the stage doesn't exist.
    pub fn predecessors(&self, stage: StageIndex) -> Result<Vec<StageIndex>> {
        self.neighbors(stage, Direction::Incoming)
    }

    /// Returns the stages gated on `stage`.
    ///
    /// # Errors
    ///
    /// Returns [`WardflowError::StageNotFound`] if the stage doesn't exist.
    pub fn dependents(&self, stage: StageIndex) -> Result<Vec<StageIndex>> {
        self.neighbors(stage, Direction::Outgoing)
    }

    fn neighbors(&self, stage: StageIndex, direction: Direction) -> Result<Vec<StageIndex>> {
        let node = self
            .index_of
            .get(&stage)
            .ok_or(WardflowError::StageNotFound(stage))?;

        let mut stages: Vec<StageIndex> = self
            .graph
            .neighbors_directed(*node, direction)
            .map(|idx| self.graph[idx].index)
            .collect();
        stages.sort_unstable();
        Ok(stages)
    }

    /// Returns stages with no predecessors. These are scheduled on create.
    pub fn root_stages(&self) -> Vec<StageIndex> {
        self.topo_order
            .iter()
            .copied()
            .filter(|stage| {
                self.predecessors(*stage)
                    .map(|preds| preds.is_empty())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Returns true if completing `stage` leaves its successor unscheduled.
    pub fn is_conditional(&self, stage: StageIndex) -> bool {
        self.conditional.contains(&stage)
    }

    /// The stage scheduled automatically when `stage` completes.
    pub fn chained_successor(&self, stage: StageIndex) -> Option<StageIndex> {
        if self.is_conditional(stage) {
            return None;
        }
        let next = stage.checked_add(1)?;
        self.index_of.contains_key(&next).then_some(next)
    }

    /// Classifies `record` at `stage`, applying gating.
    ///
    /// A stage that is scheduled while one of its predecessors is not yet
    /// completed reports `NotReached`.
    ///
    /// # Errors
    ///
    /// Returns [`WardflowError::StageNotFound`] if the stage doesn't exist.
    pub fn classify(&self, record: &dyn StagedRecord, stage: StageIndex) -> Result<StagePhase> {
        let phase = record.phase(stage);
        if phase != StagePhase::Pending {
            return Ok(phase);
        }

        let gated = self
            .predecessors(stage)?
            .into_iter()
            .any(|pred| record.phase(pred) != StagePhase::Completed);
        Ok(if gated {
            StagePhase::NotReached
        } else {
            StagePhase::Pending
        })
    }

    /// Returns the status of every stage of `record`.
    pub fn status(&self, record: &PipelineRecord) -> RecordStatus {
        let stages = self
            .topo_order
            .iter()
            .map(|&index| {
                let name = self
                    .spec(index)
                    .map(|spec| spec.name.clone())
                    .unwrap_or_default();
                let phase = self
                    .classify(record, index)
                    .unwrap_or(StagePhase::NotReached);
                match record.stages.get(&index) {
                    Some(slot) => StageStatusEntry::from_slot(index, name, slot, phase),
                    None => StageStatusEntry::not_reached(index, name),
                }
            })
            .collect();

        RecordStatus::new(&record.id, &self.name, stages)
    }

    /// Checks that every predecessor of `stage` is completed.
    fn check_predecessors(&self, record: &PipelineRecord, spec: &StageSpec) -> Result<()> {
        for pred in self.predecessors(spec.index)? {
            if record.phase(pred) != StagePhase::Completed {
                let pred_name = self.spec(pred)?.name.clone();
                return Err(WardflowError::validation(format!(
                    "{} must be completed before {}",
                    pred_name, spec.name
                )));
            }
        }
        Ok(())
    }

    /// Applies a completion to a record without touching any store.
    ///
    /// On success the returned record has the payload merged into its
    /// fields, `actual_at = at` and `completed_by = actor` on `stage`, the
    /// delay computed if the stage tracks it, and the chained successor
    /// scheduled at `at`.
    ///
    /// # Errors
    ///
    /// [`WardflowError::Validation`] if the stage is not scheduled, already
    /// completed, gated by an incomplete predecessor, or the payload misses
    /// a required key. The input record is never modified.
    pub fn apply_completion(
        &self,
        record: &PipelineRecord,
        stage: StageIndex,
        payload: &StagePayload,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<PipelineRecord> {
        let spec = self.spec(stage)?;

        match record.phase(stage) {
            StagePhase::NotReached => {
                return Err(WardflowError::validation(format!(
                    "{} has not been scheduled yet",
                    spec.name
                )))
            }
            StagePhase::Completed => {
                return Err(WardflowError::validation(format!(
                    "{}: stage already completed",
                    spec.name
                )))
            }
            StagePhase::Pending => {}
        }

        self.check_predecessors(record, spec)?;
        spec.validate_payload(payload)?;

        let mut updated = record.clone();
        for (key, value) in payload {
            updated.fields.insert(key.clone(), value.clone());
        }

        let slot = updated.slot_mut(stage);
        slot.mark_complete(at, actor);
        if spec.tracks_delay {
            slot.delay = slot.planned_at.map(|planned| Delay::between(planned, at));
        }

        if let Some(next) = self.chained_successor(stage) {
            updated.slot_mut(next).schedule(at);
        }

        Ok(updated)
    }

    /// Loads a record of this pipeline.
    async fn load<S>(&self, store: &S, id: &str) -> Result<PipelineRecord>
    where
        S: RecordStore + ?Sized,
    {
        match store.get_record(id).await? {
            Some(record) if record.pipeline == self.name => Ok(record),
            _ => Err(WardflowError::RecordNotFound(id.to_string())),
        }
    }

    /// Reads, transforms and writes a record under optimistic concurrency.
    ///
    /// A stale write reloads and re-applies. If the reloaded record no longer
    /// passes validation, another writer got there first and the result is
    /// [`WardflowError::Conflict`].
    async fn write_with_retry<S, F>(
        &self,
        store: &mut S,
        id: &str,
        stage: StageIndex,
        apply: F,
    ) -> Result<PipelineRecord>
    where
        S: RecordStore + ?Sized,
        F: Fn(&PipelineRecord) -> Result<PipelineRecord> + Send + Sync,
    {
        let mut last_error = None;

        for attempt in 1..=self.write_attempts {
            let record = self.load(store, id).await?;

            let updated = match apply(&record) {
                Ok(updated) => updated,
                Err(e) if attempt > 1 && e.is_validation() => {
                    warn!(record_id = %id, stage, reason = %e, "lost completion race");
                    self.events.emit(PipelineEvent::CompletionConflict {
                        record_id: id.to_string(),
                        stage,
                    });
                    return Err(WardflowError::Conflict {
                        id: id.to_string(),
                        stage,
                    });
                }
                Err(e) => return Err(e),
            };

            match store.update_record(&updated, record.version).await {
                Ok(stored) => return Ok(stored),
                Err(e @ WardflowError::StaleWrite { .. }) => {
                    debug!(attempt, error = %e, "stale write; reloading");
                    last_error = Some(e);
                }
                Err(e) => {
                    error!(record_id = %id, error = %e, "failed to write record");
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| WardflowError::Storage("no write attempted".to_string())))
    }

    /// Completes `stage` of record `id` now.
    ///
    /// See [`complete_at`](Self::complete_at).
    pub async fn complete<S>(
        &self,
        store: &mut S,
        id: &str,
        stage: StageIndex,
        payload: &StagePayload,
        actor: &str,
    ) -> Result<PipelineRecord>
    where
        S: RecordStore + ?Sized,
    {
        self.complete_at(store, id, stage, payload, actor, Utc::now())
            .await
    }

    /// Completes `stage` of record `id` at `at`.
    ///
    /// The completion and the successor scheduling are written with one
    /// `update_record` call carrying the version that was read.
    ///
    /// # Errors
    ///
    /// - [`WardflowError::Validation`] as for
    ///   [`apply_completion`](Self::apply_completion); nothing is written
    /// - [`WardflowError::Conflict`] if another writer completed the stage
    ///   between the read and the write
    /// - [`WardflowError::RecordNotFound`] or a storage error
    pub async fn complete_at<S>(
        &self,
        store: &mut S,
        id: &str,
        stage: StageIndex,
        payload: &StagePayload,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<PipelineRecord>
    where
        S: RecordStore + ?Sized,
    {
        let span = info_span!("complete", pipeline = %self.name, record_id = %id, stage);

        async {
            let stored = self
                .write_with_retry(store, id, stage, |record| {
                    self.apply_completion(record, stage, payload, actor, at)
                })
                .await?;

            info!(actor, "stage completed");
            self.events.emit(PipelineEvent::StageCompleted {
                pipeline: self.name.clone(),
                record_id: stored.id.clone(),
                stage,
            });
            if let Some(next) = self.chained_successor(stage) {
                self.events.emit(PipelineEvent::StageScheduled {
                    pipeline: self.name.clone(),
                    record_id: stored.id.clone(),
                    stage: next,
                });
            }
            Ok(stored)
        }
        .instrument(span)
        .await
    }

    /// Completes `stage` for several records with one shared payload.
    ///
    /// The payload is validated once before any write, so a missing field
    /// rejects the whole batch. Records are then completed independently.
    ///
    /// # Errors
    ///
    /// Returns [`WardflowError::Validation`] for an empty selection or an
    /// invalid payload, and stops at the first storage error. Per-record
    /// conflicts and validation failures are reported in the outcome.
    pub async fn complete_many<S>(
        &self,
        store: &mut S,
        ids: &[String],
        stage: StageIndex,
        payload: &StagePayload,
        actor: &str,
    ) -> Result<BatchOutcome>
    where
        S: RecordStore + ?Sized,
    {
        if ids.is_empty() {
            return Err(WardflowError::validation(
                "Please select at least one record",
            ));
        }
        self.spec(stage)?.validate_payload(payload)?;

        let at = Utc::now();
        let mut outcome = BatchOutcome::default();
        for id in ids {
            match self.complete_at(store, id, stage, payload, actor, at).await {
                Ok(record) => outcome.completed.push(record),
                Err(e) if e.is_conflict() => outcome.conflicts.push(id.clone()),
                Err(e) if e.is_validation() => outcome.rejected.push((id.clone(), e.to_string())),
                Err(e) => return Err(e),
            }
        }

        info!(
            pipeline = %self.name,
            stage,
            completed = outcome.completed.len(),
            conflicts = outcome.conflicts.len(),
            rejected = outcome.rejected.len(),
            "batch completion finished"
        );
        Ok(outcome)
    }

    /// Creates a record now.
    ///
    /// See [`create_at`](Self::create_at).
    pub async fn create<S>(
        &self,
        store: &mut S,
        subject: SubjectContext,
        fields: BTreeMap<String, JsonValue>,
    ) -> Result<PipelineRecord>
    where
        S: RecordStore + ?Sized,
    {
        self.create_at(store, subject, fields, Utc::now()).await
    }

    /// Creates a record with an issued id and its root stages scheduled at
    /// `at`.
    ///
    /// An id that collides with an existing row is re-issued.
    ///
    /// # Errors
    ///
    /// Returns [`WardflowError::DuplicateNumber`] if every attempt collided,
    /// or a storage error.
    pub async fn create_at<S>(
        &self,
        store: &mut S,
        subject: SubjectContext,
        fields: BTreeMap<String, JsonValue>,
        at: DateTime<Utc>,
    ) -> Result<PipelineRecord>
    where
        S: RecordStore + ?Sized,
    {
        let span = info_span!("create", pipeline = %self.name);

        async {
            let issuer = TaskNumberIssuer::new();
            let roots = self.root_stages();
            let mut last_error = None;

            for attempt in 1..=self.issue_attempts {
                let issued = issuer.next(&*store, &self.scope).await;
                let mut record = PipelineRecord::new(issued.id(), &self.name, subject.clone(), at);
                record.fields = fields.clone();
                for &root in &roots {
                    record.slot_mut(root).schedule(at);
                }

                match store.insert_record(&record).await {
                    Ok(stored) => {
                        info!(record_id = %stored.id, degraded = issued.degraded, "record created");
                        self.events.emit(PipelineEvent::RecordCreated {
                            pipeline: self.name.clone(),
                            record_id: stored.id.clone(),
                        });
                        return Ok(stored);
                    }
                    Err(e @ WardflowError::DuplicateNumber(_)) => {
                        warn!(attempt, error = %e, "issued id collided; re-issuing");
                        last_error = Some(e);
                    }
                    Err(e) => {
                        error!(error = %e, "failed to insert record");
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

    /// Schedules a stage manually, typically the successor of a
    /// conditional stage.
    ///
    /// # Errors
    ///
    /// [`WardflowError::Validation`] if the stage is already scheduled or a
    /// predecessor is not completed; [`WardflowError::Conflict`] if another
    /// writer scheduled it first.
    pub async fn schedule<S>(
        &self,
        store: &mut S,
        id: &str,
        stage: StageIndex,
    ) -> Result<PipelineRecord>
    where
        S: RecordStore + ?Sized,
    {
        let spec = self.spec(stage)?;
        let at = Utc::now();
        let span = info_span!("schedule", pipeline = %self.name, record_id = %id, stage);

        async {
            let stored = self
                .write_with_retry(store, id, stage, |record| {
                    if record.phase(stage) != StagePhase::NotReached {
                        return Err(WardflowError::validation(format!(
                            "{} is already scheduled",
                            spec.name
                        )));
                    }
                    self.check_predecessors(record, spec)?;

                    let mut updated = record.clone();
                    updated.slot_mut(stage).schedule(at);
                    Ok(updated)
                })
                .await?;

            info!("stage scheduled");
            self.events.emit(PipelineEvent::StageScheduled {
                pipeline: self.name.clone(),
                record_id: stored.id.clone(),
                stage,
            });
            Ok(stored)
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("scope", &self.scope.prefix)
            .field("stages", &self.topo_order)
            .field("conditional", &self.conditional)
            .finish()
    }
}

/// A deferred gating edge.
struct DeferredRequirement {
    stage: StageIndex,
    predecessor: StageIndex,
}

/// Builder for constructing [`Pipeline`] instances.
///
/// Stages must be added in order with indices `1..=N`. Each stage depends
/// on the one before it; [`requires`](Self::requires) adds further gating.
pub struct PipelineBuilder {
    name: String,
    scope: SequenceScope,
    /// Stages in the order they were added.
    stages: Vec<StageSpec>,
    /// Extra requirements resolved at build time.
    deferred: Vec<DeferredRequirement>,
    conditional: BTreeSet<StageIndex>,
    events: Option<EventBus>,
    write_attempts: u32,
    issue_attempts: u32,
}

impl PipelineBuilder {
    fn new(name: String, scope: SequenceScope) -> Self {
        Self {
            name,
            scope,
            stages: Vec::new(),
            deferred: Vec::new(),
            conditional: BTreeSet::new(),
            events: None,
            write_attempts: DEFAULT_ATTEMPTS,
            issue_attempts: DEFAULT_ATTEMPTS,
        }
    }

    /// Adds the next stage.
    pub fn stage(mut self, spec: StageSpec) -> Self {
        self.stages.push(spec);
        self
    }

    /// Declares that `stage` may only complete after `predecessor`.
    ///
    /// Requirements are validated at build time.
    pub fn requires(mut self, stage: StageIndex, predecessor: StageIndex) -> Self {
        self.deferred.push(DeferredRequirement { stage, predecessor });
        self
    }

    /// Marks `stage` as conditional: completing it does not schedule its
    /// successor.
    pub fn conditional(mut self, stage: StageIndex) -> Self {
        self.conditional.insert(stage);
        self
    }

    /// Emits events on `bus` instead of a private channel.
    pub fn events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Applies retry limits and event capacity from `config`.
    pub fn configure(mut self, config: &WardflowConfig) -> Self {
        self.write_attempts = config.write_attempts;
        self.issue_attempts = config.issue_attempts;
        if self.events.is_none() {
            self.events = Some(EventBus::new(config.event_capacity));
        }
        self
    }

    /// Builds the pipeline, validating the DAG.
    ///
    /// # Errors
    ///
    /// - [`WardflowError::InvalidPipeline`] if there are no stages, indices
    ///   are not `1..=N` in order, or a retry limit is zero
    /// - [`WardflowError::StageNotFound`] if a requirement or conditional
    ///   marker references a non-existent stage
    /// - [`WardflowError::InvalidPipeline`] if requirements form a cycle
    pub fn build(self) -> Result<Pipeline> {
        if self.stages.is_empty() {
            return Err(WardflowError::InvalidPipeline(format!(
                "{} has no stages",
                self.name
            )));
        }
        if self.write_attempts == 0 || self.issue_attempts == 0 {
            return Err(WardflowError::InvalidPipeline(
                "retry limits must be positive".to_string(),
            ));
        }

        let mut graph = DiGraph::new();
        let mut index_of = BTreeMap::new();
        for (position, spec) in self.stages.into_iter().enumerate() {
            let expected = position + 1;
            if usize::from(spec.index) != expected {
                return Err(WardflowError::InvalidPipeline(format!(
                    "stage {} ({}) added at position {}",
                    spec.index, spec.name, expected
                )));
            }
            let index = spec.index;
            let node = graph.add_node(spec);
            index_of.insert(index, node);
        }

        // Linear chain: stage k depends on stage k-1
        let nodes: Vec<NodeIndex> = index_of.values().copied().collect();
        for pair in nodes.windows(2) {
            graph.add_edge(pair[0], pair[1], ());
        }

        for req in &self.deferred {
            let stage = index_of
                .get(&req.stage)
                .ok_or(WardflowError::StageNotFound(req.stage))?;
            let predecessor = index_of
                .get(&req.predecessor)
                .ok_or(WardflowError::StageNotFound(req.predecessor))?;

            // Edge direction: predecessor -> stage
            graph.update_edge(*predecessor, *stage, ());
        }

        if let Some(unknown) = self.conditional.iter().find(|s| !index_of.contains_key(*s)) {
            return Err(WardflowError::StageNotFound(*unknown));
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(WardflowError::InvalidPipeline(format!(
                "{} has a cyclic stage requirement",
                self.name
            )));
        }

        let topo_order = petgraph::algo::toposort(&graph, None)
            .map_err(|_| WardflowError::InvalidPipeline("cycle".to_string()))?
            .into_iter()
            .map(|idx| graph[idx].index)
            .collect();

        Ok(Pipeline {
            name: self.name,
            scope: self.scope,
            graph,
            index_of,
            topo_order,
            conditional: self.conditional,
            events: self.events.unwrap_or_default(),
            write_attempts: self.write_attempts,
            issue_attempts: self.issue_attempts,
        })
    }
}
