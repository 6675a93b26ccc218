//! Records that move through stages.
//!
//! [`StagedRecord`] is the common view over anything carrying planned/actual
//! stage pairs. [`PipelineRecord`] is the multi-stage row shared by the lab
//! and discharge screens; task assignments implement the same trait as a
//! single-stage record.

use crate::stage::{classify, StageIndex, StagePhase, StageSlot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// A record whose progress is encoded as per-stage timestamp pairs.
///
/// # Object Safety
///
/// This trait is object-safe, so heterogeneous collections can be handled
/// as `dyn StagedRecord`.
pub trait StagedRecord: Debug + Send + Sync {
    /// Stable identifier of the record.
    fn id(&self) -> &str;

    /// The slot for `stage`. Stages the record does not carry are unscheduled.
    fn slot(&self, stage: StageIndex) -> StageSlot;

    /// Classifies the record at `stage` without gating.
    fn phase(&self, stage: StageIndex) -> StagePhase {
        classify(&self.slot(stage))
    }
}

/// Snapshot of the patient and location a record or task concerns.
///
/// Copied by value wherever it is stored; later edits to the patient do not
/// reach rows that already hold a copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectContext {
    /// Patient or admission identifier.
    pub subject_ref: String,

    /// Patient display name.
    pub patient_name: String,

    /// Ward name.
    pub ward: Option<String>,

    /// Bed number.
    pub bed: Option<String>,

    /// Treating consultant.
    pub consultant: Option<String>,
}

impl SubjectContext {
    /// Creates a context with only the reference and name set.
    pub fn new(subject_ref: impl Into<String>, patient_name: impl Into<String>) -> Self {
        Self {
            subject_ref: subject_ref.into(),
            patient_name: patient_name.into(),
            ..Self::default()
        }
    }

    /// Sets the ward and bed.
    pub fn at(mut self, ward: impl Into<String>, bed: impl Into<String>) -> Self {
        self.ward = Some(ward.into());
        self.bed = Some(bed.into());
        self
    }

    /// Sets the consultant.
    pub fn with_consultant(mut self, consultant: impl Into<String>) -> Self {
        self.consultant = Some(consultant.into());
        self
    }
}

/// One order or case advancing through a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    /// Issued identifier, e.g. `LAB-007`.
    pub id: String,

    /// Name of the pipeline that owns the record.
    pub pipeline: String,

    /// Patient and location.
    pub subject: SubjectContext,

    /// Planned/actual pairs keyed by stage index.
    pub stages: BTreeMap<StageIndex, StageSlot>,

    /// Stage payload fields accumulated across completions.
    pub fields: BTreeMap<String, JsonValue>,

    /// Row version, bumped by the store on every update.
    pub version: u64,

    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl PipelineRecord {
    /// Creates a record with no stage scheduled.
    pub fn new(
        id: impl Into<String>,
        pipeline: impl Into<String>,
        subject: SubjectContext,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            pipeline: pipeline.into(),
            subject,
            stages: BTreeMap::new(),
            fields: BTreeMap::new(),
            version: 0,
            created_at,
        }
    }

    /// Mutable access to a stage slot, creating it unscheduled if absent.
    pub fn slot_mut(&mut self, stage: StageIndex) -> &mut StageSlot {
        self.stages.entry(stage).or_default()
    }

    /// Reads a payload field as a string.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(JsonValue::as_str)
    }

    /// Returns true if every stage with an actual time also has a planned
    /// time.
    pub fn is_consistent(&self) -> bool {
        self.stages
            .values()
            .all(|slot| slot.actual_at.is_none() || slot.planned_at.is_some())
    }
}

impl StagedRecord for PipelineRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn slot(&self, stage: StageIndex) -> StageSlot {
        self.stages.get(&stage).cloned().unwrap_or_default()
    }
}
