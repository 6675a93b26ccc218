//! Stage types for wardflow pipelines.
//!
//! Every stage of a record is a pair of nullable timestamps: `planned_at`
//! says the stage was scheduled, `actual_at` says it was completed. This
//! module holds that pair ([`StageSlot`]), the pure predicate that reads it
//! ([`classify`]), and the per-stage definition used by a pipeline to
//! validate completions ([`StageSpec`]).

use crate::delay::Delay;
use crate::{Result, WardflowError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// 1-based position of a stage within its pipeline.
pub type StageIndex = u8;

/// Payload submitted with a stage completion.
pub type StagePayload = serde_json::Map<String, JsonValue>;

/// Where a record stands at one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StagePhase {
    /// Scheduled but not yet completed.
    Pending,

    /// Scheduled and completed.
    Completed,

    /// Not scheduled yet.
    NotReached,
}

/// The planned/actual pair for one stage of one record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSlot {
    /// When the stage was scheduled.
    pub planned_at: Option<DateTime<Utc>>,

    /// When the stage was completed.
    pub actual_at: Option<DateTime<Utc>>,

    /// Name of the actor who completed the stage.
    pub completed_by: Option<String>,

    /// Elapsed-time classification, for stages that track it.
    pub delay: Option<Delay>,
}

impl StageSlot {
    /// Creates an unscheduled slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a slot already scheduled at `at`.
    pub fn scheduled(at: DateTime<Utc>) -> Self {
        Self {
            planned_at: Some(at),
            ..Self::default()
        }
    }

    /// Records the planned time. An existing planned time is kept.
    pub fn schedule(&mut self, at: DateTime<Utc>) {
        if self.planned_at.is_none() {
            self.planned_at = Some(at);
        }
    }

    /// Records the completion time and actor.
    pub fn mark_complete(&mut self, at: DateTime<Utc>, by: impl Into<String>) {
        self.actual_at = Some(at);
        self.completed_by = Some(by.into());
    }

    /// Returns true once `planned_at` is set.
    pub fn is_scheduled(&self) -> bool {
        self.planned_at.is_some()
    }

    /// Returns true once both timestamps are set.
    pub fn is_completed(&self) -> bool {
        self.planned_at.is_some() && self.actual_at.is_some()
    }

    /// Shorthand for [`classify`].
    pub fn phase(&self) -> StagePhase {
        classify(self)
    }
}

/// Classifies a slot without looking at any other stage.
///
/// `Pending` iff planned is set and actual is not; `Completed` iff both are
/// set; `NotReached` iff planned is unset.
pub fn classify(slot: &StageSlot) -> StagePhase {
    match (slot.planned_at, slot.actual_at) {
        (None, _) => StagePhase::NotReached,
        (Some(_), None) => StagePhase::Pending,
        (Some(_), Some(_)) => StagePhase::Completed,
    }
}

/// A payload key a stage requires on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadField {
    /// Key in the completion payload.
    pub key: String,

    /// Closed set of accepted string values, if any.
    pub allowed: Option<Vec<String>>,

    /// Whether the value must be the boolean `true`.
    #[serde(default)]
    pub confirmation: bool,

    /// Message shown when the key is missing or invalid.
    pub message: String,
}

impl PayloadField {
    /// A key that must be present and non-empty.
    pub fn required(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            allowed: None,
            confirmation: false,
            message: message.into(),
        }
    }

    /// A key that must be the boolean `true`, e.g. a sign-off checkbox.
    pub fn confirmed(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            allowed: None,
            confirmation: true,
            message: message.into(),
        }
    }

    /// A key whose value must be one of `allowed`.
    pub fn one_of<I, V>(key: impl Into<String>, allowed: I, message: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self {
            key: key.into(),
            allowed: Some(allowed.into_iter().map(Into::into).collect()),
            confirmation: false,
            message: message.into(),
        }
    }

    /// Checks this field against a payload.
    pub fn validate(&self, payload: &StagePayload) -> Result<()> {
        let value = match payload.get(&self.key) {
            None | Some(JsonValue::Null) => {
                return Err(WardflowError::validation(self.message.clone()))
            }
            Some(JsonValue::String(s)) if s.trim().is_empty() => {
                return Err(WardflowError::validation(self.message.clone()))
            }
            Some(value) => value,
        };

        if self.confirmation && value != &JsonValue::Bool(true) {
            return Err(WardflowError::validation(self.message.clone()));
        }

        if let Some(allowed) = &self.allowed {
            let accepted = value
                .as_str()
                .map(|s| allowed.iter().any(|a| a == s))
                .unwrap_or(false);
            if !accepted {
                return Err(WardflowError::validation(format!(
                    "{} (expected one of: {})",
                    self.message,
                    allowed.join(", ")
                )));
            }
        }

        Ok(())
    }
}

/// Definition of one stage in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// 1-based position of the stage.
    pub index: StageIndex,

    /// Display name, e.g. "Report Upload".
    pub name: String,

    /// Payload keys required to complete the stage.
    pub required: Vec<PayloadField>,

    /// Whether completion computes a [`Delay`].
    pub tracks_delay: bool,
}

impl StageSpec {
    /// Creates a stage with no payload requirements.
    pub fn new(index: StageIndex, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            required: Vec::new(),
            tracks_delay: false,
        }
    }

    /// Requires a non-empty payload key.
    pub fn require(mut self, key: impl Into<String>, message: impl Into<String>) -> Self {
        self.required.push(PayloadField::required(key, message));
        self
    }

    /// Requires a payload key set to `true`.
    pub fn require_confirmed(mut self, key: impl Into<String>, message: impl Into<String>) -> Self {
        self.required.push(PayloadField::confirmed(key, message));
        self
    }

    /// Requires a payload key restricted to a closed set of values.
    pub fn require_one_of<I, V>(
        mut self,
        key: impl Into<String>,
        allowed: I,
        message: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.required.push(PayloadField::one_of(key, allowed, message));
        self
    }

    /// Enables delay classification on completion.
    pub fn track_delay(mut self) -> Self {
        self.tracks_delay = true;
        self
    }

    /// Checks every required key, reporting the first failure.
    pub fn validate_payload(&self, payload: &StagePayload) -> Result<()> {
        self.required
            .iter()
            .try_for_each(|field| field.validate(payload))
    }
}
