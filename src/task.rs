//! Single-stage task assignments and the secondary records they spawn.

use crate::record::{StagedRecord, SubjectContext};
use crate::stage::{StageIndex, StageSlot};
use crate::{Result, WardflowError};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The only stage a task carries.
pub const TASK_STAGE: StageIndex = 1;

/// Secondary record kind produced by the OT branch.
pub const OT_REGISTRY_KIND: &str = "ot_registry";

/// Duty shift a task is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Shift {
    /// Morning shift.
    A,
    /// Evening shift.
    B,
    /// Night shift.
    C,
}

impl fmt::Display for Shift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
        };
        f.write_str(label)
    }
}

impl FromStr for Shift {
    type Err = WardflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            "C" => Ok(Self::C),
            other => Err(WardflowError::validation(format!("Unknown shift: {}", other))),
        }
    }
}

/// Classification captured when completing a branch-requiring task.
///
/// `Primary` (surgical) spawns a secondary record; `Secondary`
/// (non-surgical) does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchType {
    /// Surgical: the patient goes on the OT registry.
    #[serde(alias = "surgical")]
    Primary,
    /// Non-surgical: completion only.
    #[serde(alias = "non_surgical")]
    Secondary,
}

impl BranchType {
    /// Returns true when completion spawns a secondary record.
    pub fn spawns_secondary(&self) -> bool {
        matches!(self, Self::Primary)
    }
}

impl fmt::Display for BranchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("Surgical"),
            Self::Secondary => f.write_str("Non-Surgical"),
        }
    }
}

impl FromStr for BranchType {
    type Err = WardflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "primary" | "surgical" => Ok(Self::Primary),
            "secondary" | "non_surgical" => Ok(Self::Secondary),
            other => Err(WardflowError::validation(format!(
                "Unknown branch type: {}",
                other
            ))),
        }
    }
}

/// One atomic unit of assigned work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// Issued task number, e.g. `TASK-014`.
    pub task_no: String,

    /// Sequence scope prefix the number was issued from.
    pub scope: String,

    /// Numeric part of `task_no`.
    pub sequence: u64,

    /// Patient and bed the task concerns.
    pub subject: SubjectContext,

    /// Shift the task belongs to.
    pub shift: Shift,

    /// Staff member the task is assigned to.
    pub assigned_resource: String,

    /// Name of the single task.
    pub task_name: String,

    /// When the task was scheduled.
    pub planned_at: DateTime<Utc>,

    /// When the task was completed.
    pub actual_at: Option<DateTime<Utc>>,

    /// Whether the assignee asked for a reminder.
    pub reminder: bool,

    /// First day the task applies to.
    pub start_date: NaiveDate,

    /// Whether completion requires a branch classification.
    pub requires_branch: bool,

    /// Branch captured at completion.
    pub branch_type: Option<BranchType>,

    /// Actor who completed the task.
    pub completed_by: Option<String>,

    /// Free-text remarks entered at completion.
    pub remarks: Option<String>,

    /// Row version, bumped by the store on every update.
    pub version: u64,

    /// When the row was created.
    pub created_at: DateTime<Utc>,
}

impl TaskAssignment {
    /// Returns true once `actual_at` is set.
    pub fn is_completed(&self) -> bool {
        self.actual_at.is_some()
    }
}

impl StagedRecord for TaskAssignment {
    fn id(&self) -> &str {
        &self.task_no
    }

    fn slot(&self, stage: StageIndex) -> StageSlot {
        if stage != TASK_STAGE {
            return StageSlot::default();
        }
        StageSlot {
            planned_at: Some(self.planned_at),
            actual_at: self.actual_at,
            completed_by: self.completed_by.clone(),
            delay: None,
        }
    }
}

/// Record emitted into another collection when a task completes on the
/// primary branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondaryRecord {
    /// Identifier of the secondary record.
    pub id: String,

    /// Collection kind, e.g. [`OT_REGISTRY_KIND`].
    pub kind: String,

    /// Task number that produced this record.
    pub source_task_no: String,

    /// Subject snapshot taken at completion.
    pub subject: SubjectContext,

    /// Name of the originating task.
    pub task_name: String,

    /// Shift of the originating task.
    pub shift: Shift,

    /// Assignee of the originating task.
    pub assigned_resource: String,

    /// Branch captured at completion.
    pub branch_type: BranchType,

    /// Extra details supplied with the completion.
    pub extra: BTreeMap<String, JsonValue>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl SecondaryRecord {
    /// Snapshots `task` into an OT registry entry.
    pub fn snapshot(
        task: &TaskAssignment,
        branch_type: BranchType,
        extra: BTreeMap<String, JsonValue>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("OT-{}", task.task_no),
            kind: OT_REGISTRY_KIND.to_string(),
            source_task_no: task.task_no.clone(),
            subject: task.subject.clone(),
            task_name: task.task_name.clone(),
            shift: task.shift,
            assigned_resource: task.assigned_resource.clone(),
            branch_type,
            extra,
            created_at: at,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stage::StagePhase;
    use chrono::TimeZone;

    pub(crate) fn sample_task(task_no: &str, task_name: &str) -> TaskAssignment {
        TaskAssignment {
            task_no: task_no.to_string(),
            scope: "TASK".to_string(),
            sequence: 1,
            subject: SubjectContext::new("IPD-100", "Asha Verma").at("Ward 3", "12"),
            shift: Shift::A,
            assigned_resource: "Dr. Mehta".to_string(),
            task_name: task_name.to_string(),
            planned_at: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
            actual_at: None,
            reminder: false,
            start_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            requires_branch: false,
            branch_type: None,
            completed_by: None,
            remarks: None,
            version: 0,
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_shift_parse_and_display() {
        assert_eq!("b".parse::<Shift>().unwrap(), Shift::B);
        assert_eq!(Shift::C.to_string(), "C");
        assert!("D".parse::<Shift>().unwrap_err().is_validation());
    }

    #[test]
    fn test_branch_type_parse() {
        assert_eq!("primary".parse::<BranchType>().unwrap(), BranchType::Primary);
        assert_eq!("Surgical".parse::<BranchType>().unwrap(), BranchType::Primary);
        assert_eq!(
            "Non-Surgical".parse::<BranchType>().unwrap(),
            BranchType::Secondary
        );
        assert!("maybe".parse::<BranchType>().is_err());
    }

    #[test]
    fn test_branch_type_serde_aliases() {
        let b: BranchType = serde_json::from_str(r#""surgical""#).unwrap();
        assert_eq!(b, BranchType::Primary);
        assert_eq!(
            serde_json::to_string(&BranchType::Secondary).unwrap(),
            r#""secondary""#
        );
    }

    #[test]
    fn test_task_is_single_stage() {
        let mut task = sample_task("TASK-001", "Dressing");
        assert_eq!(task.phase(TASK_STAGE), StagePhase::Pending);
        assert_eq!(task.phase(2), StagePhase::NotReached);

        task.actual_at = Some(Utc::now());
        assert_eq!(task.phase(TASK_STAGE), StagePhase::Completed);
        assert!(task.is_completed());
    }

    #[test]
    fn test_secondary_snapshot_copies_task_fields() {
        let task = sample_task("TASK-009", "OT Information");
        let secondary =
            SecondaryRecord::snapshot(&task, BranchType::Primary, BTreeMap::new(), Utc::now());

        assert_eq!(secondary.source_task_no, "TASK-009");
        assert_eq!(secondary.subject, task.subject);
        assert_eq!(secondary.task_name, task.task_name);
        assert_eq!(secondary.kind, OT_REGISTRY_KIND);
        assert_eq!(secondary.id, "OT-TASK-009");
    }
}
