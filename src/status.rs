//! Record status reporting.
//!
//! This module provides [`RecordStatus`] for inspecting where a pipeline
//! record stands across all of its stages.

use std::fmt;

use crate::delay::Delay;
use crate::stage::{StageIndex, StagePhase, StageSlot};
use chrono::{DateTime, Utc};

/// Status entry for a single stage of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct StageStatusEntry {
    /// The stage index.
    pub index: StageIndex,
    /// The stage name.
    pub name: String,
    /// Gated phase of this stage.
    pub phase: StagePhase,
    /// When this stage was scheduled.
    pub planned_at: Option<DateTime<Utc>>,
    /// When this stage completed.
    pub actual_at: Option<DateTime<Utc>>,
    /// Who completed it.
    pub completed_by: Option<String>,
    /// Delay classification, for stages that track it.
    pub delay: Option<Delay>,
}

impl StageStatusEntry {
    /// Creates an entry for a stage that has not been reached.
    pub fn not_reached(index: StageIndex, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            phase: StagePhase::NotReached,
            planned_at: None,
            actual_at: None,
            completed_by: None,
            delay: None,
        }
    }

    /// Creates an entry from a stored slot and its gated phase.
    pub fn from_slot(
        index: StageIndex,
        name: impl Into<String>,
        slot: &StageSlot,
        phase: StagePhase,
    ) -> Self {
        Self {
            index,
            name: name.into(),
            phase,
            planned_at: slot.planned_at,
            actual_at: slot.actual_at,
            completed_by: slot.completed_by.clone(),
            delay: slot.delay,
        }
    }

    /// Returns a status indicator character.
    pub fn status_char(&self) -> char {
        match self.phase {
            StagePhase::Pending => '⏳',    // Hourglass
            StagePhase::Completed => '✅',  // Green check
            StagePhase::NotReached => '⬜', // Empty box
        }
    }
}

/// The status of every stage of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordStatus {
    /// The record's identifier.
    pub record_id: String,
    /// The owning pipeline.
    pub pipeline: String,
    /// Status of each stage in pipeline order.
    pub stages: Vec<StageStatusEntry>,
}

impl RecordStatus {
    /// Creates a new record status.
    pub fn new(
        record_id: impl Into<String>,
        pipeline: impl Into<String>,
        stages: Vec<StageStatusEntry>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            pipeline: pipeline.into(),
            stages,
        }
    }

    /// Returns true if all stages are completed.
    pub fn is_complete(&self) -> bool {
        self.stages
            .iter()
            .all(|s| s.phase == StagePhase::Completed)
    }

    /// Returns the stages currently pending.
    pub fn pending_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.phase == StagePhase::Pending)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Returns the completed stages.
    pub fn completed_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.phase == StagePhase::Completed)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Returns the completed stages that finished late.
    pub fn late_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| matches!(s.delay, Some(Delay::Late { .. })))
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Returns the overall progress as a percentage.
    pub fn progress_percent(&self) -> f32 {
        if self.stages.is_empty() {
            return 100.0;
        }

        let completed = self
            .stages
            .iter()
            .filter(|s| s.phase == StagePhase::Completed)
            .count();

        (completed as f32 / self.stages.len() as f32) * 100.0
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Status for {} record \"{}\":",
            self.pipeline, self.record_id
        )?;
        writeln!(f)?;

        for stage in &self.stages {
            let phase_str = format!("{:?}", stage.phase);
            let time_str = stage
                .actual_at
                .or(stage.planned_at)
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string());

            write!(
                f,
                "  {} {}. {:<20} {:<11} {}",
                stage.status_char(),
                stage.index,
                stage.name,
                phase_str,
                time_str
            )?;

            if let Some(ref by) = stage.completed_by {
                write!(f, "  by {}", by)?;
            }

            if let Some(delay) = stage.delay {
                write!(f, "  ({})", delay)?;
            }

            writeln!(f)?;
        }

        writeln!(f)?;
        writeln!(f, "Progress: {:.0}%", self.progress_percent())?;

        if self.is_complete() {
            writeln!(f, "Status: Complete")?;
        } else {
            let pending = self.pending_stages();
            if pending.is_empty() {
                writeln!(f, "Status: Waiting to be scheduled")?;
            } else {
                writeln!(f, "Status: Pending at {}", pending.join(", "))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn completed(index: StageIndex, name: &str, planned: u32, actual: u32) -> StageStatusEntry {
        let mut slot = StageSlot::scheduled(at(planned));
        slot.mark_complete(at(actual), "Dr. Rao");
        slot.delay = Some(Delay::between(at(planned), at(actual)));
        StageStatusEntry::from_slot(index, name, &slot, StagePhase::Completed)
    }

    fn pending(index: StageIndex, name: &str, planned: u32) -> StageStatusEntry {
        StageStatusEntry::from_slot(
            index,
            name,
            &StageSlot::scheduled(at(planned)),
            StagePhase::Pending,
        )
    }

    #[test]
    fn test_status_empty() {
        let status = RecordStatus::new("LAB-001", "lab", vec![]);
        assert!(status.is_complete());
        assert_eq!(status.progress_percent(), 100.0);
    }

    #[test]
    fn test_status_partial() {
        let status = RecordStatus::new(
            "LAB-001",
            "lab",
            vec![
                completed(1, "Sample Collection", 8, 9),
                pending(2, "Report Upload", 9),
                StageStatusEntry::not_reached(3, "Work File"),
            ],
        );

        assert!(!status.is_complete());
        assert_eq!(status.pending_stages(), vec!["Report Upload"]);
        assert_eq!(status.completed_stages(), vec!["Sample Collection"]);
        assert!((status.progress_percent() - 33.33).abs() < 1.0);
    }

    #[test]
    fn test_late_stages() {
        let status = RecordStatus::new(
            "DIS-001",
            "discharge",
            vec![
                completed(1, "Discharge Initiation", 8, 8),
                completed(2, "Billing Clearance", 8, 12),
            ],
        );
        assert!(status.is_complete());
        assert_eq!(status.late_stages(), vec!["Billing Clearance"]);
    }

    #[test]
    fn test_status_display() {
        let status = RecordStatus::new(
            "LAB-007",
            "lab",
            vec![
                completed(1, "Sample Collection", 8, 11),
                pending(2, "Report Upload", 11),
                StageStatusEntry::not_reached(3, "Work File"),
            ],
        );

        let display = format!("{}", status);
        assert!(display.contains("LAB-007"));
        assert!(display.contains("Sample Collection"));
        assert!(display.contains("3 hours delay"));
        assert!(display.contains("by Dr. Rao"));
        assert!(display.contains("Status: Pending at Report Upload"));
    }

    #[test]
    fn test_stage_status_chars() {
        assert_eq!(pending(1, "a", 8).status_char(), '⏳');
        assert_eq!(completed(1, "a", 8, 9).status_char(), '✅');
        assert_eq!(StageStatusEntry::not_reached(1, "a").status_char(), '⬜');
    }
}
