//! # Wardflow
//!
//! Stage-chained workflow pipelines for hospital operations, with shift
//! task fan-out and branch sub-workflows.
//!
//! Every record advancing through a pipeline (a lab order, a discharge
//! case) carries one planned/actual timestamp pair per stage. A stage is
//! *pending* when planned but not done, *completed* when both are set, and
//! *not reached* before it is planned. Completing a stage schedules the next
//! one in the same write, so the pipeline advances exactly once no matter
//! how many screens are watching it.
//!
//! Alongside pipelines, the crate handles task assignment:
//!
//! - [`TaskFanOut`] expands a per-shift assignment form into one row per
//!   task, numbered from a single issued base
//! - [`BranchHandler`] completes tasks, and for marked tasks (by default
//!   "OT Information") records a surgical/non-surgical classification,
//!   spawning a [`SecondaryRecord`] on the surgical branch
//! - [`LiveView`] keeps Pending/History lists fresh by polling and by
//!   listening for [`PipelineEvent`]s
//!
//! ## Quick Example
//!
//! ```
//! use std::collections::BTreeMap;
//! use wardflow::domains::lab;
//! use wardflow::{EventBus, MemoryStore, StagePayload, StagePhase, StagedRecord, SubjectContext, WardflowConfig};
//!
//! # async fn example() -> wardflow::Result<()> {
//! let config = WardflowConfig::default();
//! let pipeline = lab::pipeline(&config, EventBus::default())?;
//! let mut store = MemoryStore::new();
//!
//! let order = pipeline
//!     .create(&mut store, SubjectContext::new("IPD-100", "Asha Verma"), BTreeMap::new())
//!     .await?;
//! assert_eq!(order.id, "LAB-001");
//!
//! let order = pipeline
//!     .complete(&mut store, &order.id, lab::SAMPLE_COLLECTION, &StagePayload::new(), "Nurse Joy")
//!     .await?;
//! assert_eq!(order.phase(lab::REPORT_UPLOAD), StagePhase::Pending);
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! Any number of actors may share one store. Rows carry a version, and the
//! handlers write with the version they read: a completion that lost the
//! race to another actor is reported as [`WardflowError::Conflict`] rather
//! than applied twice.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![forbid(unsafe_code)]

pub mod branch;
pub mod collab;
pub mod config;
pub mod delay;
pub mod desk;
pub mod domains;
pub mod error;
pub mod event;
pub mod fanout;
pub mod live_view;
pub mod pipeline;
pub mod record;
pub mod sequence;
pub mod stage;
pub mod status;
pub mod store;
pub mod task;

pub use branch::{BranchHandler, BranchRegistry, CompletionOutcome, TaskCompletion};
pub use collab::{
    Actor, InMemoryUploader, Notifier, RecordingNotifier, ReportUploader, Role, Severity,
    TracingNotifier,
};
pub use config::WardflowConfig;
pub use delay::Delay;
pub use desk::Desk;
pub use error::{Result, WardflowError};
pub use event::{EventBus, PipelineEvent};
pub use fanout::{ShiftAssignment, TaskFanOut};
pub use live_view::{refresh, LiveView, Partition, PipelineQuery, TaskQuery, ViewQuery};
pub use pipeline::{BatchOutcome, Pipeline, PipelineBuilder};
pub use record::{PipelineRecord, StagedRecord, SubjectContext};
pub use sequence::{IssuedNumber, SequenceScope, SequenceSource, TaskNumberIssuer};
pub use stage::{classify, PayloadField, StageIndex, StagePayload, StagePhase, StageSlot, StageSpec};
pub use status::{RecordStatus, StageStatusEntry};
pub use store::{MemoryStore, RecordStore};
pub use task::{BranchType, SecondaryRecord, Shift, TaskAssignment};

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_returns_valid_semver() {
        let version = version();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }
}
