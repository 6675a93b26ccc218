//! The hospital pipelines built on [`Pipeline`].

use crate::config::WardflowConfig;
use crate::event::EventBus;
use crate::pipeline::Pipeline;
use crate::Result;

/// Lab order processing.
pub mod lab {
    use super::*;
    use crate::stage::{StageIndex, StageSpec};

    /// Pipeline name stored on lab records.
    pub const NAME: &str = "lab";

    /// Sample collected from the patient.
    pub const SAMPLE_COLLECTION: StageIndex = 1;
    /// Report file uploaded.
    pub const REPORT_UPLOAD: StageIndex = 2;
    /// Work file updated.
    pub const WORK_FILE: StageIndex = 3;

    /// Accepted values of `work_file_status`.
    pub const WORK_FILE_STATUSES: [&str; 2] = ["Done", "Not Done"];

    /// Builds the lab pipeline.
    pub fn pipeline(config: &WardflowConfig, events: EventBus) -> Result<Pipeline> {
        Pipeline::builder(NAME, config.lab_scope.clone())
            .stage(StageSpec::new(SAMPLE_COLLECTION, "Sample Collection"))
            .stage(
                StageSpec::new(REPORT_UPLOAD, "Report Upload")
                    .require("report_url", "Please upload the report")
                    .require("remarks", "Please enter remarks")
                    .track_delay(),
            )
            .stage(
                StageSpec::new(WORK_FILE, "Work File")
                    .require_one_of(
                        "work_file_status",
                        WORK_FILE_STATUSES,
                        "Please select Work File status for all selected records",
                    )
                    .track_delay(),
            )
            .events(events)
            .configure(config)
            .build()
    }
}

/// Discharge clearance.
pub mod discharge {
    use super::*;
    use crate::stage::{StageIndex, StageSpec};

    /// Pipeline name stored on discharge records.
    pub const NAME: &str = "discharge";

    /// Discharge advised and initiated.
    pub const INITIATION: StageIndex = 1;
    /// Bills settled.
    pub const BILLING_CLEARANCE: StageIndex = 2;
    /// Pharmacy returns cleared.
    pub const PHARMACY_CLEARANCE: StageIndex = 3;
    /// Payer approval recorded. Its successor is scheduled manually.
    pub const APPROVAL: StageIndex = 4;
    /// Discharge summary uploaded.
    pub const SUMMARY: StageIndex = 5;

    /// Accepted values of `approval_type`.
    pub const APPROVAL_TYPES: [&str; 3] = ["Cash", "TPA", "Company"];

    /// Builds the discharge pipeline.
    pub fn pipeline(config: &WardflowConfig, events: EventBus) -> Result<Pipeline> {
        Pipeline::builder(NAME, config.discharge_scope.clone())
            .stage(StageSpec::new(INITIATION, "Discharge Initiation"))
            .stage(StageSpec::new(BILLING_CLEARANCE, "Billing Clearance").track_delay())
            .stage(StageSpec::new(PHARMACY_CLEARANCE, "Pharmacy Clearance"))
            .stage(
                StageSpec::new(APPROVAL, "Approval")
                    .require_one_of(
                        "approval_type",
                        APPROVAL_TYPES,
                        "Please select the approval type",
                    )
                    .require_confirmed(
                        "authority_approved",
                        "Please confirm approval by the authority",
                    ),
            )
            .stage(
                StageSpec::new(SUMMARY, "Discharge Summary")
                    .require("summary_url", "Please upload the discharge summary"),
            )
            .conditional(APPROVAL)
            .events(events)
            .configure(config)
            .build()
    }
}
