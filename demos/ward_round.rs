//! A morning on the ward with wardflow.
//!
//! This example demonstrates:
//! - Loading configuration from the environment (and `.env`)
//! - Advancing a lab order through its stages
//! - Discharge clearance with a manually scheduled stage
//! - Fanning shift assignments out into tasks
//! - Completing an "OT Information" task on the surgical branch
//! - Watching a live Pending/History view
//! - Observing pipeline events
//!
//! Run with: `cargo run --example ward_round`
//! Set `RUST_LOG=wardflow=debug` for handler logs.

use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wardflow::domains::{discharge, lab};
use wardflow::{
    Actor, BranchType, Desk, InMemoryUploader, MemoryStore, PipelineEvent, RecordingNotifier,
    Result, Shift, ShiftAssignment, StagePayload, SubjectContext, TracingNotifier, WardflowConfig,
};

fn payload(value: serde_json::Value) -> StagePayload {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    println!("╔═══════════════════════════════════════════╗");
    println!("║  Wardflow Ward Round Example              ║");
    println!("╚═══════════════════════════════════════════╝\n");

    let config = WardflowConfig::from_env()?;
    println!(
        "⚙️  Refresh every {}s, branch markers {:?}\n",
        config.refresh_interval_secs, config.branch_markers
    );

    let store = MemoryStore::new();
    let mut nurse = Desk::new(
        store,
        Actor::staff("Nurse Joy"),
        config,
        Arc::new(TracingNotifier),
    )?;

    // A second actor on the same store, whose messages we keep
    let recorder = RecordingNotifier::new();
    let mut doctor = nurse
        .for_actor(Actor::staff("Dr. Mehta"))
        .with_notifier(Arc::new(recorder.clone()));

    let mut event_receiver = nurse.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_receiver.recv().await {
            match event {
                PipelineEvent::StageCompleted {
                    record_id, stage, ..
                } => println!("   [Event] {} completed stage {}", record_id, stage),
                PipelineEvent::StageScheduled {
                    record_id, stage, ..
                } => println!("   [Event] {} scheduled stage {}", record_id, stage),
                PipelineEvent::TasksAssigned { task_nos } => {
                    println!("   [Event] {} task(s) assigned", task_nos.len())
                }
                PipelineEvent::CompletionConflict { record_id, stage } => {
                    println!("   [Event] Conflict on {} stage {}", record_id, stage)
                }
                _ => {}
            }
        }
    });

    let patient = SubjectContext::new("IPD-2024-118", "Asha Verma")
        .at("Ward 3", "12")
        .with_consultant("Dr. Iyer");

    // Lab order
    println!("🧪 Lab order");
    println!("─────────────────────────────────────────");
    let mut view = nurse.pipeline_view(lab::NAME, lab::REPORT_UPLOAD)?;

    let mut fields = BTreeMap::new();
    fields.insert("test".to_string(), json!("CBC"));
    let order = nurse.create(lab::NAME, patient.clone(), fields).await?;
    nurse
        .complete(lab::NAME, &order.id, lab::SAMPLE_COLLECTION, &StagePayload::new())
        .await?;

    while view.current().pending.is_empty() {
        view.changed().await?;
    }
    println!("   Pending report uploads: {:?}", view.current().pending_ids());

    let uploader = InMemoryUploader::new();
    nurse
        .upload_lab_report(
            &uploader,
            &order.id,
            b"%PDF-1.4 cbc".to_vec(),
            "application/pdf",
            "Haemoglobin normal",
        )
        .await?;

    // The doctor did not see the upload before acting
    if let Err(e) = doctor
        .complete(lab::NAME, &order.id, lab::REPORT_UPLOAD, &payload(json!({
            "report_url": "memory://reports/other",
            "remarks": "duplicate",
        })))
        .await
    {
        println!("   Second upload rejected: {}", e.user_message());
    }
    view.stop();

    println!("\n{}", nurse.status(lab::NAME, &order.id).await?);

    // Discharge
    println!("🏥 Discharge");
    println!("─────────────────────────────────────────");
    let case = nurse
        .create(discharge::NAME, patient.clone(), BTreeMap::new())
        .await?;
    for stage in [
        discharge::INITIATION,
        discharge::BILLING_CLEARANCE,
        discharge::PHARMACY_CLEARANCE,
    ] {
        nurse
            .complete(discharge::NAME, &case.id, stage, &StagePayload::new())
            .await?;
    }
    nurse
        .complete(
            discharge::NAME,
            &case.id,
            discharge::APPROVAL,
            &payload(json!({"approval_type": "TPA", "authority_approved": true})),
        )
        .await?;
    // Approval does not chain; the summary is scheduled by hand
    nurse
        .schedule(discharge::NAME, &case.id, discharge::SUMMARY)
        .await?;
    println!("\n{}", nurse.status(discharge::NAME, &case.id).await?);

    // Tasks
    println!("\n📋 Shift tasks");
    println!("─────────────────────────────────────────");
    let today = Utc::now().date_naive();
    let tasks = nurse
        .assign_tasks(
            &patient,
            &[
                ShiftAssignment::new(Shift::A, "Dr. Mehta", today)
                    .tasks(["Dressing", "OT Information"])
                    .with_reminder(),
                ShiftAssignment::new(Shift::B, "Nurse Joy", today).task("Vitals"),
                ShiftAssignment::new(Shift::C, "", today),
            ],
        )
        .await?;
    for task in &tasks {
        println!(
            "   {} {} → {} (shift {})",
            task.task_no, task.task_name, task.assigned_resource, task.shift
        );
    }

    let mut task_view = doctor.task_view();
    task_view.changed().await?;
    println!(
        "   Dr. Mehta has {} pending task(s)",
        task_view.current().pending.len()
    );
    if let Some(ot) = tasks.iter().find(|t| t.requires_branch) {
        let outcome = doctor
            .complete_task(
                &ot.task_no,
                Some(BranchType::Primary),
                Some("Scheduled for 14:00".to_string()),
                BTreeMap::new(),
            )
            .await?;
        if let Some(secondary) = outcome.secondary {
            println!("   OT register entry {} created", secondary.id);
        }
    }
    task_view.stop();

    println!("\n💬 Messages shown to Dr. Mehta:");
    for (severity, message) in recorder.messages() {
        println!("   [{}] {}", severity, message);
    }

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    println!("\n✨ Ward round complete!");
    Ok(())
}
