//! Periodically refreshed Pending/History views.
//!
//! A [`ViewQuery`] fetches the visible collection and names the stage to
//! partition on. [`refresh`] runs one pass; [`LiveView`] runs passes on a
//! timer and whenever a [`PipelineEvent`](crate::PipelineEvent) arrives,
//! publishing each result through a `watch` channel.

use crate::collab::Actor;
use crate::event::EventBus;
use crate::pipeline::Pipeline;
use crate::record::{PipelineRecord, StagedRecord};
use crate::stage::{StageIndex, StagePhase};
use crate::store::RecordStore;
use crate::task::{TaskAssignment, TASK_STAGE};
use crate::{Result, WardflowError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info_span, warn, Instrument};

/// A collection split into pending and completed rows for one stage.
///
/// Records that have not reached the stage appear in neither list.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition<T> {
    /// Rows pending at the stage, oldest planned first.
    pub pending: Vec<T>,

    /// Rows completed at the stage, most recently completed first.
    pub history: Vec<T>,
}

impl<T> Default for Partition<T> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            history: Vec::new(),
        }
    }
}

impl<T: StagedRecord> Partition<T> {
    /// Partitions `records` on `stage` by each record's own slot.
    pub fn of(records: Vec<T>, stage: StageIndex) -> Self {
        Self::of_with(records, stage, |record| record.phase(stage))
    }

    /// Partitions `records` on `stage` using `classify` for the phase.
    pub fn of_with<F>(records: Vec<T>, stage: StageIndex, classify: F) -> Self
    where
        F: Fn(&T) -> StagePhase,
    {
        let mut partition = Self::default();
        for record in records {
            match classify(&record) {
                StagePhase::Pending => partition.pending.push(record),
                StagePhase::Completed => partition.history.push(record),
                StagePhase::NotReached => {}
            }
        }

        partition.pending.sort_by(|a, b| {
            let (sa, sb) = (a.slot(stage), b.slot(stage));
            sa.planned_at
                .cmp(&sb.planned_at)
                .then_with(|| a.id().cmp(b.id()))
        });
        partition.history.sort_by(|a, b| {
            let (sa, sb) = (a.slot(stage), b.slot(stage));
            sb.actual_at
                .cmp(&sa.actual_at)
                .then_with(|| a.id().cmp(b.id()))
        });
        partition
    }

    /// Total rows in both lists.
    pub fn len(&self) -> usize {
        self.pending.len() + self.history.len()
    }

    /// Returns true when both lists are empty.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.history.is_empty()
    }

    /// Ids of the pending rows, in order.
    pub fn pending_ids(&self) -> Vec<&str> {
        self.pending.iter().map(|r| r.id()).collect()
    }

    /// Ids of the history rows, in order.
    pub fn history_ids(&self) -> Vec<&str> {
        self.history.iter().map(|r| r.id()).collect()
    }
}

/// The data source behind a view.
#[async_trait]
pub trait ViewQuery: Send + Sync + 'static {
    /// Row type shown by the view.
    type Item: StagedRecord + Clone + 'static;

    /// Fetches the visible rows.
    async fn fetch(&self) -> Result<Vec<Self::Item>>;

    /// Stage the view partitions on.
    fn stage(&self) -> StageIndex;

    /// Phase of `item` at [`stage`](Self::stage).
    fn classify(&self, item: &Self::Item) -> StagePhase {
        item.phase(self.stage())
    }
}

/// Records of one pipeline, partitioned at one stage.
///
/// A gated query holds the pipeline definition and keeps records whose
/// predecessors are incomplete out of the pending list.
#[derive(Debug, Clone)]
pub struct PipelineQuery<S> {
    store: S,
    pipeline: String,
    stage: StageIndex,
    gate: Option<Arc<Pipeline>>,
}

impl<S: RecordStore + Clone + 'static> PipelineQuery<S> {
    /// Creates a query over `pipeline` at `stage`.
    pub fn new(store: S, pipeline: impl Into<String>, stage: StageIndex) -> Self {
        Self {
            store,
            pipeline: pipeline.into(),
            stage,
            gate: None,
        }
    }

    /// Creates a query at `stage` classified by `pipeline`'s predecessor
    /// rules.
    pub fn gated(store: S, pipeline: Arc<Pipeline>, stage: StageIndex) -> Self {
        Self {
            store,
            pipeline: pipeline.name().to_string(),
            stage,
            gate: Some(pipeline),
        }
    }
}

#[async_trait]
impl<S: RecordStore + Clone + 'static> ViewQuery for PipelineQuery<S> {
    type Item = PipelineRecord;

    async fn fetch(&self) -> Result<Vec<PipelineRecord>> {
        self.store.list_records(&self.pipeline).await
    }

    fn stage(&self) -> StageIndex {
        self.stage
    }

    fn classify(&self, item: &PipelineRecord) -> StagePhase {
        match &self.gate {
            Some(pipeline) => pipeline
                .classify(item, self.stage)
                .unwrap_or_else(|_| item.phase(self.stage)),
            None => item.phase(self.stage),
        }
    }
}

/// Task assignments, optionally only those of one resource.
#[derive(Debug, Clone)]
pub struct TaskQuery<S> {
    store: S,
    resource: Option<String>,
}

impl<S: RecordStore + Clone + 'static> TaskQuery<S> {
    /// Every task.
    pub fn all(store: S) -> Self {
        Self {
            store,
            resource: None,
        }
    }

    /// Tasks assigned to `resource`.
    pub fn assigned_to(store: S, resource: impl Into<String>) -> Self {
        Self {
            store,
            resource: Some(resource.into()),
        }
    }

    /// Every task for admins, own tasks for everyone else.
    pub fn for_actor(store: S, actor: &Actor) -> Self {
        if actor.is_admin() {
            Self::all(store)
        } else {
            Self::assigned_to(store, actor.name.clone())
        }
    }
}

#[async_trait]
impl<S: RecordStore + Clone + 'static> ViewQuery for TaskQuery<S> {
    type Item = TaskAssignment;

    async fn fetch(&self) -> Result<Vec<TaskAssignment>> {
        let mut tasks = self.store.list_tasks().await?;
        if let Some(resource) = &self.resource {
            tasks.retain(|task| &task.assigned_resource == resource);
        }
        Ok(tasks)
    }

    fn stage(&self) -> StageIndex {
        TASK_STAGE
    }
}

/// Runs one refresh pass.
pub async fn refresh<Q: ViewQuery + ?Sized>(query: &Q) -> Result<Partition<Q::Item>> {
    let records = query.fetch().await?;
    Ok(Partition::of_with(records, query.stage(), |item| {
        query.classify(item)
    }))
}

enum Wake {
    Tick,
    Event,
    Closed,
}

/// A background refresher publishing the latest [`Partition`].
///
/// The task stops when [`stop`](Self::stop) is called or the view is
/// dropped.
#[derive(Debug)]
pub struct LiveView<T> {
    rx: watch::Receiver<Partition<T>>,
    handle: JoinHandle<()>,
}

impl<T: StagedRecord + Clone + 'static> LiveView<T> {
    /// Spawns a refresher for `query`.
    ///
    /// The first refresh runs immediately. Later refreshes run every
    /// `interval` and on every event received from `events`. A failed
    /// refresh is logged and the previous partition stays visible.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<Q>(query: Q, interval: Duration, events: Option<&EventBus>) -> Self
    where
        Q: ViewQuery<Item = T>,
    {
        let (tx, rx) = watch::channel(Partition::default());
        let mut events = events.map(EventBus::subscribe);
        let period = if interval.is_zero() {
            Duration::from_secs(1)
        } else {
            interval
        };
        let span = info_span!("live_view", stage = query.stage());

        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    let wake = match events.as_mut() {
                        Some(rx) => tokio::select! {
                            _ = ticker.tick() => Wake::Tick,
                            received = rx.recv() => match received {
                                Ok(_) => Wake::Event,
                                Err(RecvError::Lagged(skipped)) => {
                                    debug!(skipped, "event receiver lagged");
                                    Wake::Event
                                }
                                Err(RecvError::Closed) => Wake::Closed,
                            },
                        },
                        None => {
                            ticker.tick().await;
                            Wake::Tick
                        }
                    };

                    match wake {
                        Wake::Closed => {
                            debug!("event bus closed; polling only");
                            events = None;
                            continue;
                        }
                        Wake::Tick => debug!("refresh on tick"),
                        Wake::Event => debug!("refresh on event"),
                    }

                    match refresh(&query).await {
                        Ok(partition) => {
                            if tx.send(partition).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "refresh failed; keeping previous view"),
                    }
                }
            }
            .instrument(span),
        );

        Self { rx, handle }
    }

    /// The latest published partition.
    pub fn current(&self) -> Partition<T> {
        self.rx.borrow().clone()
    }

    /// Waits for the next published partition.
    ///
    /// # Errors
    ///
    /// Returns [`WardflowError::Storage`] if the refresher has stopped.
    pub async fn changed(&mut self) -> Result<()> {
        self.rx
            .changed()
            .await
            .map_err(|_| WardflowError::Storage("live view stopped".to_string()))
    }

    /// A new receiver for the published partitions.
    pub fn subscribe(&self) -> watch::Receiver<Partition<T>> {
        self.rx.clone()
    }

    /// Stops the refresher.
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl<T> Drop for LiveView<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WardflowConfig;
    use crate::domains::lab;
    use crate::event::PipelineEvent;
    use crate::record::SubjectContext;
    use crate::stage::StageSlot;
    use crate::store::MemoryStore;
    use crate::task::tests::sample_task;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn record(id: &str, planned: Option<u32>, actual: Option<u32>) -> PipelineRecord {
        let mut record = PipelineRecord::new(id, "lab", SubjectContext::new("IPD-1", "Asha"), at(0));
        if let Some(planned) = planned {
            let mut slot = StageSlot::scheduled(at(planned));
            if let Some(actual) = actual {
                slot.mark_complete(at(actual), "Dr. Rao");
            }
            record.stages.insert(2, slot);
        }
        record
    }

    #[test]
    fn test_partition_splits_and_orders() {
        let records = vec![
            record("LAB-001", Some(9), None),
            record("LAB-002", Some(7), None),
            record("LAB-003", Some(6), Some(8)),
            record("LAB-004", Some(6), Some(10)),
            record("LAB-005", None, None),
        ];

        let partition = Partition::of(records, 2);
        assert_eq!(partition.pending_ids(), vec!["LAB-002", "LAB-001"]);
        assert_eq!(partition.history_ids(), vec!["LAB-004", "LAB-003"]);
        assert_eq!(partition.len(), 4);
    }

    #[test]
    fn test_partition_ties_break_on_id() {
        let records = vec![
            record("LAB-009", Some(9), None),
            record("LAB-003", Some(9), None),
        ];
        let partition = Partition::of(records, 2);
        assert_eq!(partition.pending_ids(), vec!["LAB-003", "LAB-009"]);
    }

    #[test]
    fn test_empty_partition() {
        let partition: Partition<PipelineRecord> = Partition::of(Vec::new(), 1);
        assert!(partition.is_empty());
    }

    #[tokio::test]
    async fn test_task_query_scopes_to_actor() {
        let mut store = MemoryStore::new();
        let mut other = sample_task("TASK-002", "Dressing");
        other.assigned_resource = "Dr. Khan".to_string();
        store
            .insert_tasks(&[sample_task("TASK-001", "Dressing"), other])
            .await
            .unwrap();

        let own = refresh(&TaskQuery::for_actor(store.clone(), &Actor::staff("Dr. Mehta")))
            .await
            .unwrap();
        assert_eq!(own.pending_ids(), vec!["TASK-001"]);

        let all = refresh(&TaskQuery::for_actor(store, &Actor::admin("Matron")))
            .await
            .unwrap();
        assert_eq!(all.pending.len(), 2);
    }

    #[tokio::test]
    async fn test_gated_query_hides_stage_with_open_predecessor() {
        let mut store = MemoryStore::new();
        let pipeline = Arc::new(
            lab::pipeline(&WardflowConfig::default(), EventBus::new(4)).unwrap(),
        );
        // Report stage scheduled by hand while collection is still open
        let mut early = record("LAB-001", Some(9), None);
        early.stages.insert(1, StageSlot::scheduled(at(8)));
        let mut ready = record("LAB-002", Some(9), None);
        let mut collected = StageSlot::scheduled(at(7));
        collected.mark_complete(at(8), "Dr. Rao");
        ready.stages.insert(1, collected);
        store.insert_record(&early).await.unwrap();
        store.insert_record(&ready).await.unwrap();

        let gated = refresh(&PipelineQuery::gated(store.clone(), pipeline, lab::REPORT_UPLOAD))
            .await
            .unwrap();
        assert_eq!(gated.pending_ids(), vec!["LAB-002"]);

        let raw = refresh(&PipelineQuery::new(store, lab::NAME, lab::REPORT_UPLOAD))
            .await
            .unwrap();
        assert_eq!(raw.pending_ids(), vec!["LAB-001", "LAB-002"]);
    }

    #[tokio::test]
    async fn test_live_view_refreshes_on_event() {
        let mut store = MemoryStore::new();
        let bus = EventBus::new(16);
        let query = PipelineQuery::new(store.clone(), "lab", 2);
        let mut view = LiveView::spawn(query, Duration::from_secs(3600), Some(&bus));

        store
            .insert_record(&record("LAB-001", Some(9), None))
            .await
            .unwrap();
        bus.emit(PipelineEvent::RecordCreated {
            pipeline: "lab".to_string(),
            record_id: "LAB-001".to_string(),
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if view.current().pending.len() == 1 {
                    break;
                }
                view.changed().await.unwrap();
            }
        })
        .await
        .expect("view did not refresh");

        view.stop();
    }

    #[tokio::test]
    async fn test_live_view_polls_without_events() {
        let mut store = MemoryStore::new();
        store
            .insert_record(&record("LAB-001", Some(9), Some(10)))
            .await
            .unwrap();

        let mut view = LiveView::spawn(
            PipelineQuery::new(store.clone(), "lab", 2),
            Duration::from_millis(20),
            None,
        );

        tokio::time::timeout(Duration::from_secs(5), view.changed())
            .await
            .expect("no refresh")
            .unwrap();
        assert_eq!(view.current().history_ids(), vec!["LAB-001"]);
    }

    #[tokio::test]
    async fn test_stopped_view_reports_error() {
        let store = MemoryStore::new();
        let view = LiveView::spawn(
            TaskQuery::all(store),
            Duration::from_millis(10),
            None,
        );
        let mut rx = view.subscribe();
        view.stop();

        // Sender is dropped once the aborted task is torn down.
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while rx.changed().await.is_ok() {}
        })
        .await;
        assert!(closed.is_ok());
    }
}
