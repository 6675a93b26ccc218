//! Pipeline change events.
//!
//! Every successful write by a handler is announced on an [`EventBus`].
//! Live views subscribe to refresh as soon as something changes instead of
//! waiting for their next poll.

use crate::stage::StageIndex;
use tokio::sync::broadcast;

/// Default channel capacity for pipeline events.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// An event emitted after a write to a shared collection.
///
/// Events use `String` ids to stay cheap to clone and easy to log.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PipelineEvent {
    /// A pipeline record was created.
    RecordCreated {
        /// Pipeline name.
        pipeline: String,
        /// Record id.
        record_id: String,
    },

    /// A stage of a record was completed.
    StageCompleted {
        /// Pipeline name.
        pipeline: String,
        /// Record id.
        record_id: String,
        /// Completed stage.
        stage: StageIndex,
    },

    /// A stage was scheduled, by chaining or manually.
    StageScheduled {
        /// Pipeline name.
        pipeline: String,
        /// Record id.
        record_id: String,
        /// Scheduled stage.
        stage: StageIndex,
    },

    /// A completion lost the race to another writer.
    CompletionConflict {
        /// Record or task id.
        record_id: String,
        /// Contested stage.
        stage: StageIndex,
    },

    /// A fan-out submission created task rows.
    TasksAssigned {
        /// Task numbers created, in order.
        task_nos: Vec<String>,
    },

    /// A task was completed.
    TaskCompleted {
        /// Task number.
        task_no: String,
    },

    /// A branch completion created a secondary record.
    SecondaryRecordCreated {
        /// Secondary record id.
        secondary_id: String,
        /// Originating task number.
        source_task_no: String,
    },
}

impl PipelineEvent {
    /// Returns the record or task id the event concerns, if it has one.
    pub fn item_id(&self) -> Option<&str> {
        match self {
            Self::RecordCreated { record_id, .. }
            | Self::StageCompleted { record_id, .. }
            | Self::StageScheduled { record_id, .. }
            | Self::CompletionConflict { record_id, .. } => Some(record_id),
            Self::TaskCompleted { task_no } => Some(task_no),
            Self::SecondaryRecordCreated { source_task_no, .. } => Some(source_task_no),
            Self::TasksAssigned { .. } => None,
        }
    }

    /// Returns true for events that mark something as done.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            Self::StageCompleted { .. } | Self::TaskCompleted { .. }
        )
    }
}

/// Broadcast channel shared by the handlers of one process.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// Creates a bus holding up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes to future events.
    ///
    /// Slow receivers lose the oldest events rather than blocking writers.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Sends an event to all subscribers.
    ///
    /// Ignores send errors (no subscribers).
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id() {
        let event = PipelineEvent::StageCompleted {
            pipeline: "lab".to_string(),
            record_id: "LAB-001".to_string(),
            stage: 1,
        };
        assert_eq!(event.item_id(), Some("LAB-001"));

        let event = PipelineEvent::TasksAssigned {
            task_nos: vec!["TASK-001".to_string()],
        };
        assert_eq!(event.item_id(), None);
    }

    #[test]
    fn test_is_completion() {
        assert!(PipelineEvent::TaskCompleted {
            task_no: "TASK-001".to_string()
        }
        .is_completion());
        assert!(!PipelineEvent::StageScheduled {
            pipeline: "lab".to_string(),
            record_id: "LAB-001".to_string(),
            stage: 2,
        }
        .is_completion());
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(PipelineEvent::TaskCompleted {
            task_no: "TASK-001".to_string(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(PipelineEvent::RecordCreated {
            pipeline: "discharge".to_string(),
            record_id: "DIS-001".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.item_id(), Some("DIS-001"));
    }
}
