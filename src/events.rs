//! Typed notification events.
//!
//! Engines publish milestones here; the service loop and any UI surface
//! subscribe. Events are observable only — nothing in the core waits on
//! a subscriber, and losing one (lagging receiver, nobody listening) is
//! harmless.

use crate::delta::ApplyReport;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Channel depth before slow subscribers start lagging.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Milestones the core announces.
#[derive(Debug, Clone)]
pub enum Event {
    /// A backup finished. `skipped` marks the zero-byte unchanged case.
    BackupCompleted {
        record_id: String,
        bytes: u64,
        skipped: bool,
    },
    /// A backup failed and a retry is scheduled.
    BackupRetryScheduled {
        record_id: String,
        at: DateTime<Utc>,
    },
    /// A backup failed terminally.
    BackupFailed { record_id: String, error: String },
    /// Due work was denied by the resource monitor and queued.
    BackupDeferred {
        schedule_id: String,
        priority: u32,
        reason: String,
    },
    /// A sync transaction finished and changed the local tree.
    SyncCompleted { applied: ApplyReport },
    /// Sync found conflicts and the manual strategy left them to the
    /// user.
    SyncConflictsPending { count: usize },
    /// A restore finished.
    RestoreCompleted {
        record_id: String,
        applied: ApplyReport,
    },
}

/// Broadcast fan-out for [`Event`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event. Nobody listening is fine.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(Event::BackupCompleted {
            record_id: "r1".into(),
            bytes: 10,
            skipped: false,
        });
        assert!(matches!(
            rx.recv().await.unwrap(),
            Event::BackupCompleted { bytes: 10, .. }
        ));
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        EventBus::new().emit(Event::SyncConflictsPending { count: 1 });
    }
}
