//! Deferred work queue and retry backoff.
//!
//! Two concerns share this component. The *deferred queue* holds backups
//! that were due but denied by the resource monitor: a bounded list
//! (capacity 5) ordered by age-based priority, evicting the lowest
//! priority on overflow. The *retry policy* is the exponential backoff
//! arithmetic applied to failed backup records: `base · 2^(k−1)` capped,
//! with 5-minute base and 60-minute cap by default.
//!
//! The queue never talks to the resource monitor directly — callers pass
//! the check as a closure, which keeps the scheduler/queue dependency
//! one-way.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Bound on the deferred queue.
pub const DEFERRED_CAPACITY: usize = 5;

/// Priority saturates after a day of waiting.
const MAX_PRIORITY_HOURS: i64 = 24;

/// A backup that was due but could not run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredWorkItem {
    pub id: String,
    pub schedule_id: String,
    pub originally_due_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    /// `min(hours_since_due, 24)` at enqueue time.
    pub priority: u32,
}

/// What happened on enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Stored; the queue had room.
    Stored,
    /// Stored; the named lowest-priority item was evicted to make room.
    Evicted(String),
    /// Dropped; the new item itself was the lowest priority at capacity.
    Dropped,
}

/// Bounded, priority-ordered queue of deferred backups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredQueue {
    items: Vec<DeferredWorkItem>,
    capacity: usize,
}

impl Default for DeferredQueue {
    fn default() -> Self {
        Self::new(DEFERRED_CAPACITY)
    }
}

impl DeferredQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::new(),
            capacity,
        }
    }

    /// Rebuild from persisted items (keeps the stored order).
    pub fn from_items(items: Vec<DeferredWorkItem>, capacity: usize) -> Self {
        let mut queue = Self::new(capacity);
        queue.items = items;
        queue.sort();
        queue
    }

    pub fn items(&self) -> &[DeferredWorkItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn sort(&mut self) {
        // Highest priority first; among equals the longest-due first.
        self.items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.originally_due_at.cmp(&b.originally_due_at))
        });
    }

    /// Queue a missed backup. At capacity the lowest-priority item (which
    /// may be the new one) is dropped.
    pub fn enqueue(
        &mut self,
        schedule_id: &str,
        originally_due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> EnqueueOutcome {
        let hours_since_due = (now - originally_due_at).num_hours().max(0);
        let item = DeferredWorkItem {
            id: uuid::Uuid::new_v4().to_string(),
            schedule_id: schedule_id.to_string(),
            originally_due_at,
            enqueued_at: now,
            priority: hours_since_due.min(MAX_PRIORITY_HOURS) as u32,
        };
        let new_id = item.id.clone();

        self.items.push(item);
        self.sort();
        if self.items.len() <= self.capacity {
            return EnqueueOutcome::Stored;
        }

        let evicted = self.items.pop().expect("overflowing queue is non-empty");
        if evicted.id == new_id {
            EnqueueOutcome::Dropped
        } else {
            EnqueueOutcome::Evicted(evicted.id)
        }
    }

    /// Take the highest-priority item, but only when the caller's
    /// resource check allows work right now.
    pub fn next(&mut self, can_run: impl FnOnce() -> bool) -> Option<DeferredWorkItem> {
        if self.items.is_empty() || !can_run() {
            return None;
        }
        Some(self.items.remove(0))
    }
}

// ── Retry backoff ────────────────────────────────────────────────

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY_SECS: u64 = 5 * 60;

/// Ceiling on any retry delay.
pub const DEFAULT_MAX_DELAY_SECS: u64 = 60 * 60;

/// Default attempt budget for a failing backup.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Exponential backoff tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: DEFAULT_BASE_DELAY_SECS,
            max_delay_secs: DEFAULT_MAX_DELAY_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based):
    /// `min(base · 2^(attempt−1), cap)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let secs = self
            .base_delay_secs
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_secs);
        Duration::seconds(secs as i64)
    }
}
