//! Backup records and their status transitions.
//!
//! A record is created `InProgress` and persisted before the first I/O,
//! so a crash can never leave an unobservable half-done backup. On
//! failure the retry policy decides between `RetryPending` (with an
//! exponential-backoff fire time) and terminal `Failed`; only transient
//! error kinds are retried at all.

use crate::error::SyncError;
use crate::queue::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What triggered a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// User asked for it.
    Manual,
    /// The schedule fired.
    Scheduled,
    /// Change-triggered (debounced sync path).
    Auto,
}

/// Lifecycle state of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Completed,
    Failed,
    RetryPending,
}

impl BackupStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RetryPending => "retry_pending",
        }
    }
}

/// Outcome of registering a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Another attempt is scheduled at the given time.
    Scheduled(DateTime<Utc>),
    /// The record is terminally failed.
    Exhausted,
}

/// One backup transaction's persistent state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub kind: BackupKind,
    pub status: BackupStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Retry ordinal: 0 until the first failure schedules a retry.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Total failures observed, including the terminal one.
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub blob_id: Option<String>,
    pub bytes: u64,
    pub bookmark_count: u32,
    pub folder_count: u32,
    pub error: Option<String>,
    /// Owning schedule; `None` for manual and auto backups.
    pub schedule_id: Option<String>,
    /// Previous completed backup this one is incremental over.
    pub base_backup_id: Option<String>,
    /// Root hash of the snapshot this record captured.
    pub root_hash: Option<String>,
}

impl BackupRecord {
    pub fn new(kind: BackupKind, schedule_id: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            status: BackupStatus::InProgress,
            created_at: now,
            completed_at: None,
            attempt: 0,
            max_attempts: RetryPolicy::default().max_attempts,
            retry_count: 0,
            next_retry_at: None,
            blob_id: None,
            bytes: 0,
            bookmark_count: 0,
            folder_count: 0,
            error: None,
            schedule_id: schedule_id.map(str::to_string),
            base_backup_id: None,
            root_hash: None,
        }
    }

    /// Finish the transaction successfully.
    pub fn mark_completed(
        &mut self,
        now: DateTime<Utc>,
        blob_id: Option<String>,
        bytes: u64,
        bookmark_count: u32,
        folder_count: u32,
        root_hash: String,
    ) {
        self.status = BackupStatus::Completed;
        self.completed_at = Some(now);
        self.blob_id = blob_id;
        self.bytes = bytes;
        self.bookmark_count = bookmark_count;
        self.folder_count = folder_count;
        self.root_hash = Some(root_hash);
        self.next_retry_at = None;
        self.error = None;
    }

    /// Record a failure and decide whether to retry.
    ///
    /// Retryable kinds with attempts left go `RetryPending` with
    /// `next_retry_at = now + base·2^(attempt−1)` capped; everything else
    /// is terminal `Failed`.
    pub fn register_failure(
        &mut self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        error: &SyncError,
    ) -> RetryDecision {
        self.retry_count += 1;
        self.error = Some(error.record_message());

        if error.is_retryable() && self.attempt < self.max_attempts {
            self.attempt += 1;
            let mut delay = policy.delay_for(self.attempt);
            // A server-provided Retry-After takes precedence when longer.
            if let SyncError::Transient {
                retry_after_secs: Some(secs),
                ..
            } = error
            {
                let hinted = chrono::Duration::seconds(*secs as i64);
                if hinted > delay {
                    delay = hinted;
                }
            }
            let at = now + delay;
            self.next_retry_at = Some(at);
            self.status = BackupStatus::RetryPending;
            RetryDecision::Scheduled(at)
        } else {
            self.status = BackupStatus::Failed;
            self.next_retry_at = None;
            RetryDecision::Exhausted
        }
    }

    /// Move a pending retry back into flight.
    pub fn begin_retry(&mut self) {
        self.status = BackupStatus::InProgress;
        self.next_retry_at = None;
    }

    /// Whether the retry scan should dispatch this record now.
    pub fn is_due_for_retry(&self, now: DateTime<Utc>) -> bool {
        self.status == BackupStatus::RetryPending
            && self.next_retry_at.map_or(false, |at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn transient() -> SyncError {
        SyncError::Transient {
            message: "upload failed".into(),
            retry_after_secs: None,
        }
    }

    #[test]
    fn failure_ladder_runs_5_10_20_minutes() {
        let policy = RetryPolicy::default();
        let now = dt("2024-03-10T12:00:00Z");
        let mut record = BackupRecord::new(BackupKind::Scheduled, Some("s1"), now);

        let first = record.register_failure(&policy, now, &transient());
        assert_eq!(first, RetryDecision::Scheduled(now + Duration::minutes(5)));
        assert_eq!(record.status, BackupStatus::RetryPending);
        assert_eq!(record.attempt, 1);

        record.begin_retry();
        assert_eq!(record.status, BackupStatus::InProgress);

        let second = record.register_failure(&policy, now, &transient());
        assert_eq!(second, RetryDecision::Scheduled(now + Duration::minutes(10)));
        assert_eq!(record.attempt, 2);

        record.begin_retry();
        let third = record.register_failure(&policy, now, &transient());
        assert_eq!(third, RetryDecision::Scheduled(now + Duration::minutes(20)));
        assert_eq!(record.attempt, 3);

        // Budget exhausted: the next failure is terminal.
        record.begin_retry();
        let fourth = record.register_failure(&policy, now, &transient());
        assert_eq!(fourth, RetryDecision::Exhausted);
        assert_eq!(record.status, BackupStatus::Failed);
        assert_eq!(record.retry_count, 4);
        assert!(record.error.is_some());
    }

    #[test]
    fn non_retryable_errors_fail_terminally() {
        let policy = RetryPolicy::default();
        let now = dt("2024-03-10T12:00:00Z");
        let mut record = BackupRecord::new(BackupKind::Manual, None, now);

        let decision =
            record.register_failure(&policy, now, &SyncError::Crypto("bad tag".into()));
        assert_eq!(decision, RetryDecision::Exhausted);
        assert_eq!(record.status, BackupStatus::Failed);
        assert_eq!(record.attempt, 0);
    }

    #[test]
    fn retry_after_hint_extends_the_delay() {
        let policy = RetryPolicy::default();
        let now = dt("2024-03-10T12:00:00Z");
        let mut record = BackupRecord::new(BackupKind::Scheduled, Some("s1"), now);

        let err = SyncError::Transient {
            message: "429".into(),
            retry_after_secs: Some(15 * 60),
        };
        let decision = record.register_failure(&policy, now, &err);
        assert_eq!(
            decision,
            RetryDecision::Scheduled(now + Duration::minutes(15))
        );
    }

    #[test]
    fn retry_due_check() {
        let policy = RetryPolicy::default();
        let now = dt("2024-03-10T12:00:00Z");
        let mut record = BackupRecord::new(BackupKind::Scheduled, Some("s1"), now);
        record.register_failure(&policy, now, &transient());

        assert!(!record.is_due_for_retry(now));
        assert!(record.is_due_for_retry(now + Duration::minutes(6)));
    }

    #[test]
    fn completion_clears_retry_state() {
        let policy = RetryPolicy::default();
        let now = dt("2024-03-10T12:00:00Z");
        let mut record = BackupRecord::new(BackupKind::Scheduled, Some("s1"), now);
        record.register_failure(&policy, now, &transient());
        record.begin_retry();

        record.mark_completed(now, Some("blob-1".into()), 128, 10, 3, "hash".into());
        assert_eq!(record.status, BackupStatus::Completed);
        assert!(record.next_retry_at.is_none());
        assert!(record.error.is_none());
        assert_eq!(record.bytes, 128);
    }
}
