//! SQLite-backed local state.
//!
//! One database holds everything the core must remember across restarts:
//! the settings record, the schedule, the backup record list, the
//! deferred queue, and the stable device id. Records are stored as JSON
//! columns with a few indexed fields peeled out for querying, and the
//! connection runs in WAL mode behind a single-writer mutex.

use crate::backup::{BackupRecord, BackupStatus};
use crate::conflict::Strategy;
use crate::queue::{DeferredQueue, DeferredWorkItem, DEFERRED_CAPACITY};
use crate::schedule::Schedule;
use crate::sync::SyncMode;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// User-facing settings persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub mode: SyncMode,
    /// Sync automatically on debounced change events.
    pub auto_sync: bool,
    /// Debounce window for change-triggered sync, in seconds.
    pub sync_debounce_secs: u64,
    pub conflict_strategy: Strategy,
    /// Prefer incremental blobs when a completed base backup exists.
    pub incremental_backups: bool,
    pub encryption_enabled: bool,
    pub verbose_logs: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: SyncMode::Global,
            auto_sync: true,
            sync_debounce_secs: 3,
            conflict_strategy: Strategy::PreferNewest,
            incremental_backups: true,
            encryption_enabled: false,
            verbose_logs: false,
        }
    }
}

/// Handle over the state database.
pub struct StateStore {
    conn: Mutex<rusqlite::Connection>,
}

impl StateStore {
    /// Open (or create) the state database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path)
            .with_context(|| format!("open state db at {}", db_path.display()))?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        // WAL for crash safety; a single writer needs no pooling.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS backups (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                schedule_id TEXT,
                created_at INTEGER NOT NULL,
                record_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_backups_status ON backups(status);
            CREATE INDEX IF NOT EXISTS idx_backups_created ON backups(created_at);

            CREATE TABLE IF NOT EXISTS missed_backups (
                id TEXT PRIMARY KEY,
                item_json TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── kv records ──────────────────────────────────────────────────

    fn get_kv<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row("SELECT value_json FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn put_kv<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO kv (key, value_json) VALUES (?1, ?2)",
            rusqlite::params![key, json],
        )?;
        Ok(())
    }

    /// Stable per-device id, generated on first use.
    pub fn device_id(&self) -> Result<String> {
        if let Some(id) = self.get_kv::<String>("device_id")? {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.put_kv("device_id", &id)?;
        Ok(id)
    }

    pub fn settings(&self) -> Result<Settings> {
        Ok(self.get_kv("settings")?.unwrap_or_default())
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.put_kv("settings", settings)
    }

    pub fn schedule(&self) -> Result<Option<Schedule>> {
        self.get_kv("schedule")
    }

    pub fn save_schedule(&self, schedule: &Schedule) -> Result<()> {
        self.put_kv("schedule", schedule)
    }

    /// Snapshot captured by the most recent completed backup; the diff
    /// base for incremental backups.
    pub fn last_snapshot(&self) -> Result<Option<crate::bookmarks::TreeSnapshot>> {
        self.get_kv("last_snapshot")
    }

    pub fn save_last_snapshot(&self, snapshot: &crate::bookmarks::TreeSnapshot) -> Result<()> {
        self.put_kv("last_snapshot", snapshot)
    }

    /// The remote state as of the last completed sync — the common base
    /// that lets the next sync tell a remote deletion from a local
    /// addition.
    pub fn sync_base(&self) -> Result<Option<crate::bookmarks::TreeSnapshot>> {
        self.get_kv("sync_base")
    }

    pub fn save_sync_base(&self, snapshot: &crate::bookmarks::TreeSnapshot) -> Result<()> {
        self.put_kv("sync_base", snapshot)
    }

    // ── backup records ──────────────────────────────────────────────

    /// Insert or update a record. Called on every status transition so a
    /// crash between I/O steps is always observable.
    pub fn save_backup(&self, record: &BackupRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO backups (id, status, schedule_id, created_at, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                record.id,
                record.status.label(),
                record.schedule_id,
                record.created_at.timestamp(),
                json,
            ],
        )?;
        Ok(())
    }

    pub fn backup(&self, id: &str) -> Result<Option<BackupRecord>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT record_json FROM backups WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// All records, newest first.
    pub fn backups(&self) -> Result<Vec<BackupRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT record_json FROM backups ORDER BY created_at DESC, id DESC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    /// Records in a given status, newest first.
    pub fn backups_with_status(&self, status: BackupStatus) -> Result<Vec<BackupRecord>> {
        Ok(self
            .backups()?
            .into_iter()
            .filter(|r| r.status == status)
            .collect())
    }

    /// Most recent completed record, if any.
    pub fn latest_completed_backup(&self) -> Result<Option<BackupRecord>> {
        let mut completed = self.backups_with_status(BackupStatus::Completed)?;
        completed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        Ok(completed.into_iter().next())
    }

    pub fn delete_backup(&self, id: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM backups WHERE id = ?1", [id])?;
        Ok(())
    }

    // ── deferred queue ──────────────────────────────────────────────

    pub fn deferred_queue(&self) -> Result<DeferredQueue> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT item_json FROM missed_backups")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut items: Vec<DeferredWorkItem> = Vec::new();
        for row in rows {
            items.push(serde_json::from_str(&row?)?);
        }
        Ok(DeferredQueue::from_items(items, DEFERRED_CAPACITY))
    }

    /// Replace the persisted queue with the in-memory one.
    pub fn save_deferred_queue(&self, queue: &DeferredQueue) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM missed_backups", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO missed_backups (id, item_json) VALUES (?1, ?2)")?;
            for item in queue.items() {
                stmt.execute(rusqlite::params![item.id, serde_json::to_string(item)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Startup recovery: anything still `InProgress` from a previous
    /// process becomes `RetryPending`, due immediately.
    pub fn recover_orphans(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let orphans = self.backups_with_status(BackupStatus::InProgress)?;
        let mut recovered = Vec::new();
        for mut record in orphans {
            record.status = BackupStatus::RetryPending;
            record.next_retry_at = Some(now);
            record.error = Some("interrupted by shutdown".into());
            self.save_backup(&record)?;
            recovered.push(record.id);
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupKind;
    use chrono::{Duration, Utc};

    #[test]
    fn device_id_is_stable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("state.db");

        let first = StateStore::open(&path).unwrap().device_id().unwrap();
        let second = StateStore::open(&path).unwrap().device_id().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn settings_round_trip_with_defaults() {
        let store = StateStore::open_in_memory().unwrap();
        let mut settings = store.settings().unwrap();
        assert_eq!(settings, Settings::default());

        settings.encryption_enabled = true;
        settings.verbose_logs = true;
        store.save_settings(&settings).unwrap();
        assert_eq!(store.settings().unwrap(), settings);
    }

    #[test]
    fn schedule_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.schedule().unwrap().is_none());

        let schedule = Schedule::default_at(Utc::now());
        store.save_schedule(&schedule).unwrap();
        assert_eq!(store.schedule().unwrap(), Some(schedule));
    }

    #[test]
    fn backups_list_newest_first() {
        let store = StateStore::open_in_memory().unwrap();
        let now = Utc::now();

        let old = BackupRecord::new(BackupKind::Manual, None, now - Duration::hours(2));
        let new = BackupRecord::new(BackupKind::Manual, None, now);
        store.save_backup(&old).unwrap();
        store.save_backup(&new).unwrap();

        let listed = store.backups().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, new.id);
    }

    #[test]
    fn latest_completed_prefers_completed_at() {
        let store = StateStore::open_in_memory().unwrap();
        let now = Utc::now();

        let mut a = BackupRecord::new(BackupKind::Scheduled, Some("s1"), now - Duration::hours(3));
        a.mark_completed(now - Duration::hours(1), Some("blob-a".into()), 1, 1, 1, "ha".into());
        let mut b = BackupRecord::new(BackupKind::Scheduled, Some("s1"), now - Duration::hours(2));
        b.mark_completed(now, Some("blob-b".into()), 1, 1, 1, "hb".into());
        let pending = BackupRecord::new(BackupKind::Scheduled, Some("s1"), now);

        store.save_backup(&a).unwrap();
        store.save_backup(&b).unwrap();
        store.save_backup(&pending).unwrap();

        let latest = store.latest_completed_backup().unwrap().unwrap();
        assert_eq!(latest.id, b.id);
    }

    #[test]
    fn deferred_queue_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        let now = Utc::now();

        let mut queue = DeferredQueue::default();
        queue.enqueue("s1", now - Duration::hours(2), now);
        queue.enqueue("s1", now - Duration::hours(5), now);
        store.save_deferred_queue(&queue).unwrap();

        let restored = store.deferred_queue().unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.items()[0].priority, 5);
    }

    #[test]
    fn orphan_recovery_marks_retry_pending() {
        let store = StateStore::open_in_memory().unwrap();
        let now = Utc::now();

        let in_flight = BackupRecord::new(BackupKind::Scheduled, Some("s1"), now);
        store.save_backup(&in_flight).unwrap();

        let recovered = store.recover_orphans(now).unwrap();
        assert_eq!(recovered, vec![in_flight.id.clone()]);

        let reloaded = store.backup(&in_flight.id).unwrap().unwrap();
        assert_eq!(reloaded.status, BackupStatus::RetryPending);
        assert_eq!(reloaded.next_retry_at, Some(now));
    }
}
