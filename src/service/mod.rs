//! Background service: scans, dispatch, and the single-flight guard.
//!
//! A single cooperative event loop drives everything. Three independent
//! interval scans — main (due schedules), retry (backoff-expired
//! records), deferred (queued missed work) — plus a debounced listener
//! on the provider's change stream. Exactly one backup or sync
//! transaction is in flight per device at any time: a process-wide
//! `busy` flag guards entry and re-entrant dispatch short-circuits with
//! `Busy`. Change events arriving mid-transaction are dropped, not
//! queued.
//!
//! On startup, records left `InProgress` by a previous process are moved
//! to `RetryPending` before anything new is dispatched.

use crate::backup::{BackupEngine, BackupKind, BackupStatus};
use crate::bookmarks::BookmarkProvider;
use crate::error::SyncError;
use crate::events::{Event, EventBus};
use crate::monitor::{CheckPolicy, ResourceMonitor};
use crate::schedule::Schedule;
use crate::state::StateStore;
use crate::sync::{SyncEngine, SyncOutcome};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Scan cadences and the debounce window. Cadence is configuration, not
/// contract; the three scans always exist and tick independently.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub main_scan_secs: u64,
    pub retry_scan_secs: u64,
    pub deferred_scan_secs: u64,
    pub debounce_secs: u64,
    /// Sync on debounced provider changes.
    pub auto_sync: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            main_scan_secs: 15 * 60,
            retry_scan_secs: 2 * 60,
            deferred_scan_secs: 10 * 60,
            debounce_secs: 3,
            auto_sync: true,
        }
    }
}

/// The background service.
pub struct Service {
    backup: Arc<BackupEngine>,
    sync: Arc<SyncEngine>,
    monitor: Arc<ResourceMonitor>,
    state: Arc<StateStore>,
    provider: Arc<dyn BookmarkProvider>,
    events: EventBus,
    config: ServiceConfig,
    busy: AtomicBool,
}

/// Releases the busy flag when a transaction ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Service {
    pub fn new(
        backup: Arc<BackupEngine>,
        sync: Arc<SyncEngine>,
        monitor: Arc<ResourceMonitor>,
        state: Arc<StateStore>,
        provider: Arc<dyn BookmarkProvider>,
        events: EventBus,
        config: ServiceConfig,
    ) -> Self {
        Self {
            backup,
            sync,
            monitor,
            state,
            provider,
            events,
            config,
            busy: AtomicBool::new(false),
        }
    }

    /// Claim the single-flight slot or report `Busy`.
    fn try_begin(&self) -> Result<BusyGuard<'_>, SyncError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(BusyGuard(&self.busy))
        } else {
            Err(SyncError::Busy)
        }
    }

    /// Startup recovery: orphaned `InProgress` records become
    /// `RetryPending` (due immediately), and a schedule is seeded if
    /// none exists yet.
    pub fn recover(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let recovered = self.state.recover_orphans(now)?;
        if !recovered.is_empty() {
            tracing::info!(
                count = recovered.len(),
                "recovered interrupted backups as retry-pending"
            );
        }
        if self.state.schedule()?.is_none() {
            self.state.save_schedule(&Schedule::default_at(now))?;
        }
        Ok(recovered.len())
    }

    /// Main scan: dispatch the schedule when due, or defer it when the
    /// resource monitor says no. Either way the schedule advances, so a
    /// deferred run cannot re-trigger itself on the next scan.
    pub async fn scan_main(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let Some(mut schedule) = self.state.schedule()? else {
            return Ok(());
        };
        if !schedule.is_due(now) {
            return Ok(());
        }
        let due_at = schedule.next_run;

        let permission = self.monitor.can_perform(&CheckPolicy::backup());
        match permission {
            crate::monitor::Permission::Allow(_) => {
                let guard = match self.try_begin() {
                    Ok(guard) => guard,
                    Err(_) => {
                        tracing::debug!("main scan: transaction in flight, skipping");
                        return Ok(());
                    }
                };
                let result = self
                    .backup
                    .run(BackupKind::Scheduled, Some(&schedule.id))
                    .await;
                drop(guard);
                if let Err(err) = result {
                    tracing::warn!(%err, "scheduled backup failed");
                }
                schedule.advance(Utc::now());
                self.state.save_schedule(&schedule)?;
            }
            crate::monitor::Permission::Deny { reason, .. } => {
                let mut queue = self.state.deferred_queue()?;
                let outcome = queue.enqueue(&schedule.id, due_at, now);
                self.state.save_deferred_queue(&queue)?;
                tracing::info!(%reason, ?outcome, "backup deferred by resource state");
                if let Some(item) = queue.items().iter().find(|i| i.schedule_id == schedule.id) {
                    self.events.emit(Event::BackupDeferred {
                        schedule_id: schedule.id.clone(),
                        priority: item.priority,
                        reason,
                    });
                }
                schedule.advance(now);
                self.state.save_schedule(&schedule)?;
            }
        }
        Ok(())
    }

    /// Retry scan: dispatch records whose backoff expired. Battery state
    /// does not gate retries.
    pub async fn scan_retry(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let due: Vec<_> = self
            .state
            .backups_with_status(BackupStatus::RetryPending)?
            .into_iter()
            .filter(|r| r.is_due_for_retry(now))
            .collect();

        for record in due {
            if !self.monitor.can_perform(&CheckPolicy::retry()).is_allowed() {
                tracing::debug!("retry scan: resources deny, leaving records pending");
                break;
            }
            let guard = match self.try_begin() {
                Ok(guard) => guard,
                Err(_) => break,
            };
            let result = self.backup.retry(&record.id).await;
            drop(guard);
            if let Err(err) = result {
                tracing::warn!(record_id = %record.id, %err, "retry attempt failed");
            }
        }
        Ok(())
    }

    /// Deferred scan: dispatch the highest-priority queued item when
    /// resources allow.
    pub async fn scan_deferred(&self) -> anyhow::Result<()> {
        let mut queue = self.state.deferred_queue()?;
        if queue.is_empty() {
            return Ok(());
        }
        let item = queue.next(|| self.monitor.can_perform(&CheckPolicy::backup()).is_allowed());
        let Some(item) = item else {
            return Ok(());
        };
        self.state.save_deferred_queue(&queue)?;

        let guard = match self.try_begin() {
            Ok(guard) => guard,
            Err(_) => {
                // Transaction in flight; put the item back for the next
                // scan.
                let mut queue = self.state.deferred_queue()?;
                queue.enqueue(&item.schedule_id, item.originally_due_at, Utc::now());
                self.state.save_deferred_queue(&queue)?;
                return Ok(());
            }
        };
        tracing::info!(
            schedule_id = %item.schedule_id,
            priority = item.priority,
            "dispatching deferred backup"
        );
        let result = self
            .backup
            .run(BackupKind::Scheduled, Some(&item.schedule_id))
            .await;
        drop(guard);
        if let Err(err) = result {
            tracing::warn!(%err, "deferred backup failed");
        }
        Ok(())
    }

    /// Run one sync transaction, guarded by the busy flag.
    pub async fn trigger_sync(&self) -> Result<SyncOutcome, SyncError> {
        let _guard = self.try_begin()?;
        self.sync.run().await
    }

    /// The event loop. Returns when `shutdown` fires; any in-flight
    /// transaction completes before return because dispatch is awaited
    /// inline.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.recover()?;

        let resources = self.monitor.sample();
        tracing::info!(
            level = ?resources.level,
            reasons = ?resources.reasons,
            "initial resource state"
        );

        let mut main_tick = tokio::time::interval(Duration::from_secs(self.config.main_scan_secs));
        let mut retry_tick =
            tokio::time::interval(Duration::from_secs(self.config.retry_scan_secs));
        let mut deferred_tick =
            tokio::time::interval(Duration::from_secs(self.config.deferred_scan_secs));
        // The first tick of a tokio interval fires immediately; consume
        // them so startup does not triple-dispatch.
        main_tick.tick().await;
        retry_tick.tick().await;
        deferred_tick.tick().await;

        let mut changes = self.provider.subscribe();
        let debounce = tokio::time::sleep(Duration::from_secs(0));
        tokio::pin!(debounce);
        let mut debounce_armed = false;

        tracing::info!(
            main_secs = self.config.main_scan_secs,
            retry_secs = self.config.retry_scan_secs,
            deferred_secs = self.config.deferred_scan_secs,
            "service loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown requested, draining");
                    return Ok(());
                }
                _ = main_tick.tick() => {
                    if let Err(e) = self.scan_main().await {
                        tracing::error!("main scan failed: {e}");
                    }
                }
                _ = retry_tick.tick() => {
                    if let Err(e) = self.scan_retry().await {
                        tracing::error!("retry scan failed: {e}");
                    }
                }
                _ = deferred_tick.tick() => {
                    if let Err(e) = self.scan_deferred().await {
                        tracing::error!("deferred scan failed: {e}");
                    }
                }
                event = changes.recv() => {
                    match event {
                        Ok(event) => {
                            if self.config.auto_sync && !self.busy.load(Ordering::SeqCst) {
                                tracing::debug!(?event, "change observed, debouncing sync");
                                debounce.as_mut().reset(
                                    tokio::time::Instant::now()
                                        + Duration::from_secs(self.config.debounce_secs),
                                );
                                debounce_armed = true;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::debug!(missed, "change stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            tracing::warn!("change stream closed");
                            return Ok(());
                        }
                    }
                }
                _ = &mut debounce, if debounce_armed => {
                    debounce_armed = false;
                    match self.trigger_sync().await {
                        Ok(outcome) => tracing::debug!(?outcome, "debounced sync finished"),
                        Err(SyncError::Busy) => tracing::debug!("debounced sync skipped: busy"),
                        Err(err) => tracing::warn!(%err, "debounced sync failed"),
                    }
                }
            }
        }
    }
}
