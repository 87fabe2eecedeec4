//! bookvault CLI.
//!
//! One-shot commands (`sync`, `backup`, `restore`, `schedule`,
//! `history`, `cleanup`) and the long-running `serve` loop. Exit codes:
//! 0 success, 2 configuration error, 3 authentication error, 4
//! transient failure worth retrying, 5 fatal.

use bookvault::backup::{BackupConfig, BackupEngine, BackupKind};
use bookvault::bookmarks::LocalProvider;
use bookvault::config::{Config, RemoteBackend};
use bookvault::crypto::{self, CryptoEngine};
use bookvault::error::SyncError;
use bookvault::events::EventBus;
use bookvault::monitor::ResourceMonitor;
use bookvault::queue::RetryPolicy;
use bookvault::schedule::{Frequency, Schedule, SchedulePatch};
use bookvault::service::{Service, ServiceConfig};
use bookvault::state::StateStore;
use bookvault::storage::{BlobStore, FsStore, HttpStore, HttpStoreConfig, StaticToken};
use bookvault::sync::{SyncConfig, SyncEngine, SyncMode, SyncOutcome};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "bookvault", version, about = "Personal bookmark synchronization")]
struct Cli {
    /// Path to config.toml (defaults to the platform config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging (same as RUST_LOG=debug).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Host,
    Global,
}

#[derive(Subcommand)]
enum Command {
    /// Run one sync transaction.
    Sync {
        /// Override the configured sync mode for this run.
        #[arg(long)]
        mode: Option<ModeArg>,
    },
    /// Run one backup transaction.
    Backup {
        /// Detach the backup from the schedule (kept forever).
        #[arg(long)]
        manual: bool,
    },
    /// Restore the tree captured by a backup record.
    Restore {
        /// Backup record id (see `history`).
        id: String,
        /// Drop links whose URL already occurred earlier in the tree.
        #[arg(long)]
        dedup: bool,
    },
    /// Inspect or change the backup schedule.
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },
    /// List backup records.
    History,
    /// Drop failed records and enforce retention.
    Cleanup,
    /// Run the background service loop.
    Serve,
}

#[derive(Subcommand)]
enum ScheduleCommand {
    /// Show the current schedule.
    Show,
    /// Set frequency and fire time, e.g. `set daily 02:30` or
    /// `set weekly:0 09:00 --retention 12`.
    Set {
        /// hourly | daily | weekly:<0-6> | monthly:<1-31>
        frequency: String,
        /// HH:MM (24-hour).
        time: String,
        /// Completed backups to keep (-1 = unlimited).
        #[arg(long)]
        retention: Option<i32>,
    },
}

/// Everything a command needs, wired per the config.
struct App {
    state: Arc<StateStore>,
    provider: Arc<LocalProvider>,
    backup: Arc<BackupEngine>,
    sync: Arc<SyncEngine>,
    monitor: Arc<ResourceMonitor>,
    events: EventBus,
    config: Config,
}

impl App {
    fn build(config: Config, mode_override: Option<SyncMode>) -> anyhow::Result<Self> {
        let data_dir = config.data_dir()?;
        std::fs::create_dir_all(&data_dir)?;

        let state = Arc::new(StateStore::open(&data_dir.join("state.db"))?);
        let device_id = state.device_id()?;
        let provider = Arc::new(LocalProvider::with_file(
            device_id,
            data_dir.join("bookmarks.json"),
        )?);

        let store: Arc<dyn BlobStore> = match config.remote.backend {
            RemoteBackend::Fs => {
                let root = config
                    .remote
                    .path
                    .clone()
                    .unwrap_or_else(|| data_dir.join("remote"));
                Arc::new(FsStore::new(root).map_err(SyncError::from)?)
            }
            RemoteBackend::Http => {
                let base_url = config
                    .remote
                    .base_url
                    .clone()
                    .expect("validated: http backend has a base_url");
                let token = std::env::var(&config.remote.token_env).map_err(|_| {
                    SyncError::Auth(format!(
                        "set {} to the remote store token",
                        config.remote.token_env
                    ))
                })?;
                Arc::new(
                    HttpStore::new(
                        HttpStoreConfig::new(base_url),
                        Arc::new(StaticToken(token)),
                    )
                    .map_err(SyncError::from)?,
                )
            }
        };

        let crypto = if config.encryption.enabled {
            let passphrase = std::env::var(&config.encryption.passphrase_env).map_err(|_| {
                SyncError::Crypto(format!(
                    "encryption is enabled but {} is not set",
                    config.encryption.passphrase_env
                ))
            })?;
            let strength = crypto::check_strength(&passphrase);
            if !strength.acceptable {
                tracing::warn!(
                    problems = ?strength.problems,
                    "the configured passphrase is weak"
                );
            }
            Some(CryptoEngine::new(passphrase))
        } else {
            None
        };

        let mode = mode_override.unwrap_or(config.sync.mode);

        // Mirror the effective settings into the state store so history
        // and UI surfaces can read them without re-parsing the config.
        let settings = bookvault::state::Settings {
            mode,
            auto_sync: config.sync.auto_sync,
            sync_debounce_secs: config.sync.debounce_secs,
            conflict_strategy: config.sync.strategy,
            incremental_backups: config.backup.incremental,
            encryption_enabled: config.encryption.enabled,
            verbose_logs: config.verbose_logs,
        };
        state.save_settings(&settings)?;

        let events = EventBus::new();
        let retry = RetryPolicy {
            base_delay_secs: config.retry.base_delay_secs,
            max_delay_secs: config.retry.max_delay_secs,
            max_attempts: config.retry.max_attempts,
        };
        let backup = Arc::new(BackupEngine::new(
            provider.clone(),
            store.clone(),
            state.clone(),
            crypto.clone(),
            BackupConfig {
                folder_name: config.remote.folder.clone(),
                incremental: config.backup.incremental,
                retry,
            },
            events.clone(),
        ));

        let sync = Arc::new(SyncEngine::new(
            provider.clone(),
            store.clone(),
            state.clone(),
            crypto,
            SyncConfig {
                mode,
                is_host: config.sync.host,
                strategy: config.sync.strategy,
                folder_name: config.remote.folder.clone(),
            },
            events.clone(),
        ));

        Ok(Self {
            state,
            provider,
            backup,
            sync,
            monitor: Arc::new(ResourceMonitor::system()),
            events,
            config,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config error: {err:#}");
            return ExitCode::from(2);
        }
    };

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<SyncError>()
                .map(SyncError::exit_code)
                .unwrap_or(5);
            ExitCode::from(code as u8)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "bookvault=debug" } else { "bookvault=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    match command {
        Command::Sync { mode } => {
            let mode = mode.map(|m| match m {
                ModeArg::Host => SyncMode::HostToMany,
                ModeArg::Global => SyncMode::Global,
            });
            let app = App::build(config, mode)?;
            match app.sync.run().await? {
                SyncOutcome::Bootstrapped => println!("published first remote snapshot"),
                SyncOutcome::UpToDate => println!("already up to date"),
                SyncOutcome::Applied {
                    report,
                    wrote_remote,
                } => println!(
                    "synced: {} added, {} modified, {} deleted{}",
                    report.added,
                    report.modified,
                    report.deleted,
                    if wrote_remote { ", remote updated" } else { "" }
                ),
                SyncOutcome::ConflictsPending(conflicts) => {
                    println!("{} conflict(s) need manual resolution:", conflicts.len());
                    for conflict in conflicts {
                        println!("  {}", render_conflict(&conflict));
                    }
                }
            }
            Ok(())
        }
        Command::Backup { manual } => {
            let app = App::build(config, None)?;
            let record = if manual {
                app.backup.run(BackupKind::Manual, None).await?
            } else {
                let schedule = ensure_schedule(&app.state)?;
                app.backup
                    .run(BackupKind::Scheduled, Some(&schedule.id))
                    .await?
            };
            if record.bytes == 0 {
                println!("backup {}: tree unchanged, upload skipped", record.id);
            } else {
                println!(
                    "backup {}: {} bytes, {} bookmarks in {} folders",
                    record.id, record.bytes, record.bookmark_count, record.folder_count
                );
            }
            Ok(())
        }
        Command::Restore { id, dedup } => {
            let app = App::build(config, None)?;
            let applied = app.backup.restore(&id, dedup).await?;
            println!(
                "restored {id}: {} added, {} modified, {} deleted",
                applied.added, applied.modified, applied.deleted
            );
            Ok(())
        }
        Command::Schedule { command } => {
            let app = App::build(config, None)?;
            match command {
                ScheduleCommand::Show => {
                    let schedule = ensure_schedule(&app.state)?;
                    println!("{}", render_schedule(&schedule));
                }
                ScheduleCommand::Set {
                    frequency,
                    time,
                    retention,
                } => {
                    let frequency = parse_frequency(&frequency)?;
                    let (hour, minute) = parse_time(&time)?;
                    let mut schedule = ensure_schedule(&app.state)?;
                    schedule
                        .update(
                            SchedulePatch {
                                frequency: Some(frequency),
                                hour: Some(hour),
                                minute: Some(minute),
                                retention,
                                enabled: Some(true),
                            },
                            Utc::now(),
                        )
                        .map_err(SyncError::Fatal)?;
                    app.state.save_schedule(&schedule)?;
                    println!("{}", render_schedule(&schedule));
                }
            }
            Ok(())
        }
        Command::History => {
            let app = App::build(config, None)?;
            let records = app.state.backups()?;
            if records.is_empty() {
                println!("no backups yet");
                return Ok(());
            }
            for record in records {
                println!(
                    "{}  {:13} {:9} {:>9}B  {} bookmarks{}",
                    record.id,
                    record.status.label(),
                    format!("{:?}", record.kind).to_lowercase(),
                    record.bytes,
                    record.bookmark_count,
                    record
                        .error
                        .as_deref()
                        .map(|e| format!("  ({e})"))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::Cleanup => {
            let app = App::build(config, None)?;
            let removed = app.backup.cleanup().await?;
            println!("removed {removed} record(s)");
            Ok(())
        }
        Command::Serve => {
            let app = App::build(config, None)?;
            let service = Service::new(
                app.backup.clone(),
                app.sync.clone(),
                app.monitor.clone(),
                app.state.clone(),
                app.provider.clone(),
                app.events.clone(),
                ServiceConfig {
                    main_scan_secs: app.config.scans.main_secs,
                    retry_scan_secs: app.config.scans.retry_secs,
                    deferred_scan_secs: app.config.scans.deferred_secs,
                    debounce_secs: app.config.sync.debounce_secs,
                    auto_sync: app.config.sync.auto_sync,
                },
            );

            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal_token.cancel();
                }
            });

            // Notification surface: terminal failures and conflicts are
            // always announced; routine completions only when verbose.
            let mut notifications = app.events.subscribe();
            let verbose = app.config.verbose_logs;
            tokio::spawn(async move {
                while let Ok(event) = notifications.recv().await {
                    notify(&event, verbose);
                }
            });

            service.run(shutdown).await
        }
    }
}

/// Render one event for the user. Successful scheduled runs stay quiet
/// unless verbose logging is on.
fn notify(event: &bookvault::events::Event, verbose: bool) {
    use bookvault::events::Event;
    match event {
        Event::BackupFailed { record_id, error } => {
            eprintln!("backup {record_id} failed: {error}");
        }
        Event::SyncConflictsPending { count } => {
            eprintln!("{count} sync conflict(s) need manual resolution (run `bookvault sync`)");
        }
        Event::BackupRetryScheduled { record_id, at } => {
            eprintln!("backup {record_id} will retry at {}", at.format("%H:%M UTC"));
        }
        Event::BackupDeferred {
            schedule_id,
            reason,
            ..
        } => {
            eprintln!("backup for schedule {schedule_id} deferred: {reason}");
        }
        Event::BackupCompleted {
            record_id,
            bytes,
            skipped,
        } if verbose => {
            println!("backup {record_id} completed ({bytes} bytes, skipped: {skipped})");
        }
        Event::SyncCompleted { applied } if verbose => {
            println!(
                "sync completed: {} added, {} modified, {} deleted",
                applied.added, applied.modified, applied.deleted
            );
        }
        Event::RestoreCompleted { record_id, .. } if verbose => {
            println!("restore {record_id} completed");
        }
        _ => {}
    }
}

/// Load the schedule, seeding the daily default on first use.
fn ensure_schedule(state: &StateStore) -> anyhow::Result<Schedule> {
    if let Some(schedule) = state.schedule()? {
        return Ok(schedule);
    }
    let schedule = Schedule::default_at(Utc::now());
    state.save_schedule(&schedule)?;
    Ok(schedule)
}

fn parse_frequency(raw: &str) -> Result<Frequency, SyncError> {
    let invalid = || SyncError::Fatal(format!("unrecognized frequency {raw:?}"));
    match raw.split_once(':') {
        None => match raw {
            "hourly" => Ok(Frequency::Hourly),
            "daily" => Ok(Frequency::Daily),
            _ => Err(invalid()),
        },
        Some(("weekly", dow)) => dow
            .parse()
            .map(|dow| Frequency::Weekly { dow })
            .map_err(|_| invalid()),
        Some(("monthly", dom)) => dom
            .parse()
            .map(|dom| Frequency::Monthly { dom })
            .map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}

fn parse_time(raw: &str) -> Result<(u8, u8), SyncError> {
    let invalid = || SyncError::Fatal(format!("expected HH:MM, got {raw:?}"));
    let (hour, minute) = raw.split_once(':').ok_or_else(invalid)?;
    let hour: u8 = hour.parse().map_err(|_| invalid())?;
    let minute: u8 = minute.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok((hour, minute))
}

fn render_frequency(frequency: Frequency) -> String {
    match frequency {
        Frequency::Hourly => "hourly".into(),
        Frequency::Daily => "daily".into(),
        Frequency::Weekly { dow } => format!("weekly (day {dow})"),
        Frequency::Monthly { dom } => format!("monthly (day {dom})"),
    }
}

fn render_schedule(schedule: &Schedule) -> String {
    format!(
        "schedule {}: {} at {:02}:{:02}, {}, retention {}, next run {}",
        schedule.id,
        render_frequency(schedule.frequency),
        schedule.hour,
        schedule.minute,
        if schedule.enabled { "enabled" } else { "disabled" },
        if schedule.retention < 0 {
            "unlimited".to_string()
        } else {
            schedule.retention.to_string()
        },
        schedule.next_run.format("%Y-%m-%d %H:%M UTC"),
    )
}

fn render_conflict(conflict: &bookvault::conflict::Conflict) -> String {
    let mut fields = Vec::new();
    if let Some(diff) = &conflict.title {
        fields.push(format!("title {:?} vs {:?}", diff.local, diff.remote));
    }
    if let Some(diff) = &conflict.url {
        fields.push(format!("url {:?} vs {:?}", diff.local, diff.remote));
    }
    if let Some(diff) = &conflict.parent {
        fields.push(format!("parent {:?} vs {:?}", diff.local, diff.remote));
    }
    format!("{}: {}", conflict.id, fields.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_parsing() {
        assert_eq!(parse_frequency("hourly").unwrap(), Frequency::Hourly);
        assert_eq!(parse_frequency("daily").unwrap(), Frequency::Daily);
        assert_eq!(
            parse_frequency("weekly:3").unwrap(),
            Frequency::Weekly { dow: 3 }
        );
        assert_eq!(
            parse_frequency("monthly:31").unwrap(),
            Frequency::Monthly { dom: 31 }
        );
        assert!(parse_frequency("fortnightly").is_err());
        assert!(parse_frequency("weekly:x").is_err());
    }

    #[test]
    fn time_parsing() {
        assert_eq!(parse_time("02:30").unwrap(), (2, 30));
        assert_eq!(parse_time("23:59").unwrap(), (23, 59));
        assert!(parse_time("24:00").is_err());
        assert!(parse_time("12").is_err());
        assert!(parse_time("aa:bb").is_err());
    }

    #[test]
    fn cli_parses() {
        Cli::try_parse_from(["bookvault", "sync", "--mode", "host"]).unwrap();
        Cli::try_parse_from(["bookvault", "backup", "--manual"]).unwrap();
        Cli::try_parse_from(["bookvault", "restore", "abc", "--dedup"]).unwrap();
        Cli::try_parse_from(["bookvault", "schedule", "set", "weekly:0", "09:00"]).unwrap();
        Cli::try_parse_from(["bookvault", "history"]).unwrap();
        Cli::try_parse_from(["bookvault", "serve"]).unwrap();
        assert!(Cli::try_parse_from(["bookvault", "explode"]).is_err());
    }
}
