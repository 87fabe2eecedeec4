//! Resource-aware gating for background work.
//!
//! The monitor samples battery, memory, and network reachability and
//! classifies the machine as `Optimal`, `Constrained`, or `Critical`.
//! Classification is pure with respect to the probe readings and never
//! blocks. A probe that cannot deliver a reading counts as `Optimal` for
//! its factor (fail-open per probe, not per state); work is never allowed
//! while any considered factor is `Critical`.

use serde::{Deserialize, Serialize};

/// Battery below this percentage while discharging is `Critical`.
const BATTERY_CRITICAL_PERCENT: f32 = 15.0;

/// Battery below this percentage while discharging is `Constrained`.
const BATTERY_LOW_PERCENT: f32 = 30.0;

/// Memory use at or above this percentage is `Critical`.
const MEMORY_CRITICAL_PERCENT: f32 = 90.0;

/// Memory use at or above this percentage is `Constrained`.
const MEMORY_HIGH_PERCENT: f32 = 80.0;

/// Overall machine classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceLevel {
    Optimal,
    Constrained,
    Critical,
}

/// Coarse network classification from the reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    /// No route to the remote store.
    Offline,
    /// Reachable but over a very slow (2G-class) link.
    Slow,
    /// Reachable at usable speed.
    Good,
}

/// Raw probe readings. `None` means the probe had nothing to say.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDetail {
    pub battery_percent: Option<f32>,
    pub discharging: Option<bool>,
    pub memory_used_percent: Option<f32>,
    pub network: Option<NetworkClass>,
    pub user_idle: Option<bool>,
}

/// Classified system state with the contributing reasons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    pub level: ResourceLevel,
    pub reasons: Vec<String>,
    pub detail: ResourceDetail,
}

/// Which probes a caller wants considered, and how strict to be.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CheckPolicy {
    /// Deny anything below `Optimal`.
    pub require_optimal: bool,
    /// Allow `Constrained` (ignored when `require_optimal` is set).
    pub allow_constrained: bool,
    pub check_battery: bool,
    pub check_network: bool,
    /// Memory pressure.
    pub check_performance: bool,
}

impl CheckPolicy {
    /// The scheduler's policy for fresh backups.
    pub fn backup() -> Self {
        Self {
            require_optimal: false,
            allow_constrained: true,
            check_battery: true,
            check_network: true,
            check_performance: true,
        }
    }

    /// The retry scan's policy: a retry already waited its backoff, so
    /// battery state no longer gates it.
    pub fn retry() -> Self {
        Self {
            check_battery: false,
            ..Self::backup()
        }
    }
}

/// Outcome of a `can_perform` check.
#[derive(Debug, Clone)]
pub enum Permission {
    Allow(SystemState),
    Deny { reason: String, state: SystemState },
}

impl Permission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }

    pub fn state(&self) -> &SystemState {
        match self {
            Self::Allow(state) | Self::Deny { state, .. } => state,
        }
    }
}

/// Source of raw readings.
pub trait ResourceProbe: Send + Sync {
    fn read(&self) -> ResourceDetail;
}

/// Probe returning a fixed reading (tests, forced-state configuration).
pub struct FixedProbe(pub ResourceDetail);

impl ResourceProbe for FixedProbe {
    fn read(&self) -> ResourceDetail {
        self.0.clone()
    }
}

/// Probe reading the host: memory via `sysinfo`, battery from
/// `/sys/class/power_supply` on Linux. Factors it cannot read stay
/// `None` and fail open.
pub struct SystemProbe;

impl ResourceProbe for SystemProbe {
    fn read(&self) -> ResourceDetail {
        let mut detail = ResourceDetail::default();

        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total > 0 {
            detail.memory_used_percent = Some(sys.used_memory() as f32 / total as f32 * 100.0);
        }

        #[cfg(target_os = "linux")]
        {
            if let Some((percent, discharging)) = read_linux_battery() {
                detail.battery_percent = Some(percent);
                detail.discharging = Some(discharging);
            }
        }

        detail
    }
}

#[cfg(target_os = "linux")]
fn read_linux_battery() -> Option<(f32, bool)> {
    let entries = std::fs::read_dir("/sys/class/power_supply").ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !entry.file_name().to_string_lossy().starts_with("BAT") {
            continue;
        }
        let capacity: f32 = std::fs::read_to_string(path.join("capacity"))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        let status = std::fs::read_to_string(path.join("status")).ok()?;
        return Some((capacity, status.trim() == "Discharging"));
    }
    None
}

/// Classifies probe readings and answers `can_perform` checks.
pub struct ResourceMonitor {
    probe: Box<dyn ResourceProbe>,
}

impl ResourceMonitor {
    pub fn new(probe: Box<dyn ResourceProbe>) -> Self {
        Self { probe }
    }

    /// Monitor over the host probe.
    pub fn system() -> Self {
        Self::new(Box::new(SystemProbe))
    }

    /// Monitor returning fixed readings (tests, forced states).
    pub fn fixed(detail: ResourceDetail) -> Self {
        Self::new(Box::new(FixedProbe(detail)))
    }

    /// Classify the machine considering every probe.
    pub fn sample(&self) -> SystemState {
        self.classify(&CheckPolicy::backup())
    }

    /// Decide whether work may run under the given policy.
    pub fn can_perform(&self, policy: &CheckPolicy) -> Permission {
        let state = self.classify(policy);
        match state.level {
            ResourceLevel::Critical => Permission::Deny {
                reason: state.reasons.join("; "),
                state,
            },
            ResourceLevel::Constrained if policy.require_optimal || !policy.allow_constrained => {
                Permission::Deny {
                    reason: state.reasons.join("; "),
                    state,
                }
            }
            _ => Permission::Allow(state),
        }
    }

    fn classify(&self, policy: &CheckPolicy) -> SystemState {
        let detail = self.probe.read();
        let mut level = ResourceLevel::Optimal;
        let mut reasons = Vec::new();

        let mut raise = |new_level: ResourceLevel, reason: String, level: &mut ResourceLevel| {
            if new_level > *level {
                *level = new_level;
            }
            reasons.push(reason);
        };

        if policy.check_battery {
            if let (Some(percent), Some(true)) = (detail.battery_percent, detail.discharging) {
                if percent < BATTERY_CRITICAL_PERCENT {
                    raise(
                        ResourceLevel::Critical,
                        format!("battery at {percent:.0}% and discharging"),
                        &mut level,
                    );
                } else if percent < BATTERY_LOW_PERCENT {
                    raise(
                        ResourceLevel::Constrained,
                        format!("battery at {percent:.0}% and discharging"),
                        &mut level,
                    );
                }
            }
        }

        if policy.check_performance {
            if let Some(percent) = detail.memory_used_percent {
                if percent >= MEMORY_CRITICAL_PERCENT {
                    raise(
                        ResourceLevel::Critical,
                        format!("memory use at {percent:.0}%"),
                        &mut level,
                    );
                } else if percent >= MEMORY_HIGH_PERCENT {
                    raise(
                        ResourceLevel::Constrained,
                        format!("memory use at {percent:.0}%"),
                        &mut level,
                    );
                }
            }
        }

        if policy.check_network {
            match detail.network {
                Some(NetworkClass::Offline) => {
                    raise(ResourceLevel::Critical, "no network".into(), &mut level)
                }
                Some(NetworkClass::Slow) => raise(
                    ResourceLevel::Constrained,
                    "slow network link".into(),
                    &mut level,
                ),
                Some(NetworkClass::Good) | None => {}
            }
        }

        SystemState {
            level,
            reasons,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(detail: ResourceDetail) -> ResourceMonitor {
        ResourceMonitor::fixed(detail)
    }

    #[test]
    fn empty_readings_fail_open_to_optimal() {
        let state = monitor(ResourceDetail::default()).sample();
        assert_eq!(state.level, ResourceLevel::Optimal);
        assert!(state.reasons.is_empty());
    }

    #[test]
    fn low_discharging_battery_is_critical() {
        let state = monitor(ResourceDetail {
            battery_percent: Some(10.0),
            discharging: Some(true),
            ..Default::default()
        })
        .sample();
        assert_eq!(state.level, ResourceLevel::Critical);
    }

    #[test]
    fn charging_battery_never_gates() {
        let state = monitor(ResourceDetail {
            battery_percent: Some(5.0),
            discharging: Some(false),
            ..Default::default()
        })
        .sample();
        assert_eq!(state.level, ResourceLevel::Optimal);
    }

    #[test]
    fn battery_band_between_15_and_30_is_constrained() {
        let state = monitor(ResourceDetail {
            battery_percent: Some(20.0),
            discharging: Some(true),
            ..Default::default()
        })
        .sample();
        assert_eq!(state.level, ResourceLevel::Constrained);
    }

    #[test]
    fn memory_thresholds() {
        let high = monitor(ResourceDetail {
            memory_used_percent: Some(85.0),
            ..Default::default()
        })
        .sample();
        assert_eq!(high.level, ResourceLevel::Constrained);

        let critical = monitor(ResourceDetail {
            memory_used_percent: Some(95.0),
            ..Default::default()
        })
        .sample();
        assert_eq!(critical.level, ResourceLevel::Critical);
    }

    #[test]
    fn offline_is_critical_and_never_allowed() {
        let mon = monitor(ResourceDetail {
            network: Some(NetworkClass::Offline),
            ..Default::default()
        });
        assert!(!mon.can_perform(&CheckPolicy::backup()).is_allowed());
        assert!(!mon.can_perform(&CheckPolicy::retry()).is_allowed());
    }

    #[test]
    fn retry_policy_ignores_battery() {
        let mon = monitor(ResourceDetail {
            battery_percent: Some(10.0),
            discharging: Some(true),
            ..Default::default()
        });
        assert!(!mon.can_perform(&CheckPolicy::backup()).is_allowed());
        assert!(mon.can_perform(&CheckPolicy::retry()).is_allowed());
    }

    #[test]
    fn require_optimal_rejects_constrained() {
        let mon = monitor(ResourceDetail {
            network: Some(NetworkClass::Slow),
            ..Default::default()
        });
        assert!(mon.can_perform(&CheckPolicy::backup()).is_allowed());

        let strict = CheckPolicy {
            require_optimal: true,
            ..CheckPolicy::backup()
        };
        let denied = mon.can_perform(&strict);
        assert!(!denied.is_allowed());
        assert_eq!(denied.state().level, ResourceLevel::Constrained);
    }
}
