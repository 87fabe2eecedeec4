//! Backup schedule descriptor and next-fire computation.
//!
//! The schedule is the single source of truth for when scheduled backups
//! are due. Whenever it is enabled, `next_run` holds the earliest future
//! fire time for its frequency; every update and every `advance()`
//! recomputes it, so a deferred or missed run can never re-trigger
//! itself on the next scan.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Unlimited retention sentinel.
pub const RETENTION_UNLIMITED: i32 = -1;

/// How often a scheduled backup fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frequency {
    /// Every hour at the configured minute.
    Hourly,
    /// Every day at `hour:minute`.
    Daily,
    /// Every week on `dow` (0 = Sunday) at `hour:minute`.
    Weekly { dow: u8 },
    /// Every month on `dom` (1–31, clamped to the month's length).
    Monthly { dom: u8 },
}

/// The schedule record. Owned by the scheduler; everyone else reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub enabled: bool,
    pub frequency: Frequency,
    pub hour: u8,
    pub minute: u8,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    /// Completed backups to keep for this schedule; -1 keeps all.
    pub retention: i32,
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulePatch {
    pub enabled: Option<bool>,
    pub frequency: Option<Frequency>,
    pub hour: Option<u8>,
    pub minute: Option<u8>,
    pub retention: Option<i32>,
}

impl Schedule {
    /// Create a schedule and compute its first fire time.
    pub fn new(
        id: impl Into<String>,
        frequency: Frequency,
        hour: u8,
        minute: u8,
        now: DateTime<Utc>,
    ) -> Result<Self, String> {
        validate(frequency, hour, minute)?;
        Ok(Self {
            id: id.into(),
            enabled: true,
            frequency,
            hour,
            minute,
            last_run: None,
            next_run: compute_next(now, frequency, hour, minute),
            retention: RETENTION_UNLIMITED,
        })
    }

    /// Daily 02:00 default.
    pub fn default_at(now: DateTime<Utc>) -> Self {
        Self::new("default", Frequency::Daily, 2, 0, now).expect("static schedule is valid")
    }

    /// True iff enabled and the fire time has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run <= now
    }

    /// Commit a run: stamp `last_run` and move `next_run` forward.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
        self.next_run = compute_next(now, self.frequency, self.hour, self.minute);
    }

    /// Apply a patch and recompute `next_run` from the new fields.
    pub fn update(&mut self, patch: SchedulePatch, now: DateTime<Utc>) -> Result<(), String> {
        let frequency = patch.frequency.unwrap_or(self.frequency);
        let hour = patch.hour.unwrap_or(self.hour);
        let minute = patch.minute.unwrap_or(self.minute);
        validate(frequency, hour, minute)?;

        self.frequency = frequency;
        self.hour = hour;
        self.minute = minute;
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(retention) = patch.retention {
            if retention < RETENTION_UNLIMITED {
                return Err(format!("invalid retention {retention}"));
            }
            self.retention = retention;
        }
        self.next_run = compute_next(now, self.frequency, self.hour, self.minute);
        Ok(())
    }
}

fn validate(frequency: Frequency, hour: u8, minute: u8) -> Result<(), String> {
    if hour > 23 {
        return Err(format!("hour {hour} out of range"));
    }
    if minute > 59 {
        return Err(format!("minute {minute} out of range"));
    }
    match frequency {
        Frequency::Weekly { dow } if dow > 6 => Err(format!("weekday {dow} out of range")),
        Frequency::Monthly { dom } if dom == 0 || dom > 31 => {
            Err(format!("day of month {dom} out of range"))
        }
        _ => Ok(()),
    }
}

/// Earliest fire time strictly after `now`.
pub fn compute_next(
    now: DateTime<Utc>,
    frequency: Frequency,
    hour: u8,
    minute: u8,
) -> DateTime<Utc> {
    match frequency {
        Frequency::Hourly => {
            let candidate = at(now.date_naive(), now.hour() as u8, minute);
            if candidate > now {
                candidate
            } else {
                candidate + Duration::hours(1)
            }
        }
        Frequency::Daily => {
            let candidate = at(now.date_naive(), hour, minute);
            if candidate > now {
                candidate
            } else {
                candidate + Duration::days(1)
            }
        }
        Frequency::Weekly { dow } => {
            let today = now.weekday().num_days_from_sunday() as i64;
            let ahead = (dow as i64 - today).rem_euclid(7);
            let candidate = at(now.date_naive() + Duration::days(ahead), hour, minute);
            if candidate > now {
                candidate
            } else {
                candidate + Duration::days(7)
            }
        }
        Frequency::Monthly { dom } => {
            let this_month = monthly_candidate(now.year(), now.month(), dom, hour, minute);
            if this_month > now {
                this_month
            } else {
                let (year, month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                monthly_candidate(year, month, dom, hour, minute)
            }
        }
    }
}

fn monthly_candidate(year: i32, month: u32, dom: u8, hour: u8, minute: u8) -> DateTime<Utc> {
    let day = (dom as u32).min(days_in_month(year, month));
    at(
        NaiveDate::from_ymd_opt(year, month, day).expect("clamped day is valid"),
        hour,
        minute,
    )
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("first of month is valid")
        .pred_opt()
        .expect("predecessor of first of month exists")
        .day()
}

fn at(date: NaiveDate, hour: u8, minute: u8) -> DateTime<Utc> {
    Utc.from_utc_datetime(
        &date
            .and_hms_opt(hour as u32, minute as u32, 0)
            .expect("validated time is in range"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn hourly_fires_at_the_next_minute_boundary() {
        let now = dt("2024-03-10T14:20:00Z");
        assert_eq!(
            compute_next(now, Frequency::Hourly, 0, 30),
            dt("2024-03-10T14:30:00Z")
        );
        assert_eq!(
            compute_next(now, Frequency::Hourly, 0, 10),
            dt("2024-03-10T15:10:00Z")
        );
    }

    #[test]
    fn daily_rolls_to_tomorrow_when_passed() {
        let now = dt("2024-03-10T14:20:00Z");
        assert_eq!(
            compute_next(now, Frequency::Daily, 16, 0),
            dt("2024-03-10T16:00:00Z")
        );
        assert_eq!(
            compute_next(now, Frequency::Daily, 2, 0),
            dt("2024-03-11T02:00:00Z")
        );
    }

    #[test]
    fn weekly_same_day_but_passed_waits_a_week() {
        // 2024-03-10 is a Sunday (dow 0).
        let now = dt("2024-03-10T14:20:00Z");
        assert_eq!(
            compute_next(now, Frequency::Weekly { dow: 0 }, 9, 0),
            dt("2024-03-17T09:00:00Z")
        );
        assert_eq!(
            compute_next(now, Frequency::Weekly { dow: 0 }, 18, 0),
            dt("2024-03-10T18:00:00Z")
        );
        // Wednesday (dow 3).
        assert_eq!(
            compute_next(now, Frequency::Weekly { dow: 3 }, 9, 0),
            dt("2024-03-13T09:00:00Z")
        );
    }

    #[test]
    fn monthly_dom_31_clamps_to_february_end() {
        let now = dt("2024-02-01T00:00:00Z");
        assert_eq!(
            compute_next(now, Frequency::Monthly { dom: 31 }, 3, 0),
            dt("2024-02-29T03:00:00Z") // leap year
        );
        let now = dt("2023-02-01T00:00:00Z");
        assert_eq!(
            compute_next(now, Frequency::Monthly { dom: 31 }, 3, 0),
            dt("2023-02-28T03:00:00Z")
        );
    }

    #[test]
    fn monthly_rolls_into_next_month_and_year() {
        let now = dt("2024-12-31T23:00:00Z");
        assert_eq!(
            compute_next(now, Frequency::Monthly { dom: 15 }, 3, 0),
            dt("2025-01-15T03:00:00Z")
        );
    }

    #[test]
    fn next_run_is_always_in_the_future() {
        let now = dt("2024-03-10T14:20:00Z");
        let mut schedule = Schedule::new("s1", Frequency::Daily, 14, 20, now).unwrap();
        assert!(schedule.next_run > now);

        schedule.advance(now);
        assert!(schedule.next_run > now);
        assert_eq!(schedule.last_run, Some(now));

        schedule
            .update(
                SchedulePatch {
                    frequency: Some(Frequency::Weekly { dow: 2 }),
                    hour: Some(6),
                    ..Default::default()
                },
                now,
            )
            .unwrap();
        assert!(schedule.next_run > now);
        assert_eq!(schedule.hour, 6);
    }

    #[test]
    fn is_due_respects_enabled() {
        let now = dt("2024-03-10T14:20:00Z");
        let mut schedule = Schedule::new("s1", Frequency::Daily, 2, 0, now).unwrap();
        assert!(!schedule.is_due(now));

        // Pretend the fire time arrived.
        let later = schedule.next_run + Duration::minutes(1);
        assert!(schedule.is_due(later));

        schedule.enabled = false;
        assert!(!schedule.is_due(later));
    }

    #[test]
    fn invalid_fields_are_rejected() {
        let now = dt("2024-03-10T14:20:00Z");
        assert!(Schedule::new("s", Frequency::Daily, 24, 0, now).is_err());
        assert!(Schedule::new("s", Frequency::Weekly { dow: 7 }, 0, 0, now).is_err());
        assert!(Schedule::new("s", Frequency::Monthly { dom: 0 }, 0, 0, now).is_err());
        assert!(Schedule::new("s", Frequency::Monthly { dom: 32 }, 0, 0, now).is_err());

        let mut schedule = Schedule::new("s", Frequency::Daily, 2, 0, now).unwrap();
        assert!(schedule
            .update(
                SchedulePatch {
                    minute: Some(60),
                    ..Default::default()
                },
                now
            )
            .is_err());
        assert!(schedule
            .update(
                SchedulePatch {
                    retention: Some(-2),
                    ..Default::default()
                },
                now
            )
            .is_err());
    }
}
