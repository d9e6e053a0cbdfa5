//! Recurrence scheduling (spec §4.8): deterministic `next_fire` computation
//! plus coalescing of runs that are still in flight when the next fire time
//! arrives.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ScheduleMode {
    Manual,
    Hourly,
    Daily {
        /// Minutes since midnight UTC.
        time_of_day_minutes: u32,
    },
    Weekly {
        weekday: u8,
        time_of_day_minutes: u32,
    },
    Custom {
        interval: u32,
        unit: IntervalUnit,
    },
}

impl Default for ScheduleMode {
    fn default() -> Self {
        Self::Manual
    }
}

fn weekday_from_u8(n: u8) -> Weekday {
    match n % 7 {
        0 => Weekday::Mon,
        1 => Weekday::Tue,
        2 => Weekday::Wed,
        3 => Weekday::Thu,
        4 => Weekday::Fri,
        5 => Weekday::Sat,
        _ => Weekday::Sun,
    }
}

/// Compute the next fire time strictly after `now`, given the recurrence
/// `mode` and the persisted `anchor` (the instant the schedule was created
/// or last edited). `Manual` never fires on its own.
pub fn next_fire(
    mode: &ScheduleMode,
    now: DateTime<Utc>,
    anchor: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match mode {
        ScheduleMode::Manual => None,
        ScheduleMode::Hourly => {
            let elapsed = now.signed_duration_since(anchor);
            let hours_elapsed = elapsed.num_seconds().div_euclid(3600).max(0);
            let mut candidate = anchor + ChronoDuration::hours(hours_elapsed);
            while candidate <= now {
                candidate += ChronoDuration::hours(1);
            }
            Some(candidate)
        }
        ScheduleMode::Daily {
            time_of_day_minutes,
        } => {
            let time = minutes_to_time(*time_of_day_minutes);
            let mut candidate = now.date_naive().and_time(time).and_utc();
            if candidate <= now {
                candidate += ChronoDuration::days(1);
            }
            Some(candidate)
        }
        ScheduleMode::Weekly {
            weekday,
            time_of_day_minutes,
        } => {
            let target_weekday = weekday_from_u8(*weekday);
            let time = minutes_to_time(*time_of_day_minutes);
            let mut candidate = now.date_naive().and_time(time).and_utc();
            loop {
                if candidate.weekday() == target_weekday && candidate > now {
                    return Some(candidate);
                }
                candidate += ChronoDuration::days(1);
            }
        }
        ScheduleMode::Custom { interval, unit } => {
            let step = match unit {
                IntervalUnit::Minutes => ChronoDuration::minutes(*interval as i64),
                IntervalUnit::Hours => ChronoDuration::hours(*interval as i64),
                IntervalUnit::Days => ChronoDuration::days(*interval as i64),
            };
            if step.num_seconds() <= 0 {
                return None;
            }
            let elapsed = now.signed_duration_since(anchor);
            let steps_elapsed = elapsed.num_seconds().div_euclid(step.num_seconds()).max(0);
            let mut candidate = anchor + step * (steps_elapsed as i32);
            while candidate <= now {
                candidate += step;
            }
            Some(candidate)
        }
    }
}

fn minutes_to_time(minutes: u32) -> NaiveTime {
    let minutes = minutes % (24 * 60);
    NaiveTime::from_hms_opt(minutes / 60, minutes % 60, 0).unwrap_or_else(|| NaiveTime::from_hms_opt(0, 0, 0).unwrap())
}

/// Tracks accounts with a run currently in flight so a fire event that lands
/// mid-run is coalesced (skipped) rather than queued, per spec §4.8.
#[derive(Default)]
pub struct RunCoalescer {
    in_flight: Mutex<HashSet<String>>,
}

impl RunCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to start a run for `account_id`. Returns `false` if one is
    /// already in flight, in which case the caller must skip this fire.
    pub fn try_start(&self, account_id: &str) -> bool {
        let mut guard = self.in_flight.lock().expect("run coalescer mutex poisoned");
        guard.insert(account_id.to_string())
    }

    pub fn finish(&self, account_id: &str) {
        let mut guard = self.in_flight.lock().expect("run coalescer mutex poisoned");
        guard.remove(account_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn hourly_advances_exactly_one_hour() {
        let anchor = dt("2024-01-01T00:00:00Z");
        let now = dt("2024-01-01T00:30:00Z");
        let next = next_fire(&ScheduleMode::Hourly, now, anchor).unwrap();
        assert_eq!(next, dt("2024-01-01T01:00:00Z"));
    }

    #[test]
    fn daily_rolls_to_tomorrow_if_time_passed() {
        let anchor = dt("2024-01-01T00:00:00Z");
        let now = dt("2024-01-01T10:00:00Z");
        let mode = ScheduleMode::Daily {
            time_of_day_minutes: 9 * 60,
        };
        let next = next_fire(&mode, now, anchor).unwrap();
        assert_eq!(next, dt("2024-01-02T09:00:00Z"));
    }

    #[test]
    fn manual_never_fires() {
        let anchor = dt("2024-01-01T00:00:00Z");
        assert!(next_fire(&ScheduleMode::Manual, anchor, anchor).is_none());
    }

    #[test]
    fn custom_interval_is_deterministic_across_calls() {
        let anchor = dt("2024-01-01T00:00:00Z");
        let now = dt("2024-01-01T00:05:00Z");
        let mode = ScheduleMode::Custom {
            interval: 15,
            unit: IntervalUnit::Minutes,
        };
        let a = next_fire(&mode, now, anchor).unwrap();
        let b = next_fire(&mode, now, anchor).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, dt("2024-01-01T00:15:00Z"));
    }

    #[test]
    fn coalescer_rejects_second_start_until_finished() {
        let coalescer = RunCoalescer::new();
        assert!(coalescer.try_start("acct"));
        assert!(!coalescer.try_start("acct"));
        coalescer.finish("acct");
        assert!(coalescer.try_start("acct"));
    }
}
