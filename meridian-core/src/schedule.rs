//! Agent start schedules
//!
//! Schedules are wall-clock (station local time). A recurring schedule is a
//! start instant plus up to `occurrences - 1` further instants spaced by
//! `interval` hours or days. Instants beyond the calendar range simply never
//! occur.

use crate::error::{StationError, StationResult, ValidationError};
use crate::identity::Sid;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Repeat unit of a recurring schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepeatPolicy {
    Hourly,
    Daily,
}

impl RepeatPolicy {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            RepeatPolicy::Hourly => "HOURLY",
            RepeatPolicy::Daily => "DAILY",
        }
    }

    fn step(&self, interval: u32) -> Option<Duration> {
        match self {
            RepeatPolicy::Hourly => Duration::try_hours(i64::from(interval)),
            RepeatPolicy::Daily => Duration::try_days(i64::from(interval)),
        }
    }

    /// Largest accepted interval: one hundred years in this unit.
    pub fn max_interval(&self) -> u32 {
        match self {
            RepeatPolicy::Hourly => MAX_REPEAT_DAYS * 24,
            RepeatPolicy::Daily => MAX_REPEAT_DAYS,
        }
    }
}

const MAX_REPEAT_DAYS: u32 = 36_500;

impl fmt::Display for RepeatPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for RepeatPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HOURLY" => Ok(RepeatPolicy::Hourly),
            "DAILY" => Ok(RepeatPolicy::Daily),
            _ => Err(ValidationError::InvalidValue {
                field: "repeat".to_string(),
                reason: format!("unknown repeat policy {}", s),
            }),
        }
    }
}

/// Recurrence of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub policy: RepeatPolicy,
    pub interval: u32,
    /// Maximum number of occurrences, the start instant included
    pub occurrences: u32,
}

/// When an agent should be started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Surrogate id of the scheduled instance
    pub sid: Sid,
    pub start_date: NaiveDate,
    pub start_time: NaiveTime,
    pub repeat: Option<Recurrence>,
}

impl Schedule {
    /// One-shot schedule.
    pub fn once(sid: Sid, start: NaiveDateTime) -> Self {
        Self {
            sid,
            start_date: start.date(),
            start_time: start.time(),
            repeat: None,
        }
    }

    /// Recurring schedule.
    pub fn recurring(
        sid: Sid,
        start: NaiveDateTime,
        policy: RepeatPolicy,
        interval: u32,
        occurrences: u32,
    ) -> Self {
        Self {
            sid,
            start_date: start.date(),
            start_time: start.time(),
            repeat: Some(Recurrence {
                policy,
                interval,
                occurrences,
            }),
        }
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start_date.and_time(self.start_time)
    }

    pub fn validate(&self) -> StationResult<()> {
        if let Some(repeat) = &self.repeat {
            if repeat.interval == 0 {
                return Err(StationError::Validation(ValidationError::InvalidValue {
                    field: "interval".to_string(),
                    reason: "must be at least 1".to_string(),
                }));
            }
            if repeat.interval > repeat.policy.max_interval() {
                return Err(StationError::Validation(ValidationError::InvalidValue {
                    field: "interval".to_string(),
                    reason: format!(
                        "must be at most {} for {}",
                        repeat.policy.max_interval(),
                        repeat.policy
                    ),
                }));
            }
            if repeat.occurrences == 0 {
                return Err(StationError::Validation(ValidationError::InvalidValue {
                    field: "occurrences".to_string(),
                    reason: "must be at least 1".to_string(),
                }));
            }
        }
        Ok(())
    }

    /// Next instant strictly after `now`, or `None` once the schedule is
    /// exhausted.
    pub fn next_occurrence(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let start = self.start();
        if start > now {
            return Some(start);
        }
        let repeat = self.repeat.as_ref()?;
        let step = repeat.policy.step(repeat.interval)?.num_seconds();
        if step <= 0 {
            return None;
        }

        // occurrence index of the first instant strictly after now
        let index = now.signed_duration_since(start).num_seconds() / step + 1;
        if index >= i64::from(repeat.occurrences) {
            return None;
        }
        let offset = Duration::try_seconds(index.checked_mul(step)?)?;
        start.checked_add_signed(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .unwrap()
    }

    #[test]
    fn test_one_shot_in_future() {
        let schedule = Schedule::once(1, at(10, 12));
        assert_eq!(schedule.next_occurrence(at(10, 11)), Some(at(10, 12)));
    }

    #[test]
    fn test_one_shot_in_past_is_none() {
        let schedule = Schedule::once(1, at(10, 12));
        assert_eq!(schedule.next_occurrence(at(10, 12)), None);
        assert_eq!(schedule.next_occurrence(at(11, 0)), None);
    }

    #[test]
    fn test_daily_from_yesterday_within_budget() {
        // start yesterday 09:00, 3 occurrences: yesterday, today, tomorrow
        let schedule = Schedule::recurring(1, at(9, 9), RepeatPolicy::Daily, 1, 3);
        assert_eq!(schedule.next_occurrence(at(10, 8)), Some(at(10, 9)));
        assert_eq!(schedule.next_occurrence(at(10, 10)), Some(at(11, 9)));
        assert_eq!(schedule.next_occurrence(at(11, 9)), None);
    }

    #[test]
    fn test_daily_budget_exhausted() {
        let schedule = Schedule::recurring(1, at(1, 9), RepeatPolicy::Daily, 1, 3);
        assert_eq!(schedule.next_occurrence(at(10, 0)), None);
    }

    #[test]
    fn test_hourly_interval() {
        let schedule = Schedule::recurring(1, at(10, 0), RepeatPolicy::Hourly, 2, 5);
        assert_eq!(schedule.next_occurrence(at(10, 3)), Some(at(10, 4)));
        assert_eq!(schedule.next_occurrence(at(10, 8)), None);
    }

    #[test]
    fn test_single_occurrence_behaves_like_one_shot() {
        let schedule = Schedule::recurring(1, at(10, 0), RepeatPolicy::Daily, 1, 1);
        assert_eq!(schedule.next_occurrence(at(9, 0)), Some(at(10, 0)));
        assert_eq!(schedule.next_occurrence(at(10, 1)), None);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let schedule = Schedule::recurring(1, at(10, 0), RepeatPolicy::Daily, 0, 3);
        assert!(schedule.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_interval_beyond_a_century() {
        let daily = Schedule::recurring(1, at(10, 0), RepeatPolicy::Daily, 36_501, 3);
        assert!(daily.validate().is_err());
        let hourly = Schedule::recurring(1, at(10, 0), RepeatPolicy::Hourly, 876_001, 3);
        assert!(hourly.validate().is_err());
        let widest = Schedule::recurring(1, at(10, 0), RepeatPolicy::Daily, 36_500, 3);
        assert!(widest.validate().is_ok());
    }

    #[test]
    fn test_huge_interval_past_calendar_end_is_none() {
        let schedule = Schedule::recurring(1, at(10, 0), RepeatPolicy::Daily, u32::MAX, u32::MAX);
        assert!(schedule.validate().is_err());
        assert_eq!(schedule.next_occurrence(at(10, 1)), None);
    }

    #[test]
    fn test_occurrence_at_end_of_calendar_is_none() {
        let start = NaiveDateTime::MAX - Duration::minutes(30);
        let schedule = Schedule::recurring(1, start, RepeatPolicy::Hourly, 1, 3);
        assert_eq!(schedule.next_occurrence(start + Duration::minutes(10)), None);
    }

    #[test]
    fn test_long_running_hourly_schedule_skips_ahead() {
        let start = NaiveDate::from_ymd_opt(2000, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap();
        let schedule = Schedule::recurring(1, start, RepeatPolicy::Hourly, 1, u32::MAX);
        assert_eq!(schedule.next_occurrence(at(10, 3)), Some(at(10, 4)));
    }

    #[test]
    fn test_repeat_policy_parse() {
        assert_eq!("daily".parse::<RepeatPolicy>().unwrap(), RepeatPolicy::Daily);
        assert!("weekly".parse::<RepeatPolicy>().is_err());
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_policy() -> impl Strategy<Value = RepeatPolicy> {
        prop_oneof![Just(RepeatPolicy::Hourly), Just(RepeatPolicy::Daily)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Property: next occurrence is never at or before now
        #[test]
        fn prop_next_occurrence_after_now(
            start_offset in -500i64..500,
            policy in arb_policy(),
            interval in 1u32..5,
            occurrences in 1u32..6,
            recurring in any::<bool>(),
        ) {
            let now = NaiveDate::from_ymd_opt(2026, 6, 1)
                .and_then(|d| d.and_hms_opt(12, 0, 0))
                .unwrap();
            let start = now + Duration::hours(start_offset);
            let schedule = if recurring {
                Schedule::recurring(7, start, policy, interval, occurrences)
            } else {
                Schedule::once(7, start)
            };

            if let Some(next) = schedule.next_occurrence(now) {
                prop_assert!(next > now);
                prop_assert!(next >= start);
            }
        }
    }
}
