// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schedule timing.
//!
//! Pure functions computing when a schedule fires next. Cron and weekday
//! timing are evaluated in the schedule's timezone; interval and once timing
//! are absolute.

use cadence_core::persistence::ScheduleRecord;
use cadence_core::status::ScheduleType;
use chrono::{DateTime, Datelike, Days, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use croner::Cron;
use thiserror::Error;

/// Longest interval, timeout or retry delay a schedule may use (ten years).
pub const MAX_DURATION_SECONDS: i64 = 10 * 366 * 24 * 60 * 60;

/// Why a schedule's timing cannot be computed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimingError {
    /// Cron expression did not parse.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron {
        /// The expression.
        expression: String,
        /// Parser message.
        reason: String,
    },

    /// Timezone is not a known IANA name.
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    /// Type-specific parameters are missing or malformed.
    #[error("{0}")]
    InvalidParameters(String),
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, TimingError> {
    name.parse::<Tz>()
        .map_err(|_| TimingError::UnknownTimezone(name.to_string()))
}

/// Parse a cron expression (5 fields, or 6 with leading seconds).
pub fn parse_cron(expression: &str) -> Result<Cron, TimingError> {
    Cron::new(expression)
        .with_seconds_optional()
        .parse()
        .map_err(|e| TimingError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

/// Parse a weekday name such as `mon` or `Monday`.
pub fn parse_weekday(name: &str) -> Result<Weekday, TimingError> {
    name.trim()
        .parse::<Weekday>()
        .map_err(|_| TimingError::InvalidParameters(format!("unknown weekday '{}'", name)))
}

/// Parse a time of day as `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, TimingError> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| {
            TimingError::InvalidParameters(format!(
                "invalid time of day '{}', expected HH:MM",
                value
            ))
        })
}

enum Timing {
    Cron(Cron, Tz, String),
    Interval(chrono::Duration),
    Weekday {
        days: Vec<Weekday>,
        times: Vec<NaiveTime>,
        tz: Tz,
    },
    Once(DateTime<Utc>),
}

impl Timing {
    fn of(schedule: &ScheduleRecord) -> Result<Self, TimingError> {
        let tz = parse_timezone(&schedule.timezone)?;
        match schedule.schedule_type {
            ScheduleType::Cron => {
                let expression = schedule.cron_expression.as_deref().ok_or_else(|| {
                    TimingError::InvalidParameters(
                        "cron schedules require cron_expression".to_string(),
                    )
                })?;
                Ok(Self::Cron(parse_cron(expression)?, tz, expression.to_string()))
            }
            ScheduleType::Interval => match schedule.interval_seconds {
                Some(secs) if (1..=MAX_DURATION_SECONDS).contains(&secs) => {
                    chrono::Duration::try_seconds(secs)
                        .map(Self::Interval)
                        .ok_or_else(|| out_of_range("interval_seconds"))
                }
                Some(secs) if secs > MAX_DURATION_SECONDS => Err(TimingError::InvalidParameters(
                    format!("interval_seconds must not exceed {}", MAX_DURATION_SECONDS),
                )),
                Some(_) => Err(TimingError::InvalidParameters(
                    "interval_seconds must be positive".to_string(),
                )),
                None => Err(TimingError::InvalidParameters(
                    "interval schedules require interval_seconds".to_string(),
                )),
            },
            ScheduleType::Weekday => {
                let days = schedule
                    .weekdays
                    .as_ref()
                    .map(|d| d.0.as_slice())
                    .unwrap_or_default()
                    .iter()
                    .map(|d| parse_weekday(d))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut times = schedule
                    .weekday_times
                    .as_ref()
                    .map(|t| t.0.as_slice())
                    .unwrap_or_default()
                    .iter()
                    .map(|t| parse_time_of_day(t))
                    .collect::<Result<Vec<_>, _>>()?;
                if days.is_empty() || times.is_empty() {
                    return Err(TimingError::InvalidParameters(
                        "weekday schedules require weekdays and weekday_times".to_string(),
                    ));
                }
                times.sort();
                Ok(Self::Weekday { days, times, tz })
            }
            ScheduleType::Once => schedule.run_once_at.map(Self::Once).ok_or_else(|| {
                TimingError::InvalidParameters("once schedules require run_once_at".to_string())
            }),
        }
    }
}

fn out_of_range(what: &str) -> TimingError {
    TimingError::InvalidParameters(format!("{} is out of range", what))
}

/// Check that a schedule's timing parameters are complete and parseable.
pub fn validate(schedule: &ScheduleRecord) -> Result<(), TimingError> {
    Timing::of(schedule).map(|_| ())
}

/// First due time for a newly created or re-enabled schedule.
///
/// A `once` schedule whose time is already past is due immediately.
pub fn first_fire(
    schedule: &ScheduleRecord,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, TimingError> {
    match Timing::of(schedule)? {
        Timing::Interval(every) => now
            .checked_add_signed(every)
            .map(Some)
            .ok_or_else(|| out_of_range("next fire time")),
        Timing::Once(at) => Ok(Some(at)),
        timing => next_after(&timing, now),
    }
}

/// Due time following a fire (or skip) evaluated at `now`.
///
/// Interval schedules stay anchored to their previous `next_run_at`; missed
/// slots are skipped to the first one after `now`. `once` schedules have no
/// next fire.
pub fn next_fire(
    schedule: &ScheduleRecord,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, TimingError> {
    match Timing::of(schedule)? {
        Timing::Interval(every) => {
            let anchor = schedule.next_run_at.unwrap_or(now);
            if anchor > now {
                return Ok(Some(anchor));
            }
            let step = every.num_milliseconds();
            let behind = (now - anchor).num_milliseconds();
            let slots = behind / step + 1;
            slots
                .checked_mul(step)
                .and_then(chrono::Duration::try_milliseconds)
                .and_then(|ahead| anchor.checked_add_signed(ahead))
                .map(Some)
                .ok_or_else(|| out_of_range("next fire time"))
        }
        Timing::Once(_) => Ok(None),
        timing => next_after(&timing, now),
    }
}

fn next_after(timing: &Timing, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, TimingError> {
    match timing {
        Timing::Cron(cron, tz, expression) => {
            let local = now.with_timezone(tz);
            cron.find_next_occurrence(&local, false)
                .map(|next| Some(next.with_timezone(&Utc)))
                .map_err(|e| TimingError::InvalidCron {
                    expression: expression.clone(),
                    reason: e.to_string(),
                })
        }
        Timing::Weekday { days, times, tz } => Ok(next_weekday_slot(days, times, tz, now)),
        Timing::Interval(every) => now
            .checked_add_signed(*every)
            .map(Some)
            .ok_or_else(|| out_of_range("next fire time")),
        Timing::Once(at) => Ok((*at > now).then_some(*at)),
    }
}

fn next_weekday_slot(
    days: &[Weekday],
    times: &[NaiveTime],
    tz: &Tz,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let today = now.with_timezone(tz).date_naive();
    // Eight days covers "same weekday next week, earlier time".
    (0..=7u64).find_map(|offset| {
        let date = today.checked_add_days(Days::new(offset))?;
        if !days.contains(&date.weekday()) {
            return None;
        }
        times.iter().find_map(|time| {
            // Local times skipped by a DST gap do not fire that day.
            let local = tz.from_local_datetime(&date.and_time(*time)).earliest()?;
            let utc = local.with_timezone(&Utc);
            (utc > now).then_some(utc)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::persistence::Json;
    use cadence_core::status::DependencyMode;
    use serde_json::json;

    fn schedule(schedule_type: ScheduleType) -> ScheduleRecord {
        let now = Utc::now();
        ScheduleRecord {
            id: "s1".into(),
            name: "nightly".into(),
            description: None,
            action_id: "pkg.echo".into(),
            inputs: Json(json!({})),
            schedule_type,
            cron_expression: None,
            interval_seconds: None,
            weekdays: None,
            weekday_times: None,
            run_once_at: None,
            timezone: "UTC".into(),
            enabled: true,
            last_run_at: None,
            next_run_at: None,
            skip_if_running: false,
            max_concurrent: 1,
            timeout_seconds: None,
            retry_enabled: false,
            retry_max_attempts: 1,
            retry_delay_seconds: 60,
            backoff_multiplier: 2.0,
            rate_limit_per_hour: None,
            rate_limit_per_day: None,
            depends_on_schedule_id: None,
            dependency_mode: DependencyMode::AfterSuccess,
            notify_on_success: false,
            notify_on_failure: false,
            notification_channels: Json(vec![]),
            priority: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_cron_next_fire_in_timezone() {
        let mut s = schedule(ScheduleType::Cron);
        s.cron_expression = Some("0 9 * * *".into());
        s.timezone = "Europe/Warsaw".into();

        // 2025-01-15 is winter time, UTC+1.
        let next = next_fire(&s, at("2025-01-15T07:00:00Z")).unwrap();
        assert_eq!(next, Some(at("2025-01-15T08:00:00Z")));

        let next = next_fire(&s, at("2025-01-15T08:00:00Z")).unwrap();
        assert_eq!(next, Some(at("2025-01-16T08:00:00Z")));
    }

    #[test]
    fn test_cron_with_seconds_field() {
        let mut s = schedule(ScheduleType::Cron);
        s.cron_expression = Some("30 */5 * * * *".into());
        let next = next_fire(&s, at("2025-03-01T10:01:00Z")).unwrap();
        assert_eq!(next, Some(at("2025-03-01T10:05:30Z")));
    }

    #[test]
    fn test_invalid_cron_and_timezone() {
        let mut s = schedule(ScheduleType::Cron);
        s.cron_expression = Some("not a cron".into());
        assert!(matches!(validate(&s), Err(TimingError::InvalidCron { .. })));

        s.cron_expression = Some("0 9 * * *".into());
        s.timezone = "Mars/Olympus".into();
        assert_eq!(
            validate(&s),
            Err(TimingError::UnknownTimezone("Mars/Olympus".into()))
        );
    }

    #[test]
    fn test_interval_anchored_to_previous_slot() {
        let mut s = schedule(ScheduleType::Interval);
        s.interval_seconds = Some(60);
        s.next_run_at = Some(at("2025-01-01T00:00:00Z"));

        // Fired on time.
        let next = next_fire(&s, at("2025-01-01T00:00:00Z")).unwrap();
        assert_eq!(next, Some(at("2025-01-01T00:01:00Z")));

        // Tick arrived late; still on the original grid.
        let next = next_fire(&s, at("2025-01-01T00:00:30Z")).unwrap();
        assert_eq!(next, Some(at("2025-01-01T00:01:00Z")));

        // Several slots missed.
        let next = next_fire(&s, at("2025-01-01T00:05:10Z")).unwrap();
        assert_eq!(next, Some(at("2025-01-01T00:06:00Z")));
    }

    #[test]
    fn test_interval_requires_positive_seconds() {
        let mut s = schedule(ScheduleType::Interval);
        s.interval_seconds = Some(0);
        assert!(validate(&s).is_err());
        s.interval_seconds = None;
        assert!(validate(&s).is_err());
    }

    #[test]
    fn test_weekday_slots() {
        let mut s = schedule(ScheduleType::Weekday);
        s.weekdays = Some(Json(vec!["mon".into(), "wed".into()]));
        s.weekday_times = Some(Json(vec!["17:30".into(), "09:00".into()]));
        s.timezone = "America/New_York".into();

        // Monday 2025-01-06 10:00 New York (15:00 UTC): next is 17:30 the same day.
        let next = next_fire(&s, at("2025-01-06T15:00:00Z")).unwrap();
        assert_eq!(next, Some(at("2025-01-06T22:30:00Z")));

        // After the last Monday slot the next is Wednesday 09:00.
        let next = next_fire(&s, at("2025-01-06T22:30:00Z")).unwrap();
        assert_eq!(next, Some(at("2025-01-08T14:00:00Z")));
    }

    #[test]
    fn test_weekday_wraps_to_next_week() {
        let mut s = schedule(ScheduleType::Weekday);
        s.weekdays = Some(Json(vec!["friday".into()]));
        s.weekday_times = Some(Json(vec!["08:00".into()]));

        // Friday 2025-01-10 09:00 UTC, after today's slot.
        let next = next_fire(&s, at("2025-01-10T09:00:00Z")).unwrap();
        assert_eq!(next, Some(at("2025-01-17T08:00:00Z")));
    }

    #[test]
    fn test_weekday_invalid_parameters() {
        let mut s = schedule(ScheduleType::Weekday);
        s.weekdays = Some(Json(vec!["funday".into()]));
        s.weekday_times = Some(Json(vec!["08:00".into()]));
        assert!(validate(&s).is_err());

        s.weekdays = Some(Json(vec!["mon".into()]));
        s.weekday_times = Some(Json(vec!["25:00".into()]));
        assert!(validate(&s).is_err());
    }

    #[test]
    fn test_once() {
        let mut s = schedule(ScheduleType::Once);
        s.run_once_at = Some(at("2025-06-01T12:00:00Z"));

        assert_eq!(
            first_fire(&s, at("2025-05-01T00:00:00Z")).unwrap(),
            Some(at("2025-06-01T12:00:00Z"))
        );
        // Past one-shot is due immediately.
        assert_eq!(
            first_fire(&s, at("2025-07-01T00:00:00Z")).unwrap(),
            Some(at("2025-06-01T12:00:00Z"))
        );
        assert_eq!(next_fire(&s, at("2025-06-01T12:00:00Z")).unwrap(), None);
    }

    #[test]
    fn test_first_fire_interval_starts_from_now() {
        let mut s = schedule(ScheduleType::Interval);
        s.interval_seconds = Some(300);
        let now = at("2025-01-01T00:00:00Z");
        assert_eq!(
            first_fire(&s, now).unwrap(),
            Some(at("2025-01-01T00:05:00Z"))
        );
    }

    #[test]
    fn test_interval_upper_bound() {
        let mut s = schedule(ScheduleType::Interval);
        s.interval_seconds = Some(MAX_DURATION_SECONDS);
        assert!(validate(&s).is_ok());

        for secs in [MAX_DURATION_SECONDS + 1, i64::MAX] {
            s.interval_seconds = Some(secs);
            assert!(matches!(validate(&s), Err(TimingError::InvalidParameters(_))));
            assert!(first_fire(&s, Utc::now()).is_err());
        }
    }

    #[test]
    fn test_next_fire_out_of_range_is_an_error() {
        let mut s = schedule(ScheduleType::Interval);
        s.interval_seconds = Some(MAX_DURATION_SECONDS);
        let end_of_time = DateTime::<Utc>::MAX_UTC;
        assert!(first_fire(&s, end_of_time).is_err());
    }
}
