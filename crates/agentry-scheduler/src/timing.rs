//! Next-run computation for once/cron/interval schedules

use agentry_core::{Schedule, ScheduleType};
use chrono::{DateTime, Utc};
use std::str::FromStr;

/// Parse a cron expression, accepting the standard 5-field convention
/// (min hour dom mon dow) by prepending a seconds field.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, String> {
    let normalized = expression.trim();
    let field_count = normalized.split_whitespace().count();
    let result = if field_count == 5 {
        cron::Schedule::from_str(&format!("0 {normalized}"))
            .or_else(|_| cron::Schedule::from_str(normalized))
    } else {
        cron::Schedule::from_str(normalized)
    };
    result.map_err(|e| format!("invalid cron expression '{expression}': {e}"))
}

/// Validate a timezone string as an IANA zone.
pub fn parse_timezone(timezone: &str) -> Result<chrono_tz::Tz, String> {
    timezone
        .parse::<chrono_tz::Tz>()
        .map_err(|_| format!("invalid timezone '{timezone}'"))
}

/// Compute the next firing time (epoch ms) after `now`, or None when the
/// schedule has no future firing.
pub fn compute_next_run(schedule: &Schedule, now: i64) -> Option<i64> {
    match schedule.schedule_type {
        ScheduleType::Once => schedule.run_at.filter(|run_at| *run_at > now),
        ScheduleType::Interval => {
            let interval = schedule.interval_ms?;
            Some(schedule.last_run_at.unwrap_or(now) + interval)
        }
        ScheduleType::Cron => {
            let expression = schedule.cron.as_deref()?;
            next_cron_time(expression, schedule.timezone.as_deref(), now)
        }
    }
}

/// Next cron firing after `from_time`. Honors the schedule's timezone when
/// it parses as an IANA zone, otherwise evaluates in UTC.
fn next_cron_time(expression: &str, timezone: Option<&str>, from_time: i64) -> Option<i64> {
    let schedule = parse_cron(expression).ok()?;
    let from_datetime = DateTime::from_timestamp_millis(from_time)?;

    if let Some(tz) = timezone.and_then(|tz| tz.parse::<chrono_tz::Tz>().ok()) {
        let local_time = from_datetime.with_timezone(&tz);
        let next = schedule.after(&local_time).next()?;
        Some(next.with_timezone(&Utc).timestamp_millis())
    } else {
        let next = schedule.after(&from_datetime).next()?;
        Some(next.timestamp_millis())
    }
}
