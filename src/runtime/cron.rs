/// Cron expression handling
///
/// Triggers accept classic 5-field crontab expressions as well as the 6/7
/// field form (leading seconds, optional year) that tokio-cron-scheduler
/// parses natively. 5-field expressions are rewritten to the 6-field form.
use crate::error::{FlowyError, Result};
use chrono::{DateTime, Duration, Utc};
use ::cron::Schedule;
use std::str::FromStr;

/// Rewrite an expression into the form the scheduler parses
///
/// For 5-field input a `0` seconds field is prepended and numeric weekdays are
/// shifted from crontab numbering (0 or 7 = Sunday) to the scheduler's
/// (1 = Sunday ... 7 = Saturday). 6/7-field input is returned unchanged.
pub fn normalize(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = shift_weekdays(fields[4]);
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(FlowyError::validation(format!(
            "cron expression '{}' has {} fields, expected 5, 6 or 7",
            expr, n
        ))),
    }
}

/// Normalize and parse an expression
pub fn parse(expr: &str) -> Result<Schedule> {
    let normalized = normalize(expr)?;
    Schedule::from_str(&normalized)
        .map_err(|e| FlowyError::validation(format!("invalid cron expression '{}': {}", expr, e)))
}

/// Next firing strictly after `after`
pub fn next_after(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Whether a firing observed at `now` belongs to a slot no older than `grace`
///
/// Late firings (the scheduler was stalled past the grace window) are
/// coalesced away: the caller skips them instead of replaying.
pub fn is_on_time(schedule: &Schedule, now: DateTime<Utc>, grace: Duration) -> bool {
    // The slot itself may be a few ms after `now` if the tick fired early
    let window_start = now - grace - Duration::seconds(1);
    schedule
        .after(&window_start)
        .next()
        .map_or(false, |slot| slot <= now + Duration::seconds(1))
}

fn shift_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(shift_weekday_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_weekday_item(item: &str) -> String {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };
    let suffix = step.map(|s| format!("/{}", s)).unwrap_or_default();

    match base.split_once('-') {
        Some((start, end)) => match (start.parse::<u8>(), end.parse::<u8>()) {
            // "a-7" ends on Sunday, which moves to the front of the week
            (Ok(a), Ok(7)) if a > 0 && step.is_none() => format!("{}-7,1", a + 1),
            (Ok(a), Ok(b)) if a <= 7 && b <= 7 => {
                format!("{}-{}{}", shift_day(a), shift_day(b), suffix)
            }
            _ => item.to_string(),
        },
        None => match base.parse::<u8>() {
            Ok(day) if day <= 7 => format!("{}{}", shift_day(day), suffix),
            _ => item.to_string(),
        },
    }
}

fn shift_day(day: u8) -> u8 {
    match day {
        0 | 7 => 1,
        n => n + 1,
    }
}
