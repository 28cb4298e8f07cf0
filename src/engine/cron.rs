//! Cron schedules for time-triggered workflows.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::EngineError;

/// Day names indexed by standard cron numbering (`0 = Sunday`).
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron expression, evaluated in UTC.
///
/// Accepts standard 5-field expressions (`min hour dom month dow`, with
/// `0`/`7 = Sunday`) as well as the 6/7-field form with seconds (and optional
/// year), which is handed to the `cron` crate as-is and so uses its
/// `1 = Sunday` numbering.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, EngineError> {
        let fields = expression.split_whitespace().count();
        let normalized = match fields {
            5 => {
                let mut parts: Vec<&str> = expression.split_whitespace().collect();
                let day_of_week = standard_day_of_week(parts[4]).map_err(|reason| {
                    EngineError::InvalidSchedule {
                        schedule: expression.to_string(),
                        reason,
                    }
                })?;
                parts[4] = &day_of_week;
                format!("0 {}", parts.join(" "))
            }
            6 | 7 => expression.trim().to_string(),
            n => {
                return Err(EngineError::InvalidSchedule {
                    schedule: expression.to_string(),
                    reason: format!("expected 5, 6 or 7 fields, got {n}"),
                });
            }
        };

        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| EngineError::InvalidSchedule {
                schedule: expression.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First slot strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// The latest slot in `(after, now]`, if any. Several missed slots
    /// collapse into the most recent one.
    pub fn latest_due(&self, after: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after)
            .take_while(|slot| *slot <= now)
            .last()
    }
}

/// Rewrite a standard day-of-week field with day names so the `cron` crate
/// reads it the same way. Ranges and steps are expanded into lists; items
/// that are already names pass through.
fn standard_day_of_week(field: &str) -> Result<String, String> {
    let mut days: Vec<String> = Vec::new();
    let mut push = |day: String| {
        if !days.contains(&day) {
            days.push(day);
        }
    };

    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{item}'"))?;
                if step == 0 {
                    return Err(format!("day-of-week step must be positive in '{item}'"));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let bounds = if range == "*" || range == "?" {
            match step {
                Some(_) => Some((0, 6)),
                None => {
                    push(item.to_string());
                    continue;
                }
            }
        } else if let Some((start, end)) = range.split_once('-') {
            match (start.parse::<u32>(), end.parse::<u32>()) {
                (Ok(start), Ok(end)) => Some((start, end)),
                _ => None,
            }
        } else {
            range
                .parse::<u32>()
                .ok()
                .map(|day| (day, if step.is_some() { 6 } else { day }))
        };

        let Some((start, end)) = bounds else {
            push(item.to_string());
            continue;
        };
        if start > 7 || end > 7 || start > end {
            return Err(format!("invalid day-of-week '{item}' (expected 0-7)"));
        }
        for day in (start..=end).step_by(step.unwrap_or(1) as usize) {
            push(DAY_NAMES[(day % 7) as usize].to_string());
        }
    }

    Ok(days.join(","))
}
