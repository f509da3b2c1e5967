//! Trigger grammar.
//!
//! A flow declares when it runs as a list of pipe-delimited strings:
//!
//! | form                   | meaning                                        |
//! |------------------------|------------------------------------------------|
//! | `once|<delayMs>|`      | fire once, `delayMs` milliseconds after arming |
//! | `crontab|<expr>|`      | fire on a standard 5-field cron schedule (UTC) |
//! | `event.once|<id>|`     | fire on the next external event `id`           |
//! | `event.every|<id>|`    | fire on every external event `id`              |
//!
//! Parsing is purely syntactic and timezone-agnostic. Any conversion from a
//! user's local time happens before strings reach this module.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::error::{FlowdError, Result};

/// A parsed trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Trigger {
    Once { delay_ms: u64 },
    Crontab { expr: String },
    EventOnce { event_id: String },
    EventEvery { event_id: String },
}

impl Trigger {
    /// The degenerate trigger used when a flow declares none.
    pub fn immediate() -> Self {
        Self::Once { delay_ms: 0 }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Once { .. } => "once",
            Self::Crontab { .. } => "crontab",
            Self::EventOnce { .. } => "event.once",
            Self::EventEvery { .. } => "event.every",
        }
    }

    /// Whether the trigger disarms itself after its first firing.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::Once { .. } | Self::EventOnce { .. })
    }

    pub fn event_id(&self) -> Option<&str> {
        match self {
            Self::EventOnce { event_id } | Self::EventEvery { event_id } => Some(event_id),
            _ => None,
        }
    }

    /// Cron schedule for `crontab` triggers.
    pub fn schedule(&self) -> Option<Result<Schedule>> {
        match self {
            Self::Crontab { expr } => Some(cron_schedule(expr)),
            _ => None,
        }
    }

    /// Next cron tick strictly after `after`, evaluated in UTC.
    pub fn next_tick_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.schedule()? {
            Ok(schedule) => schedule.after(after).next(),
            Err(_) => None,
        }
    }
}

impl FromStr for Trigger {
    type Err = FlowdError;

    fn from_str(input: &str) -> Result<Self> {
        let body = input.strip_suffix('|').unwrap_or(input);
        let (kind, arg) = body
            .split_once('|')
            .ok_or_else(|| FlowdError::invalid_trigger(input, "expected `type|arg|`"))?;

        if arg.contains('|') {
            return Err(FlowdError::invalid_trigger(input, "unexpected extra segment"));
        }

        match kind {
            "once" => {
                let delay_ms = arg.parse::<u64>().map_err(|_| {
                    FlowdError::invalid_trigger(input, "delay must be a non-negative integer of milliseconds")
                })?;
                Ok(Self::Once { delay_ms })
            }
            "crontab" => {
                let fields: Vec<&str> = arg.split_whitespace().collect();
                if fields.len() != 5 {
                    return Err(FlowdError::invalid_trigger(
                        input,
                        format!("cron expression needs 5 fields, got {}", fields.len()),
                    ));
                }
                let expr = fields.join(" ");
                cron_schedule(&expr)
                    .map_err(|e| FlowdError::invalid_trigger(input, e.to_string()))?;
                Ok(Self::Crontab { expr })
            }
            "event.once" | "event.every" => {
                if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                    return Err(FlowdError::invalid_trigger(
                        input,
                        "event id must be non-empty and contain no whitespace",
                    ));
                }
                let event_id = arg.to_string();
                Ok(if kind == "event.once" {
                    Self::EventOnce { event_id }
                } else {
                    Self::EventEvery { event_id }
                })
            }
            other => Err(FlowdError::invalid_trigger(
                input,
                format!("unknown trigger type '{}'", other),
            )),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Once { delay_ms } => write!(f, "once|{}|", delay_ms),
            Self::Crontab { expr } => write!(f, "crontab|{}|", expr),
            Self::EventOnce { event_id } => write!(f, "event.once|{}|", event_id),
            Self::EventEvery { event_id } => write!(f, "event.every|{}|", event_id),
        }
    }
}

impl TryFrom<String> for Trigger {
    type Error = FlowdError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Trigger> for String {
    fn from(trigger: Trigger) -> Self {
        trigger.to_string()
    }
}

/// Parse a flow's trigger list. An empty list means "run once, now".
pub fn parse_triggers<S: AsRef<str>>(items: &[S]) -> Result<Vec<Trigger>> {
    if items.is_empty() {
        return Ok(vec![Trigger::immediate()]);
    }
    items.iter().map(|s| s.as_ref().parse()).collect()
}

/// Build a `cron` crate schedule from a standard 5-field expression.
pub fn cron_schedule(expr: &str) -> Result<Schedule> {
    let normalized = normalize_cron_expression(expr);
    Schedule::from_str(&normalized)
        .map_err(|e| FlowdError::invalid_trigger(expr, format!("invalid cron expression: {}", e)))
}

/// Convert a 5-field cron expression to the 7-field format the `cron` crate expects.
///
/// Standard cron: `min hour day month weekday` with Sunday as 0 (or 7).
/// Cron crate:    `sec min hour day month weekday year` with Sunday as 1.
fn normalize_cron_expression(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return expr.to_string();
    }
    format!(
        "0 {} {} {} {} {} *",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        shift_weekdays(fields[4])
    )
}

/// Shift numeric weekdays from the 0-based standard numbering to the crate's 1-based one.
fn shift_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((r, s)) => (r, Some(s)),
                None => (part, None),
            };
            if let Some(days) = step.and_then(|s| expand_stepped_range(range, s)) {
                return days;
            }
            let shifted = match range.split_once('-') {
                Some((start, end)) => match (start.parse::<u8>(), end.parse::<u8>()) {
                    (Ok(a), Ok(7)) if step.is_none() && a > 0 => format!("{}-7,1", a + 1),
                    (Ok(a), Ok(b)) => format!("{}-{}", a + 1, b.min(6) + 1),
                    _ => range.to_string(),
                },
                None => match range.parse::<u8>() {
                    Ok(7) => "1".to_string(),
                    Ok(n) => (n + 1).to_string(),
                    Err(_) => range.to_string(),
                },
            };
            match step {
                Some(s) => format!("{}/{}", shifted, s),
                None => shifted,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// `a-b/n` over standard weekdays as an explicit 1-based day list, so a range
/// ending on 7 keeps its Sunday.
fn expand_stepped_range(range: &str, step: &str) -> Option<String> {
    let (start, end) = range.split_once('-')?;
    let (a, b, n) = (start.parse::<u8>().ok()?, end.parse::<u8>().ok()?, step.parse::<u8>().ok()?);
    if n == 0 || a > b || b > 7 {
        return None;
    }
    let mut days: Vec<u8> = (a..=b).step_by(n as usize).map(|d| d % 7 + 1).collect();
    days.sort_unstable();
    days.dedup();
    Some(days.iter().map(u8::to_string).collect::<Vec<_>>().join(","))
}
