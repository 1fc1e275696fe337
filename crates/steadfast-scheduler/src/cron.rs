//! Five-field cron expressions.
//!
//! Grammar per field: `*`, an integer, `a-b` ranges, `a,b,c` lists and
//! `*/n` steps (n ≥ 1). Fields are minute, hour, day-of-month, month and
//! day-of-week (0 = Sunday), all matched conjunctively. Malformed input
//! (wrong field count, out-of-range values, zero steps, empty tokens) is
//! rejected at parse time.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use steadfast_core::ConfigError;

const FIELDS: [(&str, u8, u8); 5] = [
    ("minute", 0, 59),
    ("hour", 0, 23),
    ("day-of-month", 1, 31),
    ("month", 1, 12),
    ("day-of-week", 0, 6),
];

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    expression: String,
    minutes: Vec<u8>,
    hours: Vec<u8>,
    days_of_month: Vec<u8>,
    months: Vec<u8>,
    days_of_week: Vec<u8>,
}

impl CronExpr {
    /// Parse and validate a 5-field expression.
    pub fn parse(expression: &str) -> Result<Self, ConfigError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ConfigError::new(
                "cron",
                format!(
                    "expected 5 fields (minute hour day-of-month month day-of-week), got {}",
                    fields.len()
                ),
            ));
        }

        let mut parsed: Vec<Vec<u8>> = Vec::with_capacity(5);
        for (field, (name, min, max)) in fields.iter().zip(FIELDS) {
            parsed.push(parse_field(field, name, min, max)?);
        }
        let mut parsed = parsed.into_iter();

        Ok(Self {
            expression: expression.to_string(),
            minutes: parsed.next().unwrap(),
            hours: parsed.next().unwrap(),
            days_of_month: parsed.next().unwrap(),
            months: parsed.next().unwrap(),
            days_of_week: parsed.next().unwrap(),
        })
    }

    /// The source expression.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether the given instant (truncated to the minute) matches.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minutes.contains(&(at.minute() as u8))
            && self.hours.contains(&(at.hour() as u8))
            && self.days_of_month.contains(&(at.day() as u8))
            && self.months.contains(&(at.month() as u8))
            && self
                .days_of_week
                .contains(&(at.weekday().num_days_from_sunday() as u8))
    }

    /// The next matching instant strictly after `from`. `None` when no
    /// match exists within the search horizon (e.g. February 30th).
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Scan day by day, then pick the first allowed hour/minute. Four
        // years bounds the search past any leap-year-only date.
        let start_day = from.date_naive();
        for day_offset in 0..=(4 * 366) {
            let date = start_day + ChronoDuration::days(day_offset);
            if !self.months.contains(&(date.month() as u8))
                || !self.days_of_month.contains(&(date.day() as u8))
                || !self
                    .days_of_week
                    .contains(&(date.weekday().num_days_from_sunday() as u8))
            {
                continue;
            }

            for &hour in &self.hours {
                for &minute in &self.minutes {
                    let candidate = Utc
                        .with_ymd_and_hms(
                            date.year(),
                            date.month(),
                            date.day(),
                            hour as u32,
                            minute as u32,
                            0,
                        )
                        .single()?;
                    if candidate > from {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }
}

fn parse_field(field: &str, name: &str, min: u8, max: u8) -> Result<Vec<u8>, ConfigError> {
    let invalid = |message: String| Err(ConfigError::new("cron", message));
    if field.is_empty() {
        return invalid(format!("{name} field is empty"));
    }

    let mut allowed: Vec<u8> = Vec::new();
    for token in field.split(',') {
        if token.is_empty() {
            return invalid(format!("{name} field contains an empty token"));
        }

        if token == "*" {
            allowed.extend(min..=max);
        } else if let Some(step) = token.strip_prefix("*/") {
            let step: u64 = step
                .parse()
                .map_err(|_| ConfigError::new("cron", format!("{name} step '{step}' is not a number")))?;
            if step == 0 {
                return invalid(format!("{name} step must be at least 1"));
            }
            allowed.extend((min..=max).filter(|v| ((v - min) as u64) % step == 0));
        } else if let Some((lo, hi)) = token.split_once('-') {
            let lo = parse_value(lo, name, min, max)?;
            let hi = parse_value(hi, name, min, max)?;
            if lo > hi {
                return invalid(format!("{name} range '{token}' is inverted"));
            }
            allowed.extend(lo..=hi);
        } else {
            allowed.push(parse_value(token, name, min, max)?);
        }
    }

    allowed.sort_unstable();
    allowed.dedup();
    Ok(allowed)
}

fn parse_value(token: &str, name: &str, min: u8, max: u8) -> Result<u8, ConfigError> {
    let value: u8 = token.parse().map_err(|_| {
        ConfigError::new("cron", format!("{name} value '{token}' is not a number"))
    })?;
    if value < min || value > max {
        return Err(ConfigError::new(
            "cron",
            format!("{name} value {value} is outside {min}-{max}"),
        ));
    }
    Ok(value)
}
