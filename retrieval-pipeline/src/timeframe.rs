use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

use common::error::AppError;

/// A half-open window over `created_at`, as carried by the SQUIRREL and
/// EPISODIC tool arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        if let Some(from) = self.from {
            if at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if at > to {
                return false;
            }
        }
        true
    }
}

/// Parse a timeframe argument.
///
/// Relative windows: `-60min`, `-2h`, `7d`, `1w` (the leading `-` is
/// optional, the window always ends at `now`). Absolute: `2025-03-01` for a
/// single day, `2025-03-01..2025-03-07` for an inclusive range.
pub fn parse_timeframe(input: &str, now: DateTime<Utc>) -> Result<TimeRange, AppError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("empty timeframe".into()));
    }

    if let Some((start, end)) = trimmed.split_once("..") {
        let from = parse_day(start)?;
        let to = parse_day(end)?;
        if to < from {
            return Err(AppError::Validation(format!(
                "timeframe range ends before it starts: {trimmed}"
            )));
        }
        return Ok(TimeRange {
            from: Some(from),
            to: Some(end_of_day(to)),
        });
    }

    if trimmed.contains('-') && trimmed.len() == 10 {
        let day = parse_day(trimmed)?;
        return Ok(TimeRange {
            from: Some(day),
            to: Some(end_of_day(day)),
        });
    }

    let relative = trimmed.strip_prefix('-').unwrap_or(trimmed);
    let split = relative
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| AppError::Validation(format!("timeframe missing unit: {trimmed}")))?;
    let (amount, unit) = relative.split_at(split);
    let amount: i64 = amount
        .parse()
        .map_err(|_| AppError::Validation(format!("bad timeframe amount: {trimmed}")))?;

    let duration = match unit {
        "min" | "m" => Duration::minutes(amount),
        "h" | "hr" | "hour" | "hours" => Duration::hours(amount),
        "d" | "day" | "days" => Duration::days(amount),
        "w" | "week" | "weeks" => Duration::weeks(amount),
        other => {
            return Err(AppError::Validation(format!(
                "unknown timeframe unit '{other}'"
            )))
        }
    };

    Ok(TimeRange {
        from: Some(now - duration),
        to: None,
    })
}

fn parse_day(input: &str) -> Result<DateTime<Utc>, AppError> {
    let date = NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::Validation(format!("bad timeframe date: {input}")))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| AppError::Validation(format!("bad timeframe date: {input}")))?;
    Ok(Utc.from_utc_datetime(&midnight))
}

fn end_of_day(start: DateTime<Utc>) -> DateTime<Utc> {
    start + Duration::days(1) - Duration::nanoseconds(1)
}
