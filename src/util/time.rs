//! Timestamp parsing for collaborator-supplied scheduling fields.
//!
//! The store itself speaks RFC 3339 only; this module exists so callers
//! can accept friendlier inputs for `due_at`/`defer_until` and hand the
//! engine a proper `DateTime<Utc>`.

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::error::{BeadsError, Result};

/// Parse a timestamp from any of:
/// - RFC 3339 (`2026-03-01T12:00:00Z`)
/// - a bare date (`2026-03-01`, read as 09:00 local)
/// - a relative offset (`+30m`, `+4h`, `+2d`, `+1w`)
/// - the keywords `tomorrow` / `next-week`
///
/// # Errors
///
/// `Validation` naming `field` when nothing matches or local time is
/// ambiguous (DST transitions).
pub fn parse_timestamp(input: &str, field: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return local_morning(date, field);
    }

    if let Some(dt) = parse_offset(input) {
        return Ok(dt);
    }

    match input.to_lowercase().as_str() {
        "tomorrow" => local_morning(Local::now().date_naive() + Duration::days(1), field),
        "next-week" | "nextweek" => {
            local_morning(Local::now().date_naive() + Duration::weeks(1), field)
        }
        _ => Err(BeadsError::validation(
            field,
            "unrecognized time (try RFC 3339, 2026-03-01, +2d, tomorrow)",
        )),
    }
}

fn local_morning(date: NaiveDate, field: &str) -> Result<DateTime<Utc>> {
    let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default();
    Local
        .from_local_datetime(&date.and_time(nine))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| BeadsError::validation(field, "ambiguous local time"))
}

/// `+30m` / `-2d` style offsets relative to now. Returns `None` when the
/// input is not an offset at all.
#[must_use]
pub fn parse_offset(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    let rest = input.strip_prefix(['+', '-'])?;
    let negative = input.starts_with('-');
    let unit = rest.chars().last()?;
    let amount: i64 = rest[..rest.len() - 1].parse().ok()?;
    let amount = if negative { -amount } else { amount };
    let delta = match unit {
        'm' => Duration::minutes(amount),
        'h' => Duration::hours(amount),
        'd' => Duration::days(amount),
        'w' => Duration::weeks(amount),
        _ => return None,
    };
    Some(Utc::now() + delta)
}
