//! Cron expressions and time zones of recurring jobs.

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::ValidationError;

/// Largest accepted UTC offset, in hours.
const MAX_OFFSET_HOURS: i32 = 14;

/// A parsed cron expression.
///
/// Accepts the classic 5-field form (minute first) as well as the 6/7-field
/// form with a leading seconds field. Five-field expressions fire at second 0.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: ::cron::Schedule,
}

impl CronSchedule {
    /// Parse `expression`; it must also fire at least once in the future.
    pub fn parse(expression: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidCron {
            expression: expression.to_string(),
            reason,
        };

        let trimmed = expression.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            n => return Err(invalid(format!("expected 5 to 7 fields, got {n}"))),
        };

        let schedule = ::cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        if schedule.upcoming(Utc).next().is_none() {
            return Err(invalid("the expression never fires".to_string()));
        }

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    /// The expression as given by the caller.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `after`, evaluated in `zone`.
    pub fn next_after<Z: TimeZone>(
        &self,
        after: DateTime<Utc>,
        zone: &Z,
    ) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(zone))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }

    /// [`next_after`](Self::next_after) in a recurring job's stored zone.
    pub fn next_in(&self, after: DateTime<Utc>, zone: &JobTimeZone) -> Option<DateTime<Utc>> {
        match zone {
            JobTimeZone::Named(tz) => self.next_after(after, tz),
            JobTimeZone::Fixed(offset) => self.next_after(after, offset),
        }
    }
}

/// The zone a recurring job's cron expression is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTimeZone {
    /// An IANA zone such as `Europe/Berlin`; daylight saving is honoured.
    Named(Tz),
    /// A constant offset from UTC.
    Fixed(FixedOffset),
}

/// Parse a time zone id: an IANA name (`Europe/Berlin`, `UTC`), `Z`, or a
/// fixed offset such as `+02:00`, `-0530` or `+03`.
pub fn parse_time_zone(id: &str) -> Result<JobTimeZone, ValidationError> {
    let trimmed = id.trim();

    if ["utc", "z", "etc/utc", "gmt"]
        .iter()
        .any(|name| trimmed.eq_ignore_ascii_case(name))
    {
        return Ok(JobTimeZone::Named(Tz::UTC));
    }
    if let Ok(tz) = Tz::from_str(trimmed) {
        return Ok(JobTimeZone::Named(tz));
    }
    parse_offset(trimmed)
        .map(JobTimeZone::Fixed)
        .ok_or_else(|| ValidationError::InvalidTimeZone(id.to_string()))
}

fn parse_offset(offset: &str) -> Option<FixedOffset> {
    let (sign, rest) = match offset.as_bytes().first() {
        Some(b'+') => (1, &offset[1..]),
        Some(b'-') => (-1, &offset[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > MAX_OFFSET_HOURS || minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn utc() -> JobTimeZone {
        parse_time_zone("UTC").unwrap()
    }

    #[test]
    fn five_field_expressions_fire_at_second_zero() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 10, 7, 30).unwrap();
        let next = schedule.next_in(after, &utc()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap());
        assert_eq!(schedule.expression(), "*/15 * * * *");
    }

    #[test]
    fn six_field_expressions_keep_their_seconds() {
        let schedule = CronSchedule::parse("30 0 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let next = schedule.next_in(after, &utc()).unwrap();
        assert_eq!(next.second(), 30);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        for expression in ["", "* * *", "61 * * * *", "not a cron at all"] {
            assert!(
                matches!(
                    CronSchedule::parse(expression),
                    Err(ValidationError::InvalidCron { .. })
                ),
                "{expression:?} should be rejected"
            );
        }
    }

    #[test]
    fn expressions_without_future_occurrences_are_rejected() {
        assert!(CronSchedule::parse("0 0 0 1 1 * 2001").is_err());
    }

    #[test]
    fn occurrences_follow_the_time_zone() {
        let schedule = CronSchedule::parse("0 9 * * *").unwrap();
        let zone = parse_time_zone("+02:00").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let next = schedule.next_in(after, &zone).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap());
    }

    #[test]
    fn named_zones_follow_daylight_saving() {
        let schedule = CronSchedule::parse("0 9 * * *").unwrap();
        let berlin = parse_time_zone("Europe/Berlin").unwrap();
        assert_eq!(berlin, JobTimeZone::Named(chrono_tz::Europe::Berlin));

        let winter = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(
            schedule.next_in(winter, &berlin).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap()
        );
        let summer = Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap();
        assert_eq!(
            schedule.next_in(summer, &berlin).unwrap(),
            Utc.with_ymd_and_hms(2024, 7, 15, 7, 0, 0).unwrap()
        );
    }

    #[test]
    fn time_zone_forms() {
        let fixed = |seconds| JobTimeZone::Fixed(FixedOffset::east_opt(seconds).unwrap());
        assert_eq!(parse_time_zone("Z").unwrap(), JobTimeZone::Named(Tz::UTC));
        assert_eq!(parse_time_zone("-0530").unwrap(), fixed(-(5 * 3600 + 30 * 60)));
        assert_eq!(parse_time_zone("+03").unwrap(), fixed(3 * 3600));
        for bad in ["Europe/Nowhere", "+25:00", "+02:75", "0200", "+"] {
            assert!(
                matches!(parse_time_zone(bad), Err(ValidationError::InvalidTimeZone(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
