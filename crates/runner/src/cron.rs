//! Five-field cron expressions (`min hour dom month dow`).
//!
//! Expressions are parsed once into a [`CronExpr`], so schedule validation
//! happens at load time. Evaluation is timezone-aware; day-of-week 0 and 7
//! both mean Sunday.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};

use wr_domain::{Error, Result};

/// Parse a timezone name, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Any,
    /// `*/n`
    Step(u32),
    /// Comma-separated values and ranges.
    Parts(Vec<Part>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Value(u32),
    Range(u32, u32),
}

impl Field {
    fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Step(n) => value % n == 0,
            Field::Parts(parts) => parts.iter().any(|p| match p {
                Part::Value(v) => value == *v,
                Part::Range(lo, hi) => value >= *lo && value <= *hi,
            }),
        }
    }
}

/// A validated cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: Field,
    hour: Field,
    dom: Field,
    month: Field,
    dow: Field,
}

impl CronExpr {
    /// Parse and validate. Field bounds: minute 0-59, hour 0-23, day 1-31,
    /// month 1-12, weekday 0-7 (7 normalizes to Sunday).
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::Validation(format!(
                "cron expression '{expr}' must have 5 fields, got {}",
                fields.len()
            )));
        }

        Ok(Self {
            minute: parse_field(fields[0], 0, 59, false)?,
            hour: parse_field(fields[1], 0, 23, false)?,
            dom: parse_field(fields[2], 1, 31, false)?,
            month: parse_field(fields[3], 1, 12, false)?,
            dow: parse_field(fields[4], 0, 7, true)?,
        })
    }

    fn matches_naive(&self, dt: &NaiveDateTime) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.dom.matches(dt.day())
            && self.month.matches(dt.month())
            && self.dow.matches(dt.weekday().num_days_from_sunday())
    }

    /// Whether a UTC instant matches (UTC shorthand).
    pub fn matches(&self, dt: &DateTime<Utc>) -> bool {
        self.matches_naive(&dt.naive_utc())
    }

    /// Next occurrence strictly after `after`, evaluated in `tz`.
    ///
    /// DST: local times inside a spring-forward gap are skipped; fall-back
    /// overlaps take the earliest (pre-transition) mapping.
    pub fn next_after(&self, after: &DateTime<Utc>, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let into_next_minute = 60 - i64::from(local.second());
        let mut candidate = local + chrono::Duration::seconds(into_next_minute);
        candidate = candidate.with_second(0).unwrap_or(candidate);
        candidate = candidate.with_nanosecond(0).unwrap_or(candidate);

        // Bounded scan: one year of minutes.
        let max_checks = 366 * 24 * 60;
        for _ in 0..max_checks {
            if self.matches_naive(&candidate) {
                match tz.from_local_datetime(&candidate) {
                    chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                    chrono::LocalResult::Ambiguous(earliest, _) => {
                        return Some(earliest.with_timezone(&Utc));
                    }
                    chrono::LocalResult::None => {
                        // Spring-forward gap; this local minute does not exist.
                    }
                }
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }
}

fn parse_field(raw: &str, min: u32, max: u32, is_dow: bool) -> Result<Field> {
    let bad = |detail: &str| Error::Validation(format!("invalid cron field '{raw}': {detail}"));

    if raw == "*" {
        return Ok(Field::Any);
    }

    if let Some(step) = raw.strip_prefix("*/") {
        let n: u32 = step.parse().map_err(|_| bad("step is not a number"))?;
        if n == 0 {
            return Err(bad("step of zero"));
        }
        return Ok(Field::Step(n));
    }

    let norm = |v: u32| if is_dow && v == 7 { 0 } else { v };
    let mut parts = Vec::new();
    for piece in raw.split(',') {
        if let Some((lo_s, hi_s)) = piece.split_once('-') {
            let lo: u32 = lo_s.parse().map_err(|_| bad("range start is not a number"))?;
            let hi: u32 = hi_s.parse().map_err(|_| bad("range end is not a number"))?;
            if lo < min || hi > max || lo > hi {
                return Err(bad(&format!("range {lo}-{hi} outside {min}-{max}")));
            }
            parts.push(Part::Range(norm(lo), norm(hi)));
        } else {
            let v: u32 = piece.parse().map_err(|_| bad("value is not a number"))?;
            if v < min || v > max {
                return Err(bad(&format!("value {v} outside {min}-{max}")));
            }
            parts.push(Part::Value(norm(v)));
        }
    }
    if parts.is_empty() {
        return Err(bad("empty field"));
    }
    Ok(Field::Parts(parts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parse_rejects_wrong_arity() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("* * * * * *").is_err());
        assert!(CronExpr::parse("").is_err());
    }

    #[test]
    fn parse_rejects_out_of_bounds() {
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("* 24 * * *").is_err());
        assert!(CronExpr::parse("* * 0 * *").is_err());
        assert!(CronExpr::parse("* * * 13 *").is_err());
        assert!(CronExpr::parse("* * * * 8").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("5-2 * * * *").is_err());
        assert!(CronExpr::parse("a * * * *").is_err());
    }

    #[test]
    fn every_five_minutes() {
        let expr = CronExpr::parse("*/5 * * * *").unwrap();
        assert!(expr.matches(&at(2024, 6, 15, 10, 0)));
        assert!(expr.matches(&at(2024, 6, 15, 10, 55)));
        assert!(!expr.matches(&at(2024, 6, 15, 10, 3)));
    }

    #[test]
    fn specific_time() {
        let expr = CronExpr::parse("30 9 * * *").unwrap();
        assert!(expr.matches(&at(2024, 6, 15, 9, 30)));
        assert!(!expr.matches(&at(2024, 6, 15, 10, 30)));
    }

    #[test]
    fn ranges_and_lists() {
        let hours = CronExpr::parse("0 9-17 * * *").unwrap();
        assert!(hours.matches(&at(2024, 6, 15, 10, 0)));
        assert!(!hours.matches(&at(2024, 6, 15, 20, 0)));

        let quarters = CronExpr::parse("0,15,30,45 * * * *").unwrap();
        assert!(quarters.matches(&at(2024, 6, 15, 10, 15)));
        assert!(!quarters.matches(&at(2024, 6, 15, 10, 20)));
    }

    #[test]
    fn dow_seven_is_sunday() {
        // 2024-06-16 is a Sunday.
        let with_seven = CronExpr::parse("0 12 * * 7").unwrap();
        let with_zero = CronExpr::parse("0 12 * * 0").unwrap();
        let sunday = at(2024, 6, 16, 12, 0);
        assert!(with_seven.matches(&sunday));
        assert!(with_zero.matches(&sunday));
        assert!(!with_seven.matches(&at(2024, 6, 17, 12, 0)));
    }

    #[test]
    fn next_after_finds_occurrence() {
        let expr = CronExpr::parse("30 * * * *").unwrap();
        let next = expr
            .next_after(&at(2024, 6, 15, 10, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!(next, at(2024, 6, 15, 10, 30));
    }

    #[test]
    fn next_after_is_strictly_after() {
        let expr = CronExpr::parse("0 * * * *").unwrap();
        let next = expr
            .next_after(&at(2024, 6, 15, 10, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!(next, at(2024, 6, 15, 11, 0));
    }

    #[test]
    fn next_after_respects_timezone() {
        let expr = CronExpr::parse("0 9 * * *").unwrap();
        let tz = parse_tz("US/Eastern");
        let next = expr.next_after(&at(2024, 6, 15, 12, 0), tz).unwrap();
        // 9am EDT is 13:00 UTC.
        assert_eq!(next.hour(), 13);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn spring_forward_gap_is_skipped() {
        let expr = CronExpr::parse("30 2 * * *").unwrap();
        let tz = parse_tz("US/Eastern");
        // 2:30am local does not exist on 2024-03-10; the next firing is the
        // following day.
        let next = expr.next_after(&at(2024, 3, 10, 6, 0), tz).unwrap();
        assert_eq!(next.day(), 11);
        assert_eq!(next.hour(), 6);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn fall_back_takes_earliest_mapping() {
        let expr = CronExpr::parse("30 1 * * *").unwrap();
        let tz = parse_tz("US/Eastern");
        let next = expr.next_after(&at(2024, 11, 3, 4, 0), tz).unwrap();
        assert_eq!(next.hour(), 5);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn parse_tz_falls_back_to_utc() {
        assert_eq!(parse_tz("Not/Real"), chrono_tz::UTC);
        assert_eq!(parse_tz("Europe/London"), chrono_tz::Europe::London);
    }
}
