// Minimal 5-field cron expressions
// minute hour day-of-month month day-of-week, with *, */n, a, a-b, a-b/n and
// comma lists. Day-of-week accepts 0-7 (0 and 7 are Sunday).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, TimeZone, Timelike};

use crate::error::{Result, SiftError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    /// Field was `*` (or `*/1`), which matters for day matching
    any: bool,
}

impl Field {
    fn contains(&self, v: u32) -> bool {
        self.bits & (1u64 << v) != 0
    }
}

fn parse_field(spec: &str, min: u32, max: u32, name: &str) -> Result<Field> {
    let invalid = |why: &str| SiftError::Invalid(format!("cron {} field '{}': {}", name, spec, why));
    let parse_num = |s: &str| -> Result<u32> {
        let v: u32 = s.parse().map_err(|_| invalid("not a number"))?;
        if v < min || v > max {
            return Err(invalid(&format!("{} out of range {}-{}", v, min, max)));
        }
        Ok(v)
    };

    let mut bits = 0u64;
    let mut any = false;
    for part in spec.split(',') {
        if part.is_empty() {
            return Err(invalid("empty list element"));
        }
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| invalid("bad step"))?;
                if step == 0 {
                    return Err(invalid("step must be positive"));
                }
                (r, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            if step == 1 {
                any = true;
            }
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (parse_num(a)?, parse_num(b)?);
            if a > b {
                return Err(invalid("range start after end"));
            }
            (a, b)
        } else {
            let v = parse_num(range)?;
            // "5/15" means 5 through max in steps of 15
            if part.contains('/') {
                (v, max)
            } else {
                (v, v)
            }
        };
        let mut v = lo;
        while v <= hi {
            bits |= 1u64 << v;
            v += step;
        }
    }
    Ok(Field { bits, any })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(SiftError::Invalid(format!(
                "cron expression '{}' must have 5 fields, got {}",
                expr,
                parts.len()
            )));
        }
        let mut days_of_week = parse_field(parts[4], 0, 7, "day-of-week")?;
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits | 1) & !(1u64 << 7);
        }
        Ok(Self {
            source: parts.join(" "),
            minutes: parse_field(parts[0], 0, 59, "minute")?,
            hours: parse_field(parts[1], 0, 23, "hour")?,
            days_of_month: parse_field(parts[2], 1, 31, "day-of-month")?,
            months: parse_field(parts[3], 1, 12, "month")?,
            days_of_week,
        })
    }

    /// Whether the schedule fires in the minute containing `t`.
    pub fn matches<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        if !self.minutes.contains(t.minute()) || !self.hours.contains(t.hour()) || !self.months.contains(t.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(t.day());
        let dow = self.days_of_week.contains(t.weekday().num_days_from_sunday());
        // Classic cron: when both day fields are restricted, either may match
        match (self.days_of_month.any, self.days_of_week.any) {
            (true, true) => true,
            (true, false) => dow,
            (false, true) => dom,
            (false, false) => dom || dow,
        }
    }
}

impl FromStr for CronSchedule {
    type Err = SiftError;

    fn from_str(s: &str) -> Result<Self> {
        CronSchedule::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_every_minute() {
        let s = CronSchedule::parse("* * * * *").unwrap();
        assert!(s.matches(&at(2024, 5, 17, 13, 42)));
    }

    #[test]
    fn test_steps_ranges_lists() {
        let s = CronSchedule::parse("*/15 2-4 * * *").unwrap();
        assert!(s.matches(&at(2024, 1, 1, 3, 30)));
        assert!(!s.matches(&at(2024, 1, 1, 3, 31)));
        assert!(!s.matches(&at(2024, 1, 1, 5, 0)));

        let s = CronSchedule::parse("0,30 0-12/6 * * *").unwrap();
        assert!(s.matches(&at(2024, 1, 1, 6, 30)));
        assert!(s.matches(&at(2024, 1, 1, 12, 0)));
        assert!(!s.matches(&at(2024, 1, 1, 7, 0)));

        let s = CronSchedule::parse("5/20 * * * *").unwrap();
        assert!(s.matches(&at(2024, 1, 1, 0, 45)));
        assert!(!s.matches(&at(2024, 1, 1, 0, 0)));
    }

    #[test]
    fn test_day_fields_or_semantics() {
        // 1st of the month OR any Monday
        let s = CronSchedule::parse("0 0 1 * 1").unwrap();
        assert!(s.matches(&at(2024, 5, 1, 0, 0))); // Wednesday the 1st
        assert!(s.matches(&at(2024, 5, 6, 0, 0))); // Monday
        assert!(!s.matches(&at(2024, 5, 7, 0, 0)));

        // Only weekday restricted
        let s = CronSchedule::parse("0 3 * * 0").unwrap();
        assert!(s.matches(&at(2024, 5, 5, 3, 0))); // Sunday
        assert!(!s.matches(&at(2024, 5, 6, 3, 0)));
    }

    #[test]
    fn test_sunday_as_seven() {
        let s = CronSchedule::parse("0 0 * * 7").unwrap();
        assert!(s.matches(&at(2024, 5, 5, 0, 0)));
    }

    #[test]
    fn test_rejects_bad_expressions() {
        for bad in ["", "* * * *", "60 * * * *", "* 24 * * *", "* * 0 * *", "*/0 * * * *", "5-1 * * * *", "a * * * *", "1,,2 * * * *"] {
            assert!(CronSchedule::parse(bad).is_err(), "{}", bad);
        }
    }
}
