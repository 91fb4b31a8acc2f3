// src/cycling/point.rs

//! Cycle points: integer or UTC calendar date-times.

use std::fmt;
use std::ops::{Add, Sub};
use std::sync::OnceLock;

use chrono::{Months, NaiveDate, NaiveDateTime, TimeDelta, Timelike};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cycling::interval::{CalendarDuration, Interval};
use crate::errors::{CycloramaError, Result};
use crate::types::CyclingMode;

/// A totally ordered point in the cycling domain.
///
/// Points of different modes never meet in a validated workflow; comparing
/// them orders every integer point before every calendar point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CyclePoint {
    Integer(i64),
    Calendar(NaiveDateTime),
}

fn calendar_point_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{4})(\d{2})?(\d{2})?(?:T(\d{2})(\d{2})?(\d{2})?)?(?:Z|\+00(?:00)?)?$")
            .expect("static regex")
    })
}

impl CyclePoint {
    /// Parse a point written in the given mode.
    ///
    /// Calendar points accept basic (`20240101T0600Z`) and extended
    /// (`2024-01-01T06:00Z`) ISO 8601 forms with reduced precision
    /// (`2024`, `202401`, `20240101T06`). Points are UTC.
    pub fn parse(s: &str, mode: CyclingMode) -> Result<Self> {
        let s = s.trim();
        let invalid = || CycloramaError::InvalidPoint(s.to_string());
        match mode {
            CyclingMode::Integer => s.parse::<i64>().map(CyclePoint::Integer).map_err(|_| invalid()),
            CyclingMode::Gregorian => {
                let compact: String = s.chars().filter(|c| *c != '-' && *c != ':').collect();
                let caps = calendar_point_re().captures(&compact).ok_or_else(invalid)?;
                let field = |i: usize, default: u32| -> Result<u32> {
                    match caps.get(i) {
                        Some(m) => m.as_str().parse::<u32>().map_err(|_| invalid()),
                        None => Ok(default),
                    }
                };
                let year: i32 = caps[1].parse().map_err(|_| invalid())?;
                let date = NaiveDate::from_ymd_opt(year, field(2, 1)?, field(3, 1)?)
                    .ok_or_else(invalid)?;
                let dt = date
                    .and_hms_opt(field(4, 0)?, field(5, 0)?, field(6, 0)?)
                    .ok_or_else(invalid)?;
                Ok(CyclePoint::Calendar(dt))
            }
        }
    }

    pub fn mode(&self) -> CyclingMode {
        match self {
            CyclePoint::Integer(_) => CyclingMode::Integer,
            CyclePoint::Calendar(_) => CyclingMode::Gregorian,
        }
    }

    /// Add an interval, returning `None` on overflow or mode mismatch.
    pub fn checked_add(&self, interval: &Interval) -> Option<CyclePoint> {
        match (self, interval) {
            (CyclePoint::Integer(p), Interval::Integer(n)) => p.checked_add(*n).map(CyclePoint::Integer),
            (CyclePoint::Calendar(dt), Interval::Calendar(d)) => {
                add_calendar(*dt, d).map(CyclePoint::Calendar)
            }
            _ => None,
        }
    }

    pub fn checked_sub(&self, interval: &Interval) -> Option<CyclePoint> {
        self.checked_add(&-*interval)
    }

    /// Exact difference `self - other`. Calendar differences are expressed
    /// in seconds.
    pub fn difference(&self, other: &CyclePoint) -> Option<Interval> {
        match (self, other) {
            (CyclePoint::Integer(a), CyclePoint::Integer(b)) => a.checked_sub(*b).map(Interval::Integer),
            (CyclePoint::Calendar(a), CyclePoint::Calendar(b)) => {
                let secs = (*a - *b).num_seconds();
                Some(Interval::Calendar(CalendarDuration {
                    months: 0,
                    days: 0,
                    seconds: secs,
                }))
            }
            _ => None,
        }
    }
}

fn add_calendar(dt: NaiveDateTime, d: &CalendarDuration) -> Option<NaiveDateTime> {
    let dt = if d.months >= 0 {
        dt.checked_add_months(Months::new(u32::try_from(d.months).ok()?))?
    } else {
        dt.checked_sub_months(Months::new(u32::try_from(-d.months).ok()?))?
    };
    let dt = dt.checked_add_signed(TimeDelta::try_days(d.days)?)?;
    dt.checked_add_signed(TimeDelta::try_seconds(d.seconds)?)
}

impl Add<Interval> for CyclePoint {
    type Output = CyclePoint;

    fn add(self, rhs: Interval) -> CyclePoint {
        self.checked_add(&rhs)
            .unwrap_or_else(|| panic!("cannot add interval {rhs} to cycle point {self}"))
    }
}

impl Sub<Interval> for CyclePoint {
    type Output = CyclePoint;

    fn sub(self, rhs: Interval) -> CyclePoint {
        self.checked_sub(&rhs)
            .unwrap_or_else(|| panic!("cannot subtract interval {rhs} from cycle point {self}"))
    }
}

impl fmt::Display for CyclePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CyclePoint::Integer(n) => write!(f, "{n}"),
            CyclePoint::Calendar(dt) => {
                if dt.second() == 0 {
                    write!(f, "{}", dt.format("%Y%m%dT%H%MZ"))
                } else {
                    write!(f, "{}", dt.format("%Y%m%dT%H%M%SZ"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cal(s: &str) -> CyclePoint {
        CyclePoint::parse(s, CyclingMode::Gregorian).unwrap()
    }

    #[test]
    fn parses_basic_and_extended_forms() {
        assert_eq!(cal("20240101T0600Z"), cal("2024-01-01T06:00Z"));
        assert_eq!(cal("2024").to_string(), "20240101T0000Z");
        assert_eq!(cal("20240229T12").to_string(), "20240229T1200Z");
        assert!(CyclePoint::parse("20230229", CyclingMode::Gregorian).is_err());
        assert!(CyclePoint::parse("tomorrow", CyclingMode::Gregorian).is_err());
    }

    #[test]
    fn month_arithmetic_clamps_to_month_end() {
        let p = cal("20240131");
        let next = p + Interval::parse("P1M", CyclingMode::Gregorian).unwrap();
        assert_eq!(next, cal("20240229"));
    }

    #[test]
    fn integer_arithmetic_and_ordering() {
        let p = CyclePoint::Integer(3);
        assert_eq!(p + Interval::Integer(2), CyclePoint::Integer(5));
        assert_eq!(p - Interval::Integer(4), CyclePoint::Integer(-1));
        assert!(CyclePoint::Integer(1) < CyclePoint::Integer(2));
        assert_eq!(
            CyclePoint::Integer(7).difference(&CyclePoint::Integer(3)),
            Some(Interval::Integer(4))
        );
    }

    #[test]
    fn mode_mismatch_is_none() {
        let p = CyclePoint::Integer(1);
        let iv = Interval::parse("PT1H", CyclingMode::Gregorian).unwrap();
        assert!(p.checked_add(&iv).is_none());
    }
}
