// src/cycling/interval.rs

//! Signed intervals between cycle points.
//!
//! Integer workflows use intervals like `P1` / `-P2`; calendar workflows use
//! ISO 8601 durations (`PT6H`, `P1Y2M`, `-P1D`, `P2W`). Years are folded into
//! months so that `P1Y` and `P12M` compare equal.

use std::fmt;
use std::ops::Neg;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{CycloramaError, Result};
use crate::types::CyclingMode;

/// Nominal calendar duration. Components may carry a sign; a negative
/// interval has every component `<= 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CalendarDuration {
    pub months: i64,
    pub days: i64,
    pub seconds: i64,
}

impl CalendarDuration {
    pub fn has_months(&self) -> bool {
        self.months != 0
    }

    fn is_zero(&self) -> bool {
        self.months == 0 && self.days == 0 && self.seconds == 0
    }
}

/// An interval in either cycling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    Integer(i64),
    Calendar(CalendarDuration),
}

fn integer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([+-])?P(\d+)$").expect("static regex"))
}

fn calendar_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^([+-])?P(?:(\d+)Y)?(?:(\d+)M)?(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$",
        )
        .expect("static regex")
    })
}

impl Interval {
    /// Parse an interval string for the given cycling mode.
    pub fn parse(s: &str, mode: CyclingMode) -> Result<Self> {
        let s = s.trim();
        match mode {
            CyclingMode::Integer => {
                let caps = integer_re()
                    .captures(s)
                    .ok_or_else(|| CycloramaError::InvalidInterval(s.to_string()))?;
                let n: i64 = caps[2]
                    .parse()
                    .map_err(|_| CycloramaError::InvalidInterval(s.to_string()))?;
                let negative = caps.get(1).is_some_and(|m| m.as_str() == "-");
                Ok(Interval::Integer(if negative { -n } else { n }))
            }
            CyclingMode::Gregorian => {
                let caps = calendar_re()
                    .captures(s)
                    .ok_or_else(|| CycloramaError::InvalidInterval(s.to_string()))?;
                if (2..=8).all(|i| caps.get(i).is_none()) || s.ends_with('T') {
                    return Err(CycloramaError::InvalidInterval(s.to_string()));
                }
                let num = |i: usize| -> Result<i64> {
                    match caps.get(i) {
                        Some(m) => m
                            .as_str()
                            .parse::<i64>()
                            .map_err(|_| CycloramaError::InvalidInterval(s.to_string())),
                        None => Ok(0),
                    }
                };
                let mut dur = CalendarDuration {
                    months: num(2)? * 12 + num(3)?,
                    days: num(4)? * 7 + num(5)?,
                    seconds: num(6)? * 3600 + num(7)? * 60 + num(8)?,
                };
                if caps.get(1).is_some_and(|m| m.as_str() == "-") {
                    dur = CalendarDuration {
                        months: -dur.months,
                        days: -dur.days,
                        seconds: -dur.seconds,
                    };
                }
                Ok(Interval::Calendar(dur))
            }
        }
    }

    pub fn mode(&self) -> CyclingMode {
        match self {
            Interval::Integer(_) => CyclingMode::Integer,
            Interval::Calendar(_) => CyclingMode::Gregorian,
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Interval::Integer(n) => *n == 0,
            Interval::Calendar(d) => d.is_zero(),
        }
    }

    /// Strictly positive: usable as a recurrence step.
    pub fn is_positive(&self) -> bool {
        match self {
            Interval::Integer(n) => *n > 0,
            Interval::Calendar(d) => {
                d.months >= 0 && d.days >= 0 && d.seconds >= 0 && !d.is_zero()
            }
        }
    }

    pub fn is_negative(&self) -> bool {
        match self {
            Interval::Integer(n) => *n < 0,
            Interval::Calendar(d) => {
                d.months <= 0 && d.days <= 0 && d.seconds <= 0 && !d.is_zero()
            }
        }
    }

    /// Multiply every component by `k`, or `None` on overflow.
    pub fn scaled(&self, k: i64) -> Option<Interval> {
        match self {
            Interval::Integer(n) => n.checked_mul(k).map(Interval::Integer),
            Interval::Calendar(d) => Some(Interval::Calendar(CalendarDuration {
                months: d.months.checked_mul(k)?,
                days: d.days.checked_mul(k)?,
                seconds: d.seconds.checked_mul(k)?,
            })),
        }
    }

    /// Wall-clock length of a non-negative calendar interval without month
    /// components. Used for retry and polling delays.
    pub fn to_std_duration(&self) -> Option<Duration> {
        match self {
            Interval::Calendar(d) if !d.has_months() && d.days >= 0 && d.seconds >= 0 => {
                let secs = d.days.checked_mul(86_400)?.checked_add(d.seconds)?;
                Some(Duration::from_secs(u64::try_from(secs).ok()?))
            }
            _ => None,
        }
    }
}

impl Neg for Interval {
    type Output = Interval;

    fn neg(self) -> Interval {
        match self {
            Interval::Integer(n) => Interval::Integer(-n),
            Interval::Calendar(d) => Interval::Calendar(CalendarDuration {
                months: -d.months,
                days: -d.days,
                seconds: -d.seconds,
            }),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interval::Integer(n) if *n < 0 => write!(f, "-P{}", -n),
            Interval::Integer(n) => write!(f, "P{n}"),
            Interval::Calendar(d) => {
                if d.is_zero() {
                    return write!(f, "P0Y");
                }
                let negative = d.months <= 0 && d.days <= 0 && d.seconds <= 0;
                let (months, days, seconds) = if negative {
                    (-d.months, -d.days, -d.seconds)
                } else {
                    (d.months, d.days, d.seconds)
                };
                if negative {
                    write!(f, "-")?;
                }
                write!(f, "P")?;
                let (years, months) = (months / 12, months % 12);
                if years != 0 {
                    write!(f, "{years}Y")?;
                }
                if months != 0 {
                    write!(f, "{months}M")?;
                }
                if days != 0 {
                    write!(f, "{days}D")?;
                }
                if seconds != 0 {
                    write!(f, "T")?;
                    let (h, rem) = (seconds / 3600, seconds % 3600);
                    let (m, s) = (rem / 60, rem % 60);
                    if h != 0 {
                        write!(f, "{h}H")?;
                    }
                    if m != 0 {
                        write!(f, "{m}M")?;
                    }
                    if s != 0 {
                        write!(f, "{s}S")?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Parse an ISO 8601 duration such as `PT30S` into a wall-clock delay.
pub fn parse_delay(s: &str) -> Result<Duration> {
    Interval::parse(s, CyclingMode::Gregorian)?
        .to_std_duration()
        .ok_or_else(|| {
            CycloramaError::InvalidInterval(format!(
                "{s}: delays must be non-negative and free of month/year components"
            ))
        })
}

/// Parse a list of delays, e.g. `["PT0S", "PT1S", "PT1S"]`.
pub fn parse_delays<S: AsRef<str>>(items: &[S]) -> Result<Vec<Duration>> {
    items.iter().map(|s| parse_delay(s.as_ref())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_calendar_components() {
        let iv = Interval::parse("P1Y2M3DT4H5M6S", CyclingMode::Gregorian).unwrap();
        assert_eq!(
            iv,
            Interval::Calendar(CalendarDuration {
                months: 14,
                days: 3,
                seconds: 4 * 3600 + 5 * 60 + 6
            })
        );
        assert_eq!(iv.to_string(), "P1Y2M3DT4H5M6S");
    }

    #[test]
    fn negative_and_weeks() {
        let iv = Interval::parse("-P2W", CyclingMode::Gregorian).unwrap();
        assert!(iv.is_negative());
        assert_eq!(iv.to_string(), "-P14D");
    }

    #[test]
    fn integer_mode() {
        assert_eq!(Interval::parse("-P3", CyclingMode::Integer).unwrap(), Interval::Integer(-3));
        assert!(Interval::parse("PT1H", CyclingMode::Integer).is_err());
        assert!(Interval::parse("P", CyclingMode::Gregorian).is_err());
        assert!(Interval::parse("PT", CyclingMode::Gregorian).is_err());
    }

    #[test]
    fn delays() {
        let delays = parse_delays(&["PT0S", "PT1S", "PT1M"]).unwrap();
        assert_eq!(
            delays,
            vec![Duration::ZERO, Duration::from_secs(1), Duration::from_secs(60)]
        );
        assert!(parse_delay("P1M").is_err());
        assert!(parse_delay("-PT1S").is_err());
    }
}
