// src/cycling/recurrence.rs

//! Parsing of recurrence expressions (the keys of `[scheduling.graph]`).
//!
//! Supported forms (`^` = initial point, `$` = final point):
//!
//! | form                          | meaning                                   |
//! |-------------------------------|-------------------------------------------|
//! | `R1`, `R1/^`                  | once, at the initial point                |
//! | `R1/$`                        | once, at the final point                  |
//! | `R1/<point>`                  | once, at `<point>`                        |
//! | `<interval>`                  | every `<interval>` from the initial point |
//! | `+<offset>/<interval>`        | every `<interval>` from `^ + offset`      |
//! | `R/<point>/<interval>`        | every `<interval>` from `<point>`         |
//! | `R<n>/<point>/<interval>`     | `n` times from `<point>`                  |
//! | `R<n>/<interval>`             | `n` times from the initial point          |
//! | `R<n>/<interval>/<point>`     | `n` times, ending at `<point>`            |
//!
//! `<point>` may be a literal point, `^`, `$`, or either anchor followed by
//! an offset (`^+PT6H`, `$-P1`).

use crate::cycling::interval::Interval;
use crate::cycling::point::CyclePoint;
use crate::cycling::sequence::Sequence;
use crate::errors::{CycloramaError, Result};
use crate::types::CyclingMode;

/// Workflow-wide bounds a recurrence is resolved against.
#[derive(Debug, Clone, Copy)]
pub struct RecurrenceContext {
    pub mode: CyclingMode,
    pub initial: CyclePoint,
    pub final_point: Option<CyclePoint>,
}

impl RecurrenceContext {
    pub fn new(mode: CyclingMode, initial: CyclePoint, final_point: Option<CyclePoint>) -> Self {
        Self {
            mode,
            initial,
            final_point,
        }
    }

    fn invalid(&self, expr: &str, why: &str) -> CycloramaError {
        CycloramaError::InvalidRecurrence(format!("{expr}: {why}"))
    }

    fn is_interval(&self, token: &str) -> bool {
        let t = token.trim_start_matches(['+', '-']);
        t.starts_with('P') && Interval::parse(token, self.mode).is_ok()
    }

    /// Resolve a point token: literal point, `^`, `$`, or anchored offset.
    pub fn resolve_point(&self, token: &str, expr: &str) -> Result<CyclePoint> {
        let token = token.trim();
        let (anchor, rest) = if let Some(rest) = token.strip_prefix('^') {
            (Some(self.initial), rest)
        } else if let Some(rest) = token.strip_prefix('$') {
            let fp = self
                .final_point
                .ok_or_else(|| self.invalid(expr, "'$' used without a final cycle point"))?;
            (Some(fp), rest)
        } else if token.starts_with('+') || (token.starts_with('-') && self.is_interval(token)) {
            (Some(self.initial), token)
        } else {
            (None, token)
        };

        match anchor {
            Some(base) if rest.is_empty() => Ok(base),
            Some(base) => {
                let offset = Interval::parse(rest, self.mode)?;
                base.checked_add(&offset)
                    .ok_or_else(|| self.invalid(expr, "offset overflows the cycling domain"))
            }
            None => CyclePoint::parse(rest, self.mode),
        }
    }

    fn step(&self, token: &str, expr: &str) -> Result<Interval> {
        let step = Interval::parse(token, self.mode)?;
        if !step.is_positive() {
            return Err(self.invalid(expr, "recurrence interval must be positive"));
        }
        Ok(step)
    }

    fn build(
        &self,
        expr: &str,
        start: CyclePoint,
        step: Option<Interval>,
        repetitions: Option<u64>,
    ) -> Sequence {
        Sequence::new(expr, start, step, repetitions, self.initial, self.final_point)
    }
}

fn parse_repetitions(head: &str, expr: &str) -> Result<Option<u64>> {
    let digits = &head[1..];
    if digits.is_empty() {
        return Ok(None);
    }
    let n: u64 = digits
        .parse()
        .map_err(|_| CycloramaError::InvalidRecurrence(format!("{expr}: bad repetition count")))?;
    if n == 0 {
        return Err(CycloramaError::InvalidRecurrence(format!(
            "{expr}: repetition count must be at least 1"
        )));
    }
    Ok(Some(n))
}

/// Parse a recurrence expression into a [`Sequence`].
pub fn parse_recurrence(expr: &str, ctx: &RecurrenceContext) -> Result<Sequence> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(ctx.invalid(expr, "empty recurrence"));
    }
    let parts: Vec<&str> = expr.split('/').map(str::trim).collect();

    if parts[0].starts_with('R') {
        let reps = parse_repetitions(parts[0], expr)?;
        return match parts.as_slice() {
            [_] => match reps {
                Some(1) => Ok(ctx.build(expr, ctx.initial, None, Some(1))),
                _ => Err(ctx.invalid(expr, "only R1 may omit a start point and interval")),
            },
            [_, second] if ctx.is_interval(second) => {
                let step = ctx.step(second, expr)?;
                Ok(ctx.build(expr, ctx.initial, Some(step), reps))
            }
            [_, point] => match reps {
                Some(1) => {
                    let start = ctx.resolve_point(point, expr)?;
                    Ok(ctx.build(expr, start, None, Some(1)))
                }
                _ => Err(ctx.invalid(expr, "a single point needs R1")),
            },
            [_, second, third] if ctx.is_interval(second) => {
                // R<n>/<interval>/<end>: count back from the end point.
                let n = reps.ok_or_else(|| {
                    ctx.invalid(expr, "an end-anchored recurrence needs a repetition count")
                })?;
                let step = ctx.step(second, expr)?;
                let end = ctx.resolve_point(third, expr)?;
                let back = i64::try_from(n - 1)
                    .ok()
                    .and_then(|k| step.scaled(k))
                    .and_then(|span| end.checked_sub(&span))
                    .ok_or_else(|| ctx.invalid(expr, "start point overflows the cycling domain"))?;
                Ok(ctx.build(expr, back, Some(step), Some(n)))
            }
            [_, point, interval] => {
                let start = ctx.resolve_point(point, expr)?;
                let step = ctx.step(interval, expr)?;
                Ok(ctx.build(expr, start, Some(step), reps))
            }
            _ => Err(ctx.invalid(expr, "too many '/' separated parts")),
        };
    }

    match parts.as_slice() {
        [interval] if ctx.is_interval(interval) && !interval.starts_with(['+', '-']) => {
            let step = ctx.step(interval, expr)?;
            Ok(ctx.build(expr, ctx.initial, Some(step), None))
        }
        [offset, interval] if offset.starts_with(['+', '-', '^']) => {
            let start = ctx.resolve_point(offset, expr)?;
            let step = ctx.step(interval, expr)?;
            Ok(ctx.build(expr, start, Some(step), None))
        }
        [point, interval] => {
            let start = ctx.resolve_point(point, expr)?;
            let step = ctx.step(interval, expr)?;
            Ok(ctx.build(expr, start, Some(step), None))
        }
        _ => Err(ctx.invalid(expr, "unrecognised recurrence form")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_ctx(initial: i64, final_point: Option<i64>) -> RecurrenceContext {
        RecurrenceContext::new(
            CyclingMode::Integer,
            CyclePoint::Integer(initial),
            final_point.map(CyclePoint::Integer),
        )
    }

    fn points(expr: &str, ctx: &RecurrenceContext) -> Vec<i64> {
        parse_recurrence(expr, ctx)
            .unwrap()
            .iter()
            .take(10)
            .map(|p| match p {
                CyclePoint::Integer(n) => n,
                CyclePoint::Calendar(_) => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn integer_forms() {
        let ctx = int_ctx(1, Some(10));
        assert_eq!(points("R1", &ctx), vec![1]);
        assert_eq!(points("R1/$", &ctx), vec![10]);
        assert_eq!(points("R1/^+P2", &ctx), vec![3]);
        assert_eq!(points("P3", &ctx), vec![1, 4, 7, 10]);
        assert_eq!(points("+P1/P3", &ctx), vec![2, 5, 8]);
        assert_eq!(points("R2/P4", &ctx), vec![1, 5]);
        assert_eq!(points("R/4/P2", &ctx), vec![4, 6, 8, 10]);
        assert_eq!(points("R3/2/P1", &ctx), vec![2, 3, 4]);
        assert_eq!(points("R2/P2/$", &ctx), vec![8, 10]);
    }

    #[test]
    fn calendar_forms() {
        let ctx = RecurrenceContext::new(
            CyclingMode::Gregorian,
            CyclePoint::parse("20240101T00", CyclingMode::Gregorian).unwrap(),
            None,
        );
        let seq = parse_recurrence("+PT6H/PT12H", &ctx).unwrap();
        let got: Vec<String> = seq.iter().take(2).map(|p| p.to_string()).collect();
        assert_eq!(got, vec!["20240101T0600Z", "20240101T1800Z"]);
    }

    #[test]
    fn rejects_bad_forms() {
        let ctx = int_ctx(1, None);
        assert!(parse_recurrence("R1/$", &ctx).is_err());
        assert!(parse_recurrence("R0/P1", &ctx).is_err());
        assert!(parse_recurrence("-P1", &ctx).is_err());
        assert!(parse_recurrence("P0", &ctx).is_err());
        assert!(parse_recurrence("R2/1", &ctx).is_err());
        assert!(parse_recurrence("", &ctx).is_err());
    }
}
