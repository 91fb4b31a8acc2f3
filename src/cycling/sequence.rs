// src/cycling/sequence.rs

//! Recurrence sequences of cycle points.
//!
//! A [`Sequence`] is `start + k * step` for `k = 0, 1, ...` (bounded by an
//! optional repetition count), clipped to the workflow window
//! `[initial, final]`. Sequences are lazy: points are computed on demand and
//! membership / neighbour queries use an exponential-then-binary search over
//! `k`, which stays correct for month steps where the gap between points is
//! not constant.

use std::fmt;

use crate::cycling::interval::Interval;
use crate::cycling::point::CyclePoint;

/// A lazily evaluated, ordered, possibly infinite stream of cycle points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    expr: String,
    start: CyclePoint,
    step: Option<Interval>,
    repetitions: Option<u64>,
    lower: CyclePoint,
    upper: Option<CyclePoint>,
}

impl Sequence {
    /// Build a sequence.
    ///
    /// - `start`: first point of the recurrence (may precede `lower`).
    /// - `step`: `None` for a single-point recurrence; must be positive.
    /// - `repetitions`: total number of recurrence points, `None` = unbounded.
    /// - `lower` / `upper`: the workflow's initial and (optional) final point.
    pub fn new(
        expr: impl Into<String>,
        start: CyclePoint,
        step: Option<Interval>,
        repetitions: Option<u64>,
        lower: CyclePoint,
        upper: Option<CyclePoint>,
    ) -> Self {
        if let Some(step) = &step {
            assert!(step.is_positive(), "sequence step must be positive, got {step}");
        }
        let repetitions = if step.is_none() { Some(1) } else { repetitions };
        Self {
            expr: expr.into(),
            start,
            step,
            repetitions,
            lower,
            upper,
        }
    }

    /// The recurrence expression this sequence was built from.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    pub fn start(&self) -> CyclePoint {
        self.start
    }

    pub fn step(&self) -> Option<Interval> {
        self.step
    }

    pub fn upper(&self) -> Option<CyclePoint> {
        self.upper
    }

    /// The `k`-th recurrence point, ignoring the workflow window.
    pub fn point_at(&self, k: u64) -> Option<CyclePoint> {
        if self.repetitions.is_some_and(|n| k >= n) {
            return None;
        }
        if k == 0 {
            return Some(self.start);
        }
        let step = self.step?;
        let k = i64::try_from(k).ok()?;
        self.start.checked_add(&step.scaled(k)?)
    }

    /// Smallest `k` whose recurrence point is `>= p`, ignoring repetitions.
    /// Overflowing points count as "infinitely late".
    fn ceil_index(&self, p: CyclePoint) -> u64 {
        if p <= self.start {
            return 0;
        }
        let Some(step) = self.step else {
            return 1;
        };
        let at = |k: u64| -> Option<CyclePoint> {
            let k = i64::try_from(k).ok()?;
            self.start.checked_add(&step.scaled(k)?)
        };
        let reaches = |k: u64| at(k).is_none_or(|q| q >= p);

        let mut lo = 0u64;
        let mut hi = 1u64;
        while !reaches(hi) {
            lo = hi;
            hi = match hi.checked_mul(2) {
                Some(h) => h,
                None => return u64::MAX,
            };
        }
        // invariant: !reaches(lo) (or lo == 0 and start < p), reaches(hi)
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if reaches(mid) {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        hi
    }

    fn within_window(&self, p: CyclePoint) -> bool {
        p >= self.lower && self.upper.is_none_or(|u| p <= u)
    }

    /// Whether `p` is a recurrence point, regardless of the workflow window.
    pub fn is_on_sequence(&self, p: CyclePoint) -> bool {
        if p.mode() != self.start.mode() {
            return false;
        }
        let k = self.ceil_index(p);
        self.point_at(k) == Some(p)
    }

    /// Whether `p` is a recurrence point inside the workflow window.
    pub fn contains(&self, p: CyclePoint) -> bool {
        self.within_window(p) && self.is_on_sequence(p)
    }

    /// First valid point of the sequence.
    pub fn first_point(&self) -> Option<CyclePoint> {
        self.first_point_on_or_after(self.lower)
    }

    /// First valid point `>= p`.
    pub fn first_point_on_or_after(&self, p: CyclePoint) -> Option<CyclePoint> {
        let p = p.max(self.lower);
        let k = self.ceil_index(p);
        let q = self.point_at(k)?;
        self.within_window(q).then_some(q)
    }

    /// First valid point strictly after `p`.
    pub fn next_point(&self, p: CyclePoint) -> Option<CyclePoint> {
        let mut k = self.ceil_index(p);
        if self.point_at(k) == Some(p) {
            k = k.checked_add(1)?;
        }
        let mut q = self.point_at(k)?;
        // the window's lower bound can exceed p
        if q < self.lower {
            q = self.first_point()?;
        }
        self.within_window(q).then_some(q)
    }

    /// Last valid point strictly before `p`.
    pub fn prev_point(&self, p: CyclePoint) -> Option<CyclePoint> {
        if let Some(u) = self.upper {
            if p > u {
                return if self.contains(u) { Some(u) } else { self.prev_point(u) };
            }
        }
        let k = self.ceil_index(p);
        if k == 0 {
            return None;
        }
        let mut k = k - 1;
        if let Some(n) = self.repetitions {
            k = k.min(n.checked_sub(1)?);
        }
        let q = self.point_at(k)?;
        self.within_window(q).then_some(q)
    }

    /// Iterate valid points starting at the first point `>= from`.
    pub fn iter_from(&self, from: CyclePoint) -> SequenceIter<'_> {
        SequenceIter {
            seq: self,
            next: self.first_point_on_or_after(from),
        }
    }

    /// Iterate every valid point from the start of the workflow window.
    pub fn iter(&self) -> SequenceIter<'_> {
        self.iter_from(self.lower)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

/// Two sequences coincide at `p` when both contain it.
pub fn coincident(a: &Sequence, b: &Sequence, p: CyclePoint) -> bool {
    a.contains(p) && b.contains(p)
}

pub struct SequenceIter<'a> {
    seq: &'a Sequence,
    next: Option<CyclePoint>,
}

impl Iterator for SequenceIter<'_> {
    type Item = CyclePoint;

    fn next(&mut self) -> Option<CyclePoint> {
        let current = self.next?;
        self.next = self.seq.next_point(current);
        Some(current)
    }
}
