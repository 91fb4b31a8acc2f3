// src/cycling/mod.rs

//! Cycling domain: points, intervals, recurrence sequences.
//!
//! Everything here is a pure value type. The graph expander and the pool ask
//! sequences questions ("is this point on the sequence?", "what comes
//! next?") and never iterate them eagerly.

pub mod interval;
pub mod point;
pub mod recurrence;
pub mod sequence;

pub use interval::{parse_delay, parse_delays, CalendarDuration, Interval};
pub use point::CyclePoint;
pub use recurrence::{parse_recurrence, RecurrenceContext};
pub use sequence::{coincident, Sequence, SequenceIter};
