// tests/property_sequence.rs

use proptest::prelude::*;

use cyclorama::cycling::{parse_recurrence, CyclePoint, RecurrenceContext};
use cyclorama::types::CyclingMode;

fn int(n: i64) -> CyclePoint {
    CyclePoint::Integer(n)
}

/// Brute-force reference: every point of the recurrence inside the window.
fn expected(initial: i64, last: i64, start: i64, step: i64, reps: Option<u64>) -> Vec<CyclePoint> {
    (initial..=last)
        .filter(|p| *p >= start && (p - start) % step == 0)
        .filter(|p| reps.is_none_or(|n| ((p - start) / step) < n as i64))
        .map(int)
        .collect()
}

proptest! {
    #[test]
    fn unbounded_recurrence_stays_inside_the_window(
        initial in -50i64..50,
        len in 0i64..60,
        start_offset in -20i64..20,
        step in 1i64..8,
    ) {
        let last = initial + len;
        let start = initial + start_offset;
        let ctx = RecurrenceContext::new(CyclingMode::Integer, int(initial), Some(int(last)));
        let seq = parse_recurrence(&format!("R/{start}/P{step}"), &ctx).unwrap();

        let want = expected(initial, last, start, step, None);
        let got: Vec<CyclePoint> = seq.iter().collect();
        prop_assert_eq!(&got, &want);

        for p in (initial - 5)..=(last + 5) {
            prop_assert_eq!(seq.contains(int(p)), want.contains(&int(p)), "point {}", p);
        }
    }

    #[test]
    fn repetition_count_caps_the_sequence(
        initial in 0i64..20,
        start_offset in 0i64..10,
        step in 1i64..5,
        reps in 1u64..10,
    ) {
        let last = initial + 100;
        let start = initial + start_offset;
        let ctx = RecurrenceContext::new(CyclingMode::Integer, int(initial), Some(int(last)));
        let seq = parse_recurrence(&format!("R{reps}/{start}/P{step}"), &ctx).unwrap();

        let got: Vec<CyclePoint> = seq.iter().collect();
        prop_assert_eq!(got.len() as u64, reps);
        prop_assert_eq!(got, expected(initial, last, start, step, Some(reps)));
    }

    #[test]
    fn next_and_prev_are_inverse_on_the_sequence(
        initial in -30i64..30,
        len in 1i64..80,
        step in 1i64..6,
    ) {
        let last = initial + len;
        let ctx = RecurrenceContext::new(CyclingMode::Integer, int(initial), Some(int(last)));
        let seq = parse_recurrence(&format!("P{step}"), &ctx).unwrap();

        let points: Vec<CyclePoint> = seq.iter().collect();
        prop_assert_eq!(seq.first_point(), Some(int(initial)));
        for pair in points.windows(2) {
            prop_assert_eq!(seq.next_point(pair[0]), Some(pair[1]));
            prop_assert_eq!(seq.prev_point(pair[1]), Some(pair[0]));
        }
        prop_assert_eq!(seq.next_point(*points.last().unwrap()), None);
    }
}
