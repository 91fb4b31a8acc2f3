// tests/property_retry.rs

use std::time::{Duration, Instant};

use proptest::prelude::*;

use cyclorama::retry::{EventRetryQueue, RetryPolicy, ScheduleOutcome};

fn delays() -> impl Strategy<Value = Vec<Duration>> {
    proptest::collection::vec((0u64..600).prop_map(Duration::from_secs), 0..6)
}

proptest! {
    /// A key never fires before its delay has elapsed and fires exactly
    /// once per scheduled attempt.
    #[test]
    fn fires_once_and_never_early(delays in delays(), early_secs in 0u64..1200) {
        let t0 = Instant::now();
        let mut q: EventRetryQueue<&'static str> = EventRetryQueue::new();
        q.set_policy("job", RetryPolicy::new(delays.clone()));

        let mut now = t0;
        for (i, delay) in delays.iter().enumerate() {
            let outcome = q.schedule(&"job", now);
            let ScheduleOutcome::Scheduled { due, attempt, remaining, .. } = outcome else {
                return Err(TestCaseError::fail(format!("attempt {} exhausted early", i + 1)));
            };
            prop_assert_eq!(due, now + *delay);
            prop_assert_eq!(attempt, i + 1);
            prop_assert_eq!(remaining, Some(delays.len() - i - 1));

            let early = now + Duration::from_secs(early_secs).min(*delay);
            if early < due {
                prop_assert!(q.poll_due(early).is_empty());
            }
            prop_assert_eq!(q.poll_due(due), vec!["job"]);
            prop_assert!(q.poll_due(due + Duration::from_secs(3600)).is_empty());
            now = due;
        }
        prop_assert_eq!(
            q.schedule(&"job", now),
            ScheduleOutcome::Exhausted { attempts: delays.len() }
        );
        prop_assert_eq!(q.next_deadline(), None);
    }

    /// Repeating policies keep going with the last delay.
    #[test]
    fn repeating_policy_never_exhausts(delays in proptest::collection::vec(1u64..100, 1..4), extra in 1usize..10) {
        let delays: Vec<Duration> = delays.into_iter().map(Duration::from_secs).collect();
        let last = *delays.last().unwrap();
        let mut q: EventRetryQueue<u32> = EventRetryQueue::new();
        q.set_policy(7, RetryPolicy::repeating(delays.clone()));

        let now = Instant::now();
        for i in 0..delays.len() + extra {
            match q.schedule(&7, now) {
                ScheduleOutcome::Scheduled { delay, remaining, .. } => {
                    prop_assert_eq!(delay, delays.get(i).copied().unwrap_or(last));
                    prop_assert_eq!(remaining, None);
                }
                ScheduleOutcome::Exhausted { .. } => {
                    return Err(TestCaseError::fail("repeating policy exhausted"));
                }
            }
        }
    }

    /// Due keys come out earliest first, whatever order they were armed in.
    #[test]
    fn due_keys_are_ordered_by_deadline(offsets in proptest::collection::vec(0u64..1000, 1..12)) {
        let t0 = Instant::now();
        let mut q: EventRetryQueue<usize> = EventRetryQueue::new();
        for (key, secs) in offsets.iter().enumerate() {
            q.set_policy(key, RetryPolicy::new(vec![Duration::from_secs(*secs)]));
            q.schedule(&key, t0);
        }

        let fired = q.poll_due(t0 + Duration::from_secs(1000));
        prop_assert_eq!(fired.len(), offsets.len());
        let deadlines: Vec<u64> = fired.iter().map(|k| offsets[*k]).collect();
        let mut sorted = deadlines.clone();
        sorted.sort();
        prop_assert_eq!(deadlines, sorted);
        prop_assert_eq!(q.next_deadline(), None);
    }
}
