//! Property-based tests for the retry schedule and task state machine.

use std::{sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use herald_core::{
    models::{TaskId, TaskStatus},
    Clock, CoreError, TestClock,
};
use herald_delivery::{
    storage::mock::MockDeliveryStorage, DeliveryStorage, RetryDecision, RetryPolicy,
};
use herald_testing::TaskBuilder;
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Op {
    Succeed,
    Fail,
    Dead,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Succeed), Just(Op::Fail), Just(Op::Dead)]
}

proptest! {
    /// Backoff never shrinks as the attempt number grows, and matches
    /// `2^n` seconds while it fits.
    #[test]
    fn backoff_is_monotonic_and_exponential(attempt in 0u32..200) {
        let policy = RetryPolicy::default();
        let current = policy.backoff_for(attempt);
        let next = policy.backoff_for(attempt + 1);

        prop_assert!(next >= current);
        if attempt < 64 {
            prop_assert_eq!(current, Duration::from_secs(1u64 << attempt));
        }
    }

    /// A failed attempt is given up on exactly when it reaches the ceiling.
    #[test]
    fn give_up_iff_ceiling_reached(max_attempts in 1u32..30, attempt in 1u32..60) {
        let policy = RetryPolicy::new(max_attempts);
        let failed_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        match policy.decide(attempt, failed_at) {
            RetryDecision::GiveUp => prop_assert!(attempt >= max_attempts),
            RetryDecision::Retry { next_attempt_at, backoff } => {
                prop_assert!(attempt < max_attempts);
                prop_assert_eq!(backoff, policy.backoff_for(attempt));
                prop_assert!(next_attempt_at > failed_at);
            },
        }
    }

    /// A capped policy never waits longer than its cap.
    #[test]
    fn capped_backoff_never_exceeds_cap(attempt in 0u32..200, cap_secs in 1u64..100_000) {
        let cap = Duration::from_secs(cap_secs);
        let policy = RetryPolicy::default().with_max_backoff(cap);

        prop_assert!(policy.backoff_for(attempt) <= cap);
    }

    /// Transitions are accepted only from `pending` with the next attempt
    /// number; the attempt count never decreases and terminal tasks never
    /// change again.
    #[test]
    fn store_transitions_follow_the_state_machine(
        steps in prop::collection::vec((op_strategy(), 0u32..4), 1..30),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let clock = TestClock::starting_at(start);
            let storage = MockDeliveryStorage::new(Arc::new(clock.clone()) as Arc<dyn Clock>);
            let task = TaskBuilder::new().build_at(clock.now_utc());
            let task_id: TaskId = task.id;
            storage.add_task(task).await;

            let mut expected_count = 0i32;
            let mut expected_status = TaskStatus::Pending;

            for (op, offset) in steps {
                // offset 1 is the valid next attempt; 0 replays, 2+ skips ahead
                let attempt_number = u32::try_from(expected_count).unwrap() + offset;
                let next = clock.now_utc() + chrono::Duration::seconds(2);

                let result = match op {
                    Op::Succeed => storage.mark_succeeded(task_id, attempt_number).await,
                    Op::Fail => storage.mark_failed(task_id, attempt_number, next).await,
                    Op::Dead => storage.mark_dead(task_id, attempt_number).await,
                };

                let accepted = expected_status == TaskStatus::Pending
                    && i64::from(attempt_number) == i64::from(expected_count) + 1;

                if accepted {
                    prop_assert!(result.is_ok(), "valid transition rejected: {:?}", result);
                    expected_count += 1;
                    expected_status = match op {
                        Op::Succeed => TaskStatus::Succeeded,
                        Op::Fail => TaskStatus::Pending,
                        Op::Dead => TaskStatus::Dead,
                    };
                } else {
                    let rejected = matches!(
                        result,
                        Err(CoreError::InvalidState(_) | CoreError::InvalidInput(_))
                    );
                    prop_assert!(rejected, "invalid transition accepted: {:?}", result);
                }

                let stored = storage.task(task_id).await.unwrap();
                prop_assert_eq!(stored.attempted_count, expected_count);
                prop_assert_eq!(stored.status, expected_status);
            }

            Ok(())
        })?;
    }
}
