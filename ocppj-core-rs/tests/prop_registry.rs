//! Property tests for the pending-call registry
//!
//! Racing resolutions of one pending call (answer, CallError, expiry,
//! cancellation, connection loss) must resolve it exactly once and leave
//! nothing behind.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ocppj_core::{
    CallError, CallFailure, CallResult, ErrorCode, MessageId, NetworkPath, Payload,
    PendingCallRegistry,
};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Resolution {
    Answer,
    Reject,
    Expire,
    Cancel,
    ConnectionLoss,
}

// ============================================================================
// Strategies
// ============================================================================

fn resolution() -> impl Strategy<Value = Resolution> {
    prop_oneof![
        Just(Resolution::Answer),
        Just(Resolution::Reject),
        Just(Resolution::Expire),
        Just(Resolution::Cancel),
        Just(Resolution::ConnectionLoss),
    ]
}

fn racers() -> impl Strategy<Value = Vec<Resolution>> {
    prop::collection::vec(resolution(), 2..6)
}

fn id() -> MessageId {
    MessageId::parse("m1").unwrap()
}

fn path() -> NetworkPath {
    NetworkPath::origin("B".into())
}

/// Apply one resolution; true if this call won the remove
fn apply(registry: &PendingCallRegistry, resolution: Resolution) -> bool {
    match resolution {
        Resolution::Answer => registry
            .complete(&id(), &"B".into(), Ok(CallResult::new(id(), Payload::empty(), path())))
            .is_ok(),
        Resolution::Reject => registry
            .complete(
                &id(),
                &"B".into(),
                Err(CallError::new(id(), ErrorCode::GenericError, "rejected", path())),
            )
            .is_ok(),
        Resolution::Expire => registry.expire(&id()),
        Resolution::Cancel => registry.cancel(&id()),
        Resolution::ConnectionLoss => registry.fail_via(&"B".into()) == 1,
    }
}

fn outcome_matches(resolution: Resolution, outcome: &Result<CallResult, CallFailure>) -> bool {
    match (resolution, outcome) {
        (Resolution::Answer, Ok(_)) => true,
        (Resolution::Reject, Err(CallFailure::Rejected(_))) => true,
        (Resolution::Expire, Err(CallFailure::Timeout)) => true,
        (Resolution::Cancel, Err(CallFailure::Cancelled)) => true,
        (Resolution::ConnectionLoss, Err(CallFailure::ConnectionLost)) => true,
        _ => false,
    }
}

// ============================================================================
// Exactly-once Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// CORE INVARIANT: exactly one racer wins and the handle sees its outcome
    #[test]
    fn racing_resolutions_resolve_once(racers in racers()) {
        let registry = PendingCallRegistry::new();
        let handle = registry
            .register(id(), "B".into(), "B".into(), "Heartbeat".into(), Duration::from_secs(60))
            .unwrap();

        let winners: Vec<Resolution> = thread::scope(|scope| {
            let tasks: Vec<_> = racers
                .iter()
                .map(|&r| {
                    let registry = Arc::clone(&registry);
                    scope.spawn(move || apply(&registry, r).then_some(r))
                })
                .collect();
            tasks.into_iter().filter_map(|t| t.join().unwrap()).collect()
        });

        prop_assert_eq!(winners.len(), 1, "winners: {:?}", winners);
        prop_assert!(registry.is_empty());

        let outcome = tokio_test::block_on(handle.wait());
        prop_assert!(
            outcome_matches(winners[0], &outcome),
            "winner {:?} but handle saw {:?}", winners[0], outcome
        );
    }

    /// Unrelated calls survive a race on another id
    #[test]
    fn racing_leaves_other_calls(racers in racers(), others in 1usize..8) {
        let registry = PendingCallRegistry::new();
        let _handle = registry
            .register(id(), "B".into(), "B".into(), "Heartbeat".into(), Duration::from_secs(60))
            .unwrap();
        let _others: Vec<_> = (0..others)
            .map(|i| {
                registry
                    .register(
                        MessageId::parse(&format!("other-{}", i)).unwrap(),
                        "C".into(),
                        "C".into(),
                        "Heartbeat".into(),
                        Duration::from_secs(60),
                    )
                    .unwrap()
            })
            .collect();

        for r in racers {
            apply(&registry, r);
        }

        prop_assert!(!registry.contains(&id()));
        prop_assert_eq!(registry.len(), others);
    }
}
