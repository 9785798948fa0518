//! Property tests for the network path router
//!
//! - a frame whose path already has the maximum length is never forwarded
//! - forwarded paths grow by exactly the local node and stay within bounds
//! - a path that already contains the local node is a loop

use ocppj_core::router::InboundRoute;
use ocppj_core::{
    Call, Envelope, Frame, NetworkPath, NodeId, Payload, RouteError, Router,
};
use proptest::prelude::*;

const LOCAL: &str = "R";
const DESTINATION: &str = "C";

// ============================================================================
// Strategies
// ============================================================================

/// Distinct hop names that are neither the relay nor the destination
fn hops(len: std::ops::Range<usize>) -> impl Strategy<Value = Vec<NodeId>> {
    prop::collection::hash_set("[a-z]{1,8}", len)
        .prop_map(|names| names.into_iter().map(NodeId::from).collect())
}

fn envelope(hops: Vec<NodeId>) -> Envelope {
    let mut call = Call::new(hops[0].clone(), "DataTransfer".into(), Payload::empty());
    call.network_path = NetworkPath::from_hops(hops).unwrap();
    Envelope::new(DESTINATION.into(), Frame::Call(call))
}

fn router(max_hops: usize) -> Router {
    let router = Router::new(LOCAL.into(), max_hops);
    router.attach(DESTINATION.into());
    router
}

// ============================================================================
// Hop-bound Property Tests
// ============================================================================

proptest! {
    /// CORE INVARIANT: a path of length >= N is never forwarded
    #[test]
    fn full_paths_never_forwarded(
        (max_hops, path) in (1usize..10).prop_flat_map(|n| (Just(n), hops(n..n + 4)))
    ) {
        let len = path.len();
        let result = router(max_hops).route_inbound(&envelope(path));
        prop_assert_eq!(
            result,
            Err(RouteError::HopLimitExceeded { hops: len + 1, max: max_hops })
        );
    }

    /// Shorter paths are forwarded with the local node appended
    #[test]
    fn short_paths_forwarded_within_bound(
        (max_hops, path) in (2usize..10).prop_flat_map(|n| (Just(n), hops(1..n)))
    ) {
        let original = path.clone();
        match router(max_hops).route_inbound(&envelope(path)) {
            Ok(InboundRoute::Forward { next, network_path }) => {
                prop_assert_eq!(next.via, NodeId::from(DESTINATION));
                prop_assert!(network_path.len() <= max_hops);
                prop_assert_eq!(&network_path.hops()[..original.len()], &original[..]);
                prop_assert_eq!(network_path.sender(), &NodeId::from(LOCAL));
            }
            other => prop_assert!(false, "expected Forward, got {:?}", other),
        }
    }

    /// The relay never forwards a frame it has already forwarded
    #[test]
    fn paths_through_local_are_loops(
        (path, at) in hops(2..6).prop_flat_map(|p| { let len = p.len(); (Just(p), 0..len) })
    ) {
        let mut path = path;
        path[at] = NodeId::from(LOCAL);
        let result = router(16).route_inbound(&envelope(path));
        prop_assert_eq!(result, Err(RouteError::Loop(LOCAL.into())));
    }
}
