//! Network path router
//!
//! Table-driven next-hop selection. A destination is reached either through
//! its own attached session, through a static route naming the session to
//! use, or through the default upstream relay. Transit frames get the local
//! node appended to their path and are bounded by the maximum hop count.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::RouteError;
use crate::frame::Envelope;
use crate::types::{NetworkPath, NodeId};

/// Session a frame should leave through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHop {
    pub via: NodeId,
    /// True when `via` is the destination itself
    pub direct: bool,
}

/// Routing decision for a received frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRoute {
    /// Addressed to this node
    Local,
    /// Transit traffic, re-sent with the extended path
    Forward { next: NextHop, network_path: NetworkPath },
}

#[derive(Debug, Default)]
struct RoutingTable {
    attached: HashSet<NodeId>,
    routes: HashMap<NodeId, NodeId>,
    default_upstream: Option<NodeId>,
}

#[derive(Debug)]
pub struct Router {
    local: NodeId,
    max_hops: usize,
    table: RwLock<RoutingTable>,
}

impl Router {
    pub fn new(local: NodeId, max_hops: usize) -> Self {
        Self {
            local,
            max_hops,
            table: RwLock::new(RoutingTable::default()),
        }
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    pub fn max_hops(&self) -> usize {
        self.max_hops
    }

    /// Mark `node` as reachable through its own session
    pub fn attach(&self, node: NodeId) {
        debug!("Route table: attached {}", node);
        self.table.write().attached.insert(node);
    }

    pub fn detach(&self, node: &NodeId) -> bool {
        let removed = self.table.write().attached.remove(node);
        if removed {
            debug!("Route table: detached {}", node);
        }
        removed
    }

    pub fn is_attached(&self, node: &NodeId) -> bool {
        self.table.read().attached.contains(node)
    }

    pub fn attached(&self) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self.table.read().attached.iter().cloned().collect();
        nodes.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        nodes
    }

    pub fn set_default_upstream(&self, upstream: Option<NodeId>) {
        match &upstream {
            Some(node) => info!("Default upstream relay: {}", node),
            None => info!("Default upstream relay cleared"),
        }
        self.table.write().default_upstream = upstream;
    }

    pub fn default_upstream(&self) -> Option<NodeId> {
        self.table.read().default_upstream.clone()
    }

    /// Send frames for `destination` through the session of `via`
    pub fn add_route(&self, destination: NodeId, via: NodeId) {
        debug!("Route table: {} via {}", destination, via);
        self.table.write().routes.insert(destination, via);
    }

    pub fn remove_route(&self, destination: &NodeId) -> Option<NodeId> {
        self.table.write().routes.remove(destination)
    }

    /// Pick the session for a frame addressed to `destination`.
    ///
    /// Routes and the upstream only count while their session is attached.
    pub fn resolve(&self, destination: &NodeId) -> Result<NextHop, RouteError> {
        if destination == &self.local {
            return Err(RouteError::NoRoute(destination.clone()));
        }

        let table = self.table.read();
        if table.attached.contains(destination) {
            return Ok(NextHop {
                via: destination.clone(),
                direct: true,
            });
        }

        table
            .routes
            .get(destination)
            .into_iter()
            .chain(table.default_upstream.as_ref())
            .find(|via| table.attached.contains(*via))
            .map(|via| NextHop {
                via: via.clone(),
                direct: false,
            })
            .ok_or_else(|| RouteError::NoRoute(destination.clone()))
    }

    /// Decide what to do with a received envelope
    pub fn route_inbound(&self, envelope: &Envelope) -> Result<InboundRoute, RouteError> {
        if envelope.destination == self.local {
            return Ok(InboundRoute::Local);
        }

        let path = envelope.frame.network_path();
        if path.contains(&self.local) {
            return Err(RouteError::Loop(self.local.clone()));
        }
        if path.len() >= self.max_hops {
            return Err(RouteError::HopLimitExceeded {
                hops: path.len() + 1,
                max: self.max_hops,
            });
        }

        let next = self.resolve(&envelope.destination)?;
        Ok(InboundRoute::Forward {
            next,
            network_path: path.appended(self.local.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Call, Frame};
    use crate::types::Payload;

    fn envelope(destination: &str, hops: &[&str]) -> Envelope {
        let mut call = Call::new(hops[0].into(), "DataTransfer".into(), Payload::empty());
        call.network_path =
            NetworkPath::from_hops(hops.iter().map(|h| NodeId::from(*h)).collect()).unwrap();
        Envelope::new(destination.into(), Frame::Call(call))
    }

    #[test]
    fn test_resolve_prefers_direct_then_route_then_upstream() {
        let router = Router::new("R".into(), 8);
        router.attach("C".into());
        router.attach("CSMS".into());
        router.attach("R2".into());

        assert_eq!(
            router.resolve(&"C".into()),
            Ok(NextHop { via: "C".into(), direct: true })
        );
        assert_eq!(router.resolve(&"X".into()), Err(RouteError::NoRoute("X".into())));

        router.set_default_upstream(Some("CSMS".into()));
        assert_eq!(router.resolve(&"X".into()).unwrap().via, NodeId::from("CSMS"));

        router.add_route("X".into(), "R2".into());
        assert_eq!(
            router.resolve(&"X".into()),
            Ok(NextHop { via: "R2".into(), direct: false })
        );

        // Route through a detached session falls back to the upstream
        router.detach(&"R2".into());
        assert_eq!(router.resolve(&"X".into()).unwrap().via, NodeId::from("CSMS"));

        router.detach(&"CSMS".into());
        assert!(router.resolve(&"X".into()).is_err());
    }

    #[test]
    fn test_never_routes_to_self() {
        let router = Router::new("R".into(), 8);
        router.attach("R".into());
        assert_eq!(router.resolve(&"R".into()), Err(RouteError::NoRoute("R".into())));
    }

    #[test]
    fn test_inbound_local_and_forward() {
        let router = Router::new("R".into(), 8);
        router.attach("C".into());

        assert_eq!(router.route_inbound(&envelope("R", &["A"])), Ok(InboundRoute::Local));

        match router.route_inbound(&envelope("C", &["A"])).unwrap() {
            InboundRoute::Forward { next, network_path } => {
                assert_eq!(next.via, NodeId::from("C"));
                assert_eq!(network_path.to_string(), "[A > R]");
            }
            other => panic!("Expected Forward, got {:?}", other),
        }

        assert_eq!(
            router.route_inbound(&envelope("Z", &["A"])),
            Err(RouteError::NoRoute("Z".into()))
        );
    }

    #[test]
    fn test_hop_limit_and_loop() {
        let router = Router::new("R".into(), 3);
        router.attach("C".into());

        assert!(router.route_inbound(&envelope("C", &["A", "B"])).is_ok());
        assert_eq!(
            router.route_inbound(&envelope("C", &["A", "B", "D"])),
            Err(RouteError::HopLimitExceeded { hops: 4, max: 3 })
        );
        assert_eq!(
            router.route_inbound(&envelope("C", &["A", "R", "B"])),
            Err(RouteError::Loop("R".into()))
        );
    }
}
