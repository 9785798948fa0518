//! Configuration for a networking node
//!
//! Combines routing limits, session limits and WebSocket settings.

use std::net::SocketAddr;
use std::time::Duration;

use crate::session::SessionConfig;
use crate::types::NodeId;

/// Subprotocols offered and accepted, in order of preference
pub const DEFAULT_SUBPROTOCOLS: [&str; 3] = ["ocpp2.1", "ocpp2.0.1", "ocpp1.6"];

/// Complete node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    // Node identity
    pub node_id: NodeId,

    /// Longest network path a frame may have after this node appends itself
    pub max_hops: usize,

    /// Largest encoded frame accepted or sent, in bytes
    pub max_frame_size: usize,

    /// Outbound queue length per session
    pub queue_capacity: usize,

    /// How often overdue pending calls are expired
    pub sweep_interval: Duration,

    /// How long a Call relayed to a plain peer waits for its answer
    pub transit_timeout: Duration,

    /// Buffered observations per subscriber before it starts lagging
    pub observation_capacity: usize,

    /// Peers speaking plain OCPP-J without routing information
    pub plain_peers: Vec<NodeId>,

    // WebSocket settings
    pub ws: WsConfig,
}

/// WebSocket listener and upstream link settings
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Address to accept peer connections on
    pub listen_addr: Option<SocketAddr>,

    /// Upstream WebSocket URL (without node id)
    pub upstream_url: Option<String>,

    /// Node id of the upstream peer
    pub upstream_id: NodeId,

    pub subprotocols: Vec<String>,

    /// Reconnect delay (initial)
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from("ocppj-node"),
            max_hops: 8,
            max_frame_size: 64 * 1024,
            queue_capacity: 64,
            sweep_interval: Duration::from_millis(250),
            transit_timeout: Duration::from_secs(60),
            observation_capacity: 256,
            plain_peers: Vec::new(),
            ws: WsConfig::default(),
        }
    }
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            upstream_url: None,
            upstream_id: NodeId::from("CSMS"),
            subprotocols: DEFAULT_SUBPROTOCOLS.iter().map(|s| s.to_string()).collect(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
        }
    }
}

impl NodeConfig {
    /// Create config for the given node id with default limits
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_transit_timeout(mut self, timeout: Duration) -> Self {
        self.transit_timeout = timeout;
        self
    }

    pub fn with_observation_capacity(mut self, capacity: usize) -> Self {
        self.observation_capacity = capacity;
        self
    }

    /// Treat `peer` as a plain OCPP-J speaker
    pub fn with_plain_peer(mut self, peer: impl Into<NodeId>) -> Self {
        self.plain_peers.push(peer.into());
        self
    }

    /// Accept peer connections on `addr`
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.ws.listen_addr = Some(addr);
        self
    }

    /// Keep a link to an upstream node at `url`
    pub fn with_upstream(mut self, url: impl Into<String>, id: impl Into<NodeId>) -> Self {
        self.ws.upstream_url = Some(url.into());
        self.ws.upstream_id = id.into();
        self
    }

    pub fn is_plain_peer(&self, peer: &NodeId) -> bool {
        self.plain_peers.contains(peer)
    }

    /// Session settings for a connection to `peer`
    pub fn session_config(&self, peer: &NodeId) -> SessionConfig {
        SessionConfig {
            max_frame_size: self.max_frame_size,
            queue_capacity: self.queue_capacity,
            dialect: if self.is_plain_peer(peer) {
                crate::codec::Dialect::Plain
            } else {
                crate::codec::Dialect::Networking
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Dialect;

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new("R")
            .with_max_hops(4)
            .with_queue_capacity(8)
            .with_transit_timeout(Duration::from_secs(5))
            .with_plain_peer("CS001")
            .with_upstream("ws://localhost:9000/ocpp", "CSMS");

        assert_eq!(config.node_id, NodeId::from("R"));
        assert_eq!(config.max_hops, 4);
        assert_eq!(config.max_frame_size, 64 * 1024);
        assert_eq!(config.transit_timeout, Duration::from_secs(5));
        assert_eq!(config.ws.upstream_url.as_deref(), Some("ws://localhost:9000/ocpp"));
        assert_eq!(config.session_config(&"CS001".into()).dialect, Dialect::Plain);
        assert_eq!(config.session_config(&"CSMS".into()).dialect, Dialect::Networking);
        assert_eq!(config.session_config(&"CSMS".into()).queue_capacity, 8);
    }
}
