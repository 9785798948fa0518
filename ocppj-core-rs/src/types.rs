//! Core identity types shared by every layer of the node
//!
//! - `NodeId`: identity of a station, networking node or central system
//! - `MessageId`: correlation token of a Call and its answer
//! - `Action`: OCPP action name (opaque to the core)
//! - `NetworkPath`: relay chain a frame has traversed
//! - `Payload`: opaque JSON value or raw bytes

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::PathError;

/// Maximum length of an OCPP-J message id
pub const MAX_MESSAGE_ID_LEN: usize = 36;

/// Identity of a protocol participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// Correlation token for a Call and its CallResult/CallError
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Fresh random id (UUID v4, exactly 36 characters)
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Validate an id received from the wire or supplied by a caller.
    /// Returns `None` when empty or longer than [`MAX_MESSAGE_ID_LEN`].
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() || s.chars().count() > MAX_MESSAGE_ID_LEN {
            None
        } else {
            Some(Self(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// OCPP action name, e.g. "Heartbeat" or "BootNotification"
///
/// The core never interprets actions; the catalogue lives with the handlers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(String);

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Direction of a frame relative to the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Ordered relay chain, oldest hop first, current sender last.
///
/// Never empty and never holds the same node twice in a row. Relays extend a
/// path with [`NetworkPath::appended`], which returns a new path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct NetworkPath(Vec<NodeId>);

impl NetworkPath {
    /// Path of a frame originated by `origin`
    pub fn origin(origin: NodeId) -> Self {
        Self(vec![origin])
    }

    pub fn from_hops(hops: Vec<NodeId>) -> Result<Self, PathError> {
        if hops.is_empty() {
            return Err(PathError::Empty);
        }
        if let Some(pair) = hops.windows(2).find(|w| w[0] == w[1]) {
            return Err(PathError::RepeatedHop(pair[0].clone()));
        }
        Ok(Self(hops))
    }

    /// New path with `hop` added as the latest sender.
    ///
    /// Appending the current sender again is a no-op.
    pub fn appended(&self, hop: NodeId) -> Self {
        let mut hops = self.0.clone();
        if hops.last() != Some(&hop) {
            hops.push(hop);
        }
        Self(hops)
    }

    /// Node that originated the frame
    pub fn source(&self) -> &NodeId {
        &self.0[0]
    }

    /// Immediate sender of the frame
    pub fn sender(&self) -> &NodeId {
        &self.0[self.0.len() - 1]
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.0.contains(node)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; present for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.0
    }
}

impl<'de> Deserialize<'de> for NetworkPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hops = Vec::<NodeId>::deserialize(deserializer)?;
        NetworkPath::from_hops(hops).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, hop) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" > ")?;
            }
            f.write_str(hop.as_str())?;
        }
        f.write_str("]")
    }
}

/// Opaque message payload
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// JSON value carried in text frames
    Json(Value),
    /// Raw bytes carried in binary frames
    Binary(Bytes),
}

impl Payload {
    /// Empty JSON object, the payload of e.g. a Heartbeat request
    pub fn empty() -> Self {
        Payload::Json(Value::Object(serde_json::Map::new()))
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary(_))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            Payload::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Binary(b) => Some(b),
            Payload::Json(_) => None,
        }
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Json(v)
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Binary(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(b))
    }
}
