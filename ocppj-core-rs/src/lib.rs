//! # OCPP-J Networking Node Core
//!
//! Message routing and request/response correlation for OCPP-J
//! participants: charging stations, relays and central systems.
//!
//! ## Architecture
//!
//! ```text
//!            application handlers
//!                   │ register_handler / send_call
//!                   ▼
//! ┌─────────────────────────────────────────┐
//! │            NetworkingNode               │
//! │  ┌──────────┐ ┌──────────┐ ┌─────────┐  │
//! │  │ Dispatch │ │ Pending  │ │ Router  │  │
//! │  │  Table   │ │ Registry │ │         │  │
//! │  └──────────┘ └──────────┘ └─────────┘  │
//! │  ┌───────────────────────────────────┐  │
//! │  │ Sessions (reader + single writer) │  │
//! │  └───────────────────────────────────┘  │
//! └──────────────────┬──────────────────────┘
//!                    │ Codec: JSON / binary frames
//!                    ▼
//!          WebSocket or in-memory transport
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use ocppj_core::{NetworkingNode, NodeConfig, Payload};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let station = NetworkingNode::new(NodeConfig::new("CS001"));
//!     let (transport, _) = ocppj_core::ws::connect(
//!         "ws://localhost:9000/ocpp",
//!         station.id(),
//!         &station.config().ws.subprotocols,
//!         station.config().max_frame_size,
//!     )
//!     .await?;
//!     station.attach("CSMS", transport);
//!
//!     let result = station
//!         .send_call("CSMS", "Heartbeat", Payload::empty(), Duration::from_secs(30))
//!         .await?;
//!     println!("{:?}", result.payload);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod node;
pub mod registry;
pub mod router;
pub mod session;
pub mod transit;
pub mod transport;
pub mod types;
pub mod ws;

pub use config::{NodeConfig, WsConfig};
pub use node::{FrameObservation, NetworkingNode};

// Re-export key types
pub use codec::{Codec, Dialect, WireFormat, WireMessage};
pub use dispatch::{DispatchTable, HandlerError};
pub use error::{CallFailure, CodecError, RegistryError, RouteError, SendError, SessionError};
pub use frame::{Call, CallError, CallResult, Envelope, ErrorCode, Frame};
pub use registry::{CompletionHandle, PendingCallRegistry};
pub use router::Router;
pub use session::{SessionHandle, SessionState};
pub use transport::{in_memory_pair, Transport};
pub use types::{Action, Direction, MessageId, NetworkPath, NodeId, Payload};
