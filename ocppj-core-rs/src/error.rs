//! Error types for every layer of the node
//!
//! Each layer owns one enum; [`SendError`] is what `send_call` callers see.

use thiserror::Error;

use crate::frame::CallError;
use crate::types::{MessageId, NodeId};

/// Violations of the [`NetworkPath`](crate::types::NetworkPath) invariants
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("network path is empty")]
    Empty,

    #[error("node {0} appears twice in a row in network path")]
    RepeatedHop(NodeId),
}

/// Envelope encode/decode failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    /// Too short, unknown tag, missing or mistyped field.
    /// `call_id` is set when the frame was recognisably a Call with a
    /// readable id, so the sender can be answered with a CallError.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        reason: String,
        call_id: Option<MessageId>,
    },

    /// Binary framing used for something not registered as binary-capable
    #[error("unsupported format: {reason}")]
    UnsupportedFormat {
        reason: String,
        call_id: Option<MessageId>,
    },
}

impl CodecError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        CodecError::MalformedEnvelope {
            reason: reason.into(),
            call_id: None,
        }
    }

    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        CodecError::UnsupportedFormat {
            reason: reason.into(),
            call_id: None,
        }
    }

    /// Attach the id of the Call being decoded
    pub(crate) fn for_call(self, id: &MessageId) -> Self {
        match self {
            CodecError::MalformedEnvelope { reason, .. } => CodecError::MalformedEnvelope {
                reason,
                call_id: Some(id.clone()),
            },
            CodecError::UnsupportedFormat { reason, .. } => CodecError::UnsupportedFormat {
                reason,
                call_id: Some(id.clone()),
            },
        }
    }

    /// Id of the offending Call, when there is someone to answer
    pub fn call_id(&self) -> Option<&MessageId> {
        match self {
            CodecError::MalformedEnvelope { call_id, .. }
            | CodecError::UnsupportedFormat { call_id, .. } => call_id.as_ref(),
        }
    }
}

/// Pending-call registry failures (non-fatal, local to one frame)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("message id {0} already has a pending call")]
    DuplicateMessageId(MessageId),

    #[error("no pending call for message id {0}")]
    UnknownCorrelation(MessageId),
}

/// Routing failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no route to {0}")]
    NoRoute(NodeId),

    #[error("hop limit exceeded: path of {hops} hops, maximum {max}")]
    HopLimitExceeded { hops: usize, max: usize },

    #[error("forwarding loop: {0} already in network path")]
    Loop(NodeId),
}

/// Transport-level failures of the underlying byte-message channel
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures when handing a frame to a connection session
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("session to {0} is not open yet")]
    NotOpen(NodeId),

    #[error("outbound queue of session {0} is full")]
    Overloaded(NodeId),

    #[error("connection to {0} lost")]
    ConnectionLost(NodeId),

    #[error("encoded frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// How a pending call ended without a CallResult
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallFailure {
    /// The peer answered with a CallError
    #[error("call rejected: {:?} {}", .0.error_code, .0.error_description)]
    Rejected(CallError),

    /// No answer before the deadline
    #[error("timed out waiting for answer")]
    Timeout,

    /// The session the call was routed through closed
    #[error("connection lost before answer")]
    ConnectionLost,

    /// The caller gave up
    #[error("call cancelled")]
    Cancelled,
}

/// Everything `send_call` can resolve with besides a CallResult
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SendError {
    #[error("no route to {0}")]
    NoRoute(NodeId),

    #[error("destination overloaded: {0}")]
    Overloaded(NodeId),

    #[error("call rejected by peer: {:?} {}", .0.error_code, .0.error_description)]
    Rejected(CallError),

    #[error("timed out waiting for answer")]
    Timeout,

    #[error("connection lost before answer")]
    ConnectionLost,

    #[error("call cancelled")]
    Cancelled,

    #[error("message id {0} already has a pending call")]
    DuplicateMessageId(MessageId),

    #[error("encoded frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Unroutable(RouteError),

    #[error("invalid message id {0:?}")]
    InvalidMessageId(String),

    /// CallResult payload did not match the expected response type
    #[error("invalid response payload: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<CallFailure> for SendError {
    fn from(f: CallFailure) -> Self {
        match f {
            CallFailure::Rejected(e) => SendError::Rejected(e),
            CallFailure::Timeout => SendError::Timeout,
            CallFailure::ConnectionLost => SendError::ConnectionLost,
            CallFailure::Cancelled => SendError::Cancelled,
        }
    }
}

impl From<RouteError> for SendError {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::NoRoute(node) => SendError::NoRoute(node),
            other => SendError::Unroutable(other),
        }
    }
}

impl From<SessionError> for SendError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Overloaded(node) => SendError::Overloaded(node),
            SessionError::NotOpen(_) | SessionError::ConnectionLost(_) => SendError::ConnectionLost,
            SessionError::FrameTooLarge { size, max } => SendError::FrameTooLarge { size, max },
            SessionError::Codec(c) => SendError::Codec(c),
        }
    }
}

impl From<RegistryError> for SendError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DuplicateMessageId(id) => SendError::DuplicateMessageId(id),
            // Registration never reports an unknown correlation
            RegistryError::UnknownCorrelation(id) => SendError::InvalidMessageId(id.to_string()),
        }
    }
}
