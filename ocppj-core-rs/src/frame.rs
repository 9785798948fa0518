//! OCPP-J frame model
//!
//! Three frame kinds share one correlation id space:
//! - CALL: request carrying an action and payload
//! - CALLRESULT: successful answer
//! - CALLERROR: failed answer with an error code
//!
//! Every frame also carries the [`NetworkPath`] it travelled. The destination
//! travels beside the frame in an [`Envelope`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Action, MessageId, NetworkPath, NodeId, Payload};

/// OCPP-J message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }
}

/// OCPP-J error codes.
///
/// Codes outside the OCPP 2.x set (OCPP 1.6's `FormationViolation`, vendor
/// codes) are kept verbatim in `Other` so relays pass them on unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
    Other(String),
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 12] = [
        ErrorCode::FormatViolation,
        ErrorCode::GenericError,
        ErrorCode::InternalError,
        ErrorCode::MessageTypeNotSupported,
        ErrorCode::NotImplemented,
        ErrorCode::NotSupported,
        ErrorCode::OccurrenceConstraintViolation,
        ErrorCode::PropertyConstraintViolation,
        ErrorCode::ProtocolError,
        ErrorCode::RpcFrameworkError,
        ErrorCode::SecurityError,
        ErrorCode::TypeConstraintViolation,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::Other(code) => code,
        }
    }

    /// Parse a wire error code
    pub fn from_wire(s: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .unwrap_or_else(|| ErrorCode::Other(s.to_string()))
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(ErrorCode::from_wire(&code))
    }
}

/// OCPP-J CALL frame (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: MessageId,
    pub action: Action,
    pub payload: Payload,
    pub network_path: NetworkPath,
    pub sent_at: DateTime<Utc>,
}

impl Call {
    /// Create a new CALL originated by `origin` with an auto-generated id
    pub fn new(origin: NodeId, action: Action, payload: Payload) -> Self {
        Self::with_id(MessageId::generate(), origin, action, payload)
    }

    pub fn with_id(message_id: MessageId, origin: NodeId, action: Action, payload: Payload) -> Self {
        Self {
            message_id,
            action,
            payload,
            network_path: NetworkPath::origin(origin),
            sent_at: Utc::now(),
        }
    }

    /// Parse a JSON payload as a specific request type
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        parse_json(&self.payload)
    }
}

/// OCPP-J CALLRESULT frame (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: MessageId,
    pub payload: Payload,
    pub network_path: NetworkPath,
}

impl CallResult {
    pub fn new(message_id: MessageId, payload: Payload, network_path: NetworkPath) -> Self {
        Self {
            message_id,
            payload,
            network_path,
        }
    }

    /// Parse a JSON payload as a specific response type
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        parse_json(&self.payload)
    }
}

/// OCPP-J CALLERROR frame (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: MessageId,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
    pub network_path: NetworkPath,
}

impl CallError {
    /// Create a new CALLERROR with empty details
    pub fn new(
        message_id: MessageId,
        error_code: ErrorCode,
        error_description: impl Into<String>,
        network_path: NetworkPath,
    ) -> Self {
        Self {
            message_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
            network_path,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }
}

/// Any OCPP-J frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Call(_) => MessageType::Call,
            Frame::CallResult(_) => MessageType::CallResult,
            Frame::CallError(_) => MessageType::CallError,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        match self {
            Frame::Call(c) => &c.message_id,
            Frame::CallResult(r) => &r.message_id,
            Frame::CallError(e) => &e.message_id,
        }
    }

    pub fn network_path(&self) -> &NetworkPath {
        match self {
            Frame::Call(c) => &c.network_path,
            Frame::CallResult(r) => &r.network_path,
            Frame::CallError(e) => &e.network_path,
        }
    }

    /// Action name, for Calls only
    pub fn action(&self) -> Option<&Action> {
        match self {
            Frame::Call(c) => Some(&c.action),
            _ => None,
        }
    }

    /// Same frame carrying a different network path
    pub fn with_network_path(&self, network_path: NetworkPath) -> Frame {
        match self {
            Frame::Call(c) => Frame::Call(Call {
                network_path,
                ..c.clone()
            }),
            Frame::CallResult(r) => Frame::CallResult(CallResult {
                network_path,
                ..r.clone()
            }),
            Frame::CallError(e) => Frame::CallError(CallError {
                network_path,
                ..e.clone()
            }),
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Frame::Call(c) => Some(&c.payload),
            Frame::CallResult(r) => Some(&r.payload),
            Frame::CallError(_) => None,
        }
    }
}

/// A frame plus the node it is addressed to
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub destination: NodeId,
    pub frame: Frame,
}

impl Envelope {
    pub fn new(destination: NodeId, frame: Frame) -> Self {
        Self { destination, frame }
    }
}

/// Typed payload access failures
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is binary, expected JSON")]
    NotJson,

    #[error("payload does not match expected type: {0}")]
    Json(#[from] serde_json::Error),
}

fn parse_json<T: DeserializeOwned>(payload: &Payload) -> Result<T, PayloadError> {
    match payload {
        Payload::Json(v) => Ok(T::deserialize(v)?),
        Payload::Binary(_) => Err(PayloadError::NotJson),
    }
}
