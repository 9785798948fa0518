//! Envelope codec: wire messages to/from [`Envelope`]s
//!
//! Two wire formats carry the same logical frame:
//! - `json`: OCPP-J text arrays, optionally followed by a routing object
//! - `binary`: length-prefixed segments for binary-capable actions
//!
//! The codec never looks inside payloads and never enforces size limits.

mod binary;
mod json;

use std::sync::Arc;

use bytes::Bytes;

use crate::error::CodecError;
use crate::frame::Envelope;
use crate::types::{Action, NodeId};

/// Wire format of a single WebSocket message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    Binary,
}

/// One message as carried by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

impl WireMessage {
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(s) => s.len(),
            WireMessage::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn format(&self) -> WireFormat {
        match self {
            WireMessage::Text(_) => WireFormat::Json,
            WireMessage::Binary(_) => WireFormat::Binary,
        }
    }
}

/// JSON flavour spoken on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// Frames carry the trailing routing object
    #[default]
    Networking,
    /// Plain OCPP-J arrays, for peers that do not speak the extension
    Plain,
}

/// Which actions may travel in binary frames
pub trait BinaryCapability: Send + Sync {
    fn is_binary_capable(&self, action: &Action) -> bool;
}

impl<F> BinaryCapability for F
where
    F: Fn(&Action) -> bool + Send + Sync,
{
    fn is_binary_capable(&self, action: &Action) -> bool {
        self(action)
    }
}

/// The two ends of the link a message arrived on.
///
/// Supplies destination and path for frames without routing information.
#[derive(Debug, Clone, Copy)]
pub struct Link<'a> {
    pub local: &'a NodeId,
    pub remote: &'a NodeId,
}

/// Result of decoding one wire message
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub envelope: Envelope,
    pub format: WireFormat,
    /// False when destination and path were filled in from the link
    pub routed: bool,
}

/// Stateless envelope codec
#[derive(Clone)]
pub struct Codec {
    binary: Arc<dyn BinaryCapability>,
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec").finish_non_exhaustive()
    }
}

impl Codec {
    pub fn new(binary: Arc<dyn BinaryCapability>) -> Self {
        Self { binary }
    }

    /// Codec that rejects all binary framing
    pub fn json_only() -> Self {
        Self::new(Arc::new(|_: &Action| false))
    }

    pub fn is_binary_capable(&self, action: &Action) -> bool {
        self.binary.is_binary_capable(action)
    }

    /// Decode one wire message
    pub fn decode(&self, msg: &WireMessage, link: Link<'_>) -> Result<Decoded, CodecError> {
        match msg {
            WireMessage::Text(text) => {
                let (envelope, routed) = json::decode(text, link)?;
                Ok(Decoded {
                    envelope,
                    format: WireFormat::Json,
                    routed,
                })
            }
            WireMessage::Binary(bytes) => {
                let envelope = binary::decode(bytes.clone(), self.binary.as_ref())?;
                Ok(Decoded {
                    envelope,
                    format: WireFormat::Binary,
                    routed: true,
                })
            }
        }
    }

    /// Encode an envelope in the networking dialect
    pub fn encode(&self, envelope: &Envelope, format: WireFormat) -> Result<WireMessage, CodecError> {
        self.encode_with(envelope, format, Dialect::Networking)
    }

    pub fn encode_with(
        &self,
        envelope: &Envelope,
        format: WireFormat,
        dialect: Dialect,
    ) -> Result<WireMessage, CodecError> {
        match format {
            WireFormat::Json => json::encode(envelope, dialect).map(WireMessage::Text),
            WireFormat::Binary => {
                binary::encode(envelope, self.binary.as_ref()).map(WireMessage::Binary)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Call, CallError, CallResult, ErrorCode, Frame};
    use crate::types::{MessageId, NetworkPath, Payload};
    use serde_json::json;

    fn codec() -> Codec {
        Codec::new(Arc::new(|a: &Action| a.as_str() == "BinaryDataTransfer"))
    }

    fn link<'a>(local: &'a NodeId, remote: &'a NodeId) -> Link<'a> {
        Link { local, remote }
    }

    fn id(s: &str) -> MessageId {
        MessageId::parse(s).unwrap()
    }

    fn path(hops: &[&str]) -> NetworkPath {
        NetworkPath::from_hops(hops.iter().map(|h| NodeId::from(*h)).collect()).unwrap()
    }

    #[test]
    fn test_plain_call_parsing() {
        let local = NodeId::from("CSMS");
        let remote = NodeId::from("CS001");
        let text = r#"[2, "msg-123", "Heartbeat", {}]"#;
        let decoded = codec()
            .decode(&WireMessage::Text(text.into()), link(&local, &remote))
            .unwrap();

        assert!(!decoded.routed);
        assert_eq!(decoded.envelope.destination, local);
        match decoded.envelope.frame {
            Frame::Call(call) => {
                assert_eq!(call.message_id, id("msg-123"));
                assert_eq!(call.action.as_str(), "Heartbeat");
                assert_eq!(call.network_path, path(&["CS001"]));
            }
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_result_and_error_parsing() {
        let local = NodeId::from("CS001");
        let remote = NodeId::from("CSMS");
        let c = codec();

        let result = r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#;
        match c.decode(&WireMessage::Text(result.into()), link(&local, &remote)).unwrap().envelope.frame {
            Frame::CallResult(r) => {
                assert_eq!(r.message_id, id("msg-123"));
                assert_eq!(r.payload, Payload::Json(json!({"currentTime": "2026-01-20T12:00:00Z"})));
            }
            other => panic!("Expected CallResult, got {:?}", other),
        }

        let error = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        match c.decode(&WireMessage::Text(error.into()), link(&local, &remote)).unwrap().envelope.frame {
            Frame::CallError(e) => {
                assert_eq!(e.error_code, ErrorCode::NotImplemented);
                assert_eq!(e.error_description, "Action not supported");
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_encoding_matches_ocpp_j() {
        let call = Call::with_id(id("m1"), "CSMS".into(), "Heartbeat".into(), Payload::empty());
        let envelope = Envelope::new("CS001".into(), Frame::Call(call));
        let msg = codec()
            .encode_with(&envelope, WireFormat::Json, Dialect::Plain)
            .unwrap();

        assert_eq!(msg, WireMessage::Text(r#"[2,"m1","Heartbeat",{}]"#.into()));
    }

    #[test]
    fn test_unknown_error_code_relayed_unchanged() {
        let local = NodeId::from("R");
        let remote = NodeId::from("CS001");
        let c = codec();
        let text = r#"[4,"m1","FormationViolation","bad",{}]"#;
        let decoded = c
            .decode(&WireMessage::Text(text.into()), link(&local, &remote))
            .unwrap();

        let msg = c
            .encode_with(&decoded.envelope, WireFormat::Json, Dialect::Plain)
            .unwrap();
        assert_eq!(msg, WireMessage::Text(text.into()));
    }

    #[test]
    fn test_routed_round_trip_both_formats() {
        let local = NodeId::from("C");
        let remote = NodeId::from("R");
        let c = codec();

        let mut call = Call::with_id(
            id("bin-1"),
            "A".into(),
            "BinaryDataTransfer".into(),
            Payload::from(vec![0u8, 159, 146, 150]),
        );
        call.network_path = path(&["A", "R"]);
        let envelope = Envelope::new("C".into(), Frame::Call(call));

        for format in [WireFormat::Json, WireFormat::Binary] {
            if format == WireFormat::Json {
                // Binary payloads cannot ride in text frames
                assert!(c.encode(&envelope, format).is_err());
                continue;
            }
            let wire = c.encode(&envelope, format).unwrap();
            let decoded = c.decode(&wire, link(&local, &remote)).unwrap();
            assert!(decoded.routed);
            assert_eq!(decoded.envelope, envelope);
        }

        let result = CallResult::new(id("m2"), Payload::Json(json!({"status": "Accepted"})), path(&["C", "R"]));
        let envelope = Envelope::new("A".into(), Frame::CallResult(result));
        for format in [WireFormat::Json, WireFormat::Binary] {
            let wire = c.encode(&envelope, format).unwrap();
            assert_eq!(wire.format(), format);
            assert_eq!(c.decode(&wire, link(&local, &remote)).unwrap().envelope, envelope);
        }

        let error = CallError::new(id("m3"), ErrorCode::ProtocolError, "hop limit exceeded", path(&["R"]))
            .with_details(json!({"maxHops": 8}));
        let envelope = Envelope::new("A".into(), Frame::CallError(error));
        let wire = c.encode(&envelope, WireFormat::Json).unwrap();
        assert_eq!(c.decode(&wire, link(&local, &remote)).unwrap().envelope, envelope);
    }

    #[test]
    fn test_malformed_envelopes() {
        let local = NodeId::from("CSMS");
        let remote = NodeId::from("CS001");
        let c = codec();

        for text in [
            "not json",
            "[]",
            r#"{"a": 1}"#,
            r#"["2", "m1", "Heartbeat", {}]"#,
            r#"[7, "m1", "Heartbeat", {}]"#,
            r#"[2, "m1", "Heartbeat"]"#,
            r#"[3, "m1"]"#,
            r#"[4, "m1", "GenericError", "x"]"#,
            r#"[2, 17, "Heartbeat", {}]"#,
            r#"[2, "", "Heartbeat", {}]"#,
        ] {
            let err = c.decode(&WireMessage::Text(text.into()), link(&local, &remote)).unwrap_err();
            assert!(
                matches!(err, CodecError::MalformedEnvelope { .. }),
                "{} gave {:?}",
                text,
                err
            );
        }

        // The sender of a broken Call can still be answered
        let err = c
            .decode(&WireMessage::Text(r#"[2, "m9", 42, {}]"#.into()), link(&local, &remote))
            .unwrap_err();
        assert_eq!(err.call_id(), Some(&id("m9")));
    }

    #[test]
    fn test_binary_requires_capability() {
        let local = NodeId::from("C");
        let remote = NodeId::from("A");
        let call = Call::with_id(id("m1"), "A".into(), "Heartbeat".into(), Payload::empty());
        let envelope = Envelope::new("C".into(), Frame::Call(call));

        let err = codec().encode(&envelope, WireFormat::Binary).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedFormat { .. }));

        // A peer that considers Heartbeat binary-capable sends it anyway
        let permissive = Codec::new(Arc::new(|_: &Action| true));
        let wire = permissive.encode(&envelope, WireFormat::Binary).unwrap();
        let err = codec().decode(&wire, link(&local, &remote)).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedFormat { .. }));
        assert_eq!(err.call_id(), Some(&id("m1")));
    }

    #[test]
    fn test_binary_call_error_rejected() {
        let error = CallError::new(id("m1"), ErrorCode::GenericError, "boom", path(&["C"]));
        let envelope = Envelope::new("A".into(), Frame::CallError(error));
        let err = codec().encode(&envelope, WireFormat::Binary).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedFormat { .. }));
    }
}
