//! Binary framing for binary-capable actions
//!
//! ```text
//! u8 tag | u8 payload kind | segments...
//! segment   = u32 length (BE) || bytes
//! CALL       = id, action, destination, sentAt, u16 hops, hop*, payload
//! CALLRESULT = id, destination, u16 hops, hop*, payload
//! ```
//!
//! Payload kind 0 is UTF-8 JSON, 1 is raw bytes. CALLERROR has no binary form.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};

use super::BinaryCapability;
use crate::error::CodecError;
use crate::frame::{Call, CallResult, Envelope, Frame, MessageType};
use crate::types::{Action, MessageId, NetworkPath, NodeId, Payload};

const PAYLOAD_JSON: u8 = 0;
const PAYLOAD_RAW: u8 = 1;

pub(super) fn encode(
    envelope: &Envelope,
    capability: &dyn BinaryCapability,
) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();

    match &envelope.frame {
        Frame::Call(call) => {
            if !capability.is_binary_capable(&call.action) {
                return Err(CodecError::unsupported(format!(
                    "action {} is not binary-capable",
                    call.action
                )));
            }
            let payload = payload_bytes(&call.payload)?;
            buf.put_u8(MessageType::Call.tag());
            buf.put_u8(payload_kind(&call.payload));
            put_segment(&mut buf, call.message_id.as_str().as_bytes());
            put_segment(&mut buf, call.action.as_str().as_bytes());
            put_segment(&mut buf, envelope.destination.as_str().as_bytes());
            put_segment(
                &mut buf,
                call.sent_at
                    .to_rfc3339_opts(SecondsFormat::AutoSi, true)
                    .as_bytes(),
            );
            put_path(&mut buf, &call.network_path)?;
            put_segment(&mut buf, &payload);
        }
        Frame::CallResult(result) => {
            let payload = payload_bytes(&result.payload)?;
            buf.put_u8(MessageType::CallResult.tag());
            buf.put_u8(payload_kind(&result.payload));
            put_segment(&mut buf, result.message_id.as_str().as_bytes());
            put_segment(&mut buf, envelope.destination.as_str().as_bytes());
            put_path(&mut buf, &result.network_path)?;
            put_segment(&mut buf, &payload);
        }
        Frame::CallError(_) => {
            return Err(CodecError::unsupported("CallError frames have no binary form"));
        }
    }

    Ok(buf.freeze())
}

pub(super) fn decode(
    bytes: Bytes,
    capability: &dyn BinaryCapability,
) -> Result<Envelope, CodecError> {
    let mut reader = Reader { buf: bytes };

    let tag = reader.u8("message type")?;
    let message_type = MessageType::from_tag(u64::from(tag))
        .ok_or_else(|| CodecError::malformed(format!("unknown message type {}", tag)))?;
    let kind = reader.u8("payload kind")?;
    let message_id = MessageId::parse(&reader.string("message id")?)
        .ok_or_else(|| CodecError::malformed("invalid message id"))?;

    match message_type {
        MessageType::Call => {
            let (destination, call) = decode_call(&mut reader, kind, message_id.clone())
                .map_err(|e| e.for_call(&message_id))?;
            if !capability.is_binary_capable(&call.action) {
                return Err(CodecError::unsupported(format!(
                    "action {} is not binary-capable",
                    call.action
                ))
                .for_call(&message_id));
            }
            Ok(Envelope::new(destination, Frame::Call(call)))
        }
        MessageType::CallResult => {
            let destination = NodeId::from(reader.string("destination")?);
            let network_path = reader.path()?;
            let payload = reader.payload(kind)?;
            reader.finish()?;
            Ok(Envelope::new(
                destination,
                Frame::CallResult(CallResult {
                    message_id,
                    payload,
                    network_path,
                }),
            ))
        }
        MessageType::CallError => Err(CodecError::unsupported(
            "CallError frames have no binary form",
        )),
    }
}

fn decode_call(
    reader: &mut Reader,
    kind: u8,
    message_id: MessageId,
) -> Result<(NodeId, Call), CodecError> {
    let action = reader.string("action")?;
    if action.is_empty() {
        return Err(CodecError::malformed("empty action"));
    }
    let destination = NodeId::from(reader.string("destination")?);
    let sent_at = DateTime::parse_from_rfc3339(&reader.string("sent at")?)
        .map_err(|e| CodecError::malformed(format!("invalid sent at: {}", e)))?
        .with_timezone(&Utc);
    let network_path = reader.path()?;
    let payload = reader.payload(kind)?;
    reader.finish()?;

    Ok((
        destination,
        Call {
            message_id,
            action: Action::new(action),
            payload,
            network_path,
            sent_at,
        },
    ))
}

fn payload_kind(payload: &Payload) -> u8 {
    match payload {
        Payload::Json(_) => PAYLOAD_JSON,
        Payload::Binary(_) => PAYLOAD_RAW,
    }
}

fn payload_bytes(payload: &Payload) -> Result<Bytes, CodecError> {
    match payload {
        Payload::Json(v) => serde_json::to_vec(v)
            .map(Bytes::from)
            .map_err(|e| CodecError::malformed(e.to_string())),
        Payload::Binary(b) => Ok(b.clone()),
    }
}

fn put_segment(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn put_path(buf: &mut BytesMut, path: &NetworkPath) -> Result<(), CodecError> {
    let hops = u16::try_from(path.len())
        .map_err(|_| CodecError::malformed("network path too long for binary frame"))?;
    buf.put_u16(hops);
    for hop in path.hops() {
        put_segment(buf, hop.as_str().as_bytes());
    }
    Ok(())
}

/// Bounds-checked reader over a binary frame
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn u8(&mut self, what: &str) -> Result<u8, CodecError> {
        if self.buf.remaining() < 1 {
            return Err(CodecError::malformed(format!("truncated before {}", what)));
        }
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, what: &str) -> Result<u16, CodecError> {
        if self.buf.remaining() < 2 {
            return Err(CodecError::malformed(format!("truncated before {}", what)));
        }
        Ok(self.buf.get_u16())
    }

    fn segment(&mut self, what: &str) -> Result<Bytes, CodecError> {
        if self.buf.remaining() < 4 {
            return Err(CodecError::malformed(format!("truncated before {}", what)));
        }
        let len = self.buf.get_u32() as usize;
        if self.buf.remaining() < len {
            return Err(CodecError::malformed(format!(
                "{} segment of {} bytes is truncated",
                what, len
            )));
        }
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self, what: &str) -> Result<String, CodecError> {
        let bytes = self.segment(what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CodecError::malformed(format!("{} is not UTF-8", what)))
    }

    fn path(&mut self) -> Result<NetworkPath, CodecError> {
        let count = self.u16("hop count")?;
        let hops = (0..count)
            .map(|_| self.string("hop").map(NodeId::from))
            .collect::<Result<Vec<_>, _>>()?;
        NetworkPath::from_hops(hops).map_err(|e| CodecError::malformed(e.to_string()))
    }

    fn payload(&mut self, kind: u8) -> Result<Payload, CodecError> {
        let bytes = self.segment("payload")?;
        match kind {
            PAYLOAD_JSON => serde_json::from_slice(&bytes)
                .map(Payload::Json)
                .map_err(|e| CodecError::malformed(format!("invalid JSON payload: {}", e))),
            PAYLOAD_RAW => Ok(Payload::Binary(bytes)),
            other => Err(CodecError::malformed(format!("unknown payload kind {}", other))),
        }
    }

    fn finish(&self) -> Result<(), CodecError> {
        if self.buf.has_remaining() {
            return Err(CodecError::malformed(format!(
                "{} trailing bytes",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}
