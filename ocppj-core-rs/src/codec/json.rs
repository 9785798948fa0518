//! OCPP-J text framing
//!
//! - CALL: [2, messageId, action, payload, routing?]
//! - CALLRESULT: [3, messageId, payload, routing?]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails, routing?]
//!
//! `routing` is `{"destination", "networkPath", "sentAt"?}`; without it the
//! frame is plain OCPP-J and is addressed to the receiving node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Dialect, Link};
use crate::error::CodecError;
use crate::frame::{Call, CallError, CallResult, Envelope, ErrorCode, Frame, MessageType};
use crate::types::{Action, MessageId, NetworkPath, NodeId, Payload};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Routing {
    destination: NodeId,
    network_path: NetworkPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sent_at: Option<DateTime<Utc>>,
}

pub(super) fn encode(envelope: &Envelope, dialect: Dialect) -> Result<String, CodecError> {
    let mut array = match &envelope.frame {
        Frame::Call(call) => vec![
            Value::from(MessageType::Call.tag()),
            Value::from(call.message_id.as_str()),
            Value::from(call.action.as_str()),
            json_payload(&call.payload)?,
        ],
        Frame::CallResult(result) => vec![
            Value::from(MessageType::CallResult.tag()),
            Value::from(result.message_id.as_str()),
            json_payload(&result.payload)?,
        ],
        Frame::CallError(error) => vec![
            Value::from(MessageType::CallError.tag()),
            Value::from(error.message_id.as_str()),
            Value::from(error.error_code.as_str()),
            Value::from(error.error_description.as_str()),
            error.error_details.clone(),
        ],
    };

    if dialect == Dialect::Networking {
        let routing = Routing {
            destination: envelope.destination.clone(),
            network_path: envelope.frame.network_path().clone(),
            sent_at: match &envelope.frame {
                Frame::Call(call) => Some(call.sent_at),
                _ => None,
            },
        };
        array.push(serde_json::to_value(routing).map_err(|e| CodecError::malformed(e.to_string()))?);
    }

    serde_json::to_string(&array).map_err(|e| CodecError::malformed(e.to_string()))
}

fn json_payload(payload: &Payload) -> Result<Value, CodecError> {
    match payload {
        Payload::Json(v) => Ok(v.clone()),
        Payload::Binary(_) => Err(CodecError::unsupported("binary payload in a text frame")),
    }
}

pub(super) fn decode(text: &str, link: Link<'_>) -> Result<(Envelope, bool), CodecError> {
    let array: Vec<Value> = serde_json::from_str(text)
        .map_err(|e| CodecError::malformed(format!("not a JSON array: {}", e)))?;

    let tag = array
        .first()
        .ok_or_else(|| CodecError::malformed("empty array"))?
        .as_u64()
        .ok_or_else(|| CodecError::malformed("message type is not an integer"))?;
    let message_type = MessageType::from_tag(tag)
        .ok_or_else(|| CodecError::malformed(format!("unknown message type {}", tag)))?;

    let message_id = array
        .get(1)
        .and_then(Value::as_str)
        .and_then(MessageId::parse)
        .ok_or_else(|| CodecError::malformed("missing or invalid message id"))?;

    match message_type {
        MessageType::Call => {
            // CALL: [2, messageId, action, payload]
            decode_call(&array, message_id.clone(), link).map_err(|e| e.for_call(&message_id))
        }
        MessageType::CallResult => {
            // CALLRESULT: [3, messageId, payload]
            let routing = routing(&array, 3)?;
            let payload = Payload::Json(array[2].clone());
            let (destination, network_path, routed) = resolve(routing, link);

            let frame = Frame::CallResult(CallResult {
                message_id,
                payload,
                network_path,
            });
            Ok((Envelope::new(destination, frame), routed))
        }
        MessageType::CallError => {
            // CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
            let routing = routing(&array, 5)?;
            let error_code = array[2]
                .as_str()
                .map(ErrorCode::from_wire)
                .ok_or_else(|| CodecError::malformed("error code is not a string"))?;
            let error_description = array[3]
                .as_str()
                .ok_or_else(|| CodecError::malformed("error description is not a string"))?
                .to_string();
            let error_details = array[4].clone();
            let (destination, network_path, routed) = resolve(routing, link);

            let frame = Frame::CallError(CallError {
                message_id,
                error_code,
                error_description,
                error_details,
                network_path,
            });
            Ok((Envelope::new(destination, frame), routed))
        }
    }
}

fn decode_call(
    array: &[Value],
    message_id: MessageId,
    link: Link<'_>,
) -> Result<(Envelope, bool), CodecError> {
    let routing = routing(array, 4)?;

    let action = array[2]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(Action::new)
        .ok_or_else(|| CodecError::malformed("action is not a string"))?;
    let payload = Payload::Json(array[3].clone());

    let sent_at = routing
        .as_ref()
        .and_then(|r| r.sent_at)
        .unwrap_or_else(Utc::now);
    let (destination, network_path, routed) = resolve(routing, link);

    let frame = Frame::Call(Call {
        message_id,
        action,
        payload,
        network_path,
        sent_at,
    });
    Ok((Envelope::new(destination, frame), routed))
}

/// Check the array length and parse the optional trailing routing object
fn routing(array: &[Value], positional: usize) -> Result<Option<Routing>, CodecError> {
    match array.len() {
        n if n == positional => Ok(None),
        n if n == positional + 1 => serde_json::from_value(array[positional].clone())
            .map(Some)
            .map_err(|e| CodecError::malformed(format!("invalid routing object: {}", e))),
        n if n < positional => Err(CodecError::malformed(format!(
            "expected {} elements, got {}",
            positional, n
        ))),
        n => Err(CodecError::malformed(format!(
            "unexpected trailing elements ({} of at most {})",
            n,
            positional + 1
        ))),
    }
}

fn resolve(routing: Option<Routing>, link: Link<'_>) -> (NodeId, NetworkPath, bool) {
    match routing {
        Some(r) => (r.destination, r.network_path, true),
        None => (
            link.local.clone(),
            NetworkPath::origin(link.remote.clone()),
            false,
        ),
    }
}
