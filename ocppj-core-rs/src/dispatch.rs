//! Action dispatch table
//!
//! Maps action names to handlers for inbound Calls. Handlers see opaque
//! payloads; `register_typed` layers serde (de)serialization on top so a
//! message catalogue can plug in plain request/response structs.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::codec::BinaryCapability;
use crate::frame::{Call, ErrorCode};
use crate::types::{Action, Payload};

/// Failure returned by a handler; sent back as a CallError
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {description}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl HandlerError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn format_violation(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::FormatViolation, description)
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, description)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

pub type HandlerResult = Result<Payload, HandlerError>;

/// Type-erased handler for one action
pub type BoxedHandler = Arc<dyn Fn(Call) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Handlers and binary capability per action
#[derive(Default)]
pub struct DispatchTable {
    handlers: RwLock<HashMap<Action, BoxedHandler>>,
    binary: RwLock<HashSet<Action>>,
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("actions", &self.actions())
            .field("binary", &*self.binary.read())
            .finish()
    }
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw handler, replacing any previous one for `action`
    pub fn register<F, Fut>(&self, action: impl Into<Action>, handler: F)
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let action = action.into();
        debug!("Registering handler for {}", action);
        let boxed: BoxedHandler = Arc::new(move |call| handler(call).boxed());
        self.handlers.write().insert(action, boxed);
    }

    /// Register a handler working on typed JSON request/response bodies.
    ///
    /// A payload that does not deserialize into `Req` is answered with
    /// `FormatViolation` without invoking `handler`.
    pub fn register_typed<Req, Resp, F, Fut>(&self, action: impl Into<Action>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(action, move |call: Call| {
            let handler = handler.clone();
            async move {
                let request: Req = call
                    .parse_payload()
                    .map_err(|e| HandlerError::format_violation(e.to_string()))?;
                let response = handler(request).await?;
                serde_json::to_value(response)
                    .map(Payload::Json)
                    .map_err(|e| HandlerError::internal(e.to_string()))
            }
        });
    }

    /// Register a handler and allow its Calls and results to use binary frames
    pub fn register_binary<F, Fut>(&self, action: impl Into<Action>, handler: F)
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let action = action.into();
        self.mark_binary(action.clone());
        self.register(action, handler);
    }

    /// Allow binary framing for `action` without registering a handler,
    /// e.g. for actions this node only sends
    pub fn mark_binary(&self, action: impl Into<Action>) {
        self.binary.write().insert(action.into());
    }

    pub fn unregister(&self, action: &Action) -> bool {
        self.handlers.write().remove(action).is_some()
    }

    pub fn handler(&self, action: &Action) -> Option<BoxedHandler> {
        self.handlers.read().get(action).cloned()
    }

    pub fn actions(&self) -> Vec<Action> {
        let mut actions: Vec<_> = self.handlers.read().keys().cloned().collect();
        actions.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        actions
    }
}

impl BinaryCapability for DispatchTable {
    fn is_binary_capable(&self, action: &Action) -> bool {
        self.binary.read().contains(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct StatusNotificationRequest {
        evse_id: i32,
    }

    #[derive(Serialize)]
    struct Empty {}

    fn call(action: &str, payload: Value) -> Call {
        Call::new("CS001".into(), action.into(), Payload::Json(payload))
    }

    #[tokio::test]
    async fn test_typed_handler() {
        let table = DispatchTable::new();
        table.register_typed("StatusNotification", |req: StatusNotificationRequest| async move {
            if req.evse_id < 0 {
                return Err(HandlerError::new(ErrorCode::PropertyConstraintViolation, "negative evse"));
            }
            Ok(Empty {})
        });

        let handler = table.handler(&"StatusNotification".into()).unwrap();
        assert_eq!(handler(call("StatusNotification", json!({"evseId": 1}))).await, Ok(Payload::Json(json!({}))));

        let err = handler(call("StatusNotification", json!({"evseId": -1}))).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PropertyConstraintViolation);

        let err = handler(call("StatusNotification", json!({"evse": "x"}))).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::FormatViolation);
    }

    #[test]
    fn test_binary_capability() {
        let table = DispatchTable::new();
        table.register_binary("BinaryDataTransfer", |_call: Call| async { Ok(Payload::from(vec![1u8])) });
        table.mark_binary("SignedFirmwareChunk");

        assert!(table.is_binary_capable(&"BinaryDataTransfer".into()));
        assert!(table.is_binary_capable(&"SignedFirmwareChunk".into()));
        assert!(!table.is_binary_capable(&"Heartbeat".into()));
        assert_eq!(table.actions(), vec![Action::from("BinaryDataTransfer")]);
    }
}
