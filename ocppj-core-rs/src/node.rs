//! Networking node facade
//!
//! Owns the dispatch table, pending-call registry, router and the sessions
//! attached to this node. Each session's reader hands decoded frames to the
//! node, which either answers them locally, completes a pending call, or
//! forwards them one hop further.
//!
//! ```text
//!   A ──Call [A]──► R ──Call [A > R]──► C
//!   A ◄─Result [C > R]── R ◄─Result [C]── C
//! ```
//!
//! Peers configured as plain OCPP-J cannot carry routing information. When R
//! forwards a Call to such a peer it remembers who originated it, so the
//! plain answer can be addressed back to that origin.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::codec::{Codec, Decoded, Dialect, WireFormat};
use crate::config::NodeConfig;
use crate::dispatch::{DispatchTable, HandlerError, HandlerResult};
use crate::error::{CodecError, RouteError, SendError};
use crate::frame::{Call, CallError, CallResult, Envelope, ErrorCode, Frame};
use crate::registry::PendingCallRegistry;
use crate::router::{InboundRoute, NextHop, Router};
use crate::session::{SessionConfig, SessionHandle, SessionListener};
use crate::transit::TransitTable;
use crate::transport::{in_memory_pair, Transport};
use crate::types::{Action, Direction, MessageId, NetworkPath, NodeId, Payload};

/// One frame seen by the node, for observers
#[derive(Debug, Clone, PartialEq)]
pub struct FrameObservation {
    pub direction: Direction,
    /// Peer the frame came from or went to
    pub node: NodeId,
    pub frame: Frame,
    pub timestamp: DateTime<Utc>,
}

/// A networking node: station, relay or central system
#[derive(Clone)]
pub struct NetworkingNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    codec: Codec,
    dispatch: Arc<DispatchTable>,
    registry: Arc<PendingCallRegistry>,
    router: Router,
    sessions: RwLock<HashMap<NodeId, SessionHandle>>,
    /// Origins of Calls forwarded to plain peers
    transit: Arc<TransitTable>,
    observations: broadcast::Sender<FrameObservation>,
    sweepers: [JoinHandle<()>; 2],
}

impl std::fmt::Debug for NetworkingNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkingNode")
            .field("id", self.id())
            .field("sessions", &self.sessions())
            .field("pending", &self.pending_calls())
            .finish()
    }
}

impl NetworkingNode {
    /// Create a node. Must be called within a tokio runtime.
    pub fn new(config: NodeConfig) -> Self {
        let dispatch = Arc::new(DispatchTable::new());
        let codec = Codec::new(dispatch.clone());
        let registry = PendingCallRegistry::new();
        let transit = TransitTable::new();
        let sweepers = [
            registry.spawn_sweeper(config.sweep_interval),
            transit.spawn_sweeper(config.sweep_interval),
        ];
        let (observations, _) = broadcast::channel(config.observation_capacity.max(1));
        let router = Router::new(config.node_id.clone(), config.max_hops);

        info!(
            "Node {} up (max hops {}, max frame {} bytes)",
            config.node_id, config.max_hops, config.max_frame_size
        );

        Self {
            inner: Arc::new(NodeInner {
                config,
                codec,
                dispatch,
                registry,
                router,
                sessions: RwLock::new(HashMap::new()),
                transit,
                observations,
                sweepers,
            }),
        }
    }

    pub fn id(&self) -> &NodeId {
        self.inner.local()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn dispatch(&self) -> &DispatchTable {
        &self.inner.dispatch
    }

    pub fn registry(&self) -> &Arc<PendingCallRegistry> {
        &self.inner.registry
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.registry.len()
    }

    // ---- administration ----

    /// Attach a connection to `remote`, replacing any existing session for it
    pub fn attach(&self, remote: impl Into<NodeId>, transport: Transport) -> SessionHandle {
        let remote = remote.into();
        let config = self.inner.config.session_config(&remote);
        self.attach_with(remote, transport, config)
    }

    pub fn attach_with(
        &self,
        remote: NodeId,
        transport: Transport,
        config: SessionConfig,
    ) -> SessionHandle {
        let previous = self.inner.sessions.write().remove(&remote);
        if let Some(previous) = previous {
            info!("Replacing session {} to {}", previous.id(), remote);
            self.inner.retire(&previous);
        }

        let listener = Arc::new(NodeListener(Arc::downgrade(&self.inner)));
        let session = SessionHandle::spawn(
            transport,
            self.id().clone(),
            remote.clone(),
            config,
            self.inner.codec.clone(),
            listener,
        );
        self.inner
            .sessions
            .write()
            .insert(remote.clone(), session.clone());
        self.inner.router.attach(remote);
        session
    }

    /// Drop the session to `remote`; its pending calls fail with `ConnectionLost`
    pub fn detach(&self, remote: &NodeId) -> bool {
        let session = self.inner.sessions.write().remove(remote);
        match session {
            Some(session) => {
                info!("Detaching {}", remote);
                self.inner.router.detach(remote);
                self.inner.retire(&session);
                true
            }
            None => false,
        }
    }

    pub fn session(&self, remote: &NodeId) -> Option<SessionHandle> {
        self.inner.sessions.read().get(remote).cloned()
    }

    pub fn sessions(&self) -> Vec<NodeId> {
        self.inner.router.attached()
    }

    pub fn set_default_upstream(&self, upstream: Option<NodeId>) {
        self.inner.router.set_default_upstream(upstream);
    }

    pub fn add_route(&self, destination: impl Into<NodeId>, via: impl Into<NodeId>) {
        self.inner.router.add_route(destination.into(), via.into());
    }

    pub fn remove_route(&self, destination: &NodeId) -> Option<NodeId> {
        self.inner.router.remove_route(destination)
    }

    /// Link this node to `other` through an in-process transport
    pub fn link_in_memory(&self, other: &NetworkingNode) -> (SessionHandle, SessionHandle) {
        let (here, there) = in_memory_pair(self.inner.config.queue_capacity.max(1));
        let ours = self.attach(other.id().clone(), here);
        let theirs = other.attach(self.id().clone(), there);
        (ours, theirs)
    }

    /// Close every session
    pub fn shutdown(&self) {
        for remote in self.sessions() {
            self.detach(&remote);
        }
    }

    // ---- handlers ----

    pub fn register_handler<F, Fut>(&self, action: impl Into<Action>, handler: F)
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner.dispatch.register(action, handler);
    }

    pub fn register_typed<Req, Resp, F, Fut>(&self, action: impl Into<Action>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        self.inner.dispatch.register_typed(action, handler);
    }

    // ---- calls ----

    /// Send a Call and wait for its answer, at most `timeout`
    pub async fn send_call(
        &self,
        destination: impl Into<NodeId>,
        action: impl Into<Action>,
        payload: Payload,
        timeout: Duration,
    ) -> Result<CallResult, SendError> {
        self.call(MessageId::generate(), destination.into(), action.into(), payload, timeout)
            .await
    }

    /// Like [`send_call`](Self::send_call) with a caller-chosen message id
    pub async fn send_call_with_id(
        &self,
        message_id: &str,
        destination: impl Into<NodeId>,
        action: impl Into<Action>,
        payload: Payload,
        timeout: Duration,
    ) -> Result<CallResult, SendError> {
        let message_id = MessageId::parse(message_id)
            .ok_or_else(|| SendError::InvalidMessageId(message_id.to_string()))?;
        self.call(message_id, destination.into(), action.into(), payload, timeout)
            .await
    }

    /// Send a typed JSON request and parse the typed response
    pub async fn send_typed<Req, Resp>(
        &self,
        destination: impl Into<NodeId>,
        action: impl Into<Action>,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, SendError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)
            .map_err(|e| CodecError::malformed(format!("request does not serialize: {}", e)))?;
        let result = self
            .send_call(destination, action, Payload::Json(payload), timeout)
            .await?;
        result
            .parse_payload()
            .map_err(|e| SendError::InvalidResponse(e.to_string()))
    }

    async fn call(
        &self,
        message_id: MessageId,
        destination: NodeId,
        action: Action,
        payload: Payload,
        timeout: Duration,
    ) -> Result<CallResult, SendError> {
        let inner = &self.inner;
        let next = inner.router.resolve(&destination)?;
        let session = inner.session_via(&next, &destination)?;

        let call = Call::with_id(message_id, self.id().clone(), action, payload);
        let handle = inner.registry.register(
            call.message_id.clone(),
            destination.clone(),
            next.via.clone(),
            call.action.clone(),
            timeout,
        )?;
        debug!(
            "Call {} {} to {} via {}",
            call.message_id, call.action, destination, next.via
        );

        // Dropping the handle on a failed send cancels the pending entry
        inner.transmit(&session, &Envelope::new(destination, Frame::Call(call)))?;
        handle.wait().await.map_err(SendError::from)
    }

    // ---- observation ----

    /// Subscribe to every frame the node processes.
    ///
    /// Slow receivers lag and lose observations; the node never waits.
    pub fn observe(&self) -> broadcast::Receiver<FrameObservation> {
        self.inner.observations.subscribe()
    }

    /// Run `callback` for every observed frame on a separate task
    pub fn on_frame_observed<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(FrameObservation) + Send + Sync + 'static,
    {
        let mut rx = self.observe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(observation) => callback(observation),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Frame observer lagging, skipped {} frames", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl NodeInner {
    fn local(&self) -> &NodeId {
        &self.config.node_id
    }

    /// Close a session that is no longer in the table and fail what went through it
    fn retire(&self, session: &SessionHandle) {
        session.close();
        let remote = session.remote();
        self.registry.fail_via(remote);
        self.transit.forget_peer(remote);
    }

    fn session_via(&self, next: &NextHop, destination: &NodeId) -> Result<SessionHandle, RouteError> {
        let session = self
            .sessions
            .read()
            .get(&next.via)
            .cloned()
            .ok_or_else(|| RouteError::NoRoute(destination.clone()))?;
        // A plain peer cannot pass a frame on to someone else
        if session.dialect() == Dialect::Plain && !next.direct {
            return Err(RouteError::NoRoute(destination.clone()));
        }
        Ok(session)
    }

    fn transmit(
        &self,
        session: &SessionHandle,
        envelope: &Envelope,
    ) -> Result<(), crate::error::SessionError> {
        let format = match envelope.frame.payload() {
            Some(p) if p.is_binary() => WireFormat::Binary,
            _ => WireFormat::Json,
        };
        session.send(envelope, format)?;
        self.observe(Direction::Outbound, session.remote(), &envelope.frame);
        Ok(())
    }

    fn observe(&self, direction: Direction, node: &NodeId, frame: &Frame) {
        if self.observations.receiver_count() == 0 {
            return;
        }
        // No receivers left is fine
        let _ = self.observations.send(FrameObservation {
            direction,
            node: node.clone(),
            frame: frame.clone(),
            timestamp: Utc::now(),
        });
    }

    fn handle_message(self: &Arc<Self>, session: &SessionHandle, decoded: Result<Decoded, CodecError>) {
        match decoded {
            Ok(decoded) => self.handle_envelope(session, decoded),
            Err(e) => self.handle_decode_error(session, e),
        }
    }

    fn handle_decode_error(&self, session: &SessionHandle, error: CodecError) {
        warn!("Dropping frame from {}: {}", session.remote(), error);
        let Some(message_id) = error.call_id() else {
            return;
        };
        let code = match error {
            CodecError::MalformedEnvelope { .. } => ErrorCode::FormatViolation,
            CodecError::UnsupportedFormat { .. } => ErrorCode::MessageTypeNotSupported,
        };
        let answer = CallError::new(
            message_id.clone(),
            code,
            error.to_string(),
            NetworkPath::origin(self.local().clone()),
        );
        self.reply(session, session.remote().clone(), Frame::CallError(answer));
    }

    fn handle_envelope(self: &Arc<Self>, session: &SessionHandle, decoded: Decoded) {
        let Decoded {
            mut envelope,
            format,
            routed,
        } = decoded;

        let sender = envelope.frame.network_path().sender();
        if sender != session.remote() {
            warn!(
                "Dropping {:?} {} from {}: path {} ends at {}",
                envelope.frame.message_type(),
                envelope.frame.message_id(),
                session.remote(),
                envelope.frame.network_path(),
                sender
            );
            return;
        }
        trace!(
            "{:?} {:?} {} from {} for {}",
            format,
            envelope.frame.message_type(),
            envelope.frame.message_id(),
            session.remote(),
            envelope.destination
        );
        self.observe(Direction::Inbound, session.remote(), &envelope.frame);

        // Plain answers to Calls this node relayed go back to the Call's origin
        if !routed && !matches!(envelope.frame, Frame::Call(_)) {
            if let Some(origin) = self.transit.take(session.remote(), envelope.frame.message_id()) {
                envelope.destination = origin;
            }
        }

        match self.router.route_inbound(&envelope) {
            Ok(InboundRoute::Local) => self.deliver(session, envelope.frame),
            Ok(InboundRoute::Forward { next, network_path }) => {
                self.forward(session, envelope, next, network_path)
            }
            Err(e) => self.refuse(session, &envelope, &e.to_string(), route_error_code(&e)),
        }
    }

    fn deliver(self: &Arc<Self>, session: &SessionHandle, frame: Frame) {
        let (message_id, answer) = match frame {
            Frame::Call(call) => return self.dispatch_call(session.clone(), call),
            Frame::CallResult(result) => (result.message_id.clone(), Ok(result)),
            Frame::CallError(error) => (error.message_id.clone(), Err(error)),
        };
        if let Err(e) = self.registry.complete(&message_id, session.remote(), answer) {
            warn!("Dropping answer from {}: {}", session.remote(), e);
        }
    }

    fn dispatch_call(self: &Arc<Self>, session: SessionHandle, call: Call) {
        let origin = call.network_path.source().clone();
        let message_id = call.message_id.clone();
        let path = NetworkPath::origin(self.local().clone());

        let Some(handler) = self.dispatch.handler(&call.action) else {
            debug!("No handler for {} from {}", call.action, origin);
            let answer = CallError::new(
                message_id,
                ErrorCode::NotImplemented,
                format!("action {} is not implemented", call.action),
                path,
            );
            return self.reply(&session, origin, Frame::CallError(answer));
        };

        let node = self.clone();
        tokio::spawn(async move {
            let action = call.action.clone();
            let frame = match handler(call).await {
                Ok(payload) => Frame::CallResult(CallResult::new(message_id, payload, path)),
                Err(e) => {
                    debug!("Handler for {} answered {}", action, e);
                    Frame::CallError(
                        CallError::new(message_id, e.code, e.description, path)
                            .with_details(e.details),
                    )
                }
            };
            node.reply(&session, origin, frame);
        });
    }

    /// Send an answer back through the session the Call arrived on
    fn reply(&self, session: &SessionHandle, destination: NodeId, frame: Frame) {
        let envelope = Envelope::new(destination, frame);
        if let Err(e) = self.transmit(session, &envelope) {
            warn!(
                "Failed to answer {} via {}: {}",
                envelope.frame.message_id(),
                session.remote(),
                e
            );
        }
    }

    fn forward(
        &self,
        arrival: &SessionHandle,
        envelope: Envelope,
        next: NextHop,
        network_path: NetworkPath,
    ) {
        let outbound = match self.session_via(&next, &envelope.destination) {
            Ok(session) => session,
            Err(e) => {
                return self.refuse(arrival, &envelope, &e.to_string(), route_error_code(&e))
            }
        };

        let relayed = Envelope::new(
            envelope.destination.clone(),
            envelope.frame.with_network_path(network_path),
        );
        let transit_id = match (&relayed.frame, outbound.dialect()) {
            (Frame::Call(call), Dialect::Plain) => {
                let reserved = self.transit.reserve(
                    outbound.remote(),
                    &call.message_id,
                    call.network_path.source(),
                    self.config.transit_timeout,
                );
                if let Err(e) = reserved {
                    let reason = format!("{} in transit to {}", e, outbound.remote());
                    return self.refuse(arrival, &envelope, &reason, ErrorCode::GenericError);
                }
                Some(call.message_id.clone())
            }
            _ => None,
        };

        debug!(
            "Forwarding {:?} {} for {} via {} with path {}",
            relayed.frame.message_type(),
            relayed.frame.message_id(),
            relayed.destination,
            outbound.remote(),
            relayed.frame.network_path()
        );
        if let Err(e) = self.transmit(&outbound, &relayed) {
            if let Some(message_id) = transit_id {
                self.transit.release(outbound.remote(), &message_id);
            }
            self.refuse(arrival, &envelope, &e.to_string(), ErrorCode::GenericError);
        }
    }

    /// A frame that cannot be delivered: Calls are answered, answers dropped
    fn refuse(&self, arrival: &SessionHandle, envelope: &Envelope, reason: &str, code: ErrorCode) {
        let Frame::Call(call) = &envelope.frame else {
            warn!(
                "Dropping {:?} {} for {}: {}",
                envelope.frame.message_type(),
                envelope.frame.message_id(),
                envelope.destination,
                reason
            );
            return;
        };

        warn!(
            "Refusing Call {} {} for {} from {}: {}",
            call.message_id,
            call.action,
            envelope.destination,
            arrival.remote(),
            reason
        );
        let answer = CallError::new(
            call.message_id.clone(),
            code,
            reason,
            NetworkPath::origin(self.local().clone()),
        );
        self.reply(arrival, call.network_path.source().clone(), Frame::CallError(answer));
    }

    fn handle_closed(&self, session: &SessionHandle) {
        let remote = session.remote();
        let current = {
            let mut sessions = self.sessions.write();
            if sessions.get(remote).map(SessionHandle::id) == Some(session.id()) {
                sessions.remove(remote);
                true
            } else {
                false
            }
        };
        if current {
            info!("Session to {} ended", remote);
            self.router.detach(remote);
            self.retire(session);
        }
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        for sweeper in &self.sweepers {
            sweeper.abort();
        }
        for session in self.sessions.get_mut().values() {
            session.close();
        }
    }
}

fn route_error_code(error: &RouteError) -> ErrorCode {
    match error {
        RouteError::HopLimitExceeded { .. } | RouteError::Loop(_) => ErrorCode::ProtocolError,
        RouteError::NoRoute(_) => ErrorCode::GenericError,
    }
}

/// Session callbacks into a node that may already be gone
struct NodeListener(Weak<NodeInner>);

impl SessionListener for NodeListener {
    fn on_message(&self, session: &SessionHandle, decoded: Result<Decoded, CodecError>) {
        if let Some(node) = self.0.upgrade() {
            node.handle_message(session, decoded);
        }
    }

    fn on_closed(&self, session: &SessionHandle) {
        if let Some(node) = self.0.upgrade() {
            node.handle_closed(session);
        }
    }
}
