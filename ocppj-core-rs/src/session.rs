//! Connection session
//!
//! One session per physical connection to a peer node:
//! `Connecting -> Open -> Closing -> Closed`.
//!
//! A session created with [`SessionHandle::connecting`] exists before its
//! transport does, so the handshake can run while the session is already
//! known; [`SessionHandle::open`] hands it the transport.
//!
//! Outbound frames are encoded by the caller's task and handed to a bounded
//! queue drained by a single writer task. A reader task decodes every inbound
//! message and passes it to the [`SessionListener`]. Either task ending moves
//! the session to `Closing`; the listener's `on_closed` runs exactly once,
//! after which the session is `Closed`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::codec::{Codec, Decoded, Dialect, Link, WireFormat, WireMessage};
use crate::error::{CodecError, SessionError};
use crate::frame::Envelope;
use crate::transport::{Transport, WireSink, WireStream};
use crate::types::NodeId;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Transport handshake in progress; no frames accepted
    Connecting,
    Open,
    /// Close requested, tasks winding down
    Closing,
    /// Terminal
    Closed,
}

/// Per-session limits and wire dialect
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_frame_size: usize,
    pub queue_capacity: usize,
    pub dialect: Dialect,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            queue_capacity: 64,
            dialect: Dialect::Networking,
        }
    }
}

/// Receives everything a session reads
pub trait SessionListener: Send + Sync + 'static {
    /// Called from the reader task; must not block
    fn on_message(&self, session: &SessionHandle, decoded: Result<Decoded, CodecError>);

    /// Called once when the session stops
    fn on_closed(&self, session: &SessionHandle);
}

struct SessionInner {
    id: u64,
    local: NodeId,
    remote: NodeId,
    config: SessionConfig,
    codec: Codec,
    outbound: mpsc::Sender<WireMessage>,
    /// Taken by the writer task on `open`
    queue: Mutex<Option<mpsc::Receiver<WireMessage>>>,
    state: watch::Sender<SessionState>,
}

/// Cheap, cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    /// Start the reader and writer tasks for an established transport
    pub fn spawn(
        transport: Transport,
        local: NodeId,
        remote: NodeId,
        config: SessionConfig,
        codec: Codec,
        listener: Arc<dyn SessionListener>,
    ) -> SessionHandle {
        let handle = Self::connecting(local, remote, config, codec);
        handle.open(transport, listener);
        handle
    }

    /// A session whose transport is still being established
    pub fn connecting(
        local: NodeId,
        remote: NodeId,
        config: SessionConfig,
        codec: Codec,
    ) -> SessionHandle {
        let (outbound, queue) = mpsc::channel(config.queue_capacity.max(1));
        let (state, _) = watch::channel(SessionState::Connecting);

        SessionHandle {
            inner: Arc::new(SessionInner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                local,
                remote,
                config,
                codec,
                outbound,
                queue: Mutex::new(Some(queue)),
                state,
            }),
        }
    }

    /// Attach the established transport and start the reader and writer
    /// tasks. Ignored unless the session is still `Connecting`.
    pub fn open(&self, transport: Transport, listener: Arc<dyn SessionListener>) {
        let opened = self.inner.state.send_if_modified(|s| {
            if *s == SessionState::Connecting {
                *s = SessionState::Open;
                true
            } else {
                false
            }
        });
        let queue = self.inner.queue.lock().take();
        let (true, Some(queue)) = (opened, queue) else {
            warn!(
                "Session {} to {} is {:?}, dropping transport",
                self.inner.id,
                self.inner.remote,
                self.state()
            );
            return;
        };

        let Transport { sink, stream } = transport;
        tokio::spawn(write_loop(self.clone(), sink, queue));
        tokio::spawn(read_loop(self.clone(), stream, listener));
        info!(
            "Session {} open to {} ({:?})",
            self.inner.id, self.inner.remote, self.inner.config.dialect
        );
    }

    /// Unique per process; tells a replaced session from its successor
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn remote(&self) -> &NodeId {
        &self.inner.remote
    }

    pub fn dialect(&self) -> Dialect {
        self.inner.config.dialect
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Encode and queue one envelope without waiting.
    ///
    /// Fails fast with `Overloaded` when the queue is full. Returns the
    /// encoded size.
    pub fn send(&self, envelope: &Envelope, format: WireFormat) -> Result<usize, SessionError> {
        match self.state() {
            SessionState::Open => {}
            SessionState::Connecting => {
                return Err(SessionError::NotOpen(self.inner.remote.clone()))
            }
            SessionState::Closing | SessionState::Closed => {
                return Err(SessionError::ConnectionLost(self.inner.remote.clone()))
            }
        }

        let msg = self
            .inner
            .codec
            .encode_with(envelope, format, self.inner.config.dialect)?;
        let size = msg.len();
        if size > self.inner.config.max_frame_size {
            return Err(SessionError::FrameTooLarge {
                size,
                max: self.inner.config.max_frame_size,
            });
        }

        self.inner.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!("Outbound queue to {} full", self.inner.remote);
                SessionError::Overloaded(self.inner.remote.clone())
            }
            mpsc::error::TrySendError::Closed(_) => {
                SessionError::ConnectionLost(self.inner.remote.clone())
            }
        })?;
        trace!("Queued {} bytes to {}", size, self.inner.remote);
        Ok(size)
    }

    /// Request an administrative close. Idempotent.
    ///
    /// A session that never opened has no tasks to wind down and goes
    /// straight to `Closed`.
    pub fn close(&self) {
        let mut previous = SessionState::Closed;
        let changed = self.inner.state.send_if_modified(|s| {
            previous = *s;
            match *s {
                SessionState::Connecting => {
                    *s = SessionState::Closed;
                    true
                }
                SessionState::Open => {
                    *s = SessionState::Closing;
                    true
                }
                SessionState::Closing | SessionState::Closed => false,
            }
        });
        if changed {
            debug!(
                "Session {} to {} closing (was {:?})",
                self.inner.id, self.inner.remote, previous
            );
        }
    }

    /// Wait until the session reaches `Closed`
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        // Sender lives in `inner`, which we hold
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }

    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    fn mark_closed(&self) {
        self.inner.state.send_replace(SessionState::Closed);
        info!("Session {} to {} closed", self.inner.id, self.inner.remote);
    }
}

async fn until_closing(mut state: watch::Receiver<SessionState>) {
    let _ = state.wait_for(|s| *s >= SessionState::Closing).await;
}

async fn write_loop(
    session: SessionHandle,
    mut sink: WireSink,
    mut queue: mpsc::Receiver<WireMessage>,
) {
    let closing = until_closing(session.subscribe());
    tokio::pin!(closing);

    loop {
        tokio::select! {
            msg = queue.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = sink.send(msg).await {
                    error!("Failed to write to {}: {}", session.remote(), e);
                    break;
                }
            }
            _ = &mut closing => break,
        }
    }

    session.close();
    if let Err(e) = sink.close().await {
        debug!("Closing transport to {}: {}", session.remote(), e);
    }
}

async fn read_loop(
    session: SessionHandle,
    mut stream: WireStream,
    listener: Arc<dyn SessionListener>,
) {
    let closing = until_closing(session.subscribe());
    tokio::pin!(closing);
    let max = session.inner.config.max_frame_size;

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(msg)) => {
                    if msg.len() > max {
                        warn!(
                            "Dropping {} byte message from {} (max {})",
                            msg.len(), session.remote(), max
                        );
                        continue;
                    }
                    let link = Link {
                        local: &session.inner.local,
                        remote: &session.inner.remote,
                    };
                    let decoded = session.inner.codec.decode(&msg, link);
                    listener.on_message(&session, decoded);
                }
                Some(Err(e)) => {
                    warn!("Read from {} failed: {}", session.remote(), e);
                    break;
                }
                None => {
                    debug!("Transport from {} ended", session.remote());
                    break;
                }
            },
            _ = &mut closing => break,
        }
    }

    session.close();
    listener.on_closed(&session);
    session.mark_closed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Call, Frame};
    use crate::transport::in_memory_pair;
    use crate::types::{MessageId, Payload};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Envelope>>,
        errors: Mutex<Vec<CodecError>>,
        closed: Mutex<u32>,
    }

    impl SessionListener for Recorder {
        fn on_message(&self, _session: &SessionHandle, decoded: Result<Decoded, CodecError>) {
            match decoded {
                Ok(d) => self.frames.lock().push(d.envelope),
                Err(e) => self.errors.lock().push(e),
            }
        }

        fn on_closed(&self, _session: &SessionHandle) {
            *self.closed.lock() += 1;
        }
    }

    fn heartbeat(id: &str) -> Envelope {
        let call = Call::with_id(MessageId::parse(id).unwrap(), "A".into(), "Heartbeat".into(), Payload::empty());
        Envelope::new("B".into(), Frame::Call(call))
    }

    fn pair(config: SessionConfig) -> (SessionHandle, SessionHandle, Arc<Recorder>, Arc<Recorder>) {
        let (ta, tb) = in_memory_pair(16);
        let ra = Arc::new(Recorder::default());
        let rb = Arc::new(Recorder::default());
        let a = SessionHandle::spawn(ta, "A".into(), "B".into(), config.clone(), Codec::json_only(), ra.clone());
        let b = SessionHandle::spawn(tb, "B".into(), "A".into(), config, Codec::json_only(), rb.clone());
        (a, b, ra, rb)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_frames_delivered_in_queue_order() {
        let (a, _b, _ra, rb) = pair(SessionConfig::default());
        assert!(a.is_open());

        for i in 0..5 {
            a.send(&heartbeat(&format!("m{}", i)), WireFormat::Json).unwrap();
        }
        settle().await;

        let ids: Vec<String> = rb
            .frames
            .lock()
            .iter()
            .map(|e| e.frame.message_id().to_string())
            .collect();
        assert_eq!(ids, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let config = SessionConfig {
            max_frame_size: 16,
            ..SessionConfig::default()
        };
        let (a, _b, _ra, _rb) = pair(config);
        assert!(matches!(
            a.send(&heartbeat("m1"), WireFormat::Json),
            Err(SessionError::FrameTooLarge { max: 16, .. })
        ));
    }

    #[tokio::test]
    async fn test_full_queue_is_overloaded() {
        // Peer never reads: writer blocks on the transport, queue fills up
        let (ta, _tb) = in_memory_pair(1);
        let config = SessionConfig {
            queue_capacity: 2,
            ..SessionConfig::default()
        };
        let a = SessionHandle::spawn(ta, "A".into(), "B".into(), config, Codec::json_only(), Arc::new(Recorder::default()));

        let mut overloaded = false;
        for i in 0..16 {
            match a.send(&heartbeat(&format!("m{}", i)), WireFormat::Json) {
                Ok(_) => {}
                Err(SessionError::Overloaded(node)) => {
                    assert_eq!(node, NodeId::from("B"));
                    overloaded = true;
                    break;
                }
                Err(e) => panic!("unexpected error {:?}", e),
            }
            settle().await;
        }
        assert!(overloaded);
    }

    #[tokio::test]
    async fn test_peer_close_ends_both_sessions() {
        let (a, b, ra, rb) = pair(SessionConfig::default());

        a.close();
        tokio::time::timeout(Duration::from_secs(1), a.closed()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), b.closed()).await.unwrap();

        assert_eq!(*ra.closed.lock(), 1);
        assert_eq!(*rb.closed.lock(), 1);
        assert!(matches!(
            b.send(&heartbeat("m1"), WireFormat::Json),
            Err(SessionError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_connecting_session_refuses_frames_until_open() {
        let session = SessionHandle::connecting(
            "A".into(),
            "B".into(),
            SessionConfig::default(),
            Codec::json_only(),
        );
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(
            session.send(&heartbeat("m1"), WireFormat::Json),
            Err(SessionError::NotOpen("B".into()))
        );

        let (ta, mut tb) = in_memory_pair(4);
        session.open(ta, Arc::new(Recorder::default()));
        assert!(session.is_open());
        session.send(&heartbeat("m1"), WireFormat::Json).unwrap();
        assert!(matches!(tb.stream.next().await, Some(Ok(WireMessage::Text(_)))));
    }

    #[tokio::test]
    async fn test_close_while_connecting() {
        let session = SessionHandle::connecting(
            "A".into(),
            "B".into(),
            SessionConfig::default(),
            Codec::json_only(),
        );
        session.close();
        tokio::time::timeout(Duration::from_secs(1), session.closed()).await.unwrap();

        // A transport arriving after the close is not used
        let (ta, _tb) = in_memory_pair(4);
        session.open(ta, Arc::new(Recorder::default()));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_garbage_reported_to_listener() {
        let (mut ta, tb) = in_memory_pair(4);
        let rb = Arc::new(Recorder::default());
        let _b = SessionHandle::spawn(tb, "B".into(), "A".into(), SessionConfig::default(), Codec::json_only(), rb.clone());

        ta.sink.send(WireMessage::Text("[9]".into())).await.unwrap();
        settle().await;
        assert_eq!(rb.errors.lock().len(), 1);
        assert_eq!(rb.frames.lock().len(), 0);
    }
}
