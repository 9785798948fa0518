//! Byte-message transport boundary
//!
//! A session only needs a sink and a stream of [`WireMessage`]s. WebSocket
//! connections are adapted in [`crate::ws`]; [`in_memory_pair`] links two
//! sessions inside one process.

use std::pin::Pin;

use futures_util::{sink, stream, Sink, Stream};
use tokio::sync::mpsc;

use crate::codec::WireMessage;
use crate::error::TransportError;

pub type WireSink = Pin<Box<dyn Sink<WireMessage, Error = TransportError> + Send>>;
pub type WireStream = Pin<Box<dyn Stream<Item = Result<WireMessage, TransportError>> + Send>>;

/// One connection: outgoing sink plus incoming stream
pub struct Transport {
    pub sink: WireSink,
    pub stream: WireStream,
}

impl Transport {
    pub fn new(
        sink: impl Sink<WireMessage, Error = TransportError> + Send + 'static,
        stream: impl Stream<Item = Result<WireMessage, TransportError>> + Send + 'static,
    ) -> Self {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Two connected in-process transports.
///
/// Dropping either sink ends the other side's stream.
pub fn in_memory_pair(capacity: usize) -> (Transport, Transport) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (channel_transport(a_tx, b_rx), channel_transport(b_tx, a_rx))
}

fn channel_transport(tx: mpsc::Sender<WireMessage>, rx: mpsc::Receiver<WireMessage>) -> Transport {
    let sink = sink::unfold(tx, |tx, msg: WireMessage| async move {
        tx.send(msg).await.map_err(|_| TransportError::Closed)?;
        Ok::<_, TransportError>(tx)
    });
    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|msg| (Ok(msg), rx))
    });
    Transport::new(sink, stream)
}
