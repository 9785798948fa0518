//! WebSocket glue
//!
//! Adapts tokio-tungstenite connections to the [`Transport`] boundary and
//! keeps them attached to a [`NetworkingNode`]:
//! - outbound connect to `<base-url>/<node-id>` with OCPP subprotocols
//! - inbound accept taking the peer's node id from the last path segment
//! - an upstream link that reconnects with exponential backoff
//! - a listener attaching every accepted peer

use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::{future, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    handshake::server::{ErrorResponse, Request, Response},
    http::{header, HeaderValue, StatusCode},
    protocol::WebSocketConfig,
    Message,
};
use tokio_tungstenite::{accept_hdr_async_with_config, connect_async_with_config, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::codec::WireMessage;
use crate::config::WsConfig;
use crate::error::TransportError;
use crate::node::NetworkingNode;
use crate::transport::Transport;
use crate::types::NodeId;

/// Build the WebSocket URL a node connects to
pub fn build_node_url(base_url: &str, node_id: &NodeId) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), node_id)
}

/// Node id named by the last non-empty segment of a request path
pub fn node_id_from_path(path: &str) -> Option<NodeId> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .last()
        .map(NodeId::from)
}

/// First subprotocol in our preference order that the peer also offered
pub fn select_subprotocol<'a>(offered: &str, supported: &'a [String]) -> Option<&'a str> {
    let offered: Vec<&str> = offered.split(',').map(str::trim).collect();
    supported
        .iter()
        .map(String::as_str)
        .find(|ours| offered.contains(ours))
}

fn ws_config(max_frame_size: usize) -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(max_frame_size),
        max_frame_size: Some(max_frame_size),
        ..Default::default()
    }
}

/// Wrap an established WebSocket as a [`Transport`]
pub fn websocket_transport<S>(ws: WebSocketStream<S>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    let sink = sink
        .sink_map_err(TransportError::from)
        .with(|msg: WireMessage| {
            future::ready(Ok::<_, TransportError>(match msg {
                WireMessage::Text(text) => Message::Text(text),
                WireMessage::Binary(bytes) => Message::Binary(bytes.to_vec()),
            }))
        });

    let stream = stream.filter_map(|item| {
        future::ready(match item {
            Ok(Message::Text(text)) => Some(Ok(WireMessage::Text(text))),
            Ok(Message::Binary(data)) => Some(Ok(WireMessage::Binary(Bytes::from(data)))),
            Ok(Message::Close(frame)) => {
                debug!("WebSocket close received: {:?}", frame);
                None
            }
            // Pongs are sent by tungstenite itself
            Ok(_) => None,
            Err(tungstenite::Error::ConnectionClosed) => None,
            Err(e) => Some(Err(TransportError::from(e))),
        })
    });

    Transport::new(sink, stream)
}

/// Connect to `<base_url>/<local>` offering `subprotocols`.
///
/// Returns the transport and the subprotocol the server accepted.
pub async fn connect(
    base_url: &str,
    local: &NodeId,
    subprotocols: &[String],
    max_frame_size: usize,
) -> Result<(Transport, Option<String>), TransportError> {
    let url = build_node_url(base_url, local);
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::Handshake(format!("invalid URL {}: {}", url, e)))?;
    let offered = HeaderValue::from_str(&subprotocols.join(", "))
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    request
        .headers_mut()
        .insert(header::SEC_WEBSOCKET_PROTOCOL, offered);

    let (ws_stream, response) =
        connect_async_with_config(request, Some(ws_config(max_frame_size)), false)
            .await
            .map_err(|e| {
                error!("WebSocket connection to {} failed: {}", url, e);
                TransportError::from(e)
            })?;

    // Verify subprotocol
    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    match &accepted {
        Some(p) if subprotocols.iter().any(|s| s == p) => {}
        other => warn!("{} did not accept an OCPP subprotocol, got: {:?}", url, other),
    }

    info!("WebSocket connected to {}", url);
    Ok((websocket_transport(ws_stream), accepted))
}

/// Run the server side of the handshake.
///
/// The peer's node id is the last segment of the request path; requests
/// without one are refused with 404.
pub async fn accept<S>(
    stream: S,
    subprotocols: &[String],
    max_frame_size: usize,
) -> Result<(NodeId, Transport), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut peer: Option<NodeId> = None;

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let Some(id) = node_id_from_path(request.uri().path()) else {
            let mut refusal = ErrorResponse::new(Some("missing node id in path".to_string()));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            return Err(refusal);
        };

        let offered = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        match select_subprotocol(offered, subprotocols) {
            Some(protocol) => {
                if let Ok(value) = HeaderValue::from_str(protocol) {
                    response
                        .headers_mut()
                        .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                }
            }
            None => warn!("{} offered no supported subprotocol ({:?})", id, offered),
        }

        peer = Some(id);
        Ok(response)
    };

    let ws_stream =
        accept_hdr_async_with_config(stream, callback, Some(ws_config(max_frame_size))).await?;
    let peer = peer.ok_or_else(|| TransportError::Handshake("missing node id".to_string()))?;
    Ok((peer, websocket_transport(ws_stream)))
}

/// Keep a session to the configured upstream node, reconnecting with
/// exponential backoff. The upstream becomes the node's default route while
/// connected.
pub fn spawn_upstream(node: NetworkingNode, config: WsConfig) -> Option<JoinHandle<()>> {
    let url = config.upstream_url.clone()?;
    Some(tokio::spawn(async move {
        let mut reconnect_delay = config.reconnect_delay;
        let max_frame_size = node.config().max_frame_size;

        loop {
            info!("Connecting to upstream {} at {}", config.upstream_id, url);

            match connect(&url, node.id(), &config.subprotocols, max_frame_size).await {
                Ok((transport, _)) => {
                    let session = node.attach(config.upstream_id.clone(), transport);
                    node.set_default_upstream(Some(config.upstream_id.clone()));
                    reconnect_delay = config.reconnect_delay;

                    session.closed().await;
                    warn!("Upstream {} disconnected", config.upstream_id);
                }
                Err(e) => error!("Upstream connection error: {}", e),
            }

            // Exponential backoff
            info!("Reconnecting in {:?}", reconnect_delay);
            tokio::time::sleep(reconnect_delay).await;
            reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
        }
    }))
}

/// Accept peers on `listener` and attach each one to `node`
pub async fn serve(
    node: NetworkingNode,
    listener: TcpListener,
    subprotocols: Vec<String>,
) -> Result<(), TransportError> {
    info!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener.accept().await?;
        let node = node.clone();
        let subprotocols = subprotocols.clone();
        tokio::spawn(async move {
            if let Err(e) = attach_incoming(&node, stream, addr, &subprotocols).await {
                warn!("Handshake with {} failed: {}", addr, e);
            }
        });
    }
}

async fn attach_incoming(
    node: &NetworkingNode,
    stream: TcpStream,
    addr: SocketAddr,
    subprotocols: &[String],
) -> Result<(), TransportError> {
    let max_frame_size = node.config().max_frame_size;
    let (peer, transport) = accept(stream, subprotocols, max_frame_size).await?;
    info!("{} connected from {}", peer, addr);
    node.attach(peer, transport);
    Ok(())
}

/// Bind `addr` and serve peers until the listener fails
pub async fn listen(
    node: NetworkingNode,
    addr: SocketAddr,
    subprotocols: Vec<String>,
) -> Result<(), TransportError> {
    let listener = TcpListener::bind(addr).await?;
    serve(node, listener, subprotocols).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::frame::Call;
    use crate::types::Payload;
    use std::time::Duration;

    #[test]
    fn test_build_node_url() {
        let url = build_node_url("ws://localhost:9000/ocpp", &"CS001".into());
        assert_eq!(url, "ws://localhost:9000/ocpp/CS001");

        let url = build_node_url("ws://localhost:9000/ocpp/", &"CS001".into());
        assert_eq!(url, "ws://localhost:9000/ocpp/CS001");
    }

    #[test]
    fn test_node_id_from_path() {
        assert_eq!(node_id_from_path("/ocpp/CS001"), Some("CS001".into()));
        assert_eq!(node_id_from_path("/ocpp/R1/"), Some("R1".into()));
        assert_eq!(node_id_from_path("/"), None);
    }

    #[test]
    fn test_select_subprotocol_uses_our_preference() {
        let supported = vec!["ocpp2.1".to_string(), "ocpp2.0.1".to_string()];
        assert_eq!(select_subprotocol("ocpp2.0.1, ocpp2.1", &supported), Some("ocpp2.1"));
        assert_eq!(select_subprotocol("ocpp2.0.1", &supported), Some("ocpp2.0.1"));
        assert_eq!(select_subprotocol("ocpp1.6", &supported), None);
    }

    #[tokio::test]
    async fn test_call_over_websocket() {
        let csms = NetworkingNode::new(NodeConfig::new("CSMS"));
        csms.register_handler("Heartbeat", |_call: Call| async {
            Ok(Payload::Json(serde_json::json!({"currentTime": "2024-01-01T00:00:00Z"})))
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let subprotocols = WsConfig::default().subprotocols;
        tokio::spawn(serve(csms.clone(), listener, subprotocols.clone()));

        let station = NetworkingNode::new(NodeConfig::new("CS001"));
        let (transport, accepted) = connect(
            &format!("ws://{}/ocpp", addr),
            station.id(),
            &subprotocols,
            64 * 1024,
        )
        .await
        .unwrap();
        assert_eq!(accepted.as_deref(), Some("ocpp2.1"));
        station.attach("CSMS", transport);

        let result = station
            .send_call("CSMS", "Heartbeat", Payload::empty(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            result.payload,
            Payload::Json(serde_json::json!({"currentTime": "2024-01-01T00:00:00Z"}))
        );
        assert_eq!(csms.sessions(), vec![NodeId::from("CS001")]);
    }
}
