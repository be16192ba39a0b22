//! Collaboration relay: per-project WebSocket fan-out.
//!
//! ## Design
//! - ChannelRegistry: Arc<Mutex<HashMap<channel, HashMap<peer id, CollabPeer>>>>,
//!   shared across all connections
//! - Each peer owns an unbounded outbound queue; the connection task drains it
//!   into the socket, so a broadcast never awaits another peer's I/O
//! - Frames are forwarded verbatim; the relay never parses document content
//!
//! ## Peer lifecycle
//! 1. Upgrade request on `/api/collab/{projectId}` (or `?projectId=`) resolves
//!    the channel; no project means the shared `default` channel
//! 2. Peer is registered as `Connecting`, then `Open` once the 101 response
//!    has been written
//! 3. Every text/binary frame from the peer goes to every other `Open` peer in
//!    the same channel
//! 4. Close, error or EOF marks the peer `Closed` and removes it

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

pub const COLLAB_PATH: &str = "/api/collab";
pub const DEFAULT_CHANNEL: &str = "default";

/// RFC 6455 handshake GUID.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Open,
    Closed,
}

/// One connected client.
#[derive(Debug)]
pub struct CollabPeer {
    pub id: String,
    pub channel: String,
    pub state: PeerState,
    tx: mpsc::UnboundedSender<WsMessage>,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Channel name -> open peers. Cheap to clone; all clones share one map.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: Arc<Mutex<HashMap<String, HashMap<String, CollabPeer>>>>,
}

// ---------------------------------------------------------------------------
// Registry operations
// ---------------------------------------------------------------------------

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer in `Connecting` state. The receiver yields frames other
    /// peers broadcast to it.
    pub fn register(&self, channel: &str) -> (String, mpsc::UnboundedReceiver<WsMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4().to_string();
        let peer = CollabPeer {
            id: id.clone(),
            channel: channel.to_string(),
            state: PeerState::Connecting,
            tx,
        };
        if let Ok(mut guard) = self.channels.lock() {
            guard.entry(channel.to_string()).or_default().insert(id.clone(), peer);
        }
        (id, rx)
    }

    /// `Connecting` -> `Open`. A closed or unknown peer stays as it is.
    pub fn mark_open(&self, channel: &str, peer_id: &str) -> bool {
        let Ok(mut guard) = self.channels.lock() else {
            return false;
        };
        match guard.get_mut(channel).and_then(|peers| peers.get_mut(peer_id)) {
            Some(peer) if peer.state == PeerState::Connecting => {
                peer.state = PeerState::Open;
                true
            }
            _ => false,
        }
    }

    /// Mark the peer `Closed` and drop it; empty channels are dropped too.
    pub fn close(&self, channel: &str, peer_id: &str) {
        let Ok(mut guard) = self.channels.lock() else {
            return;
        };
        if let Some(peers) = guard.get_mut(channel) {
            if let Some(mut peer) = peers.remove(peer_id) {
                peer.state = PeerState::Closed;
            }
            if peers.is_empty() {
                guard.remove(channel);
            }
        }
    }

    /// Forward `message` to every open peer of `channel` except `from`.
    pub fn broadcast(&self, channel: &str, from: &str, message: &WsMessage) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let Ok(guard) = self.channels.lock() else {
            return report;
        };
        let Some(peers) = guard.get(channel) else {
            return report;
        };
        for peer in peers.values() {
            if peer.id == from || peer.state != PeerState::Open {
                continue;
            }
            match peer.tx.send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(_) => {
                    tracing::warn!(channel, peer = %peer.id, "relay delivery failed, skipping peer");
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn peer_state(&self, channel: &str, peer_id: &str) -> Option<PeerState> {
        let guard = self.channels.lock().ok()?;
        guard.get(channel)?.get(peer_id).map(|p| p.state)
    }

    pub fn peer_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .map(|g| g.get(channel).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().map(|g| g.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Handshake helpers
// ---------------------------------------------------------------------------

/// `Sec-WebSocket-Accept` for a client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// The 101 response completing the upgrade.
pub fn switching_protocols_response(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\nAccess-Control-Allow-Origin: *\r\n\r\n",
        accept_key(client_key)
    )
}

/// True when the `Upgrade` header asks for a WebSocket.
pub fn is_websocket_upgrade(upgrade: Option<&str>) -> bool {
    upgrade.is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
}

/// Channel for a request on the collab path, or `None` when `path` is not
/// the collab endpoint. A path segment wins over the `projectId` parameter.
pub fn resolve_channel(path: &str, project_param: Option<&str>) -> Option<String> {
    let rest = path.strip_prefix(COLLAB_PATH)?;
    let from_path = match rest {
        "" | "/" => None,
        r => Some(r.strip_prefix('/')?.trim_matches('/')),
    };
    let chosen = from_path
        .or(project_param)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(DEFAULT_CHANNEL);
    Some(chosen.to_string())
}

// ---------------------------------------------------------------------------
// Connection loop
// ---------------------------------------------------------------------------

/// Relay frames for one already-upgraded connection until it closes.
///
/// `peer_id` must come from [`ChannelRegistry::register`] on `channel`, with
/// `outbound` being the receiver returned alongside it.
pub async fn handle_peer<S>(
    ws: WebSocketStream<S>,
    registry: ChannelRegistry,
    channel: String,
    peer_id: String,
    mut outbound: mpsc::UnboundedReceiver<WsMessage>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    registry.mark_open(&channel, &peer_id);
    tracing::info!(channel = %channel, peer = %peer_id, peers = registry.peer_count(&channel), "collab peer joined");

    let (mut ws_sink, mut ws_stream) = ws.split();

    loop {
        tokio::select! {
            // Frame from this peer.
            inbound = ws_stream.next() => {
                match inbound {
                    Some(Ok(msg @ (WsMessage::Text(_) | WsMessage::Binary(_)))) => {
                        let report = registry.broadcast(&channel, &peer_id, &msg);
                        tracing::debug!(channel = %channel, delivered = report.delivered, failed = report.failed, "relayed frame");
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(channel = %channel, peer = %peer_id, error = %e, "collab socket error");
                        break;
                    }
                }
            }
            // Frame queued for this peer by someone else's broadcast.
            queued = outbound.recv() => {
                match queued {
                    Some(msg) => {
                        if ws_sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    registry.close(&channel, &peer_id);
    let _ = ws_sink.close().await;
    tracing::info!(channel = %channel, peer = %peer_id, "collab peer left");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> WsMessage {
        WsMessage::Text(s.to_string())
    }

    // -- accept_key --

    #[test]
    fn test_accept_key_rfc_vector() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_switching_protocols_response_shape() {
        let r = switching_protocols_response("dGhlIHNhbXBsZSBub25jZQ==");
        assert!(r.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(r.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(r.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_is_websocket_upgrade() {
        assert!(is_websocket_upgrade(Some("websocket")));
        assert!(is_websocket_upgrade(Some("WebSocket")));
        assert!(!is_websocket_upgrade(Some("h2c")));
        assert!(!is_websocket_upgrade(None));
    }

    // -- resolve_channel --

    #[test]
    fn test_resolve_channel_from_path() {
        assert_eq!(resolve_channel("/api/collab/p1", None), Some("p1".to_string()));
        assert_eq!(resolve_channel("/api/collab/p1/", Some("p2")), Some("p1".to_string()));
    }

    #[test]
    fn test_resolve_channel_from_query() {
        assert_eq!(resolve_channel("/api/collab", Some("p2")), Some("p2".to_string()));
    }

    #[test]
    fn test_resolve_channel_default() {
        assert_eq!(resolve_channel("/api/collab", None), Some("default".to_string()));
        assert_eq!(resolve_channel("/api/collab/", Some("  ")), Some("default".to_string()));
    }

    #[test]
    fn test_resolve_channel_other_paths() {
        assert_eq!(resolve_channel("/api/chat", None), None);
        assert_eq!(resolve_channel("/api/collaborate", None), None);
    }

    // -- registry --

    #[test]
    fn test_register_starts_connecting() {
        let reg = ChannelRegistry::new();
        let (id, _rx) = reg.register("p");
        assert_eq!(reg.peer_state("p", &id), Some(PeerState::Connecting));
        assert!(reg.mark_open("p", &id));
        assert_eq!(reg.peer_state("p", &id), Some(PeerState::Open));
        assert!(!reg.mark_open("p", &id));
    }

    #[test]
    fn test_close_removes_peer_and_empty_channel() {
        let reg = ChannelRegistry::new();
        let (id, _rx) = reg.register("p");
        reg.close("p", &id);
        assert_eq!(reg.peer_state("p", &id), None);
        assert_eq!(reg.channel_count(), 0);
        assert!(!reg.mark_open("p", &id));
    }

    #[test]
    fn test_broadcast_skips_sender_and_connecting_peers() {
        let reg = ChannelRegistry::new();
        let (a, mut rx_a) = reg.register("p");
        let (b, mut rx_b) = reg.register("p");
        let (_c, mut rx_c) = reg.register("p");
        reg.mark_open("p", &a);
        reg.mark_open("p", &b);

        let report = reg.broadcast("p", &a, &text("hello"));
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 0 });
        assert_eq!(rx_b.try_recv().unwrap(), text("hello"));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_is_partitioned_by_channel() {
        let reg = ChannelRegistry::new();
        let (a, _rx_a) = reg.register("p1");
        let (b, mut rx_b) = reg.register("p2");
        reg.mark_open("p1", &a);
        reg.mark_open("p2", &b);
        let report = reg.broadcast("p1", &a, &text("x"));
        assert_eq!(report.delivered, 0);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_failure_does_not_stop_others() {
        let reg = ChannelRegistry::new();
        let (a, _rx_a) = reg.register("p");
        let (b, rx_b) = reg.register("p");
        let (c, mut rx_c) = reg.register("p");
        for id in [&a, &b, &c] {
            reg.mark_open("p", id);
        }
        drop(rx_b);
        let report = reg.broadcast("p", &a, &text("edit"));
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert_eq!(rx_c.try_recv().unwrap(), text("edit"));
    }

    #[test]
    fn test_broadcast_forwards_bytes_verbatim() {
        let reg = ChannelRegistry::new();
        let (a, _rx_a) = reg.register("p");
        let (b, mut rx_b) = reg.register("p");
        reg.mark_open("p", &a);
        reg.mark_open("p", &b);
        let raw = WsMessage::Binary(vec![0, 159, 146, 150]);
        reg.broadcast("p", &a, &raw);
        assert_eq!(rx_b.try_recv().unwrap(), raw);
    }

    #[test]
    fn test_broadcast_unknown_channel_is_empty_report() {
        let reg = ChannelRegistry::new();
        assert_eq!(reg.broadcast("nope", "x", &text("y")), BroadcastReport::default());
    }
}
