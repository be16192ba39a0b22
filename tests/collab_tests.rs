//! Tests for the collaboration relay, driven through the real server with
//! WebSocket clients.

use std::net::SocketAddr;
use std::time::Duration;

use draw_nexus::config::{ClientConfig, ServerConfig};
use draw_nexus::coordinator::{run_session, DocumentState};
use draw_nexus::web;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(web::serve_listener(listener, ServerConfig::default()));
    addr
}

async fn join(addr: SocketAddr, path: &str) -> Client {
    let (ws, response) = connect_async(format!("ws://{}{}", addr, path)).await.unwrap();
    assert_eq!(response.status(), 101);
    ws
}

/// Peers are marked open just after the handshake completes on the server.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

async fn next_text(ws: &mut Client) -> Option<String> {
    match timeout(Duration::from_secs(2), ws.next()).await {
        Ok(Some(Ok(Message::Text(t)))) => Some(t),
        _ => None,
    }
}

async fn stays_silent(ws: &mut Client) -> bool {
    timeout(Duration::from_millis(300), ws.next()).await.is_err()
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_message_reaches_every_other_peer_but_not_sender() {
    let addr = start_server().await;
    let mut a = join(addr, "/api/collab/p1").await;
    let mut b = join(addr, "/api/collab/p1").await;
    let mut c = join(addr, "/api/collab/p1").await;
    settle().await;

    let frame = r#"{"content":"graph TD; A-->B"}"#;
    a.send(Message::Text(frame.into())).await.unwrap();

    assert_eq!(next_text(&mut b).await.as_deref(), Some(frame));
    assert_eq!(next_text(&mut c).await.as_deref(), Some(frame));
    assert!(stays_silent(&mut a).await);
}

#[tokio::test]
async fn test_channels_are_isolated() {
    let addr = start_server().await;
    let mut a = join(addr, "/api/collab/p1").await;
    let mut b = join(addr, "/api/collab/p1").await;
    let mut other = join(addr, "/api/collab/p2").await;
    settle().await;

    a.send(Message::Text("only p1".into())).await.unwrap();
    assert_eq!(next_text(&mut b).await.as_deref(), Some("only p1"));
    assert!(stays_silent(&mut other).await);
}

#[tokio::test]
async fn test_query_parameter_and_path_name_same_channel() {
    let addr = start_server().await;
    let mut by_path = join(addr, "/api/collab/p3").await;
    let mut by_query = join(addr, "/api/collab?projectId=p3").await;
    settle().await;

    by_query.send(Message::Text("hello".into())).await.unwrap();
    assert_eq!(next_text(&mut by_path).await.as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_unnamed_peers_share_default_channel() {
    let addr = start_server().await;
    let mut a = join(addr, "/api/collab").await;
    let mut b = join(addr, "/api/collab").await;
    let mut named = join(addr, "/api/collab/p1").await;
    settle().await;

    a.send(Message::Text("x".into())).await.unwrap();
    assert_eq!(next_text(&mut b).await.as_deref(), Some("x"));
    assert!(stays_silent(&mut named).await);
}

#[tokio::test]
async fn test_binary_frames_relayed_verbatim() {
    let addr = start_server().await;
    let mut a = join(addr, "/api/collab/bin").await;
    let mut b = join(addr, "/api/collab/bin").await;
    settle().await;

    a.send(Message::Binary(vec![0, 159, 146, 150])).await.unwrap();
    match timeout(Duration::from_secs(2), b.next()).await {
        Ok(Some(Ok(Message::Binary(bytes)))) => assert_eq!(bytes, vec![0, 159, 146, 150]),
        other => panic!("expected binary frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_awkward_project_ids_keep_their_own_channel() {
    let addr = start_server().await;
    let cfg = ClientConfig { server_url: format!("http://{}/api", addr), ..Default::default() };

    let connect = |id: &str| connect_async(cfg.collab_url(id));
    let (mut a, _) = connect("team a/diagram?v=2#x").await.unwrap();
    let (mut b, _) = connect("team a/diagram?v=2#x").await.unwrap();
    let (mut plain, _) = connect("team a").await.unwrap();
    settle().await;

    a.send(Message::Text("exact".into())).await.unwrap();
    assert_eq!(next_text(&mut b).await.as_deref(), Some("exact"));
    assert!(stays_silent(&mut plain).await);
}

// ---------------------------------------------------------------------------
// Departures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_departed_peer_does_not_block_the_rest() {
    let addr = start_server().await;
    let mut a = join(addr, "/api/collab/p1").await;
    let mut b = join(addr, "/api/collab/p1").await;
    let mut c = join(addr, "/api/collab/p1").await;
    settle().await;

    b.close(None).await.unwrap();
    drop(b);
    settle().await;

    a.send(Message::Text("still here".into())).await.unwrap();
    assert_eq!(next_text(&mut c).await.as_deref(), Some("still here"));
}

#[tokio::test]
async fn test_late_joiner_sees_only_later_messages() {
    let addr = start_server().await;
    let mut a = join(addr, "/api/collab/p1").await;
    let mut b = join(addr, "/api/collab/p1").await;
    settle().await;

    a.send(Message::Text("first".into())).await.unwrap();
    assert_eq!(next_text(&mut b).await.as_deref(), Some("first"));

    let mut late = join(addr, "/api/collab/p1").await;
    settle().await;
    a.send(Message::Text("second".into())).await.unwrap();
    assert_eq!(next_text(&mut late).await.as_deref(), Some("second"));
}

// ---------------------------------------------------------------------------
// Plain HTTP on the collab path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_plain_get_gets_upgrade_required() {
    let addr = start_server().await;
    let resp = reqwest::get(format!("http://{}/api/collab/p1", addr)).await.unwrap();
    assert_eq!(resp.status(), 426);
    assert_eq!(resp.text().await.unwrap(), "Expected Upgrade: websocket");
}

#[tokio::test]
async fn test_post_on_collab_path_not_allowed() {
    let addr = start_server().await;
    let resp = reqwest::Client::new()
        .post(format!("http://{}/api/collab/p1", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 405);
}

// ---------------------------------------------------------------------------
// Coordinated session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_session_delivers_last_edit_when_input_ends() {
    let addr = start_server().await;
    let mut watcher = join(addr, "/api/collab/p1").await;
    settle().await;

    let (edit_tx, edit_rx) = mpsc::unbounded_channel();
    let (remote_tx, _remote_rx) = mpsc::unbounded_channel();
    edit_tx.send("graph TD; A-->B".to_string()).unwrap();
    drop(edit_tx);

    let url = format!("ws://{}/api/collab/p1", addr);
    let doc = run_session(&url, DocumentState::default(), edit_rx, remote_tx).await.unwrap();
    assert_eq!(doc.content(), "graph TD; A-->B");
    assert_eq!(next_text(&mut watcher).await.as_deref(), Some(r#"{"content":"graph TD; A-->B"}"#));
}

#[tokio::test]
async fn test_session_applies_remote_update_without_echo() {
    let addr = start_server().await;
    let mut peer = join(addr, "/api/collab/p2").await;

    let (edit_tx, edit_rx) = mpsc::unbounded_channel::<String>();
    let (remote_tx, mut remote_rx) = mpsc::unbounded_channel();
    let url = format!("ws://{}/api/collab/p2", addr);
    let session = tokio::spawn(async move { run_session(&url, DocumentState::default(), edit_rx, remote_tx).await });
    settle().await;

    peer.send(Message::Text(r#"{"content":"from peer"}"#.into())).await.unwrap();
    let applied = timeout(Duration::from_secs(2), remote_rx.recv()).await.unwrap();
    assert_eq!(applied.as_deref(), Some("from peer"));

    drop(edit_tx);
    let doc = session.await.unwrap().unwrap();
    assert_eq!(doc.content(), "from peer");
    assert!(!doc.has_unsaved_changes());
    assert!(stays_silent(&mut peer).await);
}
