//! HTTP + WebSocket server.
//!
//! One request per connection (`Connection: close`). Routes:
//!
//! - `POST /api/chat`: proxy a chat completion to the effective provider,
//!   re-emitting streamed deltas as `data: {"content": ...}` lines
//! - `POST /api/models`: list the effective provider's models
//! - `POST /api/parse-url`: fetch a web page and return it as markdown
//! - `GET /api/collab[/{projectId}]`: WebSocket relay (426 without upgrade)
//! - `OPTIONS *`: CORS preflight

use colored::*;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::collab::{self, ChannelRegistry};
use crate::config::ServerConfig;
use crate::error::{NexusError, Result};
use crate::page::{self, ParseUrlRequest, ParseUrlResponse};
use crate::providers::{adapter_for, LlmConfig, ProviderAdapter};
use crate::quota::{ACCESS_PASSWORD_HEADER, QUOTA_EXEMPT_HEADER};
use crate::request::{ChatRequest, ModelsRequest};
use crate::sse::{LineBuffer, Utf8StreamDecoder, DONE_SENTINEL};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

const CORS_HEADERS: &str = "Access-Control-Allow-Origin: *\r\n\
Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
Access-Control-Allow-Headers: Content-Type, Authorization, X-Access-Password, X-Custom-LLM\r\n\
Access-Control-Expose-Headers: X-Quota-Exempt\r\n";

/// Shared by every connection task.
pub struct AppState {
    pub config: ServerConfig,
    pub http: reqwest::Client,
    pub registry: ChannelRegistry,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, http: reqwest::Client::new(), registry: ChannelRegistry::new() }
    }
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

/// A parsed request: head plus the full body.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Percent-decoding for URL components; `+` is a space.
pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let decoded = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match decoded {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse a query string into key-value pairs; later duplicates win.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let val = parts.next().unwrap_or("");
            Some((url_decode(key), url_decode(val)))
        })
        .collect()
}

/// Read one request. `Ok(None)` when the peer closed before sending anything.
pub async fn read_request<R>(stream: &mut R) -> Result<Option<HttpRequest>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let (mut request, head_len, content_length) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(NexusError::Protocol("connection closed mid-request".into()));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(&buf).map_err(|e| NexusError::Protocol(e.to_string()))? {
            httparse::Status::Complete(head_len) => {
                let target = parsed.path.unwrap_or("/");
                let (path, query) = target.split_once('?').unwrap_or((target, ""));
                let headers: Vec<(String, String)> = parsed
                    .headers
                    .iter()
                    .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).trim().to_string()))
                    .collect();
                let content_length = headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                    .map(|(_, v)| v.parse::<usize>().map_err(|_| NexusError::Protocol(format!("bad Content-Length '{}'", v))))
                    .transpose()?
                    .unwrap_or(0);
                let request = HttpRequest {
                    method: parsed.method.unwrap_or("GET").to_string(),
                    path: url_decode(path),
                    query: parse_query(query),
                    headers,
                    body: Vec::new(),
                };
                break (request, head_len, content_length);
            }
            httparse::Status::Partial => {
                if buf.len() > MAX_HEAD_BYTES {
                    return Err(NexusError::Protocol("request head too large".into()));
                }
            }
        }
    };

    if content_length > MAX_BODY_BYTES {
        return Err(NexusError::Protocol(format!("body of {} bytes exceeds limit", content_length)));
    }
    let mut body = buf.split_off(head_len);
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(NexusError::Protocol("connection closed mid-body".into()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    request.body = body;
    Ok(Some(request))
}

// ---------------------------------------------------------------------------
// Response writing
// ---------------------------------------------------------------------------

fn reason(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    extra: &[(&str, &str)],
    body: &[u8],
) -> Result<()> {
    let mut head = format!("HTTP/1.1 {} {}\r\n{}", status, reason(status), CORS_HEADERS);
    if !content_type.is_empty() {
        head.push_str(&format!("Content-Type: {}\r\n", content_type));
    }
    for (name, value) in extra {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()));
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    Ok(())
}

async fn write_json(stream: &mut TcpStream, status: u16, extra: &[(&str, &str)], value: &Value) -> Result<()> {
    let body = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", extra, &body).await
}

async fn write_error(stream: &mut TcpStream, status: u16, message: &str) -> Result<()> {
    write_json(stream, status, &[], &json!({ "error": message })).await
}

// ---------------------------------------------------------------------------
// Server loop
// ---------------------------------------------------------------------------

/// Bind to the configured address and serve forever.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr()).await?;
    let addr = listener.local_addr()?;

    eprintln!("{}", format!("  draw-nexus listening on http://{}", addr).bright_green());
    eprintln!(
        "{}",
        format!("  upstream: {} ({})", config.provider, config.model_id).bright_blue()
    );
    if config.api_key.is_empty() {
        eprintln!("{}", "  AI_API_KEY is empty: only bring-your-own LLM requests will succeed".yellow());
    }
    if config.access_password().is_some() {
        eprintln!("{}", "  access password enabled".bright_blue());
    }
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());

    serve_listener(listener, config).await
}

/// Serve on an already bound listener.
pub async fn serve_listener(listener: TcpListener, config: ServerConfig) -> Result<()> {
    let state = Arc::new(AppState::new(config));
    loop {
        let (stream, addr) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                tracing::warn!(peer = %addr, error = %e, "connection error");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) -> Result<()> {
    let request = match read_request(&mut stream).await {
        Ok(Some(r)) => r,
        Ok(None) => return Ok(()),
        Err(e) => {
            let _ = write_error(&mut stream, 400, &e.to_string()).await;
            return Err(e);
        }
    };
    tracing::debug!(method = %request.method, path = %request.path, "request");

    if request.method == "OPTIONS" {
        return write_response(&mut stream, 204, "", &[], b"").await;
    }

    let project_param = request.query.get("projectId").map(String::as_str);
    if let Some(channel) = collab::resolve_channel(&request.path, project_param) {
        if request.method != "GET" {
            return write_error(&mut stream, 405, "Method not allowed").await;
        }
        return handle_collab(stream, &state, &request, channel).await;
    }

    let result = match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/api/chat") => handle_chat(&mut stream, &state, &request).await,
        ("POST", "/api/models") => handle_models(&mut stream, &state, &request).await,
        ("POST", "/api/parse-url") => handle_parse_url(&mut stream, &state, &request).await,
        (_, "/api/chat") | (_, "/api/models") | (_, "/api/parse-url") => {
            return write_error(&mut stream, 405, "Method not allowed").await
        }
        _ => return write_error(&mut stream, 404, "Not found").await,
    };

    if let Err(e) = result {
        tracing::warn!(path = %request.path, error = %e, "handler failed");
        let status = match e.status_code() {
            s if s >= 400 => s,
            _ => 500,
        };
        // Fails harmlessly when a streamed response already started.
        let _ = write_error(&mut stream, status, &e.to_string()).await;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Access password
// ---------------------------------------------------------------------------

/// Validate the `X-Access-Password` header against the configured password.
///
/// Returns whether a correct password was supplied. A header that does not
/// match, or that is sent to a server without a password, is rejected.
pub fn check_access(configured: Option<&str>, supplied: Option<&str>) -> Result<bool> {
    let Some(supplied) = supplied.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(false);
    };
    match configured {
        Some(expected) if bool::from(expected.as_bytes().ct_eq(supplied.as_bytes())) => Ok(true),
        _ => Err(NexusError::AuthRejected("invalid access password".into())),
    }
}

// ---------------------------------------------------------------------------
// /api/chat
// ---------------------------------------------------------------------------

async fn handle_chat(stream: &mut TcpStream, state: &AppState, request: &HttpRequest) -> Result<()> {
    let password_ok = check_access(state.config.access_password(), request.header(ACCESS_PASSWORD_HEADER))?;
    let body: ChatRequest = serde_json::from_slice(&request.body)?;

    let custom_ok = body.llm_config.as_ref().is_some_and(LlmConfig::is_active);
    let exempt = password_ok || custom_ok;
    let cfg = state.config.effective(body.llm_config.as_ref());
    if !cfg.is_active() {
        return Err(NexusError::Config("no API key configured for the upstream provider".into()));
    }

    let adapter = adapter_for(cfg.provider);
    tracing::info!(provider = %cfg.provider, model = %cfg.model_id, stream = body.stream, exempt, "chat request");

    let upstream = adapter
        .chat_request(&cfg, &body.messages, body.stream)
        .into_builder(&state.http)
        .send()
        .await?;

    let exempt_header: &[(&str, &str)] = if exempt { &[(QUOTA_EXEMPT_HEADER, "true")] } else { &[] };

    let status = upstream.status();
    if !status.is_success() {
        let text = upstream.text().await.unwrap_or_default();
        let relayed = upstream_status(status.as_u16());
        tracing::warn!(status = status.as_u16(), relayed, "upstream rejected chat request");
        return write_response(stream, relayed, "application/json", &[], text.as_bytes()).await;
    }

    if !body.stream {
        let value: Value = upstream.json().await?;
        let content = adapter.extract_completion(&value).unwrap_or_default();
        return write_json(stream, 200, exempt_header, &json!({ "content": content })).await;
    }

    let mut head = format!(
        "HTTP/1.1 200 OK\r\n{}Content-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n",
        CORS_HEADERS
    );
    for (name, value) in exempt_header {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;

    relay_stream(stream, adapter, upstream.bytes_stream()).await
}

/// Status relayed for an upstream failure. 401 is reserved for the access
/// password, so a provider refusing its key becomes 502.
fn upstream_status(status: u16) -> u16 {
    match status {
        401 => 502,
        s => s,
    }
}

/// Upstream `data:` payload of one SSE line, if it is one.
fn sse_payload(line: &str) -> Option<&str> {
    line.trim().strip_prefix("data:").map(str::trim_start)
}

/// Re-emit upstream deltas as normalized SSE until the upstream ends.
///
/// An upstream that breaks off mid-body ends the response with an
/// `{"error": ...}` event and no `[DONE]`, so the client sees the turn fail.
async fn relay_stream<S, B>(stream: &mut TcpStream, adapter: &dyn ProviderAdapter, upstream: S) -> Result<()>
where
    S: futures_util::Stream<Item = reqwest::Result<B>>,
    B: AsRef<[u8]>,
{
    let mut upstream = std::pin::pin!(upstream);
    let mut decoder = Utf8StreamDecoder::new();
    let mut lines = LineBuffer::new();
    let mut done = false;

    'read: while let Some(item) = upstream.next().await {
        let bytes = match item {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "upstream stream interrupted");
                let event = format!("data: {}\n\n", json!({ "error": format!("upstream stream interrupted: {}", e) }));
                stream.write_all(event.as_bytes()).await?;
                stream.flush().await?;
                return Ok(());
            }
        };
        for line in lines.push(&decoder.decode(bytes.as_ref())) {
            if emit_line(stream, adapter, &line, &mut done).await? {
                break 'read;
            }
        }
    }
    if !done {
        let tail = decoder.finish();
        let mut rest: Vec<String> = lines.push(&tail);
        rest.push(lines.take_remainder());
        for line in rest {
            if emit_line(stream, adapter, &line, &mut done).await? {
                break;
            }
        }
    }

    stream.write_all(format!("data: {}\n\n", DONE_SENTINEL).as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Returns true once the upstream signalled completion.
async fn emit_line(stream: &mut TcpStream, adapter: &dyn ProviderAdapter, line: &str, done: &mut bool) -> Result<bool> {
    let Some(payload) = sse_payload(line) else {
        return Ok(false);
    };
    if payload == DONE_SENTINEL {
        *done = true;
        return Ok(true);
    }
    if let Some(delta) = adapter.extract_stream_delta(payload) {
        let event = format!("data: {}\n\n", json!({ "content": delta }));
        stream.write_all(event.as_bytes()).await?;
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// /api/models
// ---------------------------------------------------------------------------

async fn handle_models(stream: &mut TcpStream, state: &AppState, request: &HttpRequest) -> Result<()> {
    check_access(state.config.access_password(), request.header(ACCESS_PASSWORD_HEADER))?;
    let body: ModelsRequest = if request.body.is_empty() {
        ModelsRequest::default()
    } else {
        serde_json::from_slice(&request.body)?
    };
    let cfg = state.config.effective(body.llm_config.as_ref());
    let adapter = adapter_for(cfg.provider);

    let Some(upstream) = adapter.models_request(&cfg) else {
        let data: Vec<Value> = adapter.static_models().iter().map(|id| json!({ "id": id })).collect();
        return write_json(stream, 200, &[], &json!({ "data": data })).await;
    };

    let response = upstream.into_builder(&state.http).send().await?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(NexusError::Config(format!("failed to fetch models: {} {}", status.as_u16(), text)));
    }
    let value: Value = response.json().await?;
    write_json(stream, 200, &[], &value).await
}

// ---------------------------------------------------------------------------
// /api/parse-url
// ---------------------------------------------------------------------------

/// Every answer, failures included, has the `{success, data?, error?}` shape.
async fn handle_parse_url(stream: &mut TcpStream, state: &AppState, request: &HttpRequest) -> Result<()> {
    check_access(state.config.access_password(), request.header(ACCESS_PASSWORD_HEADER))?;
    let outcome = match serde_json::from_slice::<ParseUrlRequest>(&request.body) {
        Ok(body) => page::fetch_page(&state.http, &body.url).await,
        Err(e) => Err(NexusError::InvalidUrl(format!("expected {{\"url\": ...}}: {}", e))),
    };

    let (status, response) = match outcome {
        Ok(parsed) => {
            tracing::info!(url = %parsed.url, chars = parsed.content.len(), "parsed page");
            (200, ParseUrlResponse::ok(parsed))
        }
        Err(e) => {
            let status = match e.status_code() {
                400 => 400,
                _ => 502,
            };
            tracing::warn!(status, error = %e, "parse-url failed");
            (status, ParseUrlResponse::failed(e.to_string()))
        }
    };
    write_json(stream, status, &[], &serde_json::to_value(&response)?).await
}

// ---------------------------------------------------------------------------
// /api/collab
// ---------------------------------------------------------------------------

async fn handle_collab(mut stream: TcpStream, state: &AppState, request: &HttpRequest, channel: String) -> Result<()> {
    let key = request.header("Sec-WebSocket-Key");
    let key = match key {
        Some(k) if collab::is_websocket_upgrade(request.header("Upgrade")) => k.to_string(),
        _ => {
            return write_response(&mut stream, 426, "text/plain", &[], b"Expected Upgrade: websocket").await;
        }
    };

    let (peer_id, outbound) = state.registry.register(&channel);
    if let Err(e) = stream.write_all(collab::switching_protocols_response(&key).as_bytes()).await {
        state.registry.close(&channel, &peer_id);
        return Err(e.into());
    }

    let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
    collab::handle_peer(ws, state.registry.clone(), channel, peer_id, outbound).await;
    Ok(())
}
