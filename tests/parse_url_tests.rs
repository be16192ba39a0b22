//! `/api/parse-url` end to end: client -> server -> a local site serving
//! canned pages.

use std::net::SocketAddr;

use draw_nexus::client::ChatClient;
use draw_nexus::config::ServerConfig;
use draw_nexus::page::prompt_with_reference;
use draw_nexus::quota::CredentialGate;
use draw_nexus::web::{self, read_request};
use draw_nexus::NexusError;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

const ARTICLE: &str = r#"<!doctype html>
<html>
<head>
  <title>Login flow | Diagram Weekly</title>
  <meta property="og:site_name" content="Diagram Weekly">
  <meta name="description" content="How a login request travels.">
</head>
<body>
  <header><a href="/">Diagram Weekly</a></header>
  <main>
    <h2>Steps</h2>
    <ol><li>Browser posts credentials</li><li>Server checks the hash</li></ol>
    <p>Then a session cookie is set.</p>
  </main>
</body>
</html>"#;

fn respond(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

async fn start_site() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let Ok(Some(req)) = read_request(&mut stream).await else { return };
                let resp = match req.path.as_str() {
                    "/article" => respond("200 OK", "text/html; charset=utf-8", ARTICLE),
                    "/moved" => "HTTP/1.1 302 Found\r\nLocation: /article\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
                    "/notes.txt" => respond("200 OK", "text/plain", "  sequence notes\nalice then bob\n"),
                    "/logo.png" => respond("200 OK", "image/png", "\u{89}PNG"),
                    "/huge" => {
                        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 6000000\r\nConnection: close\r\n\r\n<html>"
                            .to_string()
                    }
                    _ => respond("404 Not Found", "text/html", "<h1>gone</h1>"),
                };
                let _ = stream.write_all(resp.as_bytes()).await;
            });
        }
    });
    addr
}

async fn start_server(config: ServerConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(web::serve_listener(listener, config));
    addr
}

async fn setup() -> (SocketAddr, ChatClient) {
    let site = start_site().await;
    let server = start_server(ServerConfig::default()).await;
    (site, ChatClient::new(format!("http://{}/api", server)))
}

/// Raw status and JSON body, bypassing the client.
async fn post_raw(client: &ChatClient, body: &str) -> (u16, serde_json::Value) {
    let resp = reqwest::Client::new()
        .post(format!("{}/parse-url", client.base_url()))
        .header("Content-Type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

// ---------------------------------------------------------------------------
// Pages that parse
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_article_comes_back_as_markdown() {
    let (site, client) = setup().await;
    let page = client.parse_url(&CredentialGate::new(5), &format!("http://{}/article", site)).await.unwrap();

    assert_eq!(page.title, "Login flow | Diagram Weekly");
    assert_eq!(page.site_name, "Diagram Weekly");
    assert_eq!(page.excerpt, "How a login request travels.");
    assert_eq!(
        page.content,
        "## Steps\n\n- Browser posts credentials\n\n- Server checks the hash\n\nThen a session cookie is set."
    );
    assert_eq!(page.url, format!("http://{}/article", site));

    let prompt = prompt_with_reference("Draw this", &page);
    assert!(prompt.contains("Reference: Login flow | Diagram Weekly"));
    assert!(prompt.ends_with("Then a session cookie is set."));
}

#[tokio::test]
async fn test_wire_shape_uses_camel_case() {
    let (site, client) = setup().await;
    let (status, body) = post_raw(&client, &format!(r#"{{"url":"http://{}/article"}}"#, site)).await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["siteName"], "Diagram Weekly");
    assert!(body["data"]["content"].as_str().unwrap().starts_with("## Steps"));
    assert!(body.get("error").is_none());
}

#[tokio::test]
async fn test_redirect_reports_final_url() {
    let (site, client) = setup().await;
    let page = client.parse_url(&CredentialGate::new(5), &format!("http://{}/moved", site)).await.unwrap();
    assert_eq!(page.url, format!("http://{}/article", site));
    assert_eq!(page.site_name, "Diagram Weekly");
}

#[tokio::test]
async fn test_plain_text_kept_as_is() {
    let (site, client) = setup().await;
    let page = client.parse_url(&CredentialGate::new(5), &format!("http://{}/notes.txt", site)).await.unwrap();
    assert_eq!(page.title, "notes.txt");
    assert_eq!(page.content, "sequence notes\nalice then bob");
    assert_eq!(page.site_name, "127.0.0.1");
}

// ---------------------------------------------------------------------------
// Failures keep the {success, error} shape
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_missing_page_is_bad_gateway() {
    let (site, client) = setup().await;
    let (status, body) = post_raw(&client, &format!(r#"{{"url":"http://{}/nowhere"}}"#, site)).await;
    assert_eq!(status, 502);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("404"), "got: {}", body);
    assert!(body.get("data").is_none());
}

#[tokio::test]
async fn test_non_http_scheme_is_bad_request() {
    let (_site, client) = setup().await;
    let err = client.parse_url(&CredentialGate::new(5), "ftp://example.com/file").await.unwrap_err();
    match err {
        NexusError::RequestFailed { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("unsupported scheme"), "got: {}", body);
        }
        other => panic!("expected RequestFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_body_without_url_is_bad_request() {
    let (_site, client) = setup().await;
    let (status, body) = post_raw(&client, r#"{"link":"http://example.com"}"#).await;
    assert_eq!(status, 400);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_binary_content_refused() {
    let (site, client) = setup().await;
    let (status, body) = post_raw(&client, &format!(r#"{{"url":"http://{}/logo.png"}}"#, site)).await;
    assert_eq!(status, 502);
    assert!(body["error"].as_str().unwrap().contains("image/png"), "got: {}", body);
}

#[tokio::test]
async fn test_oversized_page_refused_before_download() {
    let (site, client) = setup().await;
    let (status, body) = post_raw(&client, &format!(r#"{{"url":"http://{}/huge"}}"#, site)).await;
    assert_eq!(status, 502);
    assert!(body["error"].as_str().unwrap().contains("too large"), "got: {}", body);
}

#[tokio::test]
async fn test_wrong_access_password_rejected() {
    let site = start_site().await;
    let server = start_server(ServerConfig { access_password: Some("pw".into()), ..Default::default() }).await;
    let client = ChatClient::new(format!("http://{}/api", server));

    let mut gate = CredentialGate::new(5);
    gate.credentials_mut().set_access_password("nope");
    let err = client.parse_url(&gate, &format!("http://{}/article", site)).await.unwrap_err();
    assert!(matches!(err, NexusError::AuthRejected(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_get_not_allowed() {
    let (_site, client) = setup().await;
    let resp = reqwest::get(format!("{}/parse-url", client.base_url())).await.unwrap();
    assert_eq!(resp.status(), 405);
}
