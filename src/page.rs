//! Web page extraction behind `/api/parse-url`.
//!
//! A page is fetched over http(s) and reduced to a title, a short excerpt
//! and a markdown rendering of its main content, ready to be quoted in a
//! prompt.

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{NexusError, Result};

pub const MAX_PAGE_BYTES: u64 = 5 * 1024 * 1024;
pub const EXCERPT_CHARS: usize = 200;

/// Main-content candidates, most specific first.
const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "main",
    "[role='main']",
    ".post-content",
    ".article-content",
    ".entry-content",
    "#content",
    "body",
];

const BLOCK_TAGS: &[&str] = &["h1", "h2", "h3", "h4", "h5", "h6", "p", "li", "pre", "blockquote"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseUrlRequest {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedPage {
    pub title: String,
    /// Markdown.
    pub content: String,
    pub excerpt: String,
    pub site_name: String,
    pub url: String,
}

/// Wire shape of `/api/parse-url` answers, success or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseUrlResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ParsedPage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ParseUrlResponse {
    pub fn ok(page: ParsedPage) -> Self {
        Self { success: true, data: Some(page), error: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(message.into()) }
    }
}

/// Accept absolute http(s) URLs only.
pub fn validate_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| NexusError::InvalidUrl(format!("{}: {}", raw.trim(), e)))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        scheme => Err(NexusError::InvalidUrl(format!("unsupported scheme '{}'", scheme))),
    }
}

/// Fetch `raw` and extract it. HTML and plain text are accepted.
pub async fn fetch_page(client: &reqwest::Client, raw: &str) -> Result<ParsedPage> {
    let url = validate_url(raw)?;
    let response = client.get(url.clone()).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(NexusError::Page(format!("{} answered {}", url, status.as_u16())));
    }
    if let Some(len) = response.content_length() {
        if len > MAX_PAGE_BYTES {
            return Err(NexusError::Page(format!("page too large: {} bytes", len)));
        }
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/html")
        .to_ascii_lowercase();
    let final_url = response.url().clone();
    let is_html = content_type.contains("text/html") || content_type.contains("application/xhtml");
    if !is_html && !content_type.contains("text/plain") {
        return Err(NexusError::Page(format!("unsupported content type '{}'", content_type)));
    }

    let body = response.text().await?;
    tracing::debug!(url = %final_url, bytes = body.len(), html = is_html, "fetched page");
    if is_html {
        Ok(extract_page(&body, &final_url))
    } else {
        Ok(plain_page(&body, &final_url))
    }
}

/// Prompt text with the page quoted after it.
pub fn prompt_with_reference(prompt: &str, page: &ParsedPage) -> String {
    format!(
        "{}\n\n---\nReference: {} ({})\n\n{}",
        prompt.trim_end(),
        page.title,
        page.url,
        page.content
    )
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn host_of(url: &Url) -> String {
    url.host_str().unwrap_or_default().trim_start_matches("www.").to_string()
}

/// Collapse runs of whitespace to single spaces.
fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn meta(document: &Html, name: &str) -> Option<String> {
    ["name", "property"].iter().find_map(|attr| {
        let sel = selector(&format!("meta[{}='{}']", attr, name))?;
        document
            .select(&sel)
            .filter_map(|el| el.value().attr("content"))
            .map(str::trim)
            .find(|c| !c.is_empty())
            .map(str::to_string)
    })
}

fn first_text(document: &Html, css: &str) -> Option<String> {
    let sel = selector(css)?;
    document
        .select(&sel)
        .map(|el| clean_text(&el.text().collect::<String>()))
        .find(|t| !t.is_empty())
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", text[..cut].trim_end()),
        None => text.to_string(),
    }
}

/// Whether `el` sits inside another block below `root`; its text is then
/// already part of that block.
fn is_nested_block(el: &ElementRef, root: &ElementRef) -> bool {
    el.ancestors()
        .take_while(|n| n.id() != root.id())
        .filter_map(ElementRef::wrap)
        .any(|a| BLOCK_TAGS.contains(&a.value().name()))
}

fn render_block(el: &ElementRef) -> Option<String> {
    let name = el.value().name();
    if name == "pre" {
        let raw: String = el.text().collect();
        let raw = raw.trim_matches('\n');
        return (!raw.trim().is_empty()).then(|| format!("```\n{}\n```", raw));
    }
    let text = clean_text(&el.text().collect::<String>());
    if text.is_empty() {
        return None;
    }
    Some(match name {
        "li" => format!("- {}", text),
        "blockquote" => format!("> {}", text),
        h if h.len() == 2 && h.starts_with('h') => {
            let level = h[1..].parse::<usize>().unwrap_or(1);
            format!("{} {}", "#".repeat(level), text)
        }
        _ => text,
    })
}

/// Markdown blocks of the first content root that has any.
fn main_blocks(document: &Html) -> Vec<(String, String)> {
    let Some(blocks) = selector(&BLOCK_TAGS.join(", ")) else {
        return Vec::new();
    };
    for css in CONTENT_SELECTORS {
        let Some(sel) = selector(css) else { continue };
        let Some(root) = document.select(&sel).next() else { continue };
        let rendered: Vec<(String, String)> = root
            .select(&blocks)
            .filter(|el| !is_nested_block(el, &root))
            .filter_map(|el| render_block(&el).map(|md| (el.value().name().to_string(), md)))
            .collect();
        if !rendered.is_empty() {
            return rendered;
        }
    }
    Vec::new()
}

/// Reduce an HTML document fetched from `url`.
pub fn extract_page(html: &str, url: &Url) -> ParsedPage {
    let document = Html::parse_document(html);
    let host = host_of(url);

    let title = meta(&document, "og:title")
        .or_else(|| first_text(&document, "title"))
        .or_else(|| first_text(&document, "h1"))
        .unwrap_or_else(|| host.clone());
    let site_name = meta(&document, "og:site_name").unwrap_or_else(|| host.clone());

    let blocks = main_blocks(&document);
    let content = if blocks.is_empty() {
        first_text(&document, "body").unwrap_or_default()
    } else {
        blocks.iter().map(|(_, md)| md.as_str()).collect::<Vec<_>>().join("\n\n")
    };

    let excerpt = meta(&document, "description")
        .or_else(|| meta(&document, "og:description"))
        .or_else(|| blocks.iter().find(|(tag, _)| tag == "p").map(|(_, md)| md.clone()))
        .unwrap_or_else(|| clean_text(&content));

    ParsedPage {
        title,
        content,
        excerpt: truncate_chars(&excerpt, EXCERPT_CHARS),
        site_name,
        url: url.to_string(),
    }
}

fn plain_page(text: &str, url: &Url) -> ParsedPage {
    let host = host_of(url);
    let content = text.trim().to_string();
    let title = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| host.clone());
    ParsedPage {
        title,
        excerpt: truncate_chars(&clean_text(&content), EXCERPT_CHARS),
        content,
        site_name: host,
        url: url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTICLE: &str = r#"<!doctype html>
<html lang="en">
<head>
  <title>Fallback title</title>
  <meta property="og:title" content="Sequence diagrams 101">
  <meta property="og:site_name" content="Diagram Weekly">
  <script>var tracking = "ignore me";</script>
</head>
<body>
  <nav><a href="/">Home</a></nav>
  <article>
    <h1>Sequence   diagrams</h1>
    <p>Actors exchange <b>messages</b> over time.</p>
    <ul><li><p>Alice</p></li><li>Bob</li></ul>
    <pre>sequenceDiagram
    Alice->>Bob: Hi</pre>
    <blockquote>Keep it short.</blockquote>
  </article>
  <footer>© 2024</footer>
</body>
</html>"#;

    fn url() -> Url {
        Url::parse("https://www.example.com/posts/seq").unwrap()
    }

    #[test]
    fn test_extract_article_as_markdown() {
        let page = extract_page(ARTICLE, &url());
        assert_eq!(page.title, "Sequence diagrams 101");
        assert_eq!(page.site_name, "Diagram Weekly");
        assert_eq!(page.url, "https://www.example.com/posts/seq");
        assert_eq!(
            page.content,
            "# Sequence diagrams\n\nActors exchange messages over time.\n\n- Alice\n\n- Bob\n\n\
             ```\nsequenceDiagram\n    Alice->>Bob: Hi\n```\n\n> Keep it short."
        );
        assert_eq!(page.excerpt, "Actors exchange messages over time.");
        assert!(!page.content.contains("Home"));
        assert!(!page.content.contains("tracking"));
    }

    #[test]
    fn test_extract_falls_back_to_title_tag_and_host() {
        let html = "<html><head><title> Notes </title></head><body><p>one</p><p>two</p></body></html>";
        let page = extract_page(html, &url());
        assert_eq!(page.title, "Notes");
        assert_eq!(page.site_name, "example.com");
        assert_eq!(page.content, "one\n\ntwo");
    }

    #[test]
    fn test_extract_meta_description_wins_for_excerpt() {
        let html = r#"<html><head><meta name="description" content="Short summary."></head>
            <body><main><p>Body text.</p></main></body></html>"#;
        assert_eq!(extract_page(html, &url()).excerpt, "Short summary.");
    }

    #[test]
    fn test_extract_body_without_blocks() {
        let html = "<html><body><div>just\n  some   text</div></body></html>";
        let page = extract_page(html, &url());
        assert_eq!(page.content, "just some text");
        assert_eq!(page.title, "example.com");
    }

    #[test]
    fn test_excerpt_truncated_on_char_boundary() {
        let long = "流".repeat(EXCERPT_CHARS + 10);
        let html = format!("<html><body><p>{}</p></body></html>", long);
        let page = extract_page(&html, &url());
        assert_eq!(page.excerpt.chars().count(), EXCERPT_CHARS + 1);
        assert!(page.excerpt.ends_with('…'));
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com/a").is_ok());
        assert!(validate_url("  http://localhost:8080 ").is_ok());
        assert!(matches!(validate_url("ftp://example.com"), Err(NexusError::InvalidUrl(_))));
        assert!(matches!(validate_url("not a url"), Err(NexusError::InvalidUrl(_))));
        assert!(matches!(validate_url("file:///etc/passwd"), Err(NexusError::InvalidUrl(_))));
    }

    #[test]
    fn test_plain_page_title_from_path() {
        let page = plain_page("  line one\nline two  ", &Url::parse("http://example.com/notes.txt").unwrap());
        assert_eq!(page.title, "notes.txt");
        assert_eq!(page.content, "line one\nline two");
        assert_eq!(page.excerpt, "line one line two");
    }

    #[test]
    fn test_response_wire_shape() {
        let failed = serde_json::to_value(ParseUrlResponse::failed("nope")).unwrap();
        assert_eq!(failed, serde_json::json!({ "success": false, "error": "nope" }));
        let page = extract_page(ARTICLE, &url());
        let ok = serde_json::to_value(ParseUrlResponse::ok(page)).unwrap();
        assert_eq!(ok["data"]["siteName"], "Diagram Weekly");
        assert!(ok.get("error").is_none());
    }

    #[test]
    fn test_prompt_with_reference() {
        let page = extract_page(ARTICLE, &url());
        let prompt = prompt_with_reference("Draw this as a diagram\n", &page);
        assert!(prompt.starts_with("Draw this as a diagram\n\n---\nReference: Sequence diagrams 101 (https://www.example.com/posts/seq)"));
        assert!(prompt.ends_with("> Keep it short."));
    }
}
