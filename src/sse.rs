//! SSE stream parser and accumulator.
//!
//! Turns a response body, delivered in arbitrary network-sized pieces, into
//! an ordered series of text fragments:
//!
//! 1. bytes are decoded with a continuation-aware UTF-8 decoder, so a code
//!    point split across two reads is emitted once, whole;
//! 2. decoded text is cut into lines; the trailing partial line waits for
//!    the next read;
//! 3. each complete line is trimmed, stripped of its `data: ` prefix and run
//!    through [`parse_sse_line`];
//! 4. at end of stream the leftover partial line is processed too.
//!
//! The final content is independent of how the bytes were split.

use futures_util::{Stream, StreamExt};
use serde_json::Value;

use crate::error::{NexusError, Result};

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_SENTINEL: &str = "[DONE]";

type Extractor = fn(&Value) -> Option<&str>;

fn openai_delta(v: &Value) -> Option<&str> {
    v.pointer("/choices/0/delta/content")?.as_str()
}

fn flat_content(v: &Value) -> Option<&str> {
    v.get("content")?.as_str()
}

fn flat_text(v: &Value) -> Option<&str> {
    v.get("text")?.as_str()
}

/// Payload shapes tried in order; the first non-empty string wins.
const EXTRACTORS: &[(&str, Extractor)] = &[
    ("openai_delta", openai_delta),
    ("content", flat_content),
    ("text", flat_text),
];

/// Extract the text carried by one SSE line.
///
/// Returns `None` for the `[DONE]` sentinel, for JSON without a recognised
/// text field, and for blank non-JSON payloads. A non-JSON payload is
/// otherwise returned verbatim.
pub fn parse_sse_line(line: &str) -> Option<String> {
    let data = line.strip_prefix(DATA_PREFIX).unwrap_or(line);
    if data == DONE_SENTINEL {
        return None;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(value) => EXTRACTORS
            .iter()
            .find_map(|(_, extract)| extract(&value).filter(|s| !s.is_empty()))
            .map(str::to_string),
        Err(_) if data.trim().is_empty() => None,
        Err(_) => Some(data.to_string()),
    }
}

/// Message of an error event (`{"error": ...}` carrying no text), which a
/// relay sends when its upstream broke off mid-response.
pub fn parse_error_event(line: &str) -> Option<String> {
    let data = line.strip_prefix(DATA_PREFIX).unwrap_or(line);
    let value: Value = serde_json::from_str(data).ok()?;
    let error = value.get("error")?;
    if EXTRACTORS.iter().any(|(_, extract)| extract(&value).is_some_and(|s| !s.is_empty())) {
        return None;
    }
    Some(match error {
        Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    })
}

/// Whether a trimmed line is the end-of-stream marker.
pub fn is_done_line(line: &str) -> bool {
    line.strip_prefix(DATA_PREFIX).unwrap_or(line) == DONE_SENTINEL
}

/// UTF-8 decoder that carries incomplete sequences over to the next call.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `pending + bytes` as forms complete characters.
    /// Invalid sequences become U+FFFD.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;
        loop {
            let rest = &self.pending[start..];
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start += valid + len;
                        }
                        None => {
                            start += valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        out
    }

    /// Flush at end of stream; a dangling partial sequence becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}

/// Newline splitter that keeps the unterminated tail between pushes.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append text and return every line it completed.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);
        // `complete` ends in '\n', so the last split piece is not a line.
        let mut lines: Vec<String> = complete.split('\n').map(str::to_string).collect();
        lines.pop();
        lines
    }

    /// The partial line still waiting for its newline.
    pub fn remainder(&self) -> &str {
        &self.buffer
    }

    pub fn take_remainder(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }
}

/// Per-request streaming state: partial line plus accumulated content.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    decoder: Utf8StreamDecoder,
    lines: LineBuffer,
    full_content: String,
    saw_done: bool,
    error: Option<String>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read's worth of bytes. `on_chunk` receives each fragment and
    /// the content accumulated so far, in stream order.
    pub fn push<F>(&mut self, bytes: &[u8], on_chunk: &mut F)
    where
        F: FnMut(&str, &str),
    {
        let text = self.decoder.decode(bytes);
        for line in self.lines.push(&text) {
            self.process_line(&line, on_chunk);
        }
    }

    /// End of stream: flush the decoder and the last unterminated line, then
    /// hand back the full content.
    pub fn finish<F>(&mut self, on_chunk: &mut F) -> String
    where
        F: FnMut(&str, &str),
    {
        let tail = self.decoder.finish();
        for line in self.lines.push(&tail) {
            self.process_line(&line, on_chunk);
        }
        let rest = self.lines.take_remainder();
        self.process_line(&rest, on_chunk);
        std::mem::take(&mut self.full_content)
    }

    pub fn full_content(&self) -> &str {
        &self.full_content
    }

    /// Whether a `[DONE]` line has gone by. Reading continues regardless.
    pub fn saw_done(&self) -> bool {
        self.saw_done
    }

    /// First error event seen, if any.
    pub fn stream_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn process_line<F>(&mut self, line: &str, on_chunk: &mut F)
    where
        F: FnMut(&str, &str),
    {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        if is_done_line(trimmed) {
            self.saw_done = true;
            return;
        }
        if let Some(message) = parse_error_event(trimmed) {
            self.error.get_or_insert(message);
            return;
        }
        if let Some(fragment) = parse_sse_line(trimmed) {
            self.full_content.push_str(&fragment);
            on_chunk(&fragment, &self.full_content);
        }
    }
}

/// Drive a byte stream to completion through a [`StreamAccumulator`].
///
/// A transport error from the stream, or an error event inside it, aborts
/// with `StreamInterrupted`; the partial content is dropped with the
/// accumulator. The stream itself is
/// dropped on every return path.
pub async fn consume_stream<S, B, E, F>(stream: S, mut on_chunk: F) -> Result<String>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
    F: FnMut(&str, &str),
{
    let mut stream = std::pin::pin!(stream);
    let mut acc = StreamAccumulator::new();
    while let Some(item) = stream.next().await {
        let bytes = item.map_err(|e| NexusError::StreamInterrupted(e.to_string()))?;
        acc.push(bytes.as_ref(), &mut on_chunk);
    }
    if !acc.saw_done() {
        tracing::debug!(chars = acc.full_content().len(), "stream ended without [DONE]");
    }
    let content = acc.finish(&mut on_chunk);
    if let Some(message) = acc.stream_error() {
        tracing::warn!(chars = content.len(), error = message, "stream reported an upstream failure");
        return Err(NexusError::StreamInterrupted(message.to_string()));
    }
    Ok(content)
}
