//! Echo suppression and debounced sending for a collaborating client.
//!
//! A remote edit applied to the local document looks exactly like a local
//! edit to whoever watches the document, so the coordinator raises a
//! one-shot flag when it applies one; the next change notification clears
//! the flag instead of sending. Genuine local edits are sent on the trailing
//! edge of a quiet period: every new edit restarts the timer and only the
//! last content goes out.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::Result;

pub const QUIET_PERIOD: Duration = Duration::from_millis(500);

/// Wire shape of a relayed document update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollabMessage {
    #[serde(default)]
    pub content: String,
}

/// The editor's document as far as collaboration cares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentState {
    content: String,
    has_unsaved_changes: bool,
}

impl DocumentState {
    pub fn new(content: impl Into<String>) -> Self {
        Self { content: content.into(), has_unsaved_changes: false }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.has_unsaved_changes
    }

    /// A local edit.
    pub fn edit(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.has_unsaved_changes = true;
    }

    /// Content loaded from a saved version or a remote peer.
    pub fn set_from_version(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.has_unsaved_changes = false;
    }

    pub fn mark_saved(&mut self) {
        self.has_unsaved_changes = false;
    }
}

/// Payload waiting out its quiet period. Whoever takes it sends it, so the
/// timer and an early flush never both deliver.
type PendingSlot = Arc<Mutex<Option<String>>>;

pub struct CollabCoordinator {
    suppress_next: bool,
    pending: Option<(JoinHandle<()>, PendingSlot)>,
    quiet_period: Duration,
    outbound: mpsc::UnboundedSender<String>,
}

impl CollabCoordinator {
    /// Debounced sends are delivered to `outbound` as serialized messages.
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self::with_quiet_period(outbound, QUIET_PERIOD)
    }

    pub fn with_quiet_period(outbound: mpsc::UnboundedSender<String>, quiet_period: Duration) -> Self {
        Self { suppress_next: false, pending: None, quiet_period, outbound }
    }

    /// Apply a remote update. Empty content and content equal to the
    /// current document are ignored; returns whether `doc` changed.
    pub fn on_remote_message(&mut self, doc: &mut DocumentState, message: &CollabMessage) -> bool {
        if message.content.is_empty() || message.content == doc.content {
            return false;
        }
        self.suppress_next = true;
        doc.set_from_version(message.content.clone());
        true
    }

    /// React to a document change. Any pending send is superseded first.
    /// Returns whether a new send was scheduled.
    pub fn on_local_change(&mut self, doc: &DocumentState) -> bool {
        self.cancel();
        if self.suppress_next {
            self.suppress_next = false;
            return false;
        }
        if !doc.has_unsaved_changes || doc.content.is_empty() {
            return false;
        }

        let payload = match serde_json::to_string(&CollabMessage { content: doc.content.clone() }) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "could not serialize collab update");
                return false;
            }
        };
        let slot: PendingSlot = Arc::new(Mutex::new(Some(payload)));
        let timer_slot = Arc::clone(&slot);
        let tx = self.outbound.clone();
        let delay = self.quiet_period;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let due = timer_slot.lock().ok().and_then(|mut p| p.take());
            if let Some(payload) = due {
                let _ = tx.send(payload);
            }
        });
        self.pending = Some((handle, slot));
        true
    }

    /// Drop the pending send, if any.
    pub fn cancel(&mut self) {
        self.take_pending();
    }

    /// Stop the timer and hand back the payload it would have sent, for a
    /// caller that is about to leave and must not lose the last edit.
    pub fn flush(&mut self) -> Option<String> {
        self.take_pending()
    }

    fn take_pending(&mut self) -> Option<String> {
        let (handle, slot) = self.pending.take()?;
        handle.abort();
        let payload = slot.lock().ok().and_then(|mut p| p.take());
        payload
    }

    pub fn is_suppressing(&self) -> bool {
        self.suppress_next
    }

    pub fn has_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|(_, slot)| slot.lock().map(|p| p.is_some()).unwrap_or(false))
    }
}

impl Drop for CollabCoordinator {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Join the relay at `url` and keep `doc` in sync until either side ends.
///
/// Local edits arrive on `edits`; every remote update that changed the
/// document is reported on `remote_sink`. Returns the final document. When
/// `edits` closes, a send still waiting for its quiet period goes out at
/// once; when the relay ends the session, it is dropped.
pub async fn run_session(
    url: &str,
    mut doc: DocumentState,
    mut edits: mpsc::UnboundedReceiver<String>,
    remote_sink: mpsc::UnboundedSender<String>,
) -> Result<DocumentState> {
    let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
    tracing::info!(url, "joined collab channel");
    let (mut ws_sink, mut ws_stream) = ws.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let mut coordinator = CollabCoordinator::new(out_tx);

    loop {
        tokio::select! {
            inbound = ws_stream.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        let message: CollabMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                tracing::debug!(error = %e, "ignoring malformed collab frame");
                                continue;
                            }
                        };
                        if coordinator.on_remote_message(&mut doc, &message) {
                            let _ = remote_sink.send(message.content);
                            coordinator.on_local_change(&doc);
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
            edit = edits.recv() => {
                match edit {
                    Some(content) => {
                        doc.edit(content);
                        coordinator.on_local_change(&doc);
                    }
                    None => {
                        while let Ok(payload) = out_rx.try_recv() {
                            ws_sink.send(WsMessage::Text(payload)).await?;
                        }
                        if let Some(payload) = coordinator.flush() {
                            tracing::debug!("edits closed, flushing pending update");
                            ws_sink.send(WsMessage::Text(payload)).await?;
                        }
                        break;
                    }
                }
            }
            Some(payload) = out_rx.recv() => {
                ws_sink.send(WsMessage::Text(payload)).await?;
            }
        }
    }

    coordinator.cancel();
    let _ = ws_sink.close().await;
    Ok(doc)
}
