//! Per-connection read/write pumps.
//!
//! Each connection runs two tasks coupled only through the session's
//! bounded outbound queue and the hub mailbox. The write pump ends when
//! the hub closes the queue or a write fails; a write failure does not
//! notify the hub — the broken transport surfaces on the read side, and
//! unregistration happens there on every exit path.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use banter_core::ids::SessionId;
use banter_core::messages::{message_body, ChatMessage};
use banter_core::profile::ProfileRecord;
use banter_hub::HubHandle;

/// Run a WebSocket session for a registered connection.
///
/// The caller has already registered the session with the hub; this
/// drives both pumps and submits `unregister` when the read side ends.
pub async fn run_ws_session(
    socket: WebSocket,
    session_id: SessionId,
    profile: Arc<RwLock<ProfileRecord>>,
    mut rx: mpsc::Receiver<String>,
    hub: HubHandle,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Write pump: drain the outbound queue into the socket. `None` means
    // the hub dropped the sender (unregistered or evicted).
    let writer_id = session_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                debug!(session_id = %writer_id, "outbound write failed");
                break;
            }
        }
    });

    // Read pump: each inbound frame becomes a chat message stamped with
    // the session's current identity snapshot and a server timestamp.
    while let Some(Ok(frame)) = ws_rx.next().await {
        let raw = match frame {
            Message::Text(text) => text.to_string(),
            Message::Binary(ref data) => match std::str::from_utf8(data) {
                Ok(text) => text.to_owned(),
                Err(_) => {
                    debug!(session_id = %session_id, len = data.len(), "ignoring non-UTF8 frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let body = message_body(&raw);
        let sender = profile.read().clone();
        let message = ChatMessage::outgoing(&sender, body);

        match serde_json::to_string(&message) {
            Ok(json) => {
                if hub.dispatch(json).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!(session_id = %session_id, %err, "failed to serialize message"),
        }
    }

    // Read side is done (close, error, or hub gone): unregister, which
    // also closes the outbound queue and ends the write pump.
    if hub.unregister(session_id.clone()).await.is_err() {
        debug!(session_id = %session_id, "hub gone during teardown");
    }
    info!(session_id = %session_id, "connection closed");
    drop(writer);
}
