//! Agent session drivers
//!
//! One control channel per tunnel carries the request/response frames; any
//! number of secondary client channels may be attached, and their frames are
//! relayed verbatim to the control channel.
//!
//! Each accepted socket gets a dedicated writer task fed by a bounded mpsc
//! channel, so concurrent senders queue instead of interleaving writes.

use crate::http::AppState;
use axum::extract::ws::{Message, WebSocket};
use bunnel_proto::{decode_response, encode_connected, ConnectedNotice};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Drive a freshly-upgraded agent control channel until it closes.
pub(crate) async fn run_control(socket: WebSocket, subdomain: String, state: Arc<AppState>) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(64);
    tokio::spawn(write_loop(sink, rx));

    state.registry.register(&subdomain, tx.clone());

    let notice = ConnectedNotice::new(subdomain.clone());
    let frame = match encode_connected(&notice) {
        Ok(text) => Message::Text(text),
        Err(err) => {
            warn!(subdomain = %subdomain, error = %err, "failed to encode connected notice");
            state.registry.reap(&subdomain);
            return;
        }
    };
    if tx.send(frame).await.is_err() {
        state.registry.reap(&subdomain);
        return;
    }
    info!(subdomain = %subdomain, "agent control channel established");

    if read_control(stream, &subdomain, &state).await {
        // Orderly close or transport loss: keep the identity for the grace
        // window in case the agent comes right back.
        state.registry.mark_offline(&subdomain, state.config.grace_window);
    }
}

/// Read frames off the control channel. Returns true when the channel ended
/// normally, false when the tunnel was already reaped for a protocol
/// violation.
async fn read_control(
    mut stream: SplitStream<WebSocket>,
    subdomain: &str,
    state: &Arc<AppState>,
) -> bool {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(subdomain = %subdomain, "non-UTF-8 frame on control channel");
                    state.registry.reap(subdomain);
                    return false;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue, // ping/pong, handled by the websocket layer
            Err(err) => {
                debug!(subdomain = %subdomain, error = %err, "control channel read error");
                break;
            }
        };

        match decode_response(&text) {
            Ok(response) => {
                state.registry.touch(subdomain);
                if !state.pending.respond(response) {
                    debug!(subdomain = %subdomain, "response without a pending request");
                }
            }
            Err(err) => {
                // Frame desync is unrecoverable at the session level.
                warn!(subdomain = %subdomain, error = %err, "protocol violation on control channel");
                state.registry.reap(subdomain);
                return false;
            }
        }
    }
    debug!(subdomain = %subdomain, "control channel closed");
    true
}

/// Drive a secondary client channel: frames relay verbatim to the control
/// channel; nothing routes back.
pub(crate) async fn run_client(socket: WebSocket, subdomain: String, state: Arc<AppState>) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(64);
    tokio::spawn(write_loop(sink, rx));

    let Some(client_id) = state.registry.add_client(&subdomain, tx) else {
        // Tunnel vanished between routing and the upgrade completing.
        return;
    };

    while let Some(message) = stream.next().await {
        match message {
            Ok(frame @ (Message::Text(_) | Message::Binary(_))) => {
                // Fetch the sender each time: the control channel may have
                // been rebound by a grace-window reattach.
                let Some(control) = state.registry.control_sender(&subdomain) else {
                    break;
                };
                if control.send(frame).await.is_err() {
                    break;
                }
                state.registry.touch(&subdomain);
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.registry.remove_client(&subdomain, client_id);
}

/// Writer task: drains the queue into the socket, closing it when every
/// sender is gone (which is how a reap closes the channel).
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
