//! WebSocket session lifecycle on the relay side.
//!
//! One invocation of [`handle_socket`] drives one client connection from
//! upgrade to teardown: it registers the socket with the room actor, pumps
//! parsed frames into the room's command queue, and keeps a dedicated writer
//! task so outbound traffic flows while we await inbound frames.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dto::validation::validate_room_slug,
    dto::ws::WireMessage,
    services::room_actor::RoomCommand,
    state::{RoomHandle, SharedState},
};

/// Handle the full lifecycle of one participant WebSocket connection.
pub async fn handle_socket(state: SharedState, socket: WebSocket, slug: String) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task keeps outbound messages flowing even while we
    // await inbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    if let Err(err) = validate_room_slug(&slug) {
        warn!(%slug, error = %err, "rejecting socket for invalid room slug");
        let _ = outbound_tx.send(Message::Close(None));
        finalize(writer_task, outbound_tx).await;
        return;
    }

    // The first frame must arrive within the handshake window; a client that
    // upgrades and then says nothing does not get to hold a slot open.
    let handshake = state.config().handshake_timeout();
    let first = match tokio::time::timeout(handshake, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) => {
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Ok(_))) => {
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Err(err))) => {
            warn!(%slug, error = %err, "websocket receive error");
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(None) | Err(_) => {
            warn!(%slug, "websocket handshake timed out");
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let session_id = Uuid::new_v4();
    let room = state.room_or_open(&slug);
    room.send(RoomCommand::Attach {
        session_id,
        outbound: outbound_tx.clone(),
    });
    state.session_opened();
    info!(%slug, %session_id, "session connected");

    dispatch_text(&room, session_id, &first);

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => dispatch_text(&room, session_id, &text),
            Ok(Message::Ping(payload)) => {
                let _ = outbound_tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(_)) => {
                debug!(%slug, %session_id, "client closed");
                break;
            }
            Ok(Message::Binary(_)) => {}
            Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(%slug, %session_id, error = %err, "websocket error");
                break;
            }
        }
    }

    // The participant entry is retained; the room actor times it out or an
    // explicit leave removes it.
    room.send(RoomCommand::Detach { session_id });
    state.session_closed();
    info!(%slug, %session_id, "session disconnected");

    finalize(writer_task, outbound_tx).await;
}

/// Parse one text frame and hand it to the room actor. A malformed frame is
/// dropped and logged; it never disconnects the session.
fn dispatch_text(room: &RoomHandle, session_id: Uuid, text: &str) {
    match WireMessage::from_json_str(text) {
        Ok(message) => {
            room.send(RoomCommand::Frame {
                session_id,
                message,
            });
        }
        Err(err) => {
            warn!(%session_id, error = %err, "dropping malformed frame");
        }
    }
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}
