use std::sync::Arc;

use parlor_core::events::{ClientEvent, ProtocolRejection, ServerEvent};
use parlor_core::ids::ConnectionId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::coordinator::RoomCoordinator;
use crate::error::ServerError;

/// Everything the transport feeds to the room, in arrival order.
#[derive(Debug)]
pub enum Inbound {
    Connected(ConnectionId),
    Frame(ConnectionId, String),
    Disconnected(ConnectionId),
}

/// Parse one text frame into a client event.
pub fn decode(raw: &str) -> Result<ClientEvent, ServerError> {
    serde_json::from_str(raw).map_err(|e| ServerError::Protocol(e.to_string()))
}

/// Route one inbound item to the coordinator.
pub fn dispatch(coordinator: &Arc<RoomCoordinator>, inbound: Inbound) {
    match inbound {
        Inbound::Connected(id) => {
            if !coordinator.connect(&id) {
                coordinator.registry().unregister(&id);
            }
        }
        Inbound::Frame(id, raw) => match decode(&raw) {
            Ok(event) => coordinator.handle(&id, event),
            Err(err) => {
                tracing::warn!(connection_id = %id, error = %err, "dropping malformed frame");
                coordinator
                    .metrics()
                    .counter_inc("room.rejections", &[("kind", "malformed_frame")], 1);
                coordinator.reply(
                    &id,
                    ServerEvent::ProtocolError(ProtocolRejection {
                        reason: err.to_string(),
                    }),
                );
            }
        },
        Inbound::Disconnected(id) => coordinator.disconnect(&id),
    }
}

/// Single consumer of the inbound channel. Processing one item at a time
/// gives every connection the same global event order.
pub async fn process_inbound(
    mut rx: mpsc::Receiver<Inbound>,
    coordinator: Arc<RoomCoordinator>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(inbound) => dispatch(&coordinator, inbound),
                None => break,
            },
            () = cancel.cancelled() => break,
        }
    }
    tracing::debug!("inbound processor stopped");
}
