//! WebSocket handler — per-connection session and event router.
//!
//! DESIGN
//! ======
//! On upgrade, generates a connection id and enters a `select!` loop:
//! - Incoming client events → parse + route through the dispatch table
//! - Broadcast events from room peers → forward to the client
//!
//! `route_event` is the dispatch table: each inbound event maps to
//! {validation, persistence requirement, fan-out target set}, returned as
//! `Dispatch` values. The apply layer owns all outbound concerns, so routing
//! is testable without a live transport.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → session loop with `current_room = None`
//! 2. Client events → route → apply dispatches (reply / broadcast)
//! 3. Close or transport error → same cleanup as an explicit leave-room
//!
//! Events that name no joined room are dropped silently — a benign race
//! around reconnects, not an error. Fan-out is always resolved against the
//! sender's current room, so cross-room leakage is impossible.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{
    ClientEvent, DrawingOp, ERR_BAD_PAYLOAD, RemoteSegment, RemoteStroke, RoomId, ServerEvent,
    WireError,
};
use crate::services::{cursor, drawing, room};
use crate::state::AppState;

// =============================================================================
// DISPATCH
// =============================================================================

/// One outbound delivery decided by the router. The apply layer sends;
/// handlers never touch a socket.
#[derive(Debug)]
enum Dispatch {
    /// Deliver to the originating connection only.
    ToSender(ServerEvent),
    /// Broadcast to every member of a room, sender included if a member.
    ToRoom(RoomId, ServerEvent),
    /// Broadcast to a room's members excluding one connection.
    ToRoomExcept(RoomId, Uuid, ServerEvent),
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();

    // Per-connection channel for receiving broadcast events from peers.
    let (client_tx, mut client_rx) = mpsc::channel::<ServerEvent>(256);

    info!(%connection_id, "ws: client connected");

    // At most one room per connection, owned by this session task.
    let mut current_room: Option<RoomId> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies =
                            process_text(&state, &mut current_room, connection_id, &client_tx, &text).await;
                        for event in replies {
                            let _ = send_event(&mut socket, &event).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(event) = client_rx.recv() => {
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    // Transport loss runs the same cleanup as an explicit leave-room, before
    // any further event for the room can be dispatched.
    disconnect(&state, current_room.take(), connection_id).await;
    info!(%connection_id, "ws: client disconnected");
}

/// Remove a closing connection from its room and notify the remaining
/// members (count update + cursor removal).
async fn disconnect(state: &AppState, current_room: Option<RoomId>, connection_id: Uuid) {
    let Some(room_id) = current_room else {
        return;
    };
    let Some(departed) = room::leave_room(state, &room_id, connection_id).await else {
        return;
    };
    notify_departure(state, &departed, connection_id).await;
}

async fn notify_departure(state: &AppState, departed: &room::DepartedRoom, connection_id: Uuid) {
    room::broadcast(state, &departed.room_id, &ServerEvent::UserCount(departed.remaining), None).await;
    room::broadcast(
        state,
        &departed.room_id,
        &ServerEvent::CursorLeave { user_id: connection_id },
        None,
    )
    .await;
}

// =============================================================================
// EVENT PROCESSING
// =============================================================================

/// Parse and process one inbound text message and return events for the
/// sender. Split from the socket pump so tests can exercise routing and
/// fan-out end-to-end without a live transport.
async fn process_text(
    state: &AppState,
    current_room: &mut Option<RoomId>,
    connection_id: Uuid,
    client_tx: &mpsc::Sender<ServerEvent>,
    text: &str,
) -> Vec<ServerEvent> {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(%connection_id, error = %e, "ws: malformed inbound event");
            return vec![ServerEvent::Error(WireError {
                code: ERR_BAD_PAYLOAD.to_owned(),
                message: format!("invalid event: {e}"),
            })];
        }
    };

    if !matches!(event, ClientEvent::CursorMove(_)) {
        info!(%connection_id, event = event.name(), "ws: recv event");
    }

    let dispatches = route_event(state, current_room, connection_id, client_tx, event).await;
    apply_dispatches(state, dispatches).await
}

/// The dispatch table. Maps each inbound event to its validation,
/// persistence requirement, and fan-out target set.
async fn route_event(
    state: &AppState,
    current_room: &mut Option<RoomId>,
    connection_id: Uuid,
    client_tx: &mpsc::Sender<ServerEvent>,
    event: ClientEvent,
) -> Vec<Dispatch> {
    match event {
        ClientEvent::JoinRoom { room_id } => {
            let room_id = match RoomId::parse(&room_id) {
                Ok(room_id) => room_id,
                Err(e) => return vec![Dispatch::ToSender(ServerEvent::error_from(&e))],
            };

            let outcome =
                room::join_room(state, &room_id, current_room.as_ref(), connection_id, client_tx.clone())
                    .await;
            *current_room = Some(room_id.clone());

            let mut dispatches = Vec::new();
            // Re-joining the current room needs no departure notices.
            if let Some(previous) = outcome.previous.filter(|p| p.room_id != room_id) {
                dispatches.push(Dispatch::ToRoom(
                    previous.room_id.clone(),
                    ServerEvent::UserCount(previous.remaining),
                ));
                dispatches.push(Dispatch::ToRoom(
                    previous.room_id,
                    ServerEvent::CursorLeave { user_id: connection_id },
                ));
            }
            dispatches.push(Dispatch::ToSender(ServerEvent::InitDrawing(outcome.log)));
            let count = room::member_count(state, &room_id).await;
            dispatches.push(Dispatch::ToRoom(room_id, ServerEvent::UserCount(count)));
            dispatches
        }
        ClientEvent::LeaveRoom => {
            let Some(room_id) = current_room.take() else {
                return dropped(connection_id, "leave-room");
            };
            let Some(departed) = room::leave_room(state, &room_id, connection_id).await else {
                return Vec::new();
            };
            vec![
                Dispatch::ToRoom(departed.room_id.clone(), ServerEvent::UserCount(departed.remaining)),
                Dispatch::ToRoom(departed.room_id, ServerEvent::CursorLeave { user_id: connection_id }),
            ]
        }
        ClientEvent::DrawStart(segment) => {
            let Some(room_id) = current_room.as_ref() else {
                return dropped(connection_id, "draw-start");
            };
            vec![Dispatch::ToRoomExcept(
                room_id.clone(),
                connection_id,
                ServerEvent::DrawStart(RemoteSegment::new(connection_id, segment)),
            )]
        }
        ClientEvent::DrawMove(segment) => {
            let Some(room_id) = current_room.as_ref() else {
                return dropped(connection_id, "draw-move");
            };
            vec![Dispatch::ToRoomExcept(
                room_id.clone(),
                connection_id,
                ServerEvent::DrawMove(RemoteSegment::new(connection_id, segment)),
            )]
        }
        ClientEvent::DrawEnd(payload) => {
            let Some(room_id) = current_room.as_ref() else {
                return dropped(connection_id, "draw-end");
            };
            // Only the finalized stroke is durable; in-progress moves are
            // relayed live but never logged.
            if let Some(stroke) = payload.to_stroke() {
                drawing::append(state, room_id, DrawingOp::Stroke(stroke)).await;
            }
            vec![Dispatch::ToRoom(
                room_id.clone(),
                ServerEvent::DrawEnd(RemoteStroke::new(connection_id, payload)),
            )]
        }
        ClientEvent::ClearCanvas => {
            let Some(room_id) = current_room.as_ref() else {
                return dropped(connection_id, "clear-canvas");
            };
            drawing::append(state, room_id, DrawingOp::Clear {}).await;
            vec![Dispatch::ToRoom(room_id.clone(), ServerEvent::ClearCanvas)]
        }
        ClientEvent::CursorMove(position) => {
            let Some(room_id) = current_room.as_ref() else {
                return dropped(connection_id, "cursor-move");
            };
            let Some(remote) = cursor::update(state, room_id, connection_id, &position).await else {
                return Vec::new();
            };
            vec![Dispatch::ToRoomExcept(
                room_id.clone(),
                connection_id,
                ServerEvent::CursorMove(remote),
            )]
        }
    }
}

/// Benign race around reconnect: events without a joined room are dropped,
/// never surfaced as errors and never logged to any room.
fn dropped(connection_id: Uuid, event: &'static str) -> Vec<Dispatch> {
    debug!(%connection_id, event, "ws: event without a joined room dropped");
    Vec::new()
}

/// Apply routing decisions: broadcasts go out through the registry, events
/// for the sender are returned to the session loop.
async fn apply_dispatches(state: &AppState, dispatches: Vec<Dispatch>) -> Vec<ServerEvent> {
    let mut sender_events = Vec::new();
    for dispatch in dispatches {
        match dispatch {
            Dispatch::ToSender(event) => sender_events.push(event),
            Dispatch::ToRoom(room_id, event) => {
                room::broadcast(state, &room_id, &event, None).await;
            }
            Dispatch::ToRoomExcept(room_id, except, event) => {
                room::broadcast(state, &room_id, &event, Some(except)).await;
            }
        }
    }
    sender_events
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize event");
            return Err(());
        }
    };
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
