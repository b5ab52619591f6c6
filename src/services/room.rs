//! Room registry — membership, counts, and broadcast fan-out.
//!
//! DESIGN
//! ======
//! Rooms are created lazily on first join and hydrated from Postgres while
//! no client is connected. Membership is an explicit map from room id to
//! connection senders, queried directly — never inferred from transport
//! internals. A connection belongs to at most one room; joining a new room
//! detaches from the previous one inside the same write-lock critical
//! section, so no observer can see both memberships at once.
//!
//! ERROR HANDLING
//! ==============
//! Join tolerates an unreachable store: the client still joins with an empty
//! history and a warning is logged. Rooms with an unflushed log tail are
//! retained in memory after the last client leaves so the persistence task
//! can retry instead of losing strokes.

use std::collections::HashMap;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::event::{DrawingCommand, RoomId, ServerEvent};
use crate::services::drawing;
use crate::services::persistence::env_parse;
use crate::state::{AppState, RoomState};

const DEFAULT_HYDRATE_TIMEOUT_MS: u64 = 5000;

// =============================================================================
// TYPES
// =============================================================================

/// What a successful join produced.
pub struct JoinOutcome {
    /// Full ordered replay for the joiner's `init-drawing`.
    pub log: Vec<DrawingCommand>,
    /// Set when the connection was implicitly detached from another room.
    pub previous: Option<DepartedRoom>,
}

/// A room the connection just left, with its remaining member count.
pub struct DepartedRoom {
    pub room_id: RoomId,
    pub remaining: usize,
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

/// Join a room, detaching from `prior` first if set. Lazily creates the
/// room row and hydrates the log from Postgres when no client is connected.
/// Returns the replay log and the departed room, if any, for notification.
pub async fn join_room(
    state: &AppState,
    room_id: &RoomId,
    prior: Option<&RoomId>,
    connection_id: Uuid,
    tx: mpsc::Sender<ServerEvent>,
) -> JoinOutcome {
    // Lazy creation and replay happen outside the lock, bounded by a
    // timeout; both are best-effort — an unreachable store must not block
    // collaboration.
    let hydrate_timeout = Duration::from_millis(env_parse("HYDRATE_TIMEOUT_MS", DEFAULT_HYDRATE_TIMEOUT_MS));
    let hydration = match tokio::time::timeout(hydrate_timeout, hydrate(&state.pool, room_id)).await {
        Ok(log) => log,
        Err(_) => {
            warn!(%room_id, "room hydration timed out; joining with empty history");
            None
        }
    };

    let mut rooms = state.rooms.write().await;

    let previous = prior.and_then(|old| detach(&mut rooms, old, connection_id));

    let room = rooms.entry(room_id.clone()).or_insert_with(RoomState::new);

    // Hydrate only while no client holds the room live and nothing is owed
    // to Postgres; a retained unflushed log is already the full history.
    if room.clients.is_empty() && !room.has_unflushed() {
        if let Some(log) = hydration {
            room.flushed_len = log.len();
            room.log = log;
            info!(%room_id, count = room.log.len(), "hydrated room log from database");
        }
    }

    room.clients.insert(connection_id, tx);
    let log = room.log.clone();

    info!(%room_id, %connection_id, members = room.clients.len(), "client joined room");
    JoinOutcome { log, previous }
}

/// Lazily create the room row and fetch its persisted log.
async fn hydrate(pool: &PgPool, room_id: &RoomId) -> Option<Vec<DrawingCommand>> {
    if let Err(e) = drawing::get_or_create(pool, room_id).await {
        warn!(%room_id, error = %e, "lazy room creation failed; continuing");
    }
    match drawing::replay(pool, room_id).await {
        Ok(log) => Some(log),
        Err(e) => {
            warn!(%room_id, error = %e, "log replay failed; joining with empty history");
            None
        }
    }
}

/// Leave a room explicitly. Returns the departed room info for notification,
/// or `None` when the connection was not a member.
pub async fn leave_room(state: &AppState, room_id: &RoomId, connection_id: Uuid) -> Option<DepartedRoom> {
    let mut rooms = state.rooms.write().await;
    let departed = detach(&mut rooms, room_id, connection_id);
    if let Some(room) = &departed {
        info!(room_id = %room.room_id, %connection_id, remaining = room.remaining, "client left room");
    }
    departed
}

/// Remove a connection (and its cursor) from a room. Clean empty rooms are
/// evicted immediately; rooms with an unflushed tail are retained for the
/// persistence task, which evicts them once the tail lands.
fn detach(
    rooms: &mut HashMap<RoomId, RoomState>,
    room_id: &RoomId,
    connection_id: Uuid,
) -> Option<DepartedRoom> {
    let room = rooms.get_mut(room_id)?;

    let was_member = room.clients.remove(&connection_id).is_some();
    room.cursors.remove(&connection_id);

    let remaining = room.clients.len();
    let evict = remaining == 0 && !room.has_unflushed();
    if evict {
        rooms.remove(room_id);
        info!(%room_id, "evicted room from memory");
    }

    was_member.then(|| DepartedRoom { room_id: room_id.clone(), remaining })
}

// =============================================================================
// COUNTS
// =============================================================================

/// Number of currently-joined connections. Zero for rooms not live.
pub async fn member_count(state: &AppState, room_id: &RoomId) -> usize {
    let rooms = state.rooms.read().await;
    rooms.get(room_id).map_or(0, |room| room.clients.len())
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Broadcast an event to all clients in a room, optionally excluding one.
pub async fn broadcast(state: &AppState, room_id: &RoomId, event: &ServerEvent, exclude: Option<Uuid>) {
    let rooms = state.rooms.read().await;
    let Some(room) = rooms.get(room_id) else {
        return;
    };

    for (connection_id, tx) in &room.clients {
        if exclude == Some(*connection_id) {
            continue;
        }
        // Best-effort: if a client's channel is full, skip it.
        let _ = tx.try_send(event.clone());
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
