//! Cursor service — ephemeral pointer state with idle expiry.
//!
//! DESIGN
//! ======
//! Cursor positions live in a room-scoped map inside `RoomState`, never in
//! the drawing log and never in Postgres. Every update resets the entry's
//! idle timer; a background sweeper expires entries idle longer than the TTL
//! and tells the rest of the room to drop the stale cursor. This is the only
//! time-driven transition in the system — everything else is event-driven.
//! Explicit leave/disconnect removes entries immediately via the registry's
//! detach path.

use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;
use uuid::Uuid;

use crate::event::{CursorPosition, RemoteCursor, RoomId, ServerEvent};
use crate::services::persistence::env_parse;
use crate::services::room;
use crate::state::{AppState, CursorEntry};

const DEFAULT_CURSOR_TTL_MS: u64 = 3000;
const DEFAULT_CURSOR_SWEEP_INTERVAL_MS: u64 = 500;

/// Idle duration after which a cursor entry expires.
#[must_use]
pub fn cursor_ttl() -> Duration {
    Duration::from_millis(env_parse("CURSOR_TTL_MS", DEFAULT_CURSOR_TTL_MS))
}

// =============================================================================
// UPDATE
// =============================================================================

/// Record a connection's cursor position and reset its expiry timer.
/// Returns the relayed view of the stored entry for peer fan-out, or
/// `None` for rooms that are not live (the move is dropped entirely).
pub async fn update(
    state: &AppState,
    room_id: &RoomId,
    connection_id: Uuid,
    position: &CursorPosition,
) -> Option<RemoteCursor> {
    update_at(state, room_id, connection_id, position, Instant::now()).await
}

/// Internal: update with explicit timestamp (for testing).
async fn update_at(
    state: &AppState,
    room_id: &RoomId,
    connection_id: Uuid,
    position: &CursorPosition,
    now: Instant,
) -> Option<RemoteCursor> {
    let mut rooms = state.rooms.write().await;
    let room = rooms.get_mut(room_id)?;

    let entry = CursorEntry { x: position.x, y: position.y, color: position.color.clone(), last_seen: now };
    let remote = RemoteCursor { user_id: connection_id, x: entry.x, y: entry.y, color: entry.color.clone() };
    room.cursors.insert(connection_id, entry);
    Some(remote)
}

// =============================================================================
// EXPIRY
// =============================================================================

/// A cursor entry removed by the sweeper.
#[derive(Debug)]
pub struct ExpiredCursor {
    pub room_id: RoomId,
    pub connection_id: Uuid,
}

/// Expire idle cursor entries across all live rooms and notify each room's
/// remaining members with a `cursor-leave`.
pub async fn sweep_expired(state: &AppState, ttl: Duration) -> Vec<ExpiredCursor> {
    sweep_expired_at(state, ttl, Instant::now()).await
}

/// Internal: sweep with explicit clock (for testing).
async fn sweep_expired_at(state: &AppState, ttl: Duration, now: Instant) -> Vec<ExpiredCursor> {
    let expired = {
        let mut rooms = state.rooms.write().await;
        let mut expired = Vec::new();
        for (room_id, room) in rooms.iter_mut() {
            let stale: Vec<Uuid> = room
                .cursors
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.last_seen) > ttl)
                .map(|(connection_id, _)| *connection_id)
                .collect();
            for connection_id in stale {
                room.cursors.remove(&connection_id);
                expired.push(ExpiredCursor { room_id: room_id.clone(), connection_id });
            }
        }
        expired
    };

    // Notify outside the write lock. The idle connection is still a member;
    // only its cursor disappears, so it is excluded from its own leave.
    for gone in &expired {
        room::broadcast(
            state,
            &gone.room_id,
            &ServerEvent::CursorLeave { user_id: gone.connection_id },
            Some(gone.connection_id),
        )
        .await;
    }

    expired
}

// =============================================================================
// SWEEPER TASK
// =============================================================================

/// Spawn the background cursor sweeper. Returns a handle for shutdown.
pub fn spawn_cursor_sweeper(state: AppState) -> JoinHandle<()> {
    let ttl = cursor_ttl();
    let sweep_ms = env_parse("CURSOR_SWEEP_INTERVAL_MS", DEFAULT_CURSOR_SWEEP_INTERVAL_MS);
    info!(?ttl, sweep_ms, "cursor expiry sweeper configured");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(sweep_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            sweep_expired(&state, ttl).await;
        }
    })
}

#[cfg(test)]
#[path = "cursor_test.rs"]
mod tests;
