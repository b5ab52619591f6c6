//! Drawing log store — append-only per-room command log.
//!
//! DESIGN
//! ======
//! The in-memory log inside `RoomState` is authoritative for live replay;
//! `append` stamps the server timestamp and pushes under the write lock, so
//! log order is the causal order observers see. Postgres holds the durable
//! prefix: `flush_commands` writes an unflushed tail in one transaction and
//! `replay` rebuilds the log when a room is hydrated.
//!
//! ERROR HANDLING
//! ==============
//! Nothing on the live path waits on Postgres. Flush failures leave the
//! unflushed tail in memory for retry; replay failures at join time degrade
//! to an empty history. Durability degrades, collaboration does not.

use std::time::Duration;

use sqlx::PgPool;

use crate::event::{DrawingCommand, DrawingOp, RoomId, Stroke, now_ms};
use crate::state::{AppState, RoomState};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DrawingError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("persistence timed out after {0:?}")]
    Timeout(Duration),
}

/// Full persisted room record, as served by the HTTP room API.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub room_id: String,
    pub drawing_data: Vec<DrawingCommand>,
    pub last_activity: i64,
}

// =============================================================================
// APPEND
// =============================================================================

/// Stamp an op with the server time and append it to the room's in-memory
/// log. Returns the stamped command. Never touches Postgres; the tail is
/// flushed by the persistence task.
pub async fn append(state: &AppState, room_id: &RoomId, op: DrawingOp) -> DrawingCommand {
    let command = DrawingCommand::stamped(op);
    let mut rooms = state.rooms.write().await;
    let room = rooms.entry(room_id.clone()).or_insert_with(RoomState::new);
    room.log.push(command.clone());
    command
}

// =============================================================================
// LAZY CREATION
// =============================================================================

/// Idempotent lazy room creation. A fresh row gets `created_at`; an existing
/// row only has its `last_activity` bumped.
///
/// # Errors
///
/// Returns a database error if the upsert fails.
pub async fn get_or_create(pool: &PgPool, room_id: &RoomId) -> Result<(), DrawingError> {
    let now = now_ms();
    sqlx::query(
        "INSERT INTO rooms (room_id, created_at, last_activity)
         VALUES ($1, $2, $2)
         ON CONFLICT (room_id) DO UPDATE SET last_activity = EXCLUDED.last_activity",
    )
    .bind(room_id.as_str())
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Create a room only if the code is unclaimed. Returns false on collision.
///
/// # Errors
///
/// Returns a database error if the insert fails.
pub async fn create_if_absent(pool: &PgPool, room_id: &RoomId) -> Result<bool, DrawingError> {
    let now = now_ms();
    let result = sqlx::query(
        "INSERT INTO rooms (room_id, created_at, last_activity)
         VALUES ($1, $2, $2)
         ON CONFLICT (room_id) DO NOTHING",
    )
    .bind(room_id.as_str())
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

// =============================================================================
// REPLAY
// =============================================================================

/// Ordered replay of a room's persisted log. Empty for a room with no
/// history — lazily-created rooms are never "not found".
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn replay(pool: &PgPool, room_id: &RoomId) -> Result<Vec<DrawingCommand>, DrawingError> {
    let rows = sqlx::query_as::<_, (String, serde_json::Value, i64)>(
        "SELECT kind, data, ts FROM drawing_commands WHERE room_id = $1 ORDER BY id ASC",
    )
    .bind(room_id.as_str())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(kind, data, ts)| command_from_row(&kind, data, ts))
        .collect())
}

/// Fetch the full room record for the HTTP API, or `None` if the room was
/// never created.
///
/// # Errors
///
/// Returns a database error if either query fails.
pub async fn fetch_room(pool: &PgPool, room_id: &RoomId) -> Result<Option<RoomRecord>, DrawingError> {
    let row = sqlx::query_as::<_, (String, i64)>(
        "SELECT room_id, last_activity FROM rooms WHERE room_id = $1",
    )
    .bind(room_id.as_str())
    .fetch_optional(pool)
    .await?;

    let Some((room_id_raw, last_activity)) = row else {
        return Ok(None);
    };

    let drawing_data = replay(pool, room_id).await?;
    Ok(Some(RoomRecord { room_id: room_id_raw, drawing_data, last_activity }))
}

/// Rebuild one command from its persisted row. Unknown kinds and undecodable
/// data are skipped so a bad row cannot poison a whole replay.
fn command_from_row(kind: &str, data: serde_json::Value, ts: i64) -> Option<DrawingCommand> {
    let op = match kind {
        "stroke" => {
            let stroke: Stroke = serde_json::from_value(data).ok()?;
            DrawingOp::Stroke(stroke)
        }
        "clear" => DrawingOp::Clear {},
        _ => return None,
    };
    Some(DrawingCommand { op, timestamp: ts })
}

// =============================================================================
// FLUSH
// =============================================================================

/// Write a batch of commands for one room in a single transaction, bounded
/// by `timeout`. Also upserts the room row (lazy creation may have failed at
/// join time) and bumps `last_activity`.
///
/// # Errors
///
/// Returns `Timeout` when the write exceeds the bound, or the underlying
/// database error.
pub async fn flush_commands(
    pool: &PgPool,
    room_id: &RoomId,
    commands: &[DrawingCommand],
    timeout: Duration,
) -> Result<(), DrawingError> {
    if commands.is_empty() {
        return Ok(());
    }
    match tokio::time::timeout(timeout, write_commands(pool, room_id, commands)).await {
        Ok(result) => result.map_err(DrawingError::from),
        Err(_) => Err(DrawingError::Timeout(timeout)),
    }
}

async fn write_commands(
    pool: &PgPool,
    room_id: &RoomId,
    commands: &[DrawingCommand],
) -> Result<(), sqlx::Error> {
    let last_ts = commands.last().map_or_else(now_ms, |c| c.timestamp);

    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO rooms (room_id, created_at, last_activity)
         VALUES ($1, $2, $2)
         ON CONFLICT (room_id) DO NOTHING",
    )
    .bind(room_id.as_str())
    .bind(last_ts)
    .execute(tx.as_mut())
    .await?;

    for command in commands {
        sqlx::query("INSERT INTO drawing_commands (room_id, kind, data, ts) VALUES ($1, $2, $3, $4)")
            .bind(room_id.as_str())
            .bind(command.op.kind())
            .bind(command.op.data_value())
            .bind(command.timestamp)
            .execute(tx.as_mut())
            .await?;
    }

    sqlx::query("UPDATE rooms SET last_activity = $2 WHERE room_id = $1")
        .bind(room_id.as_str())
        .bind(last_ts)
        .execute(tx.as_mut())
        .await?;

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
#[path = "drawing_test.rs"]
mod tests;
