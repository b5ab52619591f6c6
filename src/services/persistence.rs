//! Persistence service — background flush of unflushed log tails.
//!
//! DESIGN
//! ======
//! A background task wakes on an interval, snapshots each room's unflushed
//! log tail under the lock, then writes lock-free with retry and a bounded
//! timeout. Watermarks advance only to the snapshot length, so commands
//! appended mid-flush stay dirty until the next cycle. Empty rooms are
//! evicted once fully flushed.
//!
//! ERROR HANDLING
//! ==============
//! Watermarks advance only after successful writes. This prioritizes
//! durability over duplicate flush attempts: a retried batch is acceptable,
//! silent stroke loss is not.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::event::{DrawingCommand, RoomId};
use crate::services::drawing;
use crate::state::AppState;

const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;
const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 5000;
const DEFAULT_FLUSH_RETRIES: usize = 2;
const DEFAULT_FLUSH_RETRY_BASE_MS: u64 = 50;

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Tuning knobs for the flush task, loaded from environment variables.
#[derive(Clone, Copy)]
pub(crate) struct FlushConfig {
    /// Bound on each per-room batch write.
    pub(crate) timeout: Duration,
    /// Total write attempts per batch per cycle.
    pub(crate) retries: usize,
    /// Base delay in milliseconds for linear retry back-off.
    pub(crate) retry_base_ms: u64,
}

impl FlushConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            timeout: Duration::from_millis(env_parse("FLUSH_TIMEOUT_MS", DEFAULT_FLUSH_TIMEOUT_MS)),
            retries: env_parse("FLUSH_RETRIES", DEFAULT_FLUSH_RETRIES),
            retry_base_ms: env_parse("FLUSH_RETRY_BASE_MS", DEFAULT_FLUSH_RETRY_BASE_MS),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self { timeout: Duration::from_millis(250), retries: 1, retry_base_ms: 1 }
    }
}

/// Spawn the background persistence task. Returns a handle for shutdown.
pub fn spawn_persistence_task(state: AppState) -> JoinHandle<()> {
    let interval_ms = env_parse("FLUSH_INTERVAL_MS", DEFAULT_FLUSH_INTERVAL_MS);
    let config = FlushConfig::from_env();
    info!(
        interval_ms,
        timeout_ms = config.timeout.as_millis() as u64,
        retries = config.retries,
        "drawing log flush configured"
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            flush_all_dirty(&state, config).await;
        }
    })
}

#[derive(Debug)]
struct DirtyFlushBatch {
    room_id: RoomId,
    commands: Vec<DrawingCommand>,
    /// Log length at snapshot time; the watermark to ack on success.
    watermark: usize,
}

async fn flush_all_dirty(state: &AppState, config: FlushConfig) {
    // PHASE: SNAPSHOT UNFLUSHED TAILS
    // WHY: collect immutable clones under lock, then perform I/O lock-free.
    let batches = collect_dirty_batches(state).await;

    // PHASE: FLUSH PER ROOM + ACK WATERMARKS
    // WHY: if flush fails we intentionally keep the tail for retry.
    for batch in batches {
        for attempt in 1..=config.retries {
            match drawing::flush_commands(&state.pool, &batch.room_id, &batch.commands, config.timeout).await {
                Ok(()) => {
                    ack_flushed(state, &batch.room_id, batch.watermark).await;
                    break;
                }
                Err(e) if attempt < config.retries => {
                    warn!(
                        error = %e,
                        attempt,
                        total = config.retries,
                        count = batch.commands.len(),
                        room_id = %batch.room_id,
                        "log flush failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(attempt as u64 * config.retry_base_ms)).await;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        count = batch.commands.len(),
                        room_id = %batch.room_id,
                        "log flush failed; tail retained for next cycle"
                    );
                }
            }
        }
    }
}

async fn collect_dirty_batches(state: &AppState) -> Vec<DirtyFlushBatch> {
    let rooms = state.rooms.read().await;
    rooms
        .iter()
        .filter(|(_, room)| room.has_unflushed())
        .map(|(room_id, room)| DirtyFlushBatch {
            room_id: room_id.clone(),
            commands: room.log[room.flushed_len..].to_vec(),
            watermark: room.log.len(),
        })
        .collect()
}

/// Advance a room's flush watermark to the acked snapshot and evict the
/// room if it is now idle and fully durable.
async fn ack_flushed(state: &AppState, room_id: &RoomId, watermark: usize) {
    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(room_id) else {
        return;
    };

    // EDGE: commands appended during the flush stay past the watermark and
    // remain dirty; never move the watermark backwards or past the log.
    room.flushed_len = room.flushed_len.max(watermark.min(room.log.len()));

    if room.clients.is_empty() && !room.has_unflushed() {
        rooms.remove(room_id);
        info!(%room_id, "evicted idle room after final flush");
    }
}

#[cfg(test)]
pub(crate) async fn flush_all_dirty_for_tests(state: &AppState) {
    flush_all_dirty(state, FlushConfig::for_tests()).await;
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
