//! Room HTTP API — join-or-create, lookup, and code generation.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::event::RoomId;
use crate::services::drawing::{self, DrawingError, RoomRecord};
use crate::state::AppState;

/// Attempts at finding an unclaimed generated code before giving up.
const MAX_CODE_ATTEMPTS: usize = 8;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomBody {
    pub room_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCodeResponse {
    pub room_id: String,
}

/// `POST /api/rooms/join` — join or create a room by code.
pub async fn join_room(
    State(state): State<AppState>,
    Json(body): Json<JoinRoomBody>,
) -> Result<Json<RoomCodeResponse>, StatusCode> {
    let Ok(room_id) = RoomId::parse(&body.room_id) else {
        return Err(StatusCode::BAD_REQUEST);
    };

    drawing::get_or_create(&state.pool, &room_id)
        .await
        .map_err(drawing_error_to_status)?;

    Ok(Json(RoomCodeResponse { room_id: room_id.as_str().to_owned() }))
}

/// `POST /api/rooms/new` — create a room under a fresh generated code.
pub async fn create_room(State(state): State<AppState>) -> Result<Json<RoomCodeResponse>, StatusCode> {
    for _ in 0..MAX_CODE_ATTEMPTS {
        let room_id = RoomId::generate();
        let claimed = drawing::create_if_absent(&state.pool, &room_id)
            .await
            .map_err(drawing_error_to_status)?;
        if claimed {
            return Ok(Json(RoomCodeResponse { room_id: room_id.as_str().to_owned() }));
        }
    }
    // Only reachable if the code space is effectively saturated.
    Err(StatusCode::INTERNAL_SERVER_ERROR)
}

/// `GET /api/rooms/:room_id` — fetch the room record with its drawing log.
pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomRecord>, StatusCode> {
    let Ok(room_id) = RoomId::parse(&room_id) else {
        return Err(StatusCode::BAD_REQUEST);
    };

    let record = drawing::fetch_room(&state.pool, &room_id)
        .await
        .map_err(drawing_error_to_status)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(record))
}

pub(crate) fn drawing_error_to_status(err: DrawingError) -> StatusCode {
    error!(error = %err, "room api backend failure");
    StatusCode::INTERNAL_SERVER_ERROR
}

#[cfg(test)]
#[path = "rooms_test.rs"]
mod tests;
