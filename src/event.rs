//! Event — the wire protocol for `SketchRoom`.
//!
//! ARCHITECTURE
//! ============
//! Every WebSocket message is a JSON envelope `{"event": <name>, "data":
//! <payload>}`. Clients send `ClientEvent`s, the session task routes them
//! through the dispatch table in `routes::ws`, and `ServerEvent`s flow back
//! out to the chosen set of connections.
//!
//! DESIGN
//! ======
//! - Inbound and outbound events are distinct enums: the server never relays
//!   a client payload without first re-typing it (sender id injection).
//! - `DrawingCommand` is the append-only log entry; its wire shape
//!   `{type, data, timestamp}` is also the persisted row shape.
//! - Room codes are validated at the boundary; a `RoomId` in hand is always
//!   well-formed.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Wire error code for malformed inbound events.
pub const ERR_BAD_PAYLOAD: &str = "E_BAD_PAYLOAD";

/// Stroke color applied when a finalized stroke omits one.
const DEFAULT_STROKE_COLOR: &str = "#000000";

/// Stroke width applied when a finalized stroke omits one.
const DEFAULT_STROKE_WIDTH: f64 = 2.0;

const ROOM_CODE_MIN_LEN: usize = 6;
const ROOM_CODE_MAX_LEN: usize = 8;

/// Length of server-generated room codes.
const GENERATED_CODE_LEN: usize = 6;

/// Alphabet for generated codes. Excludes easily-confused characters; every
/// entry satisfies the room-code grammar.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghjkmnpqrstuvwxyz23456789";

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code for structured `error` events.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;
}

// =============================================================================
// ROOM ID
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("room code must be 6-8 alphanumeric characters")]
pub struct RoomIdError;

impl ErrorCode for RoomIdError {
    fn error_code(&self) -> &'static str {
        "E_INVALID_ROOM"
    }
}

/// Validated room code: 6-8 ASCII alphanumeric characters, case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Validate a raw room code.
    ///
    /// # Errors
    ///
    /// Returns `RoomIdError` when the code is not 6-8 ASCII alphanumeric
    /// characters.
    pub fn parse(code: &str) -> Result<Self, RoomIdError> {
        let len_ok = (ROOM_CODE_MIN_LEN..=ROOM_CODE_MAX_LEN).contains(&code.len());
        if !len_ok || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(RoomIdError);
        }
        Ok(Self(code.to_owned()))
    }

    /// Generate a fresh random room code. Always well-formed.
    #[must_use]
    pub fn generate() -> Self {
        use rand::Rng;

        let mut rng = rand::rng();
        let code: String = (0..GENERATED_CODE_LEN)
            .map(|_| {
                let idx = rng.random_range(0..CODE_ALPHABET.len());
                CODE_ALPHABET[idx] as char
            })
            .collect();
        Self(code)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomId {
    type Error = RoomIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

// =============================================================================
// DRAWING COMMANDS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// One finished drawing gesture: pointer-down to pointer-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub color: String,
    pub width: f64,
    pub points: Vec<Point>,
}

/// Payload of a drawing log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum DrawingOp {
    Stroke(Stroke),
    Clear {},
}

impl DrawingOp {
    /// Persisted `kind` column value.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stroke(_) => "stroke",
            Self::Clear {} => "clear",
        }
    }

    /// Persisted `data` column value.
    #[must_use]
    pub fn data_value(&self) -> serde_json::Value {
        match self {
            Self::Stroke(stroke) => serde_json::to_value(stroke).unwrap_or_default(),
            Self::Clear {} => serde_json::json!({}),
        }
    }
}

/// Append-only log entry. Immutable once appended; replaying a room's
/// entries in order from a blank canvas reproduces the shared state.
/// `timestamp` is server-assigned at append time (epoch ms).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawingCommand {
    #[serde(flatten)]
    pub op: DrawingOp,
    pub timestamp: i64,
}

impl DrawingCommand {
    /// Stamp an op with the current server time.
    #[must_use]
    pub fn stamped(op: DrawingOp) -> Self {
        Self { op, timestamp: now_ms() }
    }
}

// =============================================================================
// INBOUND EVENTS
// =============================================================================

/// One live point of an in-progress stroke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawSegment {
    pub x: f64,
    pub y: f64,
    pub color: String,
    pub width: f64,
}

/// Finalized stroke payload. Clients may send an empty object when the
/// gesture produced too few points to keep.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DrawEndPayload {
    pub color: Option<String>,
    pub width: Option<f64>,
    pub points: Vec<Point>,
}

impl DrawEndPayload {
    /// A stroke worth persisting, or `None` when the point sequence is too
    /// short to be a stroke.
    #[must_use]
    pub fn to_stroke(&self) -> Option<Stroke> {
        if self.points.len() < 2 {
            return None;
        }
        Some(Stroke {
            color: self
                .color
                .clone()
                .unwrap_or_else(|| DEFAULT_STROKE_COLOR.to_owned()),
            width: self.width.unwrap_or(DEFAULT_STROKE_WIDTH),
            points: self.points.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
    pub color: String,
}

/// Everything a client may send. The `roomId` in `join-room` is carried raw
/// so a bad code surfaces as a validation error, not a parse failure.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    LeaveRoom,
    DrawStart(DrawSegment),
    DrawMove(DrawSegment),
    DrawEnd(DrawEndPayload),
    ClearCanvas,
    CursorMove(CursorPosition),
}

impl ClientEvent {
    /// Wire name, for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom => "leave-room",
            Self::DrawStart(_) => "draw-start",
            Self::DrawMove(_) => "draw-move",
            Self::DrawEnd(_) => "draw-end",
            Self::ClearCanvas => "clear-canvas",
            Self::CursorMove(_) => "cursor-move",
        }
    }
}

// =============================================================================
// OUTBOUND EVENTS
// =============================================================================

/// A relayed in-progress stroke point, stamped with its originator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSegment {
    pub user_id: Uuid,
    pub x: f64,
    pub y: f64,
    pub color: String,
    pub width: f64,
}

impl RemoteSegment {
    #[must_use]
    pub fn new(user_id: Uuid, segment: DrawSegment) -> Self {
        Self { user_id, x: segment.x, y: segment.y, color: segment.color, width: segment.width }
    }
}

/// A relayed finalized stroke. Carries the full point sequence so receivers
/// can render the complete stroke even if intermediate moves were lost.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStroke {
    pub user_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    pub points: Vec<Point>,
}

impl RemoteStroke {
    #[must_use]
    pub fn new(user_id: Uuid, payload: DrawEndPayload) -> Self {
        Self { user_id, color: payload.color, width: payload.width, points: payload.points }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCursor {
    pub user_id: Uuid,
    pub x: f64,
    pub y: f64,
    pub color: String,
}

/// Structured error reported to the originating connection only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

/// Everything the server may send.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Full ordered replay of the room's drawing log, sent to a joiner.
    /// Receivers must clear their local canvas and apply the sequence from
    /// scratch.
    InitDrawing(Vec<DrawingCommand>),
    /// Current number of connections in the room.
    UserCount(usize),
    DrawStart(RemoteSegment),
    DrawMove(RemoteSegment),
    DrawEnd(RemoteStroke),
    ClearCanvas,
    CursorMove(RemoteCursor),
    CursorLeave {
        #[serde(rename = "userId")]
        user_id: Uuid,
    },
    Error(WireError),
}

impl ServerEvent {
    /// Build a structured error event from a typed error.
    #[must_use]
    pub fn error_from(err: &(impl ErrorCode + ?Sized)) -> Self {
        Self::Error(WireError { code: err.error_code().to_owned(), message: err.to_string() })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_accepts_6_to_8_alphanumerics() {
        assert!(RoomId::parse("abc123").is_ok());
        assert!(RoomId::parse("ABCD1234").is_ok());
        assert!(RoomId::parse("a1B2c3D").is_ok());
    }

    #[test]
    fn room_id_rejects_bad_codes() {
        assert_eq!(RoomId::parse(""), Err(RoomIdError));
        assert_eq!(RoomId::parse("abc12"), Err(RoomIdError));
        assert_eq!(RoomId::parse("abc123456"), Err(RoomIdError));
        assert_eq!(RoomId::parse("abc 12"), Err(RoomIdError));
        assert_eq!(RoomId::parse("abc-123"), Err(RoomIdError));
        assert_eq!(RoomId::parse("abc12é"), Err(RoomIdError));
    }

    #[test]
    fn room_id_is_case_sensitive() {
        let lower = RoomId::parse("abc123").unwrap();
        let upper = RoomId::parse("ABC123").unwrap();
        assert_ne!(lower, upper);
    }

    #[test]
    fn generated_codes_are_well_formed() {
        for _ in 0..32 {
            let code = RoomId::generate();
            assert!(RoomId::parse(code.as_str()).is_ok());
            assert_eq!(code.as_str().len(), GENERATED_CODE_LEN);
        }
    }

    #[test]
    fn room_id_deserializes_with_validation() {
        let ok: Result<RoomId, _> = serde_json::from_str(r#""room42""#);
        assert_eq!(ok.unwrap().as_str(), "room42");

        let bad: Result<RoomId, _> = serde_json::from_str(r#""no!""#);
        assert!(bad.is_err());
    }

    #[test]
    fn client_event_names_round_trip() {
        let cases = [
            (r#"{"event":"join-room","data":{"roomId":"room42"}}"#, "join-room"),
            (r#"{"event":"leave-room"}"#, "leave-room"),
            (
                r##"{"event":"draw-start","data":{"x":1.0,"y":2.0,"color":"#fff","width":3.0}}"##,
                "draw-start",
            ),
            (
                r##"{"event":"draw-move","data":{"x":1.0,"y":2.0,"color":"#fff","width":3.0}}"##,
                "draw-move",
            ),
            (r#"{"event":"draw-end","data":{}}"#, "draw-end"),
            (r#"{"event":"clear-canvas"}"#, "clear-canvas"),
            (
                r##"{"event":"cursor-move","data":{"x":4.0,"y":5.0,"color":"#abc"}}"##,
                "cursor-move",
            ),
        ];
        for (json, name) in cases {
            let event: ClientEvent = serde_json::from_str(json).expect(name);
            assert_eq!(event.name(), name);
        }
    }

    #[test]
    fn draw_end_payload_tolerates_empty_object() {
        let payload: DrawEndPayload = serde_json::from_str("{}").unwrap();
        assert!(payload.points.is_empty());
        assert!(payload.to_stroke().is_none());
    }

    #[test]
    fn draw_end_requires_two_points_for_a_stroke() {
        let one = DrawEndPayload {
            color: Some("#123456".into()),
            width: Some(4.0),
            points: vec![Point { x: 0.0, y: 0.0 }],
        };
        assert!(one.to_stroke().is_none());

        let two = DrawEndPayload { points: vec![Point { x: 0.0, y: 0.0 }, Point { x: 1.0, y: 1.0 }], ..one };
        let stroke = two.to_stroke().expect("two points make a stroke");
        assert_eq!(stroke.points.len(), 2);
        assert_eq!(stroke.color, "#123456");
    }

    #[test]
    fn drawing_command_wire_shape() {
        let command = DrawingCommand {
            op: DrawingOp::Stroke(Stroke {
                color: "#ff0000".into(),
                width: 2.0,
                points: vec![Point { x: 0.0, y: 0.0 }, Point { x: 3.0, y: 4.0 }],
            }),
            timestamp: 1234,
        };

        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["type"], "stroke");
        assert_eq!(json["data"]["color"], "#ff0000");
        assert_eq!(json["data"]["points"][1]["y"], 4.0);
        assert_eq!(json["timestamp"], 1234);

        let restored: DrawingCommand = serde_json::from_value(json).unwrap();
        assert_eq!(restored, command);
    }

    #[test]
    fn clear_command_has_empty_data() {
        let command = DrawingCommand { op: DrawingOp::Clear {}, timestamp: 99 };
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["type"], "clear");
        assert_eq!(json["data"], serde_json::json!({}));

        let restored: DrawingCommand = serde_json::from_value(json).unwrap();
        assert_eq!(restored.op.kind(), "clear");
    }

    #[test]
    fn server_event_envelopes() {
        let count = serde_json::to_value(ServerEvent::UserCount(3)).unwrap();
        assert_eq!(count["event"], "user-count");
        assert_eq!(count["data"], 3);

        let init = serde_json::to_value(ServerEvent::InitDrawing(Vec::new())).unwrap();
        assert_eq!(init["event"], "init-drawing");
        assert_eq!(init["data"], serde_json::json!([]));

        let clear = serde_json::to_value(ServerEvent::ClearCanvas).unwrap();
        assert_eq!(clear["event"], "clear-canvas");
    }

    #[test]
    fn relayed_events_inject_sender_id() {
        let user_id = Uuid::new_v4();
        let segment = DrawSegment { x: 1.0, y: 2.0, color: "#00ff00".into(), width: 5.0 };
        let event = ServerEvent::DrawStart(RemoteSegment::new(user_id, segment));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "draw-start");
        assert_eq!(json["data"]["userId"], serde_json::json!(user_id));
        assert_eq!(json["data"]["color"], "#00ff00");
    }

    #[test]
    fn error_from_typed() {
        let event = ServerEvent::error_from(&RoomIdError);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["data"]["code"], "E_INVALID_ROOM");
    }

    #[test]
    fn now_ms_is_positive() {
        assert!(now_ms() > 0);
    }
}
