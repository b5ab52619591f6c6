use super::*;
use crate::event::DrawingCommand;
use crate::state::test_helpers;
use tokio::time::{Duration, timeout};

async fn recv_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("event receive timed out")
        .expect("channel closed")
}

async fn assert_silent(rx: &mut mpsc::Receiver<ServerEvent>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected channel to remain empty"
    );
}

#[tokio::test]
async fn broadcast_sends_to_all_except_excluded_client() {
    let state = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state, "room42").await;

    let (_client_a, mut rx_a) = test_helpers::attach_client(&state, &room_id).await;
    let (client_b, mut rx_b) = test_helpers::attach_client(&state, &room_id).await;
    let (_client_c, mut rx_c) = test_helpers::attach_client(&state, &room_id).await;

    broadcast(&state, &room_id, &ServerEvent::UserCount(3), Some(client_b)).await;

    assert_eq!(recv_event(&mut rx_a).await, ServerEvent::UserCount(3));
    assert_eq!(recv_event(&mut rx_c).await, ServerEvent::UserCount(3));
    assert_silent(&mut rx_b).await;
}

#[tokio::test]
async fn broadcast_to_unknown_room_is_noop() {
    let state = test_helpers::test_app_state();
    let room_id = crate::event::RoomId::parse("ghost1").unwrap();
    // Room was never created — must not panic.
    broadcast(&state, &room_id, &ServerEvent::UserCount(0), None).await;
}

#[tokio::test]
async fn join_tolerates_unreachable_store() {
    let state = test_helpers::test_app_state();
    let room_id = crate::event::RoomId::parse("room42").unwrap();
    let connection_id = Uuid::new_v4();
    let (tx, _rx) = mpsc::channel(8);

    // connect_lazy test pool: lazy creation and replay both fail, yet the
    // client still joins with an empty history.
    let outcome = join_room(&state, &room_id, None, connection_id, tx).await;

    assert!(outcome.log.is_empty());
    assert!(outcome.previous.is_none());
    assert_eq!(member_count(&state, &room_id).await, 1);
}

#[tokio::test]
async fn join_detaches_from_previous_room_in_one_step() {
    let state = test_helpers::test_app_state();
    let old = crate::event::RoomId::parse("roomQQ").unwrap();
    let new = crate::event::RoomId::parse("roomRR").unwrap();
    let connection_id = Uuid::new_v4();
    let (tx, _rx) = mpsc::channel(8);

    join_room(&state, &old, None, connection_id, tx.clone()).await;
    let outcome = join_room(&state, &new, Some(&old), connection_id, tx).await;

    let previous = outcome.previous.expect("must report the departed room");
    assert_eq!(previous.room_id, old);
    assert_eq!(previous.remaining, 0);
    assert_eq!(member_count(&state, &old).await, 0);
    assert_eq!(member_count(&state, &new).await, 1);
}

#[tokio::test]
async fn leave_room_removes_client_and_cursor() {
    let state = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state, "room42").await;
    let (client_a, _rx_a) = test_helpers::attach_client(&state, &room_id).await;
    let (client_b, _rx_b) = test_helpers::attach_client(&state, &room_id).await;

    {
        let mut rooms = state.rooms.write().await;
        let room = rooms.get_mut(&room_id).expect("room seeded");
        room.cursors.insert(
            client_a,
            crate::state::CursorEntry {
                x: 1.0,
                y: 2.0,
                color: "#fff".into(),
                last_seen: std::time::Instant::now(),
            },
        );
    }

    let departed = leave_room(&state, &room_id, client_a).await.expect("was a member");
    assert_eq!(departed.remaining, 1);

    let rooms = state.rooms.read().await;
    let room = rooms.get(&room_id).expect("room stays live for client_b");
    assert!(!room.clients.contains_key(&client_a));
    assert!(room.clients.contains_key(&client_b));
    assert!(!room.cursors.contains_key(&client_a));
}

#[tokio::test]
async fn leave_room_returns_none_for_non_member() {
    let state = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state, "room42").await;

    assert!(leave_room(&state, &room_id, Uuid::new_v4()).await.is_none());
}

#[tokio::test]
async fn last_leave_evicts_a_fully_flushed_room() {
    let state = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state, "room42").await;
    let (client, _rx) = test_helpers::attach_client(&state, &room_id).await;

    leave_room(&state, &room_id, client).await;

    assert!(!state.rooms.read().await.contains_key(&room_id));
}

#[tokio::test]
async fn last_leave_retains_a_room_with_unflushed_log() {
    let state = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state, "room42").await;
    let (client, _rx) = test_helpers::attach_client(&state, &room_id).await;

    {
        let mut rooms = state.rooms.write().await;
        let room = rooms.get_mut(&room_id).expect("room seeded");
        room.log.push(DrawingCommand { op: crate::event::DrawingOp::Clear {}, timestamp: 1 });
    }

    leave_room(&state, &room_id, client).await;

    let rooms = state.rooms.read().await;
    let room = rooms
        .get(&room_id)
        .expect("room with unflushed tail must stay for the persistence task");
    assert!(room.clients.is_empty());
    assert!(room.has_unflushed());
}

#[tokio::test]
async fn member_count_is_zero_for_unknown_rooms() {
    let state = test_helpers::test_app_state();
    let room_id = crate::event::RoomId::parse("ghost1").unwrap();
    assert_eq!(member_count(&state, &room_id).await, 0);
}
