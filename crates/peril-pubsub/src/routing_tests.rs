//! Tests for routing helpers and payloads.

use super::*;
use crate::codec::{BinaryCodec, Codec, JsonCodec};

#[test]
fn test_routing_key_helpers() {
    assert_eq!(routing_key(ARMY_MOVES_PREFIX, "alice"), "army_moves.alice");
    assert_eq!(any_under(WAR_RECOGNITIONS_PREFIX), "war.*");
}

#[test]
fn test_playing_state_uses_camel_case_field() {
    let json = serde_json::to_string(&PlayingState { is_paused: true }).unwrap();
    assert_eq!(json, r#"{"isPaused":true}"#);

    let decoded: PlayingState = JsonCodec.decode(br#"{"isPaused": false}"#).unwrap();
    assert!(!decoded.is_paused);
}

#[test]
fn test_game_log_binary_round_trip() {
    let log = GameLog {
        current_time: Timestamp::now(),
        message: "alice won a war against bob".to_string(),
        username: "alice".to_string(),
    };

    let bytes = BinaryCodec.encode(&log).unwrap();
    let decoded: GameLog = BinaryCodec.decode(&bytes).unwrap();
    assert_eq!(decoded, log);
}
