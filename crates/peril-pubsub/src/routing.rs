//! Exchange names, routing keys and the payloads exchanged through them.

use crate::message::Timestamp;
use serde::{Deserialize, Serialize};

#[cfg(test)]
#[path = "routing_tests.rs"]
mod tests;

/// Direct exchange for server-wide announcements
pub const EXCHANGE_PERIL_DIRECT: &str = "peril_direct";

/// Topic exchange for player traffic
pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";

/// Exchange receiving every message rejected without requeue.
///
/// Every queue declared through [`crate::topology`] points here.
pub const DEAD_LETTER_EXCHANGE: &str = "peril_dlx";

/// Routing key for pause/resume announcements
pub const PAUSE_KEY: &str = "pause";

/// Routing key prefix for army moves, followed by the player name
pub const ARMY_MOVES_PREFIX: &str = "army_moves";

/// Routing key prefix for war recognitions, followed by the player name
pub const WAR_RECOGNITIONS_PREFIX: &str = "war";

/// Routing key prefix for game logs, followed by the player name
pub const GAME_LOG_SLUG: &str = "game_logs";

/// Build a `prefix.suffix` routing key
pub fn routing_key(prefix: &str, suffix: &str) -> String {
    format!("{}.{}", prefix, suffix)
}

/// Build a pattern matching every key under `prefix` one segment deep
pub fn any_under(prefix: &str) -> String {
    routing_key(prefix, "*")
}

/// Pause state broadcast by the server, sent as JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayingState {
    pub is_paused: bool,
}

/// A game log line, sent with the binary codec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameLog {
    pub current_time: Timestamp,
    pub message: String,
    pub username: String,
}
