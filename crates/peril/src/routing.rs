//! Exchange names, routing keys, and shared message types.
//!
//! Publishers and subscribers only meet at the broker, so both sides take
//! their names from here:
//!
//! | Exchange | Kind | Used for |
//! |----------|------|----------|
//! | [`EXCHANGE_PERIL_DIRECT`] | direct | pause/resume ([`PAUSE_KEY`]) |
//! | [`EXCHANGE_PERIL_TOPIC`] | topic | army moves, war, game logs |
//! | [`EXCHANGE_PERIL_DLX`] | fanout | rejected messages |

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

pub const EXCHANGE_PERIL_DIRECT: &str = "peril_direct";
pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";
pub const EXCHANGE_PERIL_DLX: &str = "peril_dlx";

pub const PAUSE_KEY: &str = "pause";
pub const ARMY_MOVES_PREFIX: &str = "army_moves";
pub const WAR_RECOGNITIONS_PREFIX: &str = "war";
pub const GAME_LOG_SLUG: &str = "game_logs";

/// Pause state broadcast by the server. Sent as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayingState {
    pub is_paused: bool,
}

/// A line in the shared game log. Sent with bincode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameLog {
    pub current_time: SystemTime,
    pub message: String,
    pub username: String,
}

impl GameLog {
    /// A log entry stamped with the current time.
    pub fn new(
        username: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            current_time: SystemTime::now(),
            message: message.into(),
            username: username.into(),
        }
    }
}

/// Per-player transient queue for pause/resume messages.
pub fn pause_queue(username: &str) -> String {
    format!("{PAUSE_KEY}.{username}")
}

/// Routing key for a move made by `username`.
pub fn army_moves_key(username: &str) -> String {
    format!("{ARMY_MOVES_PREFIX}.{username}")
}

/// Binding that receives every player's moves.
pub fn army_moves_binding() -> String {
    wildcard(ARMY_MOVES_PREFIX)
}

/// Routing key for a war declared by `username`.
pub fn war_key(username: &str) -> String {
    format!("{WAR_RECOGNITIONS_PREFIX}.{username}")
}

/// Binding that receives every war declaration.
pub fn war_binding() -> String {
    wildcard(WAR_RECOGNITIONS_PREFIX)
}

/// Routing key for a game log written by `username`.
pub fn game_log_key(username: &str) -> String {
    format!("{GAME_LOG_SLUG}.{username}")
}

/// Binding that receives every player's game logs.
pub fn game_log_binding() -> String {
    wildcard(GAME_LOG_SLUG)
}

fn wildcard(prefix: &str) -> String {
    format!("{prefix}.*")
}
