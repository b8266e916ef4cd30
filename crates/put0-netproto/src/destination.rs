//! Destination names used by the game server's message broker.

use crate::messages::SessionId;

/// Prefix of every destination handled by the server's application layer.
pub const APP_PREFIX: &str = "/app";

/// Prefix of the per-session broadcast topic.
pub const GAME_TOPIC_PREFIX: &str = "/topic/game/";

/// Per-user queue the server reports command errors on.
pub const USER_ERROR_QUEUE: &str = "/user/queue/errors";

pub const JOIN_DESTINATION: &str = "/app/game/join";
pub const LEAVE_DESTINATION: &str = "/app/game/leave";
pub const RESYNC_DESTINATION: &str = "/app/game/resync";

/// Broadcast topic of one session.
pub fn game_topic(session: &SessionId) -> String {
    format!("{GAME_TOPIC_PREFIX}{session}")
}

/// Destination a player command with the given action is sent to.
pub fn command_destination(action: &str) -> String {
    format!("{APP_PREFIX}/game/{action}")
}

/// Actions become a path segment, so they are restricted to `[A-Za-z0-9_-]+`.
pub fn is_valid_action(action: &str) -> bool {
    !action.is_empty()
        && action
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
