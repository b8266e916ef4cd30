use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CommandId, ParticipantId, SessionId};

/// Full authoritative state of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub game_id: SessionId,
    pub version: u64,
    #[serde(default)]
    pub participants: Vec<ParticipantId>,
    pub game_state: Value,
    /// Commands this snapshot already accounts for.
    #[serde(default)]
    pub confirms: Vec<CommandId>,
}

/// Incremental authoritative update.
///
/// `patch` is a JSON merge patch (RFC 7386) taking the state at `base_version`
/// to the state at `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDelta {
    pub game_id: SessionId,
    pub base_version: u64,
    pub version: u64,
    pub patch: Value,
    #[serde(default)]
    pub confirms: Vec<CommandId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    pub seq: CommandId,
    /// Version at which the command took effect, if the server reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRejected {
    pub seq: CommandId,
    pub reason: String,
}

/// Free-text notice from the server, optionally tied to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerNotice {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<CommandId>,
}

/// Everything the server publishes on a session topic or the error queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerUpdate {
    JoinAck(Snapshot),
    Snapshot(Snapshot),
    Delta(StateDelta),
    Ack(CommandAck),
    Rejected(CommandRejected),
    Error(ServerNotice),
    Terminated(ServerNotice),
}

/// Type tag and message of an update without a [`ServerUpdate`] variant,
/// such as the per-move announcements some servers publish.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UntypedUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl ServerUpdate {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerUpdate::JoinAck(_) => "JOIN_ACK",
            ServerUpdate::Snapshot(_) => "SNAPSHOT",
            ServerUpdate::Delta(_) => "DELTA",
            ServerUpdate::Ack(_) => "ACK",
            ServerUpdate::Rejected(_) => "REJECTED",
            ServerUpdate::Error(_) => "ERROR",
            ServerUpdate::Terminated(_) => "TERMINATED",
        }
    }
}
