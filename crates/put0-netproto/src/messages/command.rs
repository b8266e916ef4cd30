use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ClientMessage, ParticipantId, SessionId};
use crate::destination::command_destination;

/// Per-session sequence number of a player command.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the player wants to do: an action name plus free-form JSON fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandPayload {
    pub action: String,
    pub body: Map<String, Value>,
}

impl CommandPayload {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            body: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }
}

/// A command as sent to `/app/game/{action}`.
///
/// The payload fields are flattened next to the routing fields, which is how
/// the server binds its request objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub game_id: SessionId,
    pub player_id: ParticipantId,
    pub seq: CommandId,
    /// Submission time, milliseconds since the Unix epoch.
    pub issued_at: u64,
    #[serde(skip)]
    pub action: String,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl CommandEnvelope {
    pub fn new(
        game_id: SessionId,
        player_id: ParticipantId,
        seq: CommandId,
        issued_at: u64,
        payload: CommandPayload,
    ) -> Self {
        Self {
            game_id,
            player_id,
            seq,
            issued_at,
            action: payload.action,
            body: payload.body,
        }
    }
}

impl ClientMessage for CommandEnvelope {
    fn destination(&self) -> String {
        command_destination(&self.action)
    }
}
