use std::fmt;

use serde::{Deserialize, Serialize};

use super::ClientMessage;
use crate::destination::{JOIN_DESTINATION, LEAVE_DESTINATION, RESYNC_DESTINATION};

/// Identifier of one game instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

/// Identifier of a player taking part in a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

macro_rules! string_id {
    ($ty:ident) => {
        impl $ty {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $ty {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(SessionId);
string_id!(ParticipantId);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub game_id: SessionId,
    pub player_id: ParticipantId,
}

impl ClientMessage for JoinRequest {
    fn destination(&self) -> String {
        JOIN_DESTINATION.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRequest {
    pub game_id: SessionId,
    pub player_id: ParticipantId,
}

impl ClientMessage for LeaveRequest {
    fn destination(&self) -> String {
        LEAVE_DESTINATION.to_string()
    }
}

/// Asks the server for a full snapshot of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncRequest {
    pub game_id: SessionId,
    pub player_id: ParticipantId,
    /// Last authoritative version the client holds.
    pub known_version: u64,
}

impl ClientMessage for ResyncRequest {
    fn destination(&self) -> String {
        RESYNC_DESTINATION.to_string()
    }
}
