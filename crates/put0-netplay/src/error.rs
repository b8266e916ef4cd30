//! Netplay error types.

use std::time::Duration;

use put0_netproto::{error::CodecError, messages::CommandId};
use thiserror::Error;

use crate::reconciler::SessionLifecycle;

#[derive(Error, Debug, Clone)]
pub enum NetplayError {
    /// Network, handshake or authentication failure while connecting.
    #[error("connect failed: {0}")]
    ConnectFailure(String),

    /// The frame could not be handed to a live connection.
    #[error("send failed: {0}")]
    SendFailure(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("command {id} dropped: {reason}")]
    CommandDropped { id: CommandId, reason: String },

    #[error("command {id} timed out")]
    TimedOut { id: CommandId },

    #[error("command {id} rejected: {reason}")]
    Rejected { id: CommandId, reason: String },

    #[error("version conflict: local state at {local}, update based on {base}")]
    VersionConflict { local: u64, base: u64 },

    #[error("session lost after {attempts} reconnect attempts over {elapsed:?}")]
    SessionLost { attempts: u32, elapsed: Duration },

    #[error("session closed")]
    SessionClosed,

    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionLifecycle,
        to: SessionLifecycle,
    },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("unknown command {0}")]
    UnknownCommand(CommandId),

    #[error("document store error: {0}")]
    Store(String),

    #[error("channel receive error")]
    ChannelRecv,
}

// `CodecError` is not `Clone`; keep its message.
impl From<CodecError> for NetplayError {
    fn from(err: CodecError) -> Self {
        NetplayError::Codec(err.to_string())
    }
}

impl NetplayError {
    /// Whether this error ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NetplayError::SessionLost { .. } | NetplayError::SessionClosed
        )
    }
}
