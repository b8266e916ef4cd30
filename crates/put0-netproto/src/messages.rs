//! JSON bodies exchanged with the game server.

mod command;
mod session;
mod state;

use serde::Serialize;

pub use command::{CommandEnvelope, CommandId, CommandPayload};
pub use session::{JoinRequest, LeaveRequest, ParticipantId, ResyncRequest, SessionId};
pub use state::{
    CommandAck, CommandRejected, ServerNotice, ServerUpdate, Snapshot, StateDelta, UntypedUpdate,
};

use crate::{error::CodecError, frame::Frame};

/// A message the client sends to an application destination.
pub trait ClientMessage: Serialize {
    fn destination(&self) -> String;

    /// Wrap into a SEND frame with a JSON body.
    fn to_frame(&self) -> Result<Frame, CodecError> {
        Frame::send_json(&self.destination(), self)
    }
}
