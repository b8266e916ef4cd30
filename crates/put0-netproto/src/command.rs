use strum::{Display, EnumString, IntoStaticStr};

/// STOMP frame command (the first line of every frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum StompCommand {
    // Client frames.
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,

    // Server frames.
    Connected,
    Message,
    Receipt,
    Error,
}

impl StompCommand {
    /// Wire spelling of the command.
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Returns `true` for frames a client is allowed to send.
    pub const fn is_client_frame(self) -> bool {
        !matches!(
            self,
            Self::Connected | Self::Message | Self::Receipt | Self::Error
        )
    }

    /// Header values are escaped in every frame except the connection handshake.
    pub const fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Stomp | Self::Connected)
    }

    /// Only SEND, MESSAGE and ERROR may carry a body.
    pub const fn allows_body(self) -> bool {
        matches!(self, Self::Send | Self::Message | Self::Error)
    }
}
