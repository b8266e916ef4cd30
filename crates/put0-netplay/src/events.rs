//! Notifications for the presentation layer.

use put0_netproto::messages::CommandId;
use tokio::sync::mpsc;

use crate::{dispatcher::CommandStatus, error::NetplayError, reconciler::StateView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Emitted by the session task, in processing order.
#[derive(Debug, Clone)]
pub enum NetplayEvent {
    StateChanged(StateView),
    CommandStatus {
        id: CommandId,
        status: CommandStatus,
    },
    ConnectionState(ConnectionState),
    /// The offline queue overflowed and dropped its oldest command.
    Backpressure { dropped: CommandId, queued: usize },
    /// Error notice from the server (ERROR frame or error queue).
    ServerError { message: String },
    /// Update of a type the session does not apply; state is unchanged.
    ServerNotice {
        kind: String,
        message: Option<String>,
    },
    /// Reconnection gave up. Terminal.
    SessionLost { error: NetplayError },
    /// Left or terminated by the server. Terminal.
    SessionClosed { reason: String },
}

/// Callback-style consumer of [`NetplayEvent`]s.
pub trait SessionObserver: Send {
    fn on_state_changed(&mut self, state: &StateView);
    fn on_command_status(&mut self, id: CommandId, status: &CommandStatus);
    fn on_connection_state(&mut self, state: ConnectionState);

    fn on_backpressure(&mut self, _dropped: CommandId, _queued: usize) {}
    fn on_server_error(&mut self, _message: &str) {}
    fn on_server_notice(&mut self, _kind: &str, _message: Option<&str>) {}
    fn on_session_lost(&mut self, _error: &NetplayError) {}
    fn on_session_closed(&mut self, _reason: &str) {}
}

/// Deliver events to `observer` until the session ends or the channel closes.
pub async fn drive_observer<O: SessionObserver>(
    mut events: mpsc::Receiver<NetplayEvent>,
    mut observer: O,
) -> O {
    while let Some(event) = events.recv().await {
        let terminal = dispatch_event(&mut observer, &event);
        if terminal {
            break;
        }
    }
    observer
}

/// Returns `true` for terminal events.
pub fn dispatch_event<O: SessionObserver + ?Sized>(observer: &mut O, event: &NetplayEvent) -> bool {
    match event {
        NetplayEvent::StateChanged(view) => observer.on_state_changed(view),
        NetplayEvent::CommandStatus { id, status } => observer.on_command_status(*id, status),
        NetplayEvent::ConnectionState(state) => observer.on_connection_state(*state),
        NetplayEvent::Backpressure { dropped, queued } => {
            observer.on_backpressure(*dropped, *queued)
        }
        NetplayEvent::ServerError { message } => observer.on_server_error(message),
        NetplayEvent::ServerNotice { kind, message } => {
            observer.on_server_notice(kind, message.as_deref())
        }
        NetplayEvent::SessionLost { error } => {
            observer.on_session_lost(error);
            return true;
        }
        NetplayEvent::SessionClosed { reason } => {
            observer.on_session_closed(reason);
            return true;
        }
    }
    false
}
