//! Session configuration.

use std::time::Duration;

use put0_netproto::messages::{CommandId, ParticipantId, SessionId};

use crate::error::NetplayError;

/// Reconnect backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// First delay, and the lower bound of every delay.
    pub base: Duration,
    /// Upper bound of every delay.
    pub cap: Duration,
    /// Relative jitter applied to each delay, in `[0, 1]`.
    pub jitter: f64,
    /// Give up after this many failed attempts in one outage.
    pub max_attempts: u32,
    /// Give up once an outage has lasted this long.
    pub max_elapsed: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            jitter: 0.2,
            max_attempts: 10,
            max_elapsed: Duration::from_secs(300),
        }
    }
}

/// Configuration for one synchronized game session.
#[derive(Debug, Clone)]
pub struct NetplayConfig {
    /// WebSocket endpoint, e.g. `wss://example.org/ws/websocket`.
    pub endpoint: String,
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    /// How often we send heartbeats, and want to receive them.
    pub heartbeat_interval: Duration,
    /// Lower bound of the inbound silence tolerated before the link is declared dead.
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
    /// Time a published command may wait for its acknowledgement.
    pub ack_timeout: Duration,
    /// Capacity of the offline command queue.
    pub command_queue_capacity: usize,
    /// How long terminal commands stay queryable.
    pub command_gc_grace: Duration,
    pub outbound_capacity: usize,
    pub event_capacity: usize,
    /// Sequence number of the first submitted command.
    pub initial_sequence: u64,
    pub backoff: BackoffPolicy,
}

impl NetplayConfig {
    pub fn new(
        endpoint: impl Into<String>,
        session_id: impl Into<SessionId>,
        participant_id: impl Into<ParticipantId>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            session_id: session_id.into(),
            participant_id: participant_id.into(),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(25),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            command_queue_capacity: 64,
            command_gc_grace: Duration::from_secs(30),
            outbound_capacity: 256,
            event_capacity: 256,
            initial_sequence: 1,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_command_queue_capacity(mut self, capacity: usize) -> Self {
        self.command_queue_capacity = capacity;
        self
    }

    /// Events buffered for the presentation layer before the session keeps
    /// them in its own backlog.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_command_gc_grace(mut self, grace: Duration) -> Self {
        self.command_gc_grace = grace;
        self
    }

    pub fn with_initial_sequence(mut self, seq: u64) -> Self {
        self.initial_sequence = seq;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn first_command_id(&self) -> CommandId {
        CommandId(self.initial_sequence)
    }

    /// Check values that would otherwise fail late inside the session task.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if !self.endpoint.starts_with("ws://") && !self.endpoint.starts_with("wss://") {
            return Err(NetplayError::ConnectFailure(format!(
                "endpoint must be a ws:// or wss:// url: {}",
                self.endpoint
            )));
        }
        if self.command_queue_capacity == 0
            || self.outbound_capacity == 0
            || self.event_capacity == 0
        {
            return Err(NetplayError::InvalidCommand(
                "queue capacities must be non-zero".to_string(),
            ));
        }
        if self.backoff.base.is_zero() || self.backoff.cap < self.backoff.base {
            return Err(NetplayError::InvalidCommand(
                "backoff cap must be at least the non-zero base delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Convert the HTTP base URL of the game server into its STOMP endpoint.
    ///
    /// `https://host/api/` becomes `wss://host/api/ws/websocket`.
    pub fn endpoint_from_http_base(base: &str) -> String {
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        if ws.ends_with('/') {
            format!("{ws}ws/websocket")
        } else {
            format!("{ws}/ws/websocket")
        }
    }
}
