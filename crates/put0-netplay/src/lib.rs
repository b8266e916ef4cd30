//! Put0 real-time session client.
//!
//! Keeps a player's view of a multiplayer game in sync with the server over a
//! STOMP-over-WebSocket connection. Player commands are applied optimistically
//! and reconciled against authoritative updates; lost connections are resumed
//! in the background.
//!
//! # Architecture
//!
//! - [`transport`]: WebSocket connection, STOMP handshake and heartbeats
//! - [`subscription`]: Topic registry, replayed after every reconnect
//! - [`reconciler`]: Authoritative state, optimistic shadows, lifecycle
//! - [`dispatcher`]: Sequence numbers, offline queue, acknowledgement timeouts
//! - [`supervisor`]: Reconnect backoff and the resume sequence
//! - [`handler`]: The session task tying the above together
//! - [`events`]: Notifications for the presentation layer
//! - [`store`]: Advisory membership store
//! - [`error`]: Error types

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handler;
pub mod identity;
pub mod reconciler;
pub mod store;
pub mod subscription;
pub mod supervisor;
pub mod transport;

// Re-export commonly used types
pub use config::{BackoffPolicy, NetplayConfig};
pub use dispatcher::{CommandStatus, CommandTicket};
pub use error::NetplayError;
pub use events::{ConnectionState, NetplayEvent, SessionObserver, drive_observer};
pub use handler::{SessionHandle, SessionHandler, spawn_session};
pub use identity::AuthToken;
pub use put0_netproto::messages::{CommandId, CommandPayload, ParticipantId, SessionId};
pub use reconciler::{NoPrediction, Predictor, SessionLifecycle, StateView};
pub use store::{DocumentStore, InMemoryStore};
pub use subscription::{SubscriptionId, TopicHandler};
