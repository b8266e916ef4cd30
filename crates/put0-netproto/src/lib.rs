//! Wire layer for the Put0 session synchronization protocol.
//!
//! STOMP 1.2 frames carried over a WebSocket, with JSON bodies. This crate is
//! pure: it owns the frame model, the frame codec, destination naming and the
//! message types exchanged with the game server, but performs no I/O.

pub mod codec;
pub mod command;
pub mod constants;
pub mod destination;
pub mod error;
pub mod frame;
pub mod limits;
pub mod messages;
