//! Worker-facing connection layer: wire messages, authentication and the
//! per-connection handler.

pub mod auth;
pub mod connection;
pub mod handler;
pub mod messages;

pub use connection::{ConnectionHandle, Outbound};
pub use messages::{CloseReason, ProtocolError, WorkerCommand};
