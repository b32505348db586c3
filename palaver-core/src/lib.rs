//! Palaver core: session and signaling orchestration for a real-time
//! group communication server.
//!
//! Peers connect over a persistent duplex channel, join named rooms,
//! exchange chat messages, and negotiate media sessions routed through a
//! shared media engine. This crate owns the protocol state machine —
//! rooms, peers, transports, producers, consumers and the cascades between
//! them — and talks to the engine only through the narrow facade in
//! [`media`]. Network I/O lives in the `palaver-api` crate.

pub mod cascade;
pub mod config;
pub mod error;
pub mod hub;
pub mod ids;
pub mod logging;
pub mod media;
pub mod peer;
pub mod room;
pub mod signaling;

#[cfg(test)]
pub mod test_helpers;

pub use config::Config;
pub use error::{Error, Result};
pub use hub::SessionHub;
