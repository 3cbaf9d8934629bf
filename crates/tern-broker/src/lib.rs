//! tern-broker - a small MQTT 3.1.1 broker.
//!
//! Single-threaded mio event loop; all sessions and the registry live on one
//! poll, so packet handling never needs locks. Sessions persist in memory
//! across disconnections unless the client asked for a clean session, and a
//! reconnecting client takes over its persisted session's state.

pub mod auth;
pub mod config;
pub mod registry;
pub mod server;
pub mod session;
