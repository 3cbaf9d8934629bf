//! tern-core - Core MQTT 3.1.1 types and utilities.
//!
//! This crate provides the packet types, the wire codec, topic name/filter
//! validation and matching, and the incremental stream framer shared between
//! the broker and client crates.

pub mod error;
pub mod framer;
pub mod packet;
pub mod topic;
pub mod varint;

pub use error::{Error, ProtocolError, Result};
pub use framer::Framer;
pub use packet::*;
