//! Error types for tern.

use std::io;

use thiserror::Error;

/// Main error type for tern.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// MQTT protocol errors.
///
/// Every codec error is fatal for the connection that produced it; the framer
/// surfaces these to the session layer, which closes the transport.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// Remaining-length encoding overruns 4 bytes, or a value above the
    /// 268,435,455 maximum was given to the encoder.
    #[error("Malformed remaining length")]
    MalformedLength,

    /// Fixed header flags do not match the per-type constraint.
    #[error("Invalid fixed header flags {flags:#04x} for packet type {packet_type}")]
    InvalidFlags { packet_type: u8, flags: u8 },

    /// The packet body ended before a field was fully read.
    #[error("Short read: need {needed} bytes, have {have}")]
    ShortRead { needed: usize, have: usize },

    /// The packet body did not consume exactly the declared remaining length.
    #[error("Length mismatch: declared {declared} bytes, consumed {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Type nibble outside 1..=14.
    #[error("Unknown packet type: {0}")]
    UnknownType(u8),

    #[error("Packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Invalid QoS value: {0}")]
    InvalidQos(u8),

    #[error("Invalid protocol name: {0:?}")]
    InvalidProtocolName(String),

    #[error("Unsupported protocol level: {0}")]
    UnsupportedProtocolLevel(u8),

    #[error("Invalid connect flags: {0:#04x}")]
    InvalidConnectFlags(u8),

    #[error("Invalid CONNACK return code: {0}")]
    InvalidReturnCode(u8),

    #[error("Invalid SUBACK return code: {0}")]
    InvalidSubackCode(u8),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Invalid topic name: {0:?}")]
    InvalidTopicName(String),

    #[error("Invalid topic filter: {0:?}")]
    InvalidTopicFilter(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
}

pub type Result<T> = std::result::Result<T, Error>;
