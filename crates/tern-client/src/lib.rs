//! tern-client - MQTT 3.1.1 client library.
//!
//! A polling, non-blocking client in the same event-loop style as the broker:
//! the caller pumps [`Client::poll`] and drains [`Client::next_event`]. The
//! client runs its half of the QoS 1/2 flows (acknowledging inbound
//! publishes, tracking outbound ones until the exchange completes) and pings
//! the broker on the keep-alive interval.

pub mod client;
pub mod error;
pub mod packet_id;
pub mod session;

pub use client::{Client, ClientConfig, ClientEvent};
pub use error::{ClientError, Result};
