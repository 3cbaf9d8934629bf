//! Per-session broker state.
//!
//! A `BrokerSession` owns one transport at a time together with everything
//! MQTT requires the server to remember for a client: subscriptions, the
//! packet-id sequence, and the QoS 1/2 in-flight queues. The transport is
//! absent while a persistent session is parked between connections; sending
//! on a parked session is a no-op and the pending queues simply accumulate
//! until the client returns.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Instant;

use bytes::BytesMut;
use log::{debug, trace, warn};
use mio::net::TcpStream;
use mio::Token;

use tern_core::packet::{
    self, Packet, Publish, QoS, Suback, SubackCode, Subscribe, Unsubscribe,
};
use tern_core::{Framer, Result};

/// Read chunk size for draining the socket.
const READ_CHUNK: usize = 4096;

/// A single subscription held by a session.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport accepted, CONNECT not yet received.
    AwaitingConnect,
    /// CONNECT accepted (the state persisted sessions stay in while parked).
    Connected,
    /// Marked for teardown; the registry cleanup pass closes the transport
    /// and then erases or parks the session.
    Disconnecting,
}

/// Per-client session state and buffers.
pub struct BrokerSession {
    pub token: Token,
    pub state: SessionState,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub last_packet_time: Instant,
    /// Whether the peer sent a DISCONNECT packet (graceful close).
    pub graceful_disconnect: bool,
    /// Set when a read returned EOF; packets already buffered are still
    /// processed before the closure is acted on.
    pub peer_closed: bool,

    /// Subscriptions in arrival order; filters are unique within a session.
    pub subscriptions: Vec<Subscription>,

    /// Outgoing QoS 1 publishes awaiting PUBACK, in enqueue order.
    pub qos1_pending_puback: VecDeque<Publish>,
    /// Outgoing QoS 2 publishes awaiting PUBREC, in enqueue order.
    pub qos2_pending_pubrec: VecDeque<Publish>,
    /// Incoming QoS 2 packet ids for which PUBREC was sent, awaiting PUBREL.
    pub qos2_pending_pubrel: VecDeque<u16>,
    /// Outgoing QoS 2 packet ids that have been PUBREL'd, awaiting PUBCOMP.
    pub qos2_pending_pubcomp: VecDeque<u16>,

    transport: Option<TcpStream>,
    framer: Framer,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    next_packet_id: u16,
    max_packet_size: usize,
}

impl BrokerSession {
    pub fn new(token: Token, transport: Option<TcpStream>, max_packet_size: usize) -> Self {
        Self {
            token,
            state: SessionState::AwaitingConnect,
            client_id: String::new(),
            clean_session: false,
            keep_alive: 0,
            last_packet_time: Instant::now(),
            graceful_disconnect: false,
            peer_closed: false,
            subscriptions: Vec::new(),
            qos1_pending_puback: VecDeque::new(),
            qos2_pending_pubrec: VecDeque::new(),
            qos2_pending_pubrel: VecDeque::new(),
            qos2_pending_pubcomp: VecDeque::new(),
            transport,
            framer: Framer::with_max_packet_size(max_packet_size),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: Vec::new(),
            next_packet_id: 1,
            max_packet_size,
        }
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Drain the socket into the read buffer until it would block.
    ///
    /// EOF sets `peer_closed` instead of erroring so that packets already in
    /// the buffer (a trailing DISCONNECT, typically) still get processed.
    pub fn read(&mut self) -> io::Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match transport.read(&mut chunk) {
                Ok(0) => {
                    self.peer_closed = true;
                    return Ok(());
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Try to frame the next complete packet out of the read buffer.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        self.framer.next_packet(&mut self.read_buf)
    }

    /// Queue a packet for sending and push as much as the socket accepts.
    ///
    /// Sending on a parked session (no transport) is a no-op; the pending
    /// queues carry anything that must survive until the client reconnects.
    pub fn send(&mut self, packet: &Packet) {
        if self.transport.is_none() {
            trace!("[{}] not writing to parked session", self.client_id);
            return;
        }

        if let Err(e) = packet::encode(packet, &mut self.write_buf) {
            warn!("[{}] dropping unencodable packet: {}", self.client_id, e);
            return;
        }

        if let Err(e) = self.flush() {
            debug!("[{}] write failed: {}", self.client_id, e);
            self.state = SessionState::Disconnecting;
        }
    }

    /// Write buffered data to the socket until empty or it would block.
    pub fn flush(&mut self) -> io::Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };

        let mut written = 0;
        while written < self.write_buf.len() {
            match transport.write(&self.write_buf[written..]) {
                Ok(0) => {
                    self.write_buf.drain(..written);
                    return Err(io::ErrorKind::WriteZero.into());
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.write_buf.drain(..written);
                    return Err(e);
                }
            }
        }
        self.write_buf.drain(..written);
        Ok(())
    }

    /// Allocate the next packet id, wrapping 65535 -> 1 (0 is reserved).
    pub fn allocate_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = if id == u16::MAX { 1 } else { id + 1 };
        id
    }

    /// Deliver a publish that matched one of this session's subscriptions.
    ///
    /// QoS 0 goes out as-is, fire and forget. QoS 1/2 copies get a fresh
    /// packet id from this session's sequence, dup/retain cleared, and are
    /// tracked until the acknowledgment flow completes. Retransmissions from
    /// the publisher never reach this point; the registry fans an inbound
    /// QoS 2 id out only on its first delivery.
    pub fn forward_publish(&mut self, publish: &Publish) {
        match publish.qos {
            QoS::AtMostOnce => {
                self.send(&Packet::Publish(publish.clone()));
            }
            QoS::AtLeastOnce => {
                let mut copy = publish.clone();
                copy.dup = false;
                copy.retain = false;
                copy.packet_id = Some(self.allocate_packet_id());
                self.qos1_pending_puback.push_back(copy.clone());
                self.send(&Packet::Publish(copy));
            }
            QoS::ExactlyOnce => {
                let mut copy = publish.clone();
                copy.dup = false;
                copy.retain = false;
                copy.packet_id = Some(self.allocate_packet_id());
                self.qos2_pending_pubrec.push_back(copy.clone());
                self.send(&Packet::Publish(copy));
            }
        }
    }

    /// Re-send the head of the first non-empty pending queue.
    ///
    /// Called after each packet from this client is processed; a resumed
    /// session drains its backlog one element per received packet this way.
    /// Priority: QoS 1 publishes, QoS 2 publishes awaiting PUBREC, PUBRECs
    /// owed for inbound QoS 2, then PUBRELs awaiting PUBCOMP.
    pub fn send_pending_message(&mut self) {
        if let Some(publish) = self.qos1_pending_puback.front().cloned() {
            self.send(&Packet::Publish(publish));
        } else if let Some(publish) = self.qos2_pending_pubrec.front().cloned() {
            self.send(&Packet::Publish(publish));
        } else if let Some(&packet_id) = self.qos2_pending_pubrel.front() {
            self.send(&Packet::Pubrec { packet_id });
        } else if let Some(&packet_id) = self.qos2_pending_pubcomp.front() {
            self.send(&Packet::Pubrel { packet_id });
        }
    }

    /// PUBACK received: the QoS 1 exchange for this id is complete.
    pub fn on_puback(&mut self, packet_id: u16) {
        if let Some(pos) = self
            .qos1_pending_puback
            .iter()
            .position(|p| p.packet_id == Some(packet_id))
        {
            self.qos1_pending_puback.remove(pos);
        }
    }

    /// PUBREC received: release the publish and answer with PUBREL.
    pub fn on_pubrec(&mut self, packet_id: u16) {
        self.qos2_pending_pubrec
            .retain(|p| p.packet_id != Some(packet_id));
        if !self.qos2_pending_pubcomp.contains(&packet_id) {
            self.qos2_pending_pubcomp.push_back(packet_id);
        }
        self.send(&Packet::Pubrel { packet_id });
    }

    /// PUBREL received: the inbound QoS 2 exchange completes with PUBCOMP.
    pub fn on_pubrel(&mut self, packet_id: u16) {
        self.qos2_pending_pubrel.retain(|&id| id != packet_id);
        self.send(&Packet::Pubcomp { packet_id });
    }

    /// PUBCOMP received: the outbound QoS 2 exchange for this id is done.
    pub fn on_pubcomp(&mut self, packet_id: u16) {
        self.qos2_pending_pubcomp.retain(|&id| id != packet_id);
    }

    /// SUBSCRIBE: record each filter (replacing a byte-equal existing entry)
    /// and acknowledge with the granted QoS per filter.
    pub fn on_subscribe(&mut self, subscribe: &Subscribe) {
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());

        for (filter, qos) in &subscribe.filters {
            self.subscriptions.retain(|s| s.filter != *filter);
            self.subscriptions.push(Subscription {
                filter: filter.clone(),
                qos: *qos,
            });
            return_codes.push(SubackCode::granted(*qos));
        }

        debug!(
            "[{}] subscribed to {} filter(s)",
            self.client_id,
            subscribe.filters.len()
        );

        self.send(&Packet::Suback(Suback {
            packet_id: subscribe.packet_id,
            return_codes,
        }));
    }

    /// UNSUBSCRIBE: drop the byte-equal filters and acknowledge.
    pub fn on_unsubscribe(&mut self, unsubscribe: &Unsubscribe) {
        for filter in &unsubscribe.filters {
            self.subscriptions.retain(|s| s.filter != *filter);
        }
        self.send(&Packet::Unsuback {
            packet_id: unsubscribe.packet_id,
        });
    }

    pub fn on_pingreq(&mut self) {
        self.send(&Packet::Pingresp);
    }

    /// Close and drop the transport, resetting all connection-scoped state.
    /// Session-scoped state (subscriptions, pending queues, packet id
    /// sequence) survives for resumption.
    pub fn drop_transport(&mut self) {
        let _ = self.flush();
        self.transport = None;
        self.peer_closed = false;
        self.read_buf.clear();
        self.write_buf.clear();
        self.framer = Framer::with_max_packet_size(self.max_packet_size);
    }

    /// Take over the network layer of a freshly accepted connection, used
    /// when a client reconnects to its persisted session. Any bytes the new
    /// connection already buffered move over with it.
    pub fn adopt_transport_from(&mut self, skeleton: BrokerSession) {
        self.drop_transport();
        self.token = skeleton.token;
        self.transport = skeleton.transport;
        self.framer = skeleton.framer;
        self.read_buf = skeleton.read_buf;
        self.write_buf = skeleton.write_buf;
        self.peer_closed = skeleton.peer_closed;
        self.graceful_disconnect = false;
        self.last_packet_time = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tern_core::packet::Publish;

    fn detached() -> BrokerSession {
        BrokerSession::new(Token(1), None, 0)
    }

    fn publish(qos: QoS, packet_id: Option<u16>) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            topic: "a/b".into(),
            packet_id,
            payload: Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn test_packet_id_wraps_skipping_zero() {
        let mut session = detached();
        assert_eq!(session.allocate_packet_id(), 1);
        assert_eq!(session.allocate_packet_id(), 2);

        session.next_packet_id = u16::MAX;
        assert_eq!(session.allocate_packet_id(), u16::MAX);
        assert_eq!(session.allocate_packet_id(), 1);
    }

    #[test]
    fn test_forward_qos1_tracks_pending() {
        let mut session = detached();
        let incoming = publish(QoS::AtLeastOnce, Some(42));

        session.forward_publish(&incoming);

        assert_eq!(session.qos1_pending_puback.len(), 1);
        let queued = &session.qos1_pending_puback[0];
        // The copy gets this session's own id, dup/retain cleared
        assert_eq!(queued.packet_id, Some(1));
        assert!(!queued.dup);
        assert!(!queued.retain);

        session.on_puback(1);
        assert!(session.qos1_pending_puback.is_empty());
    }

    #[test]
    fn test_forward_qos1_clears_dup_and_retain() {
        let mut session = detached();
        let mut incoming = publish(QoS::AtLeastOnce, Some(9));
        incoming.dup = true;
        incoming.retain = true;

        session.forward_publish(&incoming);

        let queued = &session.qos1_pending_puback[0];
        assert!(!queued.dup);
        assert!(!queued.retain);
    }

    #[test]
    fn test_forward_qos2_tracks_every_copy() {
        let mut session = detached();
        let incoming = publish(QoS::ExactlyOnce, Some(42));

        // Two matching filters mean two forwarded copies, each tracked under
        // its own packet id until its PUBREC arrives
        session.forward_publish(&incoming);
        session.forward_publish(&incoming);

        assert_eq!(session.qos2_pending_pubrec.len(), 2);
        assert_eq!(session.qos2_pending_pubrec[0].packet_id, Some(1));
        assert_eq!(session.qos2_pending_pubrec[1].packet_id, Some(2));
    }

    #[test]
    fn test_qos2_outbound_flow() {
        let mut session = detached();
        session.forward_publish(&publish(QoS::ExactlyOnce, Some(7)));
        let sent_id = session.qos2_pending_pubrec[0]
            .packet_id
            .expect("qos 2 copy has an id");

        session.on_pubrec(sent_id);
        assert!(session.qos2_pending_pubrec.is_empty());
        assert_eq!(session.qos2_pending_pubcomp, VecDeque::from([sent_id]));

        // Duplicate PUBREC does not double-track
        session.on_pubrec(sent_id);
        assert_eq!(session.qos2_pending_pubcomp.len(), 1);

        session.on_pubcomp(sent_id);
        assert!(session.qos2_pending_pubcomp.is_empty());
    }

    #[test]
    fn test_qos2_inbound_flow() {
        let mut session = detached();
        session.qos2_pending_pubrel.push_back(5);

        session.on_pubrel(5);
        assert!(session.qos2_pending_pubrel.is_empty());
    }

    #[test]
    fn test_subscribe_replaces_byte_equal_filter() {
        let mut session = detached();
        session.on_subscribe(&Subscribe {
            packet_id: 1,
            filters: vec![("a/b".into(), QoS::AtMostOnce), ("c/#".into(), QoS::AtLeastOnce)],
        });
        assert_eq!(session.subscriptions.len(), 2);

        // Re-subscribing to the same filter replaces the entry (and its QoS)
        session.on_subscribe(&Subscribe {
            packet_id: 2,
            filters: vec![("a/b".into(), QoS::ExactlyOnce)],
        });
        assert_eq!(session.subscriptions.len(), 2);
        let sub = session
            .subscriptions
            .iter()
            .find(|s| s.filter == "a/b")
            .expect("subscription present");
        assert_eq!(sub.qos, QoS::ExactlyOnce);
        // Replacement moves the filter to the end (arrival order)
        assert_eq!(session.subscriptions.last().map(|s| s.filter.as_str()), Some("a/b"));
    }

    #[test]
    fn test_unsubscribe_removes_filter() {
        let mut session = detached();
        session.on_subscribe(&Subscribe {
            packet_id: 1,
            filters: vec![("a/b".into(), QoS::AtMostOnce), ("c/#".into(), QoS::AtMostOnce)],
        });

        session.on_unsubscribe(&Unsubscribe {
            packet_id: 2,
            filters: vec!["a/b".into()],
        });
        assert_eq!(session.subscriptions.len(), 1);
        assert_eq!(session.subscriptions[0].filter, "c/#");

        // Unsubscribing an unknown filter is harmless
        session.on_unsubscribe(&Unsubscribe {
            packet_id: 3,
            filters: vec!["nope".into()],
        });
        assert_eq!(session.subscriptions.len(), 1);
    }

    #[test]
    fn test_pending_survives_forward_without_transport() {
        // A parked session accumulates QoS 1/2 fan-out for later delivery
        let mut session = detached();
        session.forward_publish(&publish(QoS::AtLeastOnce, Some(1)));
        session.forward_publish(&publish(QoS::ExactlyOnce, Some(2)));

        assert_eq!(session.qos1_pending_puback.len(), 1);
        assert_eq!(session.qos2_pending_pubrec.len(), 1);
    }
}
