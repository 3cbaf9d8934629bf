//! Polling MQTT client.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpStream as StdTcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use tern_core::packet::{
    encode, Connack, ConnackCode, Connect, Packet, Publish, QoS, Suback, SubackCode, Subscribe,
    Unsubscribe,
};
use tern_core::Framer;

use crate::error::{ClientError, Result};
use crate::packet_id::PacketIdAllocator;
use crate::session::{ClientSession, PendingPublish};

const CLIENT: Token = Token(0);
const READ_CHUNK: usize = 4096;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Remote broker address (host:port).
    pub address: String,
    /// Client identifier; empty asks the broker to assign one.
    pub client_id: String,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    /// Clean session flag.
    pub clean_session: bool,
    /// Connection timeout.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "localhost:1883".to_string(),
            client_id: String::new(),
            keep_alive: 60,
            clean_session: true,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Events surfaced to the application.
#[derive(Debug)]
pub enum ClientEvent {
    /// CONNACK accepted.
    Connected { session_present: bool },
    /// Connection is gone (peer close, error, or local disconnect).
    Disconnected { reason: Option<String> },
    /// An application message arrived.
    Message {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// SUBACK, aligned positionally with the subscribed filters.
    SubAck {
        packet_id: u16,
        return_codes: Vec<SubackCode>,
    },
    /// UNSUBACK.
    UnsubAck { packet_id: u16 },
    /// QoS 1 publish acknowledged.
    PubAck { packet_id: u16 },
    /// QoS 2 publish received by the broker (PUBREL already sent).
    PubRec { packet_id: u16 },
    /// QoS 2 exchange complete.
    PubComp { packet_id: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// MQTT client.
pub struct Client {
    config: ClientConfig,
    state: ConnectionState,
    poll: Poll,
    stream: Option<TcpStream>,
    framer: Framer,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    events: VecDeque<ClientEvent>,
    session: ClientSession,
    packet_ids: PacketIdAllocator,
    last_packet_time: Instant,
    pending_pings: u8,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let poll = Poll::new()?;

        Ok(Self {
            config,
            state: ConnectionState::Disconnected,
            poll,
            stream: None,
            framer: Framer::new(),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: Vec::with_capacity(READ_CHUNK),
            events: VecDeque::new(),
            session: ClientSession::new(),
            packet_ids: PacketIdAllocator::new(),
            last_packet_time: Instant::now(),
            pending_pings: 0,
        })
    }

    /// Open the TCP connection and send CONNECT. The CONNACK arrives later
    /// through [`Client::poll`] as a `Connected` event.
    pub fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(ClientError::InvalidState(
                "already connected or connecting".to_string(),
            ));
        }

        let addr = self
            .config
            .address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                ClientError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "could not resolve broker address",
                ))
            })?;

        let std_stream = StdTcpStream::connect_timeout(&addr, self.config.connect_timeout)?;
        std_stream.set_nonblocking(true)?;
        std_stream.set_nodelay(true)?;

        let mut stream = TcpStream::from_std(std_stream);
        self.poll
            .registry()
            .register(&mut stream, CLIENT, Interest::READABLE | Interest::WRITABLE)?;

        self.stream = Some(stream);
        self.state = ConnectionState::Connecting;

        if self.config.clean_session {
            self.session.clear();
            self.packet_ids.clear();
        }

        let connect = Connect {
            protocol_name: "MQTT".to_string(),
            protocol_level: 4,
            clean_session: self.config.clean_session,
            keep_alive: self.config.keep_alive,
            client_id: self.config.client_id.clone(),
            will: None,
            username: None,
            password: None,
        };

        self.queue(&Packet::Connect(connect))?;
        self.last_packet_time = Instant::now();
        Ok(())
    }

    /// Send DISCONNECT and close.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Disconnected {
            return Ok(());
        }

        self.queue(&Packet::Disconnect)?;
        let _ = self.flush();

        self.cleanup();
        self.events
            .push_back(ClientEvent::Disconnected { reason: None });
        Ok(())
    }

    /// Subscribe to topic filters. Returns the packet id to correlate the
    /// `SubAck` event with.
    pub fn subscribe(&mut self, filters: &[(&str, QoS)]) -> Result<u16> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let packet_id = self.allocate_packet_id()?;
        let subscribe = Subscribe {
            packet_id,
            filters: filters
                .iter()
                .map(|(filter, qos)| (filter.to_string(), *qos))
                .collect(),
        };
        for (filter, qos) in filters {
            self.session.record_subscription(filter, *qos);
        }

        self.queue(&Packet::Subscribe(subscribe))?;
        self.last_packet_time = Instant::now();
        Ok(packet_id)
    }

    /// Unsubscribe from topic filters.
    pub fn unsubscribe(&mut self, filters: &[&str]) -> Result<u16> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let packet_id = self.allocate_packet_id()?;
        let unsubscribe = Unsubscribe {
            packet_id,
            filters: filters.iter().map(|f| f.to_string()).collect(),
        };
        for filter in filters {
            self.session.remove_subscription(filter);
        }

        self.queue(&Packet::Unsubscribe(unsubscribe))?;
        self.last_packet_time = Instant::now();
        Ok(packet_id)
    }

    /// Publish a message. QoS 1/2 publishes are tracked until their
    /// acknowledgment flow completes; the returned id correlates the
    /// `PubAck`/`PubComp` events.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let packet_id = if qos != QoS::AtMostOnce {
            Some(self.allocate_packet_id()?)
        } else {
            None
        };

        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(payload),
        };

        if let Some(id) = packet_id {
            self.session.track_publish(PendingPublish {
                packet_id: id,
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
                qos,
                retain,
            });
        }

        self.queue(&Packet::Publish(publish))?;
        self.last_packet_time = Instant::now();
        Ok(packet_id)
    }

    /// Pump I/O for up to `timeout`. Returns true when events are queued.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if !self.write_buf.is_empty() {
            self.flush()?;
        }

        self.check_keep_alive()?;

        let mut events = Events::with_capacity(16);
        match self.poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        for event in events.iter() {
            if event.token() == CLIENT {
                if event.is_readable() || event.is_read_closed() {
                    self.handle_read()?;
                }
                if event.is_writable() {
                    self.flush()?;
                }
            }
        }

        Ok(!self.events.is_empty())
    }

    /// Get the next queued event, if any.
    pub fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    // === Internal methods ===

    fn allocate_packet_id(&mut self) -> Result<u16> {
        self.packet_ids
            .allocate()
            .ok_or_else(|| ClientError::InvalidState("no free packet ids".to_string()))
    }

    fn queue(&mut self, packet: &Packet) -> Result<()> {
        encode(packet, &mut self.write_buf)?;
        self.flush()
    }

    fn check_keep_alive(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connected || self.config.keep_alive == 0 {
            return Ok(());
        }

        let interval = Duration::from_secs(self.config.keep_alive as u64);
        if self.last_packet_time.elapsed() < interval {
            return Ok(());
        }

        if self.pending_pings >= 2 {
            warn!("no PINGRESP from broker, dropping connection");
            self.cleanup();
            self.events.push_back(ClientEvent::Disconnected {
                reason: Some("keep-alive timeout".to_string()),
            });
            return Ok(());
        }

        self.queue(&Packet::Pingreq)?;
        self.pending_pings += 1;
        self.last_packet_time = Instant::now();
        Ok(())
    }

    fn handle_read(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        let mut chunk = [0u8; READ_CHUNK];
        let mut peer_closed = false;
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ClientError::Io(e)),
            }
        }

        while let Some(packet) = self.framer.next_packet(&mut self.read_buf)? {
            self.handle_packet(packet)?;
        }

        if peer_closed && self.state != ConnectionState::Disconnected {
            self.cleanup();
            self.events.push_back(ClientEvent::Disconnected {
                reason: Some("connection closed by broker".to_string()),
            });
        }
        Ok(())
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        trace!("received {:?}", packet);
        self.last_packet_time = Instant::now();

        match packet {
            Packet::Connack(connack) => self.handle_connack(connack),
            Packet::Publish(publish) => self.handle_publish(publish),
            Packet::Puback { packet_id } => {
                if self.session.complete_qos1(packet_id) {
                    self.packet_ids.release(packet_id);
                }
                self.events.push_back(ClientEvent::PubAck { packet_id });
                Ok(())
            }
            Packet::Pubrec { packet_id } => {
                // QoS 2 step 2: release the publish
                self.session.qos2_received_pubrec(packet_id);
                self.queue(&Packet::Pubrel { packet_id })?;
                self.events.push_back(ClientEvent::PubRec { packet_id });
                Ok(())
            }
            Packet::Pubrel { packet_id } => {
                // QoS 2 inbound completion
                self.session.complete_qos2_in(packet_id);
                self.queue(&Packet::Pubcomp { packet_id })?;
                Ok(())
            }
            Packet::Pubcomp { packet_id } => {
                if self.session.complete_qos2_out(packet_id) {
                    self.packet_ids.release(packet_id);
                }
                self.events.push_back(ClientEvent::PubComp { packet_id });
                Ok(())
            }
            Packet::Suback(suback) => self.handle_suback(suback),
            Packet::Unsuback { packet_id } => {
                self.packet_ids.release(packet_id);
                self.events.push_back(ClientEvent::UnsubAck { packet_id });
                Ok(())
            }
            Packet::Pingresp => {
                self.pending_pings = 0;
                Ok(())
            }
            other => {
                debug!("ignoring unexpected packet from broker: {:?}", other);
                Ok(())
            }
        }
    }

    fn handle_connack(&mut self, connack: Connack) -> Result<()> {
        if connack.return_code != ConnackCode::Accepted {
            let reason = format!("{:?}", connack.return_code);
            self.cleanup();
            return Err(ClientError::ConnectionRefused(reason));
        }

        self.state = ConnectionState::Connected;

        if connack.session_present {
            // Resuming a persisted session: replay the unfinished exchanges
            // in their original order, publishes flagged as duplicates.
            for packet in self.session.resend_packets() {
                self.queue(&packet)?;
            }
        } else {
            // The broker holds no state for us; ours is void too.
            self.session.clear();
            self.packet_ids.clear();
        }

        self.events.push_back(ClientEvent::Connected {
            session_present: connack.session_present,
        });
        Ok(())
    }

    fn handle_publish(&mut self, publish: Publish) -> Result<()> {
        let deliver = match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => true,
            (QoS::AtLeastOnce, Some(packet_id)) => {
                self.queue(&Packet::Puback { packet_id })?;
                true
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                // Deliver only the first arrival of this id; always PUBREC
                let first = self.session.start_qos2_inbound(packet_id);
                self.queue(&Packet::Pubrec { packet_id })?;
                first
            }
            _ => {
                debug!("publish with missing packet id, dropping");
                false
            }
        };

        if deliver {
            self.events.push_back(ClientEvent::Message {
                topic: publish.topic,
                payload: publish.payload,
                qos: publish.qos,
                retain: publish.retain,
            });
        }
        Ok(())
    }

    fn handle_suback(&mut self, suback: Suback) -> Result<()> {
        self.packet_ids.release(suback.packet_id);
        self.events.push_back(ClientEvent::SubAck {
            packet_id: suback.packet_id,
            return_codes: suback.return_codes,
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        let mut written = 0;
        while written < self.write_buf.len() {
            match stream.write(&self.write_buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ClientError::Io(e)),
            }
        }
        self.write_buf.drain(..written);
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = self.poll.registry().deregister(&mut stream);
        }
        self.state = ConnectionState::Disconnected;
        self.framer = Framer::new();
        self.read_buf.clear();
        self.write_buf.clear();
        self.pending_pings = 0;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
