//! Session registry and packet dispatch.
//!
//! The registry owns every broker session, live and parked, in insertion
//! order. It runs the broker half of the MQTT state machine: the CONNECT
//! flow (including takeover of a persisted session), publish fan-out across
//! subscriptions, and the QoS acknowledgment exchanges. Everything here is
//! called from the single event-loop thread, so no state needs locking.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use log::{debug, info, warn};
use mio::net::TcpStream;
use mio::Token;

use tern_core::packet::{Connack, ConnackCode, Connect, Packet, Publish, QoS};
use tern_core::topic;

use crate::auth::Authorizer;
use crate::session::{BrokerSession, SessionState};

/// Why a transport went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// Clean EOF from the peer.
    ConnectionClosed,
    /// Socket-level failure.
    NetworkError,
    /// Keep-alive deadline missed.
    Timeout,
}

/// All broker sessions, keyed by a monotonic serial so iteration follows
/// insertion order (the fan-out order contract).
pub struct SessionRegistry {
    sessions: BTreeMap<u64, BrokerSession>,
    by_token: AHashMap<Token, u64>,
    next_serial: u64,
    auth: Box<dyn Authorizer>,
    max_packet_size: usize,
}

impl SessionRegistry {
    pub fn new(auth: Box<dyn Authorizer>, max_packet_size: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            by_token: AHashMap::new(),
            next_serial: 0,
            auth,
            max_packet_size,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Register a freshly accepted connection as a session awaiting CONNECT.
    pub fn accept(&mut self, token: Token, transport: TcpStream) {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.sessions.insert(
            serial,
            BrokerSession::new(token, Some(transport), self.max_packet_size),
        );
        self.by_token.insert(token, serial);
        debug!("accepted connection, {} session(s)", self.sessions.len());
    }

    /// Drain readable bytes for this token and run every complete packet
    /// through the state machine. Codec and framing errors are fatal for the
    /// connection; a clean EOF is handled after buffered packets.
    pub fn handle_readable(&mut self, token: Token) {
        let Some(&serial) = self.by_token.get(&token) else {
            return;
        };

        {
            let Some(session) = self.sessions.get_mut(&serial) else {
                return;
            };
            if let Err(e) = session.read() {
                debug!("[{}] read error: {}", session.client_id, e);
                self.transport_event(token, TransportEvent::NetworkError);
                return;
            }
        }

        loop {
            // Re-resolve every iteration: a takeover re-homes the token and a
            // disconnect can erase the session mid-loop.
            let Some(&serial) = self.by_token.get(&token) else {
                return;
            };
            let Some(session) = self.sessions.get_mut(&serial) else {
                return;
            };
            if session.state == SessionState::Disconnecting {
                return;
            }

            match session.next_packet() {
                Ok(Some(packet)) => {
                    session.last_packet_time = std::time::Instant::now();
                    self.handle_packet(token, packet);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("[{}] protocol error: {}", session.client_id, e);
                    session.state = SessionState::Disconnecting;
                    return;
                }
            }
        }

        let Some(&serial) = self.by_token.get(&token) else {
            return;
        };
        let peer_closed = self
            .sessions
            .get(&serial)
            .is_some_and(|s| s.peer_closed);
        if peer_closed {
            self.transport_event(token, TransportEvent::ConnectionClosed);
        }
    }

    /// Flush buffered writes for this token (writable readiness).
    pub fn handle_writable(&mut self, token: Token) {
        let Some(&serial) = self.by_token.get(&token) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&serial) else {
            return;
        };
        if let Err(e) = session.flush() {
            debug!("[{}] flush failed: {}", session.client_id, e);
            session.state = SessionState::Disconnecting;
        }
    }

    /// Run one decoded packet through the broker state machine.
    pub fn handle_packet(&mut self, token: Token, packet: Packet) {
        let Some(&serial) = self.by_token.get(&token) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&serial) else {
            return;
        };

        // The first packet on a connection must be CONNECT, and CONNECT must
        // not be repeated.
        match (&packet, session.state) {
            (Packet::Connect(_), SessionState::AwaitingConnect) => {}
            (Packet::Connect(_), _) => {
                warn!("[{}] repeated CONNECT", session.client_id);
                session.state = SessionState::Disconnecting;
                return;
            }
            (_, SessionState::AwaitingConnect) => {
                warn!("first packet was not CONNECT");
                session.state = SessionState::Disconnecting;
                return;
            }
            _ => {}
        }

        match packet {
            Packet::Connect(connect) => {
                // CONNECT manages its own pending drain (on resume), so it
                // skips the post-packet tick below.
                self.handle_connect(token, serial, connect);
                return;
            }
            Packet::Publish(publish) => self.handle_publish(serial, publish),
            Packet::Puback { packet_id } => session.on_puback(packet_id),
            Packet::Pubrec { packet_id } => session.on_pubrec(packet_id),
            Packet::Pubrel { packet_id } => session.on_pubrel(packet_id),
            Packet::Pubcomp { packet_id } => session.on_pubcomp(packet_id),
            Packet::Subscribe(subscribe) => session.on_subscribe(&subscribe),
            Packet::Unsubscribe(unsubscribe) => session.on_unsubscribe(&unsubscribe),
            Packet::Pingreq => session.on_pingreq(),
            Packet::Disconnect => {
                info!("[{}] disconnect", session.client_id);
                session.graceful_disconnect = true;
                session.state = SessionState::Disconnecting;
                return;
            }
            Packet::Connack(_) | Packet::Suback(_) | Packet::Unsuback { .. } | Packet::Pingresp => {
                // Server-to-client packets have no business arriving here.
                warn!("[{}] client sent a server packet", session.client_id);
                session.state = SessionState::Disconnecting;
                return;
            }
        }

        if let Some(session) = self.sessions.get_mut(&serial) {
            session.send_pending_message();
        }
    }

    fn handle_connect(&mut self, token: Token, serial: u64, connect: Connect) {
        if !self.auth.authorize_connection(&connect) {
            info!("connection from {:?} not authorized", connect.client_id);
            if let Some(session) = self.sessions.get_mut(&serial) {
                session.send(&Packet::Connack(Connack {
                    session_present: false,
                    return_code: ConnackCode::NotAuthorized,
                }));
                session.state = SessionState::Disconnecting;
            }
            return;
        }

        let client_id = if connect.client_id.is_empty() {
            if !connect.clean_session {
                // A persistent session needs a stable identity.
                if let Some(session) = self.sessions.get_mut(&serial) {
                    session.send(&Packet::Connack(Connack {
                        session_present: false,
                        return_code: ConnackCode::IdentifierRejected,
                    }));
                    session.state = SessionState::Disconnecting;
                }
                return;
            }
            generate_client_id(token)
        } else {
            connect.client_id.clone()
        };

        if connect.clean_session {
            // Forget any prior state held under this identity.
            self.erase_by_client_id(&client_id, Some(serial));
        } else if let Some(found_serial) = self.find_by_client_id(&client_id, serial) {
            self.resume_session(found_serial, serial, token, &connect);
            return;
        }

        let Some(session) = self.sessions.get_mut(&serial) else {
            return;
        };
        session.client_id = client_id;
        session.clean_session = connect.clean_session;
        session.keep_alive = connect.keep_alive;
        session.state = SessionState::Connected;
        info!(
            "[{}] connected (clean_session={}, keep_alive={}s)",
            session.client_id, session.clean_session, session.keep_alive
        );
        session.send(&Packet::Connack(Connack {
            session_present: false,
            return_code: ConnackCode::Accepted,
        }));
    }

    /// Re-parent the skeleton's transport into the persisted session and
    /// discard the skeleton. The resumed session confirms with
    /// `session_present=true` and starts draining its backlog.
    fn resume_session(
        &mut self,
        found_serial: u64,
        skeleton_serial: u64,
        token: Token,
        connect: &Connect,
    ) {
        let Some(skeleton) = self.sessions.remove(&skeleton_serial) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&found_serial) else {
            return;
        };

        // If the persisted session somehow still holds a live transport,
        // adopt_transport_from closes it before installing the new one.
        if session.has_transport() {
            self.by_token.remove(&session.token);
        }

        session.adopt_transport_from(skeleton);
        session.keep_alive = connect.keep_alive;
        session.state = SessionState::Connected;
        self.by_token.insert(token, found_serial);

        info!(
            "[{}] session resumed ({} pending qos1, {} pending qos2)",
            session.client_id,
            session.qos1_pending_puback.len(),
            session.qos2_pending_pubrec.len()
        );

        session.send(&Packet::Connack(Connack {
            session_present: true,
            return_code: ConnackCode::Accepted,
        }));
        session.send_pending_message();
    }

    fn handle_publish(&mut self, serial: u64, publish: Publish) {
        match publish.qos {
            QoS::AtMostOnce => {
                self.fanout(&publish);
            }
            QoS::AtLeastOnce => {
                let Some(packet_id) = publish.packet_id else {
                    self.protocol_violation(serial, "QoS 1 PUBLISH without packet id");
                    return;
                };
                self.fanout(&publish);
                if let Some(session) = self.sessions.get_mut(&serial) {
                    session.send(&Packet::Puback { packet_id });
                }
            }
            QoS::ExactlyOnce => {
                let Some(packet_id) = publish.packet_id else {
                    self.protocol_violation(serial, "QoS 2 PUBLISH without packet id");
                    return;
                };

                // Exactly-once under retransmission: fan out only the first
                // delivery of this id, but always answer with PUBREC.
                let first_delivery = {
                    let Some(session) = self.sessions.get_mut(&serial) else {
                        return;
                    };
                    let seen = session.qos2_pending_pubrel.contains(&packet_id);
                    if !seen {
                        session.qos2_pending_pubrel.push_back(packet_id);
                    }
                    !seen
                };

                if first_delivery {
                    self.fanout(&publish);
                }
                if let Some(session) = self.sessions.get_mut(&serial) {
                    session.send(&Packet::Pubrec { packet_id });
                }
            }
        }
    }

    /// Forward a publish to every session whose subscriptions match, in
    /// registry insertion order. A session with several matching filters
    /// receives one copy per match.
    fn fanout(&mut self, publish: &Publish) {
        for session in self.sessions.values_mut() {
            let matches = session
                .subscriptions
                .iter()
                .filter(|s| topic::matches(&s.filter, &publish.topic))
                .count();
            for _ in 0..matches {
                session.forward_publish(publish);
            }
        }
    }

    fn protocol_violation(&mut self, serial: u64, what: &str) {
        if let Some(session) = self.sessions.get_mut(&serial) {
            warn!("[{}] protocol violation: {}", session.client_id, what);
            session.state = SessionState::Disconnecting;
        }
    }

    /// The transport died underneath the session. Clean sessions (and
    /// connections that never completed CONNECT) are erased; persistent
    /// sessions park until the client returns.
    pub fn transport_event(&mut self, token: Token, event: TransportEvent) {
        let Some(serial) = self.by_token.remove(&token) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&serial) else {
            return;
        };

        debug!("[{}] transport event: {:?}", session.client_id, event);
        session.drop_transport();

        if session.clean_session || session.client_id.is_empty() {
            self.sessions.remove(&serial);
            info!("session erased, {} remaining", self.sessions.len());
        } else {
            session.state = SessionState::Connected;
            info!("[{}] session persisted", session.client_id);
        }
    }

    /// Tear down sessions marked `Disconnecting`: flush what we can, close
    /// the transport, then erase or park by the clean-session rule.
    pub fn cleanup(&mut self) {
        let pending: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state == SessionState::Disconnecting)
            .map(|(&serial, _)| serial)
            .collect();

        for serial in pending {
            let Some(session) = self.sessions.get_mut(&serial) else {
                continue;
            };
            self.by_token.remove(&session.token);
            session.drop_transport();

            if session.clean_session || session.client_id.is_empty() {
                self.sessions.remove(&serial);
                info!("session erased, {} remaining", self.sessions.len());
            } else {
                session.state = SessionState::Connected;
                info!("[{}] session persisted", session.client_id);
            }
        }
    }

    /// Close connections idle past 1.5x their advertised keep-alive.
    pub fn sweep_keep_alive(&mut self) {
        for session in self.sessions.values_mut() {
            if !session.has_transport()
                || session.state != SessionState::Connected
                || session.keep_alive == 0
            {
                continue;
            }
            let deadline = std::time::Duration::from_millis(session.keep_alive as u64 * 1500);
            if session.last_packet_time.elapsed() > deadline {
                warn!(
                    "[{}] keep-alive timeout ({}s)",
                    session.client_id, session.keep_alive
                );
                session.state = SessionState::Disconnecting;
            }
        }
    }

    fn find_by_client_id(&self, client_id: &str, exclude: u64) -> Option<u64> {
        self.sessions
            .iter()
            .find(|(&serial, s)| {
                serial != exclude && !s.client_id.is_empty() && s.client_id == client_id
            })
            .map(|(&serial, _)| serial)
    }

    fn erase_by_client_id(&mut self, client_id: &str, exclude: Option<u64>) {
        let doomed: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(&serial, s)| {
                Some(serial) != exclude && !s.client_id.is_empty() && s.client_id == client_id
            })
            .map(|(&serial, _)| serial)
            .collect();

        for serial in doomed {
            if let Some(session) = self.sessions.remove(&serial) {
                self.by_token.remove(&session.token);
                info!("[{}] prior session erased", session.client_id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn session_by_client_id(&self, client_id: &str) -> Option<&BrokerSession> {
        self.sessions
            .values()
            .find(|s| s.client_id == client_id)
    }

    #[cfg(test)]
    pub(crate) fn insert_detached_for_test(&mut self, session: BrokerSession) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.by_token.insert(session.token, serial);
        self.sessions.insert(serial, session);
        serial
    }
}

/// Generate a client id for an anonymous clean-session client.
pub fn generate_client_id(token: Token) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("tern-{}-{:08x}", token.0, nanos)
}
