//! Client-side session state.
//!
//! MQTT requires the client to hold session state symmetric to the broker's:
//! QoS 1/2 publishes it has sent but not seen through to completion, and the
//! ids of inbound QoS 2 publishes it has acknowledged with PUBREC but not yet
//! seen released. On reconnect to a persisted session the unfinished
//! exchanges are replayed in their original order.

use std::collections::VecDeque;

use bytes::Bytes;

use tern_core::packet::{Packet, Publish, QoS};

/// An outbound publish awaiting the rest of its acknowledgment flow.
#[derive(Debug, Clone)]
pub struct PendingPublish {
    pub packet_id: u16,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Where an outbound QoS 2 exchange currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2OutState {
    /// PUBLISH sent, awaiting PUBREC.
    AwaitingPubrec,
    /// PUBREC seen, PUBREL sent, awaiting PUBCOMP.
    AwaitingPubcomp,
}

#[derive(Debug, Clone)]
struct PendingQos2Out {
    publish: PendingPublish,
    state: Qos2OutState,
}

/// Client session state surviving across a persistent reconnect.
#[derive(Debug, Default)]
pub struct ClientSession {
    pending_qos1: VecDeque<PendingPublish>,
    pending_qos2_out: VecDeque<PendingQos2Out>,
    /// Inbound QoS 2 ids acknowledged with PUBREC, awaiting PUBREL.
    pending_qos2_in: VecDeque<u16>,
    /// Filters subscribed this session, with their requested QoS.
    subscriptions: Vec<(String, QoS)>,
}

impl ClientSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all state (clean-session connect).
    pub fn clear(&mut self) {
        self.pending_qos1.clear();
        self.pending_qos2_out.clear();
        self.pending_qos2_in.clear();
        self.subscriptions.clear();
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_qos1.is_empty() || !self.pending_qos2_out.is_empty()
    }

    pub fn track_publish(&mut self, pending: PendingPublish) {
        match pending.qos {
            QoS::AtLeastOnce => self.pending_qos1.push_back(pending),
            QoS::ExactlyOnce => self.pending_qos2_out.push_back(PendingQos2Out {
                publish: pending,
                state: Qos2OutState::AwaitingPubrec,
            }),
            QoS::AtMostOnce => {}
        }
    }

    /// PUBACK received; true if it matched a tracked QoS 1 publish.
    pub fn complete_qos1(&mut self, packet_id: u16) -> bool {
        match self
            .pending_qos1
            .iter()
            .position(|p| p.packet_id == packet_id)
        {
            Some(pos) => {
                self.pending_qos1.remove(pos);
                true
            }
            None => false,
        }
    }

    /// PUBREC received; advances the exchange to awaiting PUBCOMP. Returns
    /// false for an unknown or already-released id.
    pub fn qos2_received_pubrec(&mut self, packet_id: u16) -> bool {
        match self
            .pending_qos2_out
            .iter_mut()
            .find(|p| p.publish.packet_id == packet_id)
        {
            Some(pending) if pending.state == Qos2OutState::AwaitingPubrec => {
                pending.state = Qos2OutState::AwaitingPubcomp;
                true
            }
            _ => false,
        }
    }

    /// PUBCOMP received; true if it closed a tracked QoS 2 exchange.
    pub fn complete_qos2_out(&mut self, packet_id: u16) -> bool {
        match self
            .pending_qos2_out
            .iter()
            .position(|p| p.publish.packet_id == packet_id)
        {
            Some(pos) => {
                self.pending_qos2_out.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Record an inbound QoS 2 publish; false when the id is already tracked
    /// (a retransmission that must not be delivered again).
    pub fn start_qos2_inbound(&mut self, packet_id: u16) -> bool {
        if self.pending_qos2_in.contains(&packet_id) {
            return false;
        }
        self.pending_qos2_in.push_back(packet_id);
        true
    }

    /// PUBREL received; the inbound exchange is complete.
    pub fn complete_qos2_in(&mut self, packet_id: u16) {
        self.pending_qos2_in.retain(|&id| id != packet_id);
    }

    pub fn record_subscription(&mut self, filter: &str, qos: QoS) {
        match self.subscriptions.iter_mut().find(|(f, _)| f == filter) {
            Some(entry) => entry.1 = qos,
            None => self.subscriptions.push((filter.to_string(), qos)),
        }
    }

    pub fn remove_subscription(&mut self, filter: &str) {
        self.subscriptions.retain(|(f, _)| f != filter);
    }

    pub fn subscriptions(&self) -> &[(String, QoS)] {
        &self.subscriptions
    }

    /// Packets to replay after resuming a persisted session, in the order
    /// the exchanges were started: unfinished publishes go out again with
    /// DUP set, exchanges past PUBREC continue from PUBREL.
    pub fn resend_packets(&self) -> Vec<Packet> {
        let qos1 = self.pending_qos1.iter().map(|p| {
            Packet::Publish(Publish {
                dup: true,
                qos: p.qos,
                retain: p.retain,
                topic: p.topic.clone(),
                packet_id: Some(p.packet_id),
                payload: p.payload.clone(),
            })
        });

        let qos2 = self.pending_qos2_out.iter().map(|p| match p.state {
            Qos2OutState::AwaitingPubrec => Packet::Publish(Publish {
                dup: true,
                qos: p.publish.qos,
                retain: p.publish.retain,
                topic: p.publish.topic.clone(),
                packet_id: Some(p.publish.packet_id),
                payload: p.publish.payload.clone(),
            }),
            Qos2OutState::AwaitingPubcomp => Packet::Pubrel {
                packet_id: p.publish.packet_id,
            },
        });

        qos1.chain(qos2).collect()
    }
}
