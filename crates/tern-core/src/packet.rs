//! MQTT 3.1.1 control packet types and codec.
//!
//! Every packet is a fixed header (type nibble | flags nibble), a
//! remaining-length integer, then a variable header and payload of exactly
//! that many bytes. [`decode`] parses one complete frame into a [`Packet`];
//! [`encode`] writes a [`Packet`] back out. Both directions exist for every
//! type since the broker and the client each speak both halves of the
//! protocol.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::topic;
use crate::varint;

/// MQTT control packet types (4 bits, wire values 1..=14).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::UnknownType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT spec names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQos(value)),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnackCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::UnacceptableProtocolVersion),
            2 => Ok(ConnackCode::IdentifierRejected),
            3 => Ok(ConnackCode::ServerUnavailable),
            4 => Ok(ConnackCode::BadUsernamePassword),
            5 => Ok(ConnackCode::NotAuthorized),
            _ => Err(ProtocolError::InvalidReturnCode(value)),
        }
    }
}

/// SUBACK per-filter return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubackCode {
    SuccessQos0 = 0x00,
    SuccessQos1 = 0x01,
    SuccessQos2 = 0x02,
    Failure = 0x80,
}

impl SubackCode {
    /// The success code granting the given QoS.
    pub fn granted(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => SubackCode::SuccessQos0,
            QoS::AtLeastOnce => SubackCode::SuccessQos1,
            QoS::ExactlyOnce => SubackCode::SuccessQos2,
        }
    }
}

impl TryFrom<u8> for SubackCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00 => Ok(SubackCode::SuccessQos0),
            0x01 => Ok(SubackCode::SuccessQos1),
            0x02 => Ok(SubackCode::SuccessQos2),
            0x80 => Ok(SubackCode::Failure),
            _ => Err(ProtocolError::InvalidSubackCode(value)),
        }
    }
}

/// MQTT packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// Will message configuration carried in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub return_code: ConnackCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present iff qos > 0.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    /// Topic filters with their requested QoS, in arrival order.
    pub filters: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    /// Positionally aligned with the SUBSCRIBE's filter list.
    pub return_codes: Vec<SubackCode>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// Cursor over a packet body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn consumed(&self) -> usize {
        self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(ProtocolError::ShortRead { needed: 1, have: 0 }.into());
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::ShortRead {
                needed: 2,
                have: self.remaining(),
            }
            .into());
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::ShortRead {
                needed: len,
                have: self.remaining(),
            }
            .into());
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    fn take_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}

/// Decode one complete frame into a packet.
///
/// The frame must contain exactly one packet, fixed header included. The
/// declared remaining length is checked against the frame size and the fixed
/// flag nibble against the per-type constraint. All errors are fatal for the
/// connection the frame arrived on.
pub fn decode(frame: &[u8]) -> Result<Packet> {
    if frame.is_empty() {
        return Err(ProtocolError::ShortRead { needed: 2, have: 0 }.into());
    }

    let packet_type_raw = frame[0] >> 4;
    let flags = frame[0] & 0x0F;
    let packet_type = PacketType::try_from(packet_type_raw)?;

    let Some((remaining_len, len_bytes)) = varint::decode(&frame[1..])? else {
        return Err(ProtocolError::ShortRead {
            needed: 2,
            have: frame.len(),
        }
        .into());
    };
    let header_len = 1 + len_bytes;

    if remaining_len != frame.len() - header_len {
        return Err(ProtocolError::LengthMismatch {
            declared: remaining_len,
            actual: frame.len() - header_len,
        }
        .into());
    }

    // Fixed flag constraints: 0x02 for PUBREL/SUBSCRIBE/UNSUBSCRIBE, free for
    // PUBLISH (dup/qos/retain), zero for everything else.
    match packet_type {
        PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe => {
            if flags != 0x02 {
                return Err(ProtocolError::InvalidFlags {
                    packet_type: packet_type_raw,
                    flags,
                }
                .into());
            }
        }
        PacketType::Publish => {}
        _ => {
            if flags != 0 {
                return Err(ProtocolError::InvalidFlags {
                    packet_type: packet_type_raw,
                    flags,
                }
                .into());
            }
        }
    }

    let body = &frame[header_len..];
    let mut r = Reader::new(body);

    let packet = match packet_type {
        PacketType::Connect => decode_connect(&mut r)?,
        PacketType::Connack => decode_connack(&mut r)?,
        PacketType::Publish => decode_publish(flags, &mut r)?,
        PacketType::Puback => Packet::Puback {
            packet_id: r.read_u16()?,
        },
        PacketType::Pubrec => Packet::Pubrec {
            packet_id: r.read_u16()?,
        },
        PacketType::Pubrel => Packet::Pubrel {
            packet_id: r.read_u16()?,
        },
        PacketType::Pubcomp => Packet::Pubcomp {
            packet_id: r.read_u16()?,
        },
        PacketType::Subscribe => decode_subscribe(&mut r)?,
        PacketType::Suback => decode_suback(&mut r)?,
        PacketType::Unsubscribe => decode_unsubscribe(&mut r)?,
        PacketType::Unsuback => Packet::Unsuback {
            packet_id: r.read_u16()?,
        },
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => Packet::Disconnect,
    };

    if r.remaining() != 0 {
        return Err(ProtocolError::LengthMismatch {
            declared: body.len(),
            actual: r.consumed(),
        }
        .into());
    }

    Ok(packet)
}

fn decode_connect(r: &mut Reader) -> Result<Packet> {
    let protocol_name = r.read_string()?;
    if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
        return Err(ProtocolError::InvalidProtocolName(protocol_name).into());
    }

    let protocol_level = r.read_u8()?;
    if protocol_level != 3 && protocol_level != 4 {
        return Err(ProtocolError::UnsupportedProtocolLevel(protocol_level).into());
    }

    let flags = r.read_u8()?;
    // Reserved bit must be 0
    if (flags & 0x01) != 0 {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }
    let clean_session = (flags & 0x02) != 0;
    let will_flag = (flags & 0x04) != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = (flags & 0x20) != 0;
    let password_flag = (flags & 0x40) != 0;
    let username_flag = (flags & 0x80) != 0;

    // Will QoS and Will Retain must be 0 when the Will Flag is 0
    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }

    // Password Flag requires Username Flag
    if !username_flag && password_flag {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }

    let keep_alive = r.read_u16()?;
    let client_id = r.read_string()?;

    let will = if will_flag {
        let topic = r.read_string()?;
        topic::validate_name(&topic)?;
        let message = r.read_binary()?;
        Some(Will {
            topic,
            message,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(r.read_string()?)
    } else {
        None
    };

    let password = if password_flag {
        Some(r.read_binary()?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        protocol_name,
        protocol_level,
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn decode_connack(r: &mut Reader) -> Result<Packet> {
    let ack_flags = r.read_u8()?;
    // Bits 7-1 of the acknowledge flags are reserved
    if ack_flags & !0x01 != 0 {
        return Err(ProtocolError::MalformedPacket(format!(
            "reserved CONNACK acknowledge flags set: {:#04x}",
            ack_flags
        ))
        .into());
    }
    let return_code = ConnackCode::try_from(r.read_u8()?)?;
    Ok(Packet::Connack(Connack {
        session_present: ack_flags & 0x01 != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, r: &mut Reader) -> Result<Packet> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    let topic = r.read_string()?;
    topic::validate_name(&topic)?;

    let packet_id = if qos != QoS::AtMostOnce {
        Some(r.read_u16()?)
    } else {
        None
    };

    let payload = Bytes::copy_from_slice(r.take_rest());

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
    }))
}

fn decode_subscribe(r: &mut Reader) -> Result<Packet> {
    let packet_id = r.read_u16()?;

    let mut filters = Vec::new();
    while r.remaining() > 0 {
        let filter = r.read_string()?;
        topic::validate_filter(&filter)?;
        let qos = QoS::try_from(r.read_u8()?)?;
        filters.push((filter, qos));
    }

    if filters.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBSCRIBE with no topic filters".into()).into());
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(r: &mut Reader) -> Result<Packet> {
    let packet_id = r.read_u16()?;

    let mut return_codes = Vec::new();
    while r.remaining() > 0 {
        return_codes.push(SubackCode::try_from(r.read_u8()?)?);
    }

    if return_codes.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBACK with no return codes".into()).into());
    }

    Ok(Packet::Suback(Suback {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(r: &mut Reader) -> Result<Packet> {
    let packet_id = r.read_u16()?;

    let mut filters = Vec::new();
    while r.remaining() > 0 {
        let filter = r.read_string()?;
        topic::validate_filter(&filter)?;
        filters.push(filter);
    }

    if filters.is_empty() {
        return Err(
            ProtocolError::MalformedPacket("UNSUBSCRIBE with no topic filters".into()).into(),
        );
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

/// Encode a packet, appending its wire form to the buffer.
pub fn encode(packet: &Packet, buf: &mut Vec<u8>) -> Result<()> {
    match packet {
        Packet::Connect(connect) => encode_connect(connect, buf),
        Packet::Connack(connack) => {
            buf.push((PacketType::Connack as u8) << 4);
            buf.push(2);
            buf.push(connack.session_present as u8);
            buf.push(connack.return_code as u8);
            Ok(())
        }
        Packet::Publish(publish) => encode_publish(publish, buf),
        Packet::Puback { packet_id } => {
            encode_ack(PacketType::Puback, 0x00, *packet_id, buf);
            Ok(())
        }
        Packet::Pubrec { packet_id } => {
            encode_ack(PacketType::Pubrec, 0x00, *packet_id, buf);
            Ok(())
        }
        Packet::Pubrel { packet_id } => {
            encode_ack(PacketType::Pubrel, 0x02, *packet_id, buf);
            Ok(())
        }
        Packet::Pubcomp { packet_id } => {
            encode_ack(PacketType::Pubcomp, 0x00, *packet_id, buf);
            Ok(())
        }
        Packet::Subscribe(subscribe) => encode_subscribe(subscribe, buf),
        Packet::Suback(suback) => encode_suback(suback, buf),
        Packet::Unsubscribe(unsubscribe) => encode_unsubscribe(unsubscribe, buf),
        Packet::Unsuback { packet_id } => {
            encode_ack(PacketType::Unsuback, 0x00, *packet_id, buf);
            Ok(())
        }
        Packet::Pingreq => {
            buf.push((PacketType::Pingreq as u8) << 4);
            buf.push(0);
            Ok(())
        }
        Packet::Pingresp => {
            buf.push((PacketType::Pingresp as u8) << 4);
            buf.push(0);
            Ok(())
        }
        Packet::Disconnect => {
            buf.push((PacketType::Disconnect as u8) << 4);
            buf.push(0);
            Ok(())
        }
    }
}

fn encode_ack(packet_type: PacketType, flags: u8, packet_id: u16, buf: &mut Vec<u8>) {
    buf.push(((packet_type as u8) << 4) | flags);
    buf.push(2);
    buf.extend_from_slice(&packet_id.to_be_bytes());
}

fn write_string(s: &str, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn write_binary(b: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(b.len() as u16).to_be_bytes());
    buf.extend_from_slice(b);
}

fn encode_connect(connect: &Connect, buf: &mut Vec<u8>) -> Result<()> {
    let mut body = Vec::new();

    write_string(&connect.protocol_name, &mut body);
    body.push(connect.protocol_level);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(ref will) = connect.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.push(flags);

    body.extend_from_slice(&connect.keep_alive.to_be_bytes());
    write_string(&connect.client_id, &mut body);

    if let Some(ref will) = connect.will {
        write_string(&will.topic, &mut body);
        write_binary(&will.message, &mut body);
    }
    if let Some(ref username) = connect.username {
        write_string(username, &mut body);
    }
    if let Some(ref password) = connect.password {
        write_binary(password, &mut body);
    }

    buf.push((PacketType::Connect as u8) << 4);
    varint::encode(body.len(), buf)?;
    buf.extend_from_slice(&body);
    Ok(())
}

fn encode_publish(publish: &Publish, buf: &mut Vec<u8>) -> Result<()> {
    if publish.qos != QoS::AtMostOnce && publish.packet_id.is_none() {
        return Err(
            ProtocolError::MalformedPacket("QoS > 0 PUBLISH without packet id".into()).into(),
        );
    }

    let mut fixed = (PacketType::Publish as u8) << 4;
    if publish.dup {
        fixed |= 0x08;
    }
    fixed |= (publish.qos as u8) << 1;
    if publish.retain {
        fixed |= 0x01;
    }
    buf.push(fixed);

    let packet_id_len = if publish.qos != QoS::AtMostOnce { 2 } else { 0 };
    let remaining = 2 + publish.topic.len() + packet_id_len + publish.payload.len();
    varint::encode(remaining, buf)?;

    write_string(&publish.topic, buf);
    if publish.qos != QoS::AtMostOnce {
        if let Some(id) = publish.packet_id {
            buf.extend_from_slice(&id.to_be_bytes());
        }
    }
    buf.extend_from_slice(&publish.payload);
    Ok(())
}

fn encode_subscribe(subscribe: &Subscribe, buf: &mut Vec<u8>) -> Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(&subscribe.packet_id.to_be_bytes());
    for (filter, qos) in &subscribe.filters {
        write_string(filter, &mut body);
        body.push(*qos as u8);
    }

    buf.push(((PacketType::Subscribe as u8) << 4) | 0x02);
    varint::encode(body.len(), buf)?;
    buf.extend_from_slice(&body);
    Ok(())
}

fn encode_suback(suback: &Suback, buf: &mut Vec<u8>) -> Result<()> {
    let remaining = 2 + suback.return_codes.len();
    buf.push((PacketType::Suback as u8) << 4);
    varint::encode(remaining, buf)?;
    buf.extend_from_slice(&suback.packet_id.to_be_bytes());
    for code in &suback.return_codes {
        buf.push(*code as u8);
    }
    Ok(())
}

fn encode_unsubscribe(unsubscribe: &Unsubscribe, buf: &mut Vec<u8>) -> Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(&unsubscribe.packet_id.to_be_bytes());
    for filter in &unsubscribe.filters {
        write_string(filter, &mut body);
    }

    buf.push(((PacketType::Unsubscribe as u8) << 4) | 0x02);
    varint::encode(body.len(), buf)?;
    buf.extend_from_slice(&body);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn roundtrip(packet: Packet) -> Packet {
        let mut buf = Vec::new();
        encode(&packet, &mut buf).unwrap();
        let decoded = decode(&buf).unwrap();
        assert_eq!(packet, decoded);
        decoded
    }

    fn protocol_err(result: Result<Packet>) -> ProtocolError {
        match result {
            Err(Error::Protocol(e)) => e,
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_roundtrip_full() {
        roundtrip(Packet::Connect(Connect {
            protocol_name: "MQIsdp".into(),
            protocol_level: 4,
            clean_session: true,
            keep_alive: 60,
            client_id: "client1".into(),
            will: Some(Will {
                topic: "will".into(),
                message: (0..=9).collect(),
                qos: QoS::ExactlyOnce,
                retain: true,
            }),
            username: Some("u".into()),
            password: Some(vec![9, 8, 7, 6, 5, 4, 3, 2, 1, 0]),
        }));
    }

    #[test]
    fn test_connect_roundtrip_minimal() {
        roundtrip(Packet::Connect(Connect {
            protocol_name: "MQTT".into(),
            protocol_level: 4,
            clean_session: false,
            keep_alive: 0,
            client_id: String::new(),
            will: None,
            username: None,
            password: None,
        }));
    }

    #[test]
    fn test_connack_roundtrip() {
        roundtrip(Packet::Connack(Connack {
            session_present: true,
            return_code: ConnackCode::Accepted,
        }));
        roundtrip(Packet::Connack(Connack {
            session_present: false,
            return_code: ConnackCode::IdentifierRejected,
        }));
    }

    #[test]
    fn test_publish_roundtrip() {
        roundtrip(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "a/b/c".into(),
            packet_id: None,
            payload: Bytes::from_static(b"test message"),
        }));
        roundtrip(Packet::Publish(Publish {
            dup: true,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: "a".into(),
            packet_id: Some(7),
            payload: Bytes::new(),
        }));
        roundtrip(Packet::Publish(Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: "x/y".into(),
            packet_id: Some(65535),
            payload: Bytes::from_static(&[0, 1, 2, 3]),
        }));
    }

    #[test]
    fn test_ack_roundtrips() {
        roundtrip(Packet::Puback { packet_id: 1 });
        roundtrip(Packet::Pubrec { packet_id: 2 });
        roundtrip(Packet::Pubrel { packet_id: 3 });
        roundtrip(Packet::Pubcomp { packet_id: 4 });
        roundtrip(Packet::Unsuback { packet_id: 5 });
    }

    #[test]
    fn test_subscribe_roundtrip() {
        roundtrip(Packet::Subscribe(Subscribe {
            packet_id: 10,
            filters: vec![
                ("a/b/c".into(), QoS::AtMostOnce),
                ("a/#".into(), QoS::ExactlyOnce),
                ("+/b".into(), QoS::AtLeastOnce),
            ],
        }));
    }

    #[test]
    fn test_suback_roundtrip() {
        roundtrip(Packet::Suback(Suback {
            packet_id: 10,
            return_codes: vec![
                SubackCode::SuccessQos0,
                SubackCode::SuccessQos2,
                SubackCode::Failure,
            ],
        }));
    }

    #[test]
    fn test_unsubscribe_roundtrip() {
        roundtrip(Packet::Unsubscribe(Unsubscribe {
            packet_id: 11,
            filters: vec!["a/b".into(), "#".into()],
        }));
    }

    #[test]
    fn test_empty_packets_roundtrip() {
        roundtrip(Packet::Pingreq);
        roundtrip(Packet::Pingresp);
        roundtrip(Packet::Disconnect);
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(
            protocol_err(decode(&[0x00, 0x00])),
            ProtocolError::UnknownType(0)
        );
        assert_eq!(
            protocol_err(decode(&[0xF0, 0x00])),
            ProtocolError::UnknownType(15)
        );
    }

    #[test]
    fn test_invalid_fixed_flags() {
        // PUBREL with flags 0x00
        assert!(matches!(
            protocol_err(decode(&[0x60, 0x02, 0x00, 0x01])),
            ProtocolError::InvalidFlags { .. }
        ));
        // PINGREQ with flags 0x01
        assert!(matches!(
            protocol_err(decode(&[0xC1, 0x00])),
            ProtocolError::InvalidFlags { .. }
        ));
        // SUBSCRIBE with flags 0x00
        let mut buf = Vec::new();
        encode(
            &Packet::Subscribe(Subscribe {
                packet_id: 1,
                filters: vec![("a".into(), QoS::AtMostOnce)],
            }),
            &mut buf,
        )
        .unwrap();
        buf[0] &= 0xF0;
        assert!(matches!(
            protocol_err(decode(&buf)),
            ProtocolError::InvalidFlags { .. }
        ));
    }

    #[test]
    fn test_publish_qos3_rejected() {
        // Flags 0b0110 = QoS 3
        assert_eq!(
            protocol_err(decode(&[0x36, 0x05, 0x00, 0x01, b'a', 0x00, 0x01])),
            ProtocolError::InvalidQos(3)
        );
    }

    #[test]
    fn test_publish_wildcard_topic_rejected() {
        let mut buf = Vec::new();
        encode(
            &Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: "a".into(),
                packet_id: None,
                payload: Bytes::new(),
            }),
            &mut buf,
        )
        .unwrap();
        // Patch the topic byte to a wildcard
        buf[4] = b'#';
        assert!(matches!(
            protocol_err(decode(&buf)),
            ProtocolError::InvalidTopicName(_)
        ));
    }

    #[test]
    fn test_length_mismatch() {
        // PUBACK declaring 3 bytes but frame carries 2
        assert!(matches!(
            protocol_err(decode(&[0x40, 0x03, 0x00, 0x01])),
            ProtocolError::LengthMismatch { .. }
        ));
        // PUBACK with a trailing byte inside the declared length
        assert!(matches!(
            protocol_err(decode(&[0x40, 0x03, 0x00, 0x01, 0xFF])),
            ProtocolError::LengthMismatch { .. }
        ));
    }

    #[test]
    fn test_short_read_inside_body() {
        // CONNACK declaring 1 byte: return code missing
        assert!(matches!(
            protocol_err(decode(&[0x20, 0x01, 0x00])),
            ProtocolError::ShortRead { .. }
        ));
    }

    #[test]
    fn test_subscribe_requires_filters() {
        assert!(matches!(
            protocol_err(decode(&[0x82, 0x02, 0x00, 0x01])),
            ProtocolError::MalformedPacket(_)
        ));
    }

    #[test]
    fn test_subscribe_invalid_filter_rejected() {
        let mut bad = Vec::new();
        encode(
            &Packet::Subscribe(Subscribe {
                packet_id: 1,
                filters: vec![("ab".into(), QoS::AtMostOnce)],
            }),
            &mut bad,
        )
        .unwrap();
        // Patch the filter to "#x": a multi-level wildcard not at the end
        bad[6] = b'#';
        bad[7] = b'x';
        assert!(matches!(
            protocol_err(decode(&bad)),
            ProtocolError::InvalidTopicFilter(_)
        ));
    }

    #[test]
    fn test_connect_reserved_flag_rejected() {
        let mut buf = Vec::new();
        encode(
            &Packet::Connect(Connect {
                protocol_name: "MQTT".into(),
                protocol_level: 4,
                clean_session: true,
                keep_alive: 0,
                client_id: "c".into(),
                will: None,
                username: None,
                password: None,
            }),
            &mut buf,
        )
        .unwrap();
        // Connect flags byte sits after name (2+4), level (1): offset 2+6+1
        let flags_at = 2 + 6 + 1;
        buf[flags_at] |= 0x01;
        assert!(matches!(
            protocol_err(decode(&buf)),
            ProtocolError::InvalidConnectFlags(_)
        ));
    }

    #[test]
    fn test_connect_bad_protocol_name() {
        let mut buf = Vec::new();
        let mut body = Vec::new();
        write_string("MQXX", &mut body);
        body.push(4);
        body.push(0x02);
        body.extend_from_slice(&0u16.to_be_bytes());
        write_string("c", &mut body);
        buf.push(0x10);
        varint::encode(body.len(), &mut buf).unwrap();
        buf.extend_from_slice(&body);
        assert!(matches!(
            protocol_err(decode(&buf)),
            ProtocolError::InvalidProtocolName(_)
        ));
    }

    #[test]
    fn test_large_publish_roundtrip() {
        // Multi-byte remaining length
        roundtrip(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "big".into(),
            packet_id: None,
            payload: Bytes::from(vec![0xAB; 100_000]),
        }));
    }
}
