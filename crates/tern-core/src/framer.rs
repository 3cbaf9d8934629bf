//! Incremental packet framing over a byte stream.
//!
//! The framer consumes an append-only receive buffer fed by the transport and
//! detects complete packet boundaries. Partial frames survive between calls:
//! the decoded fixed header is cached until the full body has arrived.

use bytes::BytesMut;

use crate::error::{ProtocolError, Result};
use crate::packet::{self, Packet};
use crate::varint;

/// Incremental framer for one connection.
///
/// Call [`Framer::next_packet`] in a loop after every read until it returns
/// `Ok(None)`; this delivers back-to-back packets arriving in a single
/// readiness notification in order.
#[derive(Debug, Default)]
pub struct Framer {
    /// Fixed header length (1 + remaining-length bytes); 0 when no header is
    /// cached.
    header_len: usize,
    /// Cached remaining length, valid when `header_len != 0`.
    remaining_len: usize,
    /// Maximum total packet size; 0 disables the limit.
    max_packet_size: usize,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a framer that rejects packets larger than `max` bytes total.
    pub fn with_max_packet_size(max: usize) -> Self {
        Self {
            max_packet_size: max,
            ..Self::default()
        }
    }

    /// Try to extract the next complete packet from the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Errors are fatal for
    /// the connection. A remaining length that does not terminate within its
    /// 4-byte maximum drains the 5 offending bytes before reporting
    /// `MalformedLength`, leaving the stream positioned past the bad header.
    pub fn next_packet(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>> {
        // A frame needs at least the header byte and one length byte.
        if buf.len() < 2 {
            return Ok(None);
        }

        if self.header_len == 0 {
            let peek = buf.len().min(5);
            match varint::decode(&buf[1..peek])? {
                Some((remaining_len, consumed)) => {
                    self.header_len = 1 + consumed;
                    self.remaining_len = remaining_len;
                }
                None if peek == 5 => {
                    let _ = buf.split_to(5);
                    return Err(ProtocolError::MalformedLength.into());
                }
                None => return Ok(None),
            }

            let total = self.header_len + self.remaining_len;
            if self.max_packet_size > 0 && total > self.max_packet_size {
                return Err(ProtocolError::PacketTooLarge {
                    size: total,
                    max: self.max_packet_size,
                }
                .into());
            }
        }

        let total = self.header_len + self.remaining_len;
        if buf.len() < total {
            return Ok(None);
        }

        let frame = buf.split_to(total);
        self.header_len = 0;
        self.remaining_len = 0;

        Ok(Some(packet::decode(&frame)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::packet::{encode, Publish, QoS};
    use bytes::Bytes;

    fn publish(topic: &str, payload: &'static [u8]) -> Packet {
        Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: Bytes::from_static(payload),
        })
    }

    #[test]
    fn test_whole_packet() {
        let mut framer = Framer::new();
        let mut buf = BytesMut::new();

        let mut bytes = Vec::new();
        encode(&Packet::Pingreq, &mut bytes).unwrap();
        buf.extend_from_slice(&bytes);

        assert_eq!(framer.next_packet(&mut buf).unwrap(), Some(Packet::Pingreq));
        assert_eq!(framer.next_packet(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut framer = Framer::new();
        let mut buf = BytesMut::new();

        let mut bytes = Vec::new();
        encode(&publish("a/b", b"hello"), &mut bytes).unwrap();

        for &b in &bytes[..bytes.len() - 1] {
            buf.extend_from_slice(&[b]);
            assert_eq!(framer.next_packet(&mut buf).unwrap(), None);
        }
        buf.extend_from_slice(&bytes[bytes.len() - 1..]);
        let packet = framer.next_packet(&mut buf).unwrap().unwrap();
        assert_eq!(packet, publish("a/b", b"hello"));
    }

    #[test]
    fn test_back_to_back_packets() {
        let mut framer = Framer::new();
        let mut buf = BytesMut::new();

        let mut bytes = Vec::new();
        encode(&publish("t", b"one"), &mut bytes).unwrap();
        encode(&Packet::Puback { packet_id: 3 }, &mut bytes).unwrap();
        encode(&Packet::Pingreq, &mut bytes).unwrap();
        buf.extend_from_slice(&bytes);

        assert_eq!(
            framer.next_packet(&mut buf).unwrap(),
            Some(publish("t", b"one"))
        );
        assert_eq!(
            framer.next_packet(&mut buf).unwrap(),
            Some(Packet::Puback { packet_id: 3 })
        );
        assert_eq!(framer.next_packet(&mut buf).unwrap(), Some(Packet::Pingreq));
        assert_eq!(framer.next_packet(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_split_header_survives_between_calls() {
        let mut framer = Framer::new();
        let mut buf = BytesMut::new();

        // Publish with a payload large enough for a 2-byte remaining length
        let big = publish("t", &[0x55; 200]);
        let mut bytes = Vec::new();
        let big_encoded = {
            encode(&big, &mut bytes).unwrap();
            bytes
        };

        // Feed only the first length byte (continuation set)
        buf.extend_from_slice(&big_encoded[..2]);
        assert_eq!(framer.next_packet(&mut buf).unwrap(), None);

        buf.extend_from_slice(&big_encoded[2..]);
        assert_eq!(framer.next_packet(&mut buf).unwrap(), Some(big));
    }

    #[test]
    fn test_malformed_length_drains_five_bytes() {
        let mut framer = Framer::new();
        let mut buf = BytesMut::new();

        // Four continuation bytes after the header byte: no terminator in the
        // 5-byte window.
        buf.extend_from_slice(&[0x30, 0x80, 0x80, 0x80, 0x80, 0xAA, 0xBB]);
        let err = framer.next_packet(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::MalformedLength)
        ));
        // The 5 offending bytes were drained to recover the stream.
        assert_eq!(&buf[..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_incomplete_length_waits() {
        let mut framer = Framer::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&[0x30, 0x80, 0x80]);
        assert_eq!(framer.next_packet(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_max_packet_size() {
        let mut framer = Framer::with_max_packet_size(16);
        let mut buf = BytesMut::new();

        let mut bytes = Vec::new();
        encode(&publish("topic", &[0u8; 64]), &mut bytes).unwrap();
        buf.extend_from_slice(&bytes);

        let err = framer.next_packet(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_error_propagates() {
        let mut framer = Framer::new();
        let mut buf = BytesMut::new();

        // Unknown type nibble 0
        buf.extend_from_slice(&[0x00, 0x00]);
        let err = framer.next_packet(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnknownType(0))
        ));
    }
}
