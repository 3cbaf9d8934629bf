//! Remaining-length (variable byte integer) encoding for MQTT.
//!
//! The fixed header carries the body size as a little-endian base-128
//! integer, 7 value bits per byte with the high bit as a continuation flag:
//! - 0-127: 1 byte
//! - 128-16383: 2 bytes
//! - 16384-2097151: 3 bytes
//! - 2097152-268435455: 4 bytes

use crate::error::{ProtocolError, Result};

/// Largest value representable in four remaining-length bytes.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Decode a remaining length from a buffer.
///
/// Returns `Ok(Some((value, bytes_consumed)))` on a terminated encoding,
/// `Ok(None)` when the buffer ends before the terminating byte, or `Err`
/// when a fifth byte would be required.
///
/// # Example
/// ```
/// use tern_core::varint;
/// let buf = [0x80, 0x01]; // Encodes 128
/// let (value, consumed) = varint::decode(&buf).unwrap().unwrap();
/// assert_eq!(value, 128);
/// assert_eq!(consumed, 2);
/// ```
pub fn decode(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;

    for (count, &byte) in buf.iter().enumerate() {
        if count == 4 {
            return Err(ProtocolError::MalformedLength.into());
        }
        value |= ((byte & 0x7F) as usize) << (7 * count);
        if byte & 0x80 == 0 {
            return Ok(Some((value, count + 1)));
        }
    }

    Ok(None)
}

/// Encode a remaining length, appending to a Vec.
///
/// Returns the number of bytes written, or `MalformedLength` for values above
/// [`MAX_REMAINING_LENGTH`].
///
/// # Example
/// ```
/// use tern_core::varint;
/// let mut buf = Vec::new();
/// assert_eq!(varint::encode(300, &mut buf).unwrap(), 2);
/// assert_eq!(&buf, &[0xAC, 0x02]);
/// ```
pub fn encode(mut value: usize, buf: &mut Vec<u8>) -> Result<usize> {
    if value > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::MalformedLength.into());
    }

    let start = buf.len();
    loop {
        let low = (value & 0x7F) as u8;
        value >>= 7;
        buf.push(if value > 0 { low | 0x80 } else { low });
        if value == 0 {
            break;
        }
    }
    Ok(buf.len() - start)
}

/// The number of bytes [`encode`] produces for a value.
pub fn encoded_len(value: usize) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_byte() {
        assert_eq!(decode(&[0]).unwrap(), Some((0, 1)));
        assert_eq!(decode(&[0x7F]).unwrap(), Some((127, 1)));
    }

    #[test]
    fn test_decode_boundaries() {
        assert_eq!(decode(&[0x80, 0x01]).unwrap(), Some((128, 2)));
        assert_eq!(decode(&[0xFF, 0x7F]).unwrap(), Some((16383, 2)));
        assert_eq!(decode(&[0x80, 0x80, 0x01]).unwrap(), Some((16384, 3)));
        assert_eq!(decode(&[0xFF, 0xFF, 0x7F]).unwrap(), Some((2097151, 3)));
        assert_eq!(
            decode(&[0x80, 0x80, 0x80, 0x01]).unwrap(),
            Some((2097152, 4))
        );
        assert_eq!(
            decode(&[0xFF, 0xFF, 0xFF, 0x7F]).unwrap(),
            Some((MAX_REMAINING_LENGTH, 4))
        );
    }

    #[test]
    fn test_decode_incomplete() {
        assert_eq!(decode(&[]).unwrap(), None);
        assert_eq!(decode(&[0x80]).unwrap(), None);
        assert_eq!(decode(&[0x80, 0x80]).unwrap(), None);
        assert_eq!(decode(&[0x80, 0x80, 0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn test_decode_overlong() {
        // More than 4 bytes with continuation bit set
        assert!(decode(&[0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
    }

    #[test]
    fn test_encode_rejects_out_of_range() {
        let mut buf = Vec::new();
        assert!(encode(MAX_REMAINING_LENGTH + 1, &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encoded_len() {
        assert_eq!(encoded_len(0), 1);
        assert_eq!(encoded_len(127), 1);
        assert_eq!(encoded_len(128), 2);
        assert_eq!(encoded_len(16383), 2);
        assert_eq!(encoded_len(16384), 3);
        assert_eq!(encoded_len(2097151), 3);
        assert_eq!(encoded_len(2097152), 4);
        assert_eq!(encoded_len(MAX_REMAINING_LENGTH), 4);
    }

    #[test]
    fn test_roundtrip() {
        for value in [
            0,
            1,
            127,
            128,
            16383,
            16384,
            2097151,
            2097152,
            MAX_REMAINING_LENGTH,
        ] {
            let mut buf = Vec::new();
            let written = encode(value, &mut buf).unwrap();
            assert_eq!(written, buf.len());
            assert_eq!(written, encoded_len(value));
            let (decoded, consumed) = decode(&buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buf.len());
        }
    }
}
