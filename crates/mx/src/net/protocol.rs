use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use super::error::DecodeError;

pub const PROTOCOL_ID: u32 = 0x4D58_0001;
pub const DEFAULT_REALTIME_PORT: u16 = 27020;
pub const DEFAULT_RELIABLE_PORT: u16 = 27021;

/// Largest datagram the sockets will read in one call.
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Width of the ack window carried by every datagram.
pub const ACK_WINDOW: u32 = 32;

/// Sequence number a client reports before it has heard from its peer.
pub const NO_SEQUENCE: u32 = u32::MAX;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

const FIELD_PROTOCOL_ID: u32 = 1;
const FIELD_SEQUENCE: u32 = 2;
const FIELD_ACK: u32 = 3;
const FIELD_ACK_BITFIELD: u32 = 4;
const FIELD_PAYLOADS: u32 = 5;
const FIELD_PAYLOAD_DATA: u32 = 1;

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

/// Signed distance from `current` to `new`, treating the sequence space as a ring.
///
/// Positive when `new` is ahead of `current`.
#[inline]
pub fn sequence_distance(new: u32, current: u32) -> i64 {
    let forward = new.wrapping_sub(current);
    if forward <= SEQUENCE_WRAP_THRESHOLD {
        forward as i64
    } else {
        -(current.wrapping_sub(new) as i64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub data: Bytes,
}

impl Payload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    fn encoded_len(&self) -> usize {
        if self.data.is_empty() {
            0
        } else {
            tag_len(FIELD_PAYLOAD_DATA) + varint_len(self.data.len() as u64) + self.data.len()
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        if !self.data.is_empty() {
            put_tag(buf, FIELD_PAYLOAD_DATA, WIRE_LEN);
            buf.put_usize_varint(self.data.len());
            buf.put_slice(&self.data);
        }
    }

    fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        let mut payload = Payload::default();
        while buf.has_remaining() {
            let (field, wire_type) = get_tag(&mut buf)?;
            match (field, wire_type) {
                (FIELD_PAYLOAD_DATA, WIRE_LEN) => payload.data = get_len_delimited(&mut buf)?,
                _ => skip_field(&mut buf, wire_type)?,
            }
        }
        Ok(payload)
    }
}

/// One UDP datagram.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub protocol_id: u32,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
    pub payloads: Vec<Payload>,
}

impl Message {
    pub fn new(protocol_id: u32, sequence: u32, ack: u32, ack_bitfield: u32) -> Self {
        Self {
            protocol_id,
            sequence,
            ack,
            ack_bitfield,
            payloads: Vec::new(),
        }
    }

    pub fn with_payloads<I>(mut self, payloads: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        self.payloads.extend(payloads.into_iter().map(Payload::new));
        self
    }

    pub fn is_valid(&self, protocol_id: u32) -> bool {
        self.protocol_id == protocol_id
    }

    /// Decodes `buf` and rejects messages stamped with another protocol id.
    pub fn decode_for(buf: Bytes, protocol_id: u32) -> Result<Self, DecodeError> {
        let message = Self::decode(buf)?;
        if !message.is_valid(protocol_id) {
            return Err(DecodeError::ProtocolMismatch {
                expected: protocol_id,
                actual: message.protocol_id,
            });
        }
        Ok(message)
    }

    /// True when `sequence` falls inside the 32-entry window that ends at `ack`.
    pub fn has_ack(&self, sequence: u32) -> bool {
        self.ack.wrapping_sub(sequence) < ACK_WINDOW
    }

    /// True when the window covers `sequence` and reports it as received.
    pub fn is_acked(&self, sequence: u32) -> bool {
        self.has_ack(sequence) && self.ack_bitfield & (1 << self.ack.wrapping_sub(sequence)) != 0
    }

    pub fn encoded_len(&self) -> usize {
        let scalars = [
            (FIELD_PROTOCOL_ID, self.protocol_id),
            (FIELD_SEQUENCE, self.sequence),
            (FIELD_ACK, self.ack),
            (FIELD_ACK_BITFIELD, self.ack_bitfield),
        ];
        let header: usize = scalars
            .iter()
            .filter(|(_, value)| *value != 0)
            .map(|(field, value)| tag_len(*field) + varint_len(*value as u64))
            .sum();
        let payloads: usize = self
            .payloads
            .iter()
            .map(|p| {
                let len = p.encoded_len();
                tag_len(FIELD_PAYLOADS) + varint_len(len as u64) + len
            })
            .sum();
        header + payloads
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        put_u32_field(&mut buf, FIELD_PROTOCOL_ID, self.protocol_id);
        put_u32_field(&mut buf, FIELD_SEQUENCE, self.sequence);
        put_u32_field(&mut buf, FIELD_ACK, self.ack);
        put_u32_field(&mut buf, FIELD_ACK_BITFIELD, self.ack_bitfield);
        for payload in &self.payloads {
            put_tag(&mut buf, FIELD_PAYLOADS, WIRE_LEN);
            buf.put_usize_varint(payload.encoded_len());
            payload.encode_into(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        let mut message = Message::default();
        while buf.has_remaining() {
            let (field, wire_type) = get_tag(&mut buf)?;
            match (field, wire_type) {
                (FIELD_PROTOCOL_ID, WIRE_VARINT) => message.protocol_id = get_u32(&mut buf)?,
                (FIELD_SEQUENCE, WIRE_VARINT) => message.sequence = get_u32(&mut buf)?,
                (FIELD_ACK, WIRE_VARINT) => message.ack = get_u32(&mut buf)?,
                (FIELD_ACK_BITFIELD, WIRE_VARINT) => message.ack_bitfield = get_u32(&mut buf)?,
                (FIELD_PAYLOADS, WIRE_LEN) => {
                    let body = get_len_delimited(&mut buf)?;
                    message.payloads.push(Payload::decode(body)?);
                }
                _ => skip_field(&mut buf, wire_type)?,
            }
        }
        Ok(message)
    }
}

fn put_tag(buf: &mut BytesMut, field: u32, wire_type: u8) {
    buf.put_u32_varint((field << 3) | wire_type as u32);
}

fn put_u32_field(buf: &mut BytesMut, field: u32, value: u32) {
    if value != 0 {
        put_tag(buf, field, WIRE_VARINT);
        buf.put_u32_varint(value);
    }
}

fn get_tag(buf: &mut Bytes) -> Result<(u32, u8), DecodeError> {
    let tag = buf.try_get_u32_varint().map_err(|_| DecodeError::Varint)?;
    let field = tag >> 3;
    if field == 0 {
        return Err(DecodeError::InvalidField(field));
    }
    Ok((field, (tag & 0x7) as u8))
}

fn get_u32(buf: &mut Bytes) -> Result<u32, DecodeError> {
    // Values written by encoders that sign-extend to 64 bits are truncated like protobuf does.
    buf.try_get_u64_varint()
        .map(|value| value as u32)
        .map_err(|_| DecodeError::Varint)
}

fn get_len_delimited(buf: &mut Bytes) -> Result<Bytes, DecodeError> {
    let len = buf.try_get_usize_varint().map_err(|_| DecodeError::Varint)?;
    if buf.remaining() < len {
        return Err(DecodeError::Truncated {
            needed: len,
            remaining: buf.remaining(),
        });
    }
    Ok(buf.split_to(len))
}

fn skip_field(buf: &mut Bytes, wire_type: u8) -> Result<(), DecodeError> {
    let len = match wire_type {
        WIRE_VARINT => {
            buf.try_get_u64_varint().map_err(|_| DecodeError::Varint)?;
            return Ok(());
        }
        WIRE_FIXED64 => 8,
        WIRE_LEN => buf.try_get_usize_varint().map_err(|_| DecodeError::Varint)?,
        WIRE_FIXED32 => 4,
        other => return Err(DecodeError::WireType(other)),
    };
    if buf.remaining() < len {
        return Err(DecodeError::Truncated {
            needed: len,
            remaining: buf.remaining(),
        });
    }
    buf.advance(len);
    Ok(())
}

fn tag_len(field: u32) -> usize {
    varint_len((field << 3) as u64)
}

fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_comparison() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn test_sequence_distance_wraps() {
        assert_eq!(sequence_distance(0, u32::MAX), 1);
        assert_eq!(sequence_distance(u32::MAX, 0), -1);
        assert_eq!(sequence_distance(10, 5), 5);
        assert_eq!(sequence_distance(5, 10), -5);
        assert_eq!(sequence_distance(7, 7), 0);
    }

    #[test]
    fn test_decode_for_rejects_foreign_protocol() {
        let encoded = Message::new(0xDEAD_BEEF, 1, 0, 0).encode();

        assert!(matches!(
            Message::decode_for(encoded.clone(), PROTOCOL_ID),
            Err(DecodeError::ProtocolMismatch {
                expected: PROTOCOL_ID,
                actual: 0xDEAD_BEEF,
            })
        ));
        assert_eq!(Message::decode_for(encoded, 0xDEAD_BEEF).unwrap().sequence, 1);
    }

    #[test]
    fn test_message_round_trip() {
        let message = Message::new(PROTOCOL_ID, 41, 40, 0b1011)
            .with_payloads([Bytes::from_static(&[1, 2, 3]), Bytes::new()]);

        let encoded = message.encode();
        assert_eq!(encoded.len(), message.encoded_len());

        let decoded = Message::decode(encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_zero_fields_are_omitted() {
        let message = Message::new(0, 0, 0, 0);
        assert!(message.encode().is_empty());
        assert_eq!(Message::decode(Bytes::new()).unwrap(), message);
    }

    #[test]
    fn test_known_encoding() {
        let message = Message::new(1, 300, 0, 1).with_payloads([Bytes::from_static(b"hi")]);
        let expected: &[u8] = &[
            0x08, 0x01, // protocol_id = 1
            0x10, 0xAC, 0x02, // sequence = 300
            0x20, 0x01, // ack_bitfield = 1
            0x2A, 0x04, 0x0A, 0x02, b'h', b'i', // payloads[0].data = "hi"
        ];
        assert_eq!(&message.encode()[..], expected);
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let mut buf = BytesMut::new();
        put_tag(&mut buf, 9, WIRE_FIXED32);
        buf.put_u32_le(0xDEAD_BEEF);
        put_tag(&mut buf, 10, WIRE_LEN);
        buf.put_u8(2);
        buf.put_slice(&[7, 7]);
        put_u32_field(&mut buf, FIELD_SEQUENCE, 5);

        let decoded = Message::decode(buf.freeze()).unwrap();
        assert_eq!(decoded.sequence, 5);
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let message = Message::new(PROTOCOL_ID, 1, 0, 0).with_payloads([Bytes::from_static(&[9; 16])]);
        let encoded = message.encode();
        let truncated = encoded.slice(..encoded.len() - 4);
        assert!(matches!(
            Message::decode(truncated),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_has_ack_window() {
        let message = Message::new(PROTOCOL_ID, 0, 100, 0b101);
        assert!(message.has_ack(100));
        assert!(message.has_ack(69));
        assert!(!message.has_ack(68));
        assert!(!message.has_ack(101));

        assert!(message.is_acked(100));
        assert!(!message.is_acked(99));
        assert!(message.is_acked(98));
    }
}
