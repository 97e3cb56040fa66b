//! Sub-framing of reliable payloads.
//!
//! ```text
//! header:  [0] [count: i32 le] [message id]
//! content: [1] [index: i32 le] [message id] [chunk ...]
//! single:  [3] [index: i32 le] [message id] [whole message ...]
//! ```
//!
//! A single fragment is a content fragment with its tag rewritten, used when the
//! whole message fits in one chunk.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::DecodeError;

/// Largest fragment put on the wire, sub-header included.
pub const SAFE_FRAGMENT_SIZE: usize = 512;
pub const FRAGMENT_HEADER_SIZE: usize = 6;

/// Largest fragment count a header may declare.
pub const MAX_FRAGMENTS: i32 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FragmentKind {
    Header = 0,
    Content = 1,
    Single = 3,
}

impl TryFrom<u8> for FragmentKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FragmentKind::Header),
            1 => Ok(FragmentKind::Content),
            3 => Ok(FragmentKind::Single),
            other => Err(DecodeError::FragmentType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentFrame {
    Header { count: i32, message_id: u8 },
    Content { index: i32, message_id: u8, chunk: Bytes },
    Single { message_id: u8, data: Bytes },
}

impl FragmentFrame {
    pub fn parse(data: &Bytes) -> Result<Self, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::EmptyFragment);
        }
        if data.len() < FRAGMENT_HEADER_SIZE {
            return Err(DecodeError::Truncated {
                needed: FRAGMENT_HEADER_SIZE,
                remaining: data.len(),
            });
        }

        let mut buf = data.clone();
        let kind = FragmentKind::try_from(buf.get_u8())?;
        let value = buf.get_i32_le();
        let message_id = buf.get_u8();

        match kind {
            FragmentKind::Header => {
                if !(2..=MAX_FRAGMENTS).contains(&value) {
                    return Err(DecodeError::FragmentCount(value));
                }
                Ok(FragmentFrame::Header {
                    count: value,
                    message_id,
                })
            }
            FragmentKind::Content => {
                if !(0..MAX_FRAGMENTS).contains(&value) {
                    return Err(DecodeError::FragmentIndex(value));
                }
                Ok(FragmentFrame::Content {
                    index: value,
                    message_id,
                    chunk: buf,
                })
            }
            FragmentKind::Single => Ok(FragmentFrame::Single {
                message_id,
                data: buf,
            }),
        }
    }

    pub fn message_id(&self) -> u8 {
        match self {
            FragmentFrame::Header { message_id, .. }
            | FragmentFrame::Content { message_id, .. }
            | FragmentFrame::Single { message_id, .. } => *message_id,
        }
    }
}

pub fn encode_header(count: i32, message_id: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE);
    buf.put_u8(FragmentKind::Header as u8);
    buf.put_i32_le(count);
    buf.put_u8(message_id);
    buf.freeze()
}

pub fn encode_content(index: i32, message_id: u8, chunk: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
    buf.put_u8(FragmentKind::Content as u8);
    buf.put_i32_le(index);
    buf.put_u8(message_id);
    buf.put_slice(chunk);
    buf.freeze()
}

/// Largest message [`split`] can express in a header the receiver accepts.
pub fn max_message_len(fragment_size: usize) -> usize {
    MAX_FRAGMENTS as usize * (fragment_size - FRAGMENT_HEADER_SIZE)
}

/// Number of chunks `len` bytes split into, never less than one.
pub fn chunk_count(len: usize, fragment_size: usize) -> usize {
    len.div_ceil(fragment_size - FRAGMENT_HEADER_SIZE).max(1)
}

/// Splits `message` into wire fragments, header first when there is more than one chunk.
///
/// `message` must not exceed [`max_message_len`].
pub fn split(message: &Bytes, message_id: u8, fragment_size: usize) -> Vec<Bytes> {
    let chunk_size = fragment_size - FRAGMENT_HEADER_SIZE;
    let count = chunk_count(message.len(), fragment_size);

    if count == 1 {
        let mut single = BytesMut::from(&encode_content(0, message_id, message)[..]);
        single[0] = FragmentKind::Single as u8;
        return vec![single.freeze()];
    }

    let mut fragments = Vec::with_capacity(count + 1);
    fragments.push(encode_header(count as i32, message_id));
    fragments.extend(
        message
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, chunk)| encode_content(index as i32, message_id, chunk)),
    );
    fragments
}

/// Splits `message` into a header and content fragments even when it would fit in one.
pub fn split_multi(message: &Bytes, message_id: u8, fragment_size: usize) -> Vec<Bytes> {
    let chunk_size = fragment_size - FRAGMENT_HEADER_SIZE;
    let chunks: Vec<&[u8]> = if message.is_empty() {
        vec![&message[..], &message[..]]
    } else if message.len() <= chunk_size {
        let (head, tail) = message.split_at(message.len() / 2);
        vec![head, tail]
    } else {
        message.chunks(chunk_size).collect()
    };

    let mut fragments = Vec::with_capacity(chunks.len() + 1);
    fragments.push(encode_header(chunks.len() as i32, message_id));
    fragments.extend(
        chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| encode_content(index as i32, message_id, chunk)),
    );
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_message_becomes_single_fragment() {
        let message = Bytes::from_static(b"hello");
        let fragments = split(&message, 9, SAFE_FRAGMENT_SIZE);

        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0][0], FragmentKind::Single as u8);
        assert_eq!(
            FragmentFrame::parse(&fragments[0]).unwrap(),
            FragmentFrame::Single {
                message_id: 9,
                data: message,
            }
        );
    }

    #[test]
    fn test_empty_message_is_one_empty_single_fragment() {
        let fragments = split(&Bytes::new(), 0, SAFE_FRAGMENT_SIZE);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].len(), FRAGMENT_HEADER_SIZE);
    }

    #[test]
    fn test_large_message_gets_header_and_capped_chunks() {
        let message = Bytes::from(vec![7u8; 2000]);
        let fragments = split(&message, 3, SAFE_FRAGMENT_SIZE);

        assert_eq!(fragments.len(), 5);
        assert_eq!(
            FragmentFrame::parse(&fragments[0]).unwrap(),
            FragmentFrame::Header {
                count: 4,
                message_id: 3
            }
        );
        assert!(fragments.iter().all(|f| f.len() <= SAFE_FRAGMENT_SIZE));
        assert_eq!(fragments[1].len(), SAFE_FRAGMENT_SIZE);
    }

    #[test]
    fn test_largest_message_header_parses() {
        let max = max_message_len(SAFE_FRAGMENT_SIZE);
        assert_eq!(max, 65_536 * 506);
        assert_eq!(chunk_count(max, SAFE_FRAGMENT_SIZE), MAX_FRAGMENTS as usize);
        assert_eq!(chunk_count(max + 1, SAFE_FRAGMENT_SIZE), MAX_FRAGMENTS as usize + 1);

        let header = encode_header(chunk_count(max, SAFE_FRAGMENT_SIZE) as i32, 0);
        assert!(FragmentFrame::parse(&header).is_ok());
        let header = encode_header(chunk_count(max + 1, SAFE_FRAGMENT_SIZE) as i32, 0);
        assert!(matches!(
            FragmentFrame::parse(&header),
            Err(DecodeError::FragmentCount(_))
        ));
    }

    #[test]
    fn test_chunk_boundaries() {
        assert_eq!(chunk_count(0, SAFE_FRAGMENT_SIZE), 1);
        assert_eq!(chunk_count(506, SAFE_FRAGMENT_SIZE), 1);
        assert_eq!(chunk_count(507, SAFE_FRAGMENT_SIZE), 2);
        assert_eq!(chunk_count(100_000, SAFE_FRAGMENT_SIZE), 198);
    }

    #[test]
    fn test_content_round_trip() {
        let encoded = encode_content(41, 200, b"chunk");
        assert_eq!(
            FragmentFrame::parse(&encoded).unwrap(),
            FragmentFrame::Content {
                index: 41,
                message_id: 200,
                chunk: Bytes::from_static(b"chunk"),
            }
        );
    }

    #[test]
    fn test_rejects_malformed_fragments() {
        assert!(matches!(
            FragmentFrame::parse(&Bytes::new()),
            Err(DecodeError::EmptyFragment)
        ));
        assert!(matches!(
            FragmentFrame::parse(&Bytes::from_static(&[1, 0, 0])),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(
            FragmentFrame::parse(&Bytes::from_static(&[2, 0, 0, 0, 0, 0])),
            Err(DecodeError::FragmentType(2))
        ));
        assert!(matches!(
            FragmentFrame::parse(&encode_header(1, 0)),
            Err(DecodeError::FragmentCount(1))
        ));
        assert!(matches!(
            FragmentFrame::parse(&encode_content(-1, 0, b"")),
            Err(DecodeError::FragmentIndex(-1))
        ));
    }
}
