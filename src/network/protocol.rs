//! Protocol Messages
//!
//! Binary wire format shared by both peers. Every field is written
//! explicitly at a fixed width, little-endian, so the layout never depends
//! on how either platform would lay out a struct in memory.
//!
//! ```text
//! RandomNumber  | tag=0 u32 | nonce u32 |
//! GameBegin     | tag=1 u32 |
//! Move          | tag=2 u32 | len u64   | len bytes of UTF-8 |
//! GameOver      | tag=3 u32 | flag u8   |
//! ```
//!
//! Each transport payload carries exactly one message, so a bad frame is
//! dropped on its own and cannot desynchronize the ones after it.

use std::fmt;

use crate::core::rng::Nonce;

/// Size of the message tag.
pub const TAG_SIZE: usize = 4;

/// Size of the Move header (tag + text length).
pub const MOVE_HEADER_SIZE: usize = TAG_SIZE + 8;

/// Message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    /// Election nonce.
    RandomNumber = 0,
    /// Primary says play starts.
    GameBegin = 1,
    /// Application payload.
    Move = 2,
    /// Match finished.
    GameOver = 3,
}

impl MessageKind {
    /// Wire tag value.
    pub const fn tag(self) -> u32 {
        self as u32
    }

    /// Resolve a wire tag.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::RandomNumber),
            1 => Some(Self::GameBegin),
            2 => Some(Self::Move),
            3 => Some(Self::GameOver),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RandomNumber => "random_number",
            Self::GameBegin => "game_begin",
            Self::Move => "move",
            Self::GameOver => "game_over",
        };
        f.write_str(name)
    }
}

/// Messages exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Election nonce.
    RandomNumber(Nonce),
    /// Play begins.
    GameBegin,
    /// Free-form application text.
    Move(String),
    /// Match finished.
    GameOver {
        /// True if the primary (turn index 0) won.
        primary_won: bool,
    },
}

impl Message {
    /// Tag of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::RandomNumber(_) => MessageKind::RandomNumber,
            Self::GameBegin => MessageKind::GameBegin,
            Self::Move(_) => MessageKind::Move,
            Self::GameOver { .. } => MessageKind::GameOver,
        }
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    /// Deserialize from wire bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        decode(data)
    }
}

/// Wire decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Tag is not one of the four known kinds.
    #[error("Unknown message tag {0}")]
    UnknownTag(u32),

    /// Buffer length disagrees with the layout its header declares.
    #[error("Truncated message: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes the layout requires.
        expected: u64,
        /// Bytes present.
        actual: u64,
    },

    /// Move text is not UTF-8.
    #[error("Move text is not valid UTF-8")]
    InvalidUtf8,

    /// GameOver flag is neither 0 nor 1.
    #[error("Invalid GameOver flag {0}")]
    InvalidFlag(u8),
}

/// Encode a message.
pub fn encode(message: &Message) -> Vec<u8> {
    let tag = message.kind().tag().to_le_bytes();
    match message {
        Message::RandomNumber(nonce) => {
            let mut buf = Vec::with_capacity(TAG_SIZE + 4);
            buf.extend_from_slice(&tag);
            buf.extend_from_slice(&nonce.to_le_bytes());
            buf
        }
        Message::GameBegin => tag.to_vec(),
        Message::Move(text) => {
            let bytes = text.as_bytes();
            let mut buf = Vec::with_capacity(MOVE_HEADER_SIZE + bytes.len());
            buf.extend_from_slice(&tag);
            buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            buf.extend_from_slice(bytes);
            buf
        }
        Message::GameOver { primary_won } => {
            let mut buf = Vec::with_capacity(TAG_SIZE + 1);
            buf.extend_from_slice(&tag);
            buf.push(u8::from(*primary_won));
            buf
        }
    }
}

/// Decode a message. Inspects the tag before anything else.
pub fn decode(data: &[u8]) -> Result<Message, DecodeError> {
    let tag = read_u32(data, 0)?;
    let kind = MessageKind::from_tag(tag).ok_or(DecodeError::UnknownTag(tag))?;

    match kind {
        MessageKind::RandomNumber => {
            expect_len(data, TAG_SIZE + 4)?;
            Ok(Message::RandomNumber(read_u32(data, TAG_SIZE)?))
        }
        MessageKind::GameBegin => {
            expect_len(data, TAG_SIZE)?;
            Ok(Message::GameBegin)
        }
        MessageKind::Move => {
            let declared = read_u64(data, TAG_SIZE)?;
            let body = &data[MOVE_HEADER_SIZE..];
            if body.len() as u64 != declared {
                return Err(DecodeError::Truncated {
                    expected: (MOVE_HEADER_SIZE as u64).saturating_add(declared),
                    actual: data.len() as u64,
                });
            }
            let text = std::str::from_utf8(body).map_err(|_| DecodeError::InvalidUtf8)?;
            Ok(Message::Move(text.to_owned()))
        }
        MessageKind::GameOver => {
            expect_len(data, TAG_SIZE + 1)?;
            match data[TAG_SIZE] {
                0 => Ok(Message::GameOver { primary_won: false }),
                1 => Ok(Message::GameOver { primary_won: true }),
                other => Err(DecodeError::InvalidFlag(other)),
            }
        }
    }
}

fn expect_len(data: &[u8], expected: usize) -> Result<(), DecodeError> {
    if data.len() == expected {
        Ok(())
    } else {
        Err(DecodeError::Truncated {
            expected: expected as u64,
            actual: data.len() as u64,
        })
    }
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, DecodeError> {
    let bytes: [u8; 4] = field(data, offset)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64, DecodeError> {
    let bytes: [u8; 8] = field(data, offset)?;
    Ok(u64::from_le_bytes(bytes))
}

fn field<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], DecodeError> {
    data.get(offset..offset + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(DecodeError::Truncated {
            expected: (offset + N) as u64,
            actual: data.len() as u64,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixed_layouts() {
        assert_eq!(encode(&Message::RandomNumber(0x0102_0304)), vec![0, 0, 0, 0, 4, 3, 2, 1]);
        assert_eq!(encode(&Message::GameBegin), vec![1, 0, 0, 0]);
        assert_eq!(encode(&Message::GameOver { primary_won: true }), vec![3, 0, 0, 0, 1]);
        assert_eq!(
            encode(&Message::Move("hi".to_string())),
            vec![2, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, b'h', b'i']
        );
    }

    #[test]
    fn test_roundtrip_variants() {
        let messages = vec![
            Message::RandomNumber(0),
            Message::RandomNumber(u32::MAX),
            Message::GameBegin,
            Message::Move(String::new()),
            Message::Move("héllo, wörld".to_string()),
            Message::Move("x".repeat(1 << 20)),
            Message::GameOver { primary_won: false },
            Message::GameOver { primary_won: true },
        ];

        for msg in messages {
            let bytes = msg.to_bytes();
            assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(decode(&[9, 0, 0, 0]), Err(DecodeError::UnknownTag(9)));
        assert_eq!(decode(&[0, 0, 0, 0x80, 1, 2]), Err(DecodeError::UnknownTag(0x8000_0000)));
    }

    #[test]
    fn test_short_tag() {
        assert_eq!(
            decode(&[0, 0]),
            Err(DecodeError::Truncated { expected: 4, actual: 2 })
        );
        assert!(matches!(decode(&[]), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn test_move_shorter_than_declared() {
        let mut bytes = encode(&Message::Move("hello".to_string()));
        bytes.truncate(bytes.len() - 2);
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::Truncated { expected: 17, actual: 15 })
        );
    }

    #[test]
    fn test_move_longer_than_declared() {
        let mut bytes = encode(&Message::Move("hello".to_string()));
        bytes.push(b'!');
        assert!(matches!(decode(&bytes), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn test_move_huge_declared_length() {
        let mut bytes = vec![2, 0, 0, 0];
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        bytes.extend_from_slice(b"abc");
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::Truncated { expected: u64::MAX, actual: 15 })
        ));
    }

    #[test]
    fn test_move_header_truncated() {
        assert!(matches!(decode(&[2, 0, 0, 0, 5, 0]), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut bytes = vec![2, 0, 0, 0];
        bytes.extend_from_slice(&2u64.to_le_bytes());
        bytes.extend_from_slice(&[0xff, 0xfe]);
        assert_eq!(decode(&bytes), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn test_fixed_variant_trailing_bytes() {
        assert!(matches!(decode(&[1, 0, 0, 0, 0]), Err(DecodeError::Truncated { .. })));
        assert!(matches!(decode(&[0, 0, 0, 0, 1, 2, 3]), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn test_invalid_game_over_flag() {
        assert_eq!(decode(&[3, 0, 0, 0, 7]), Err(DecodeError::InvalidFlag(7)));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(Message::GameBegin.kind().to_string(), "game_begin");
        assert_eq!(MessageKind::from_tag(2), Some(MessageKind::Move));
        assert_eq!(MessageKind::from_tag(4), None);
    }

    proptest! {
        #[test]
        fn prop_move_roundtrip(text in ".*") {
            let msg = Message::Move(text);
            prop_assert_eq!(decode(&encode(&msg)).unwrap(), msg);
        }

        #[test]
        fn prop_truncated_move_never_panics(text in ".{0,64}", cut in 0usize..80) {
            let bytes = encode(&Message::Move(text));
            let cut = cut.min(bytes.len());
            let result = decode(&bytes[..cut]);
            if cut < bytes.len() {
                prop_assert!(matches!(result, Err(DecodeError::Truncated { .. })), "expected Truncated, got {:?}", result);
            } else {
                prop_assert!(result.is_ok());
            }
        }

        #[test]
        fn prop_arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = decode(&bytes);
        }
    }
}
