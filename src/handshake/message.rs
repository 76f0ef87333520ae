//! Handshake wire format
//!
//! ```text
//! +----------------+-------------+-----------------+
//! | HEADER (16)    | TAG (4, LE) | PAYLOAD (0..)   |
//! +----------------+-------------+-----------------+
//! ```

use crate::error::{CommError, Result};
use std::fmt;

/// Magic prefix on every handshake message
pub const HEADER: [u8; 16] = [
    0x03, 0x9B, 0x03, 0xAE, 0x03, 0xBB, 0x03, 0xB1, 0x03, 0x8D, 0x03, 0xC4, 0x03, 0xBF, 0x03, 0xC2,
];

/// Header plus stage tag
pub const PREFIX_LEN: usize = HEADER.len() + 4;

/// Handshake stage, also the on-wire message tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HandshakeStage {
    Assoc = 0x2401,
    Eot = 0x2404,
    Ack = 0x2406,
    Nack = 0x2415,
    Syn = 0x2416,
    Done = 0x2499,
}

impl HandshakeStage {
    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0x2401 => Some(Self::Assoc),
            0x2404 => Some(Self::Eot),
            0x2406 => Some(Self::Ack),
            0x2415 => Some(Self::Nack),
            0x2416 => Some(Self::Syn),
            0x2499 => Some(Self::Done),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Assoc => "ASSOC",
            Self::Eot => "EOT",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Syn => "SYN",
            Self::Done => "DONE",
        }
    }
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One framed handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub stage: HandshakeStage,
    pub payload: Vec<u8>,
}

impl HandshakeMessage {
    pub fn new(stage: HandshakeStage, payload: Vec<u8>) -> Self {
        Self { stage, payload }
    }

    /// Message with no payload (ASSOC, NACK)
    pub fn bare(stage: HandshakeStage) -> Self {
        Self::new(stage, Vec::new())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PREFIX_LEN + self.payload.len());
        out.extend_from_slice(&HEADER);
        out.extend_from_slice(&self.stage.tag().to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PREFIX_LEN {
            return Err(CommError::ProtocolViolation(format!(
                "Handshake message too short: {} bytes",
                bytes.len()
            )));
        }
        if bytes[..HEADER.len()] != HEADER {
            return Err(CommError::ProtocolViolation("Invalid handshake header".into()));
        }

        let tag = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let stage = HandshakeStage::from_tag(tag).ok_or_else(|| {
            CommError::ProtocolViolation(format!("Unknown handshake tag 0x{:04X}", tag))
        })?;

        Ok(Self::new(stage, bytes[PREFIX_LEN..].to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assoc_bytes() {
        let bytes = HandshakeMessage::bare(HandshakeStage::Assoc).encode();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[..16], &HEADER);
        assert_eq!(&bytes[16..], &[0x01, 0x24, 0x00, 0x00]);
    }

    #[test]
    fn test_decode_payload() {
        let msg = HandshakeMessage::new(HandshakeStage::Syn, b"nonce".to_vec());
        let decoded = HandshakeMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_rejects_bad_header() {
        let mut bytes = HandshakeMessage::bare(HandshakeStage::Ack).encode();
        bytes[0] = 0x04;
        assert!(matches!(
            HandshakeMessage::decode(&bytes),
            Err(CommError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let mut bytes = HEADER.to_vec();
        bytes.extend_from_slice(&0x1234u32.to_le_bytes());
        assert!(HandshakeMessage::decode(&bytes).is_err());
        assert!(HandshakeMessage::decode(&HEADER[..10]).is_err());
    }

    #[test]
    fn test_tags() {
        for stage in [
            HandshakeStage::Assoc,
            HandshakeStage::Ack,
            HandshakeStage::Syn,
            HandshakeStage::Nack,
            HandshakeStage::Eot,
            HandshakeStage::Done,
        ] {
            assert_eq!(HandshakeStage::from_tag(stage.tag()), Some(stage));
        }
        assert_eq!(HandshakeStage::Nack.tag(), 0x2415);
    }
}
