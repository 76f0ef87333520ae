//! Session token exchanged at the EOT stage
//!
//! Fixed-width uppercase hex, 292 characters:
//!
//! ```text
//! public key blob (280) | offset (4) | server key | server iv | client key | client iv (2 each)
//! ```

use super::ConnectionMode;
use crate::error::{CommError, Result};
use crate::security::ecdh::PUBLIC_BLOB_LEN;
use crate::security::key_factory::TRACK_MODULUS;
use rand::rngs::OsRng;
use rand::Rng;

/// Token length in characters
pub const TOKEN_LEN: usize = PUBLIC_BLOB_LEN * 2 + 4 + 4 * 2;

/// Offsets are drawn from `[0, OFFSET_RANGE)`
pub const OFFSET_RANGE: u16 = 4096;

/// Four pairwise-distinct track indices in `[0, 255)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackAssignment {
    pub server_key_track: u8,
    pub server_iv_track: u8,
    pub client_key_track: u8,
    pub client_iv_track: u8,
}

impl TrackAssignment {
    /// Draw a fresh distinct assignment
    pub fn random() -> Self {
        let mut rng = OsRng;
        let mut picked: Vec<u8> = Vec::with_capacity(4);
        while picked.len() < 4 {
            let track = rng.gen_range(0..TRACK_MODULUS) as u8;
            if !picked.contains(&track) {
                picked.push(track);
            }
        }

        Self {
            server_key_track: picked[0],
            server_iv_track: picked[1],
            client_key_track: picked[2],
            client_iv_track: picked[3],
        }
    }

    fn as_array(&self) -> [u8; 4] {
        [
            self.server_key_track,
            self.server_iv_track,
            self.client_key_track,
            self.client_iv_track,
        ]
    }

    /// All tracks in range and pairwise distinct
    pub fn validate(&self) -> Result<()> {
        let tracks = self.as_array();
        for (i, track) in tracks.iter().enumerate() {
            if *track as usize >= TRACK_MODULUS {
                return Err(CommError::ProtocolViolation(format!(
                    "Track index {} out of range",
                    track
                )));
            }
            if tracks[i + 1..].contains(track) {
                return Err(CommError::ProtocolViolation(format!(
                    "Track index {} assigned twice",
                    track
                )));
            }
        }
        Ok(())
    }

    /// `(key, iv)` tracks this role encrypts with
    pub fn outbound(&self, mode: ConnectionMode) -> (usize, usize) {
        match mode {
            ConnectionMode::Client => (self.client_key_track as usize, self.client_iv_track as usize),
            ConnectionMode::Server => (self.server_key_track as usize, self.server_iv_track as usize),
        }
    }

    /// `(key, iv)` tracks this role decrypts with: the peer's outbound pair
    pub fn inbound(&self, mode: ConnectionMode) -> (usize, usize) {
        self.outbound(mode.peer())
    }
}

/// Parsed session token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub public_key: Vec<u8>,
    pub offset: u16,
    pub tracks: TrackAssignment,
}

impl SessionToken {
    pub fn new(public_key: &[u8], offset: u16, tracks: TrackAssignment) -> Self {
        Self {
            public_key: public_key.to_vec(),
            offset,
            tracks,
        }
    }

    pub fn encode(&self) -> String {
        let t = &self.tracks;
        format!(
            "{}{:04X}{:02X}{:02X}{:02X}{:02X}",
            hex::encode_upper(&self.public_key),
            self.offset,
            t.server_key_track,
            t.server_iv_track,
            t.client_key_track,
            t.client_iv_track
        )
    }

    /// Parse and validate a token.
    ///
    /// Nothing is returned unless every field is well formed.
    pub fn parse(token: &str) -> Result<Self> {
        if token.len() != TOKEN_LEN {
            return Err(CommError::ProtocolViolation(format!(
                "Expecting a {} character session token, got {}",
                TOKEN_LEN,
                token.len()
            )));
        }

        let bytes = hex::decode(token)
            .map_err(|e| CommError::ProtocolViolation(format!("Session token is not hex: {}", e)))?;
        let (public_key, rest) = bytes.split_at(PUBLIC_BLOB_LEN);

        let offset = u16::from_be_bytes([rest[0], rest[1]]);
        if offset >= OFFSET_RANGE {
            return Err(CommError::ProtocolViolation(format!(
                "Session offset {} out of range",
                offset
            )));
        }

        let tracks = TrackAssignment {
            server_key_track: rest[2],
            server_iv_track: rest[3],
            client_key_track: rest[4],
            client_iv_track: rest[5],
        };
        tracks.validate()?;

        Ok(Self::new(public_key, offset, tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionToken {
        SessionToken::new(
            &[0xAB; PUBLIC_BLOB_LEN],
            0x0FA1,
            TrackAssignment {
                server_key_track: 1,
                server_iv_track: 2,
                client_key_track: 0xFE,
                client_iv_track: 0x10,
            },
        )
    }

    #[test]
    fn test_token_layout() {
        let encoded = sample().encode();
        assert_eq!(encoded.len(), 292);
        assert_eq!(&encoded[280..], "0FA10102FE10");
        assert_eq!(SessionToken::parse(&encoded).unwrap(), sample());
    }

    #[test]
    fn test_truncated_token() {
        let encoded = sample().encode();
        let result = SessionToken::parse(&encoded[..291]);
        assert!(matches!(result, Err(CommError::ProtocolViolation(_))));
    }

    #[test]
    fn test_duplicate_tracks_rejected() {
        let mut token = sample();
        token.tracks.client_iv_track = token.tracks.server_key_track;
        assert!(SessionToken::parse(&token.encode()).is_err());
    }

    #[test]
    fn test_track_255_rejected() {
        let mut token = sample();
        token.tracks.server_iv_track = 0xFF;
        assert!(SessionToken::parse(&token.encode()).is_err());
    }

    #[test]
    fn test_offset_range() {
        let mut token = sample();
        token.offset = 4096;
        assert!(SessionToken::parse(&token.encode()).is_err());
    }

    #[test]
    fn test_random_assignment() {
        for _ in 0..64 {
            assert!(TrackAssignment::random().validate().is_ok());
        }
    }

    #[test]
    fn test_role_mirroring() {
        let tracks = sample().tracks;
        assert_eq!(tracks.outbound(ConnectionMode::Client), tracks.inbound(ConnectionMode::Server));
        assert_eq!(tracks.outbound(ConnectionMode::Server), (1, 2));
        assert_eq!(tracks.inbound(ConnectionMode::Server), (0xFE, 0x10));
    }
}
