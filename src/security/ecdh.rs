//! Ephemeral P-521 ECDH
//!
//! Public keys travel as 140-byte ECC public blobs:
//!
//! ```text
//! magic "ECK5" (4) | key length = 66, u32 LE (4) | X (66) | Y (66)
//! ```
//!
//! The shared secret is the raw 66-byte X coordinate of the agreed point.
//! Private scalars are zeroized on drop.

use crate::error::{CommError, Result};
use p521::elliptic_curve::ecdh::diffie_hellman;
use p521::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p521::{EncodedPoint, PublicKey, SecretKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// Blob magic for a P-521 ECDH public key
pub const BLOB_MAGIC: [u8; 4] = *b"ECK5";

/// Coordinate length for P-521
pub const COORDINATE_LEN: usize = 66;

/// Encoded public key length
pub const PUBLIC_BLOB_LEN: usize = 8 + 2 * COORDINATE_LEN;

/// Ephemeral ECDH keypair
pub struct EcdhKeyPair {
    secret: SecretKey,
    public_blob: Vec<u8>,
}

impl EcdhKeyPair {
    /// Generate a fresh keypair from the OS RNG
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public_blob = encode_public_blob(&secret.public_key());
        Self { secret, public_blob }
    }

    /// 140-byte public blob
    pub fn public_blob(&self) -> &[u8] {
        &self.public_blob
    }

    /// Agree on a shared secret with a peer's public blob
    pub fn agree(&self, peer_blob: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let peer = decode_public_blob(peer_blob)?;
        let shared = diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    }
}

impl std::fmt::Debug for EcdhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdhKeyPair")
            .field("public", &hex::encode(&self.public_blob[8..16]))
            .finish_non_exhaustive()
    }
}

/// Encode a public key as a 140-byte blob
pub fn encode_public_blob(public: &PublicKey) -> Vec<u8> {
    let point = public.to_encoded_point(false);
    let mut blob = Vec::with_capacity(PUBLIC_BLOB_LEN);
    blob.extend_from_slice(&BLOB_MAGIC);
    blob.extend_from_slice(&(COORDINATE_LEN as u32).to_le_bytes());
    // Skip the SEC1 0x04 tag
    blob.extend_from_slice(&point.as_bytes()[1..]);
    blob
}

/// Decode and validate a 140-byte public blob
pub fn decode_public_blob(blob: &[u8]) -> Result<PublicKey> {
    if blob.len() != PUBLIC_BLOB_LEN {
        return Err(CommError::ProtocolViolation(format!(
            "Public key blob must be {} bytes, got {}",
            PUBLIC_BLOB_LEN,
            blob.len()
        )));
    }
    if blob[..4] != BLOB_MAGIC {
        return Err(CommError::ProtocolViolation("Unknown public key blob magic".into()));
    }
    let declared = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]) as usize;
    if declared != COORDINATE_LEN {
        return Err(CommError::ProtocolViolation(format!(
            "Public key blob declares {}-byte coordinates",
            declared
        )));
    }

    let mut sec1 = Vec::with_capacity(1 + 2 * COORDINATE_LEN);
    sec1.push(0x04);
    sec1.extend_from_slice(&blob[8..]);

    let point = EncodedPoint::from_bytes(&sec1)
        .map_err(|_| CommError::ProtocolViolation("Malformed public key point".into()))?;
    Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
        .ok_or_else(|| CommError::ProtocolViolation("Public key is not on P-521".into()))
}
