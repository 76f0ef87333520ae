//! Session handshake
//!
//! Two peers agree on a shared secret and a ratchet configuration in four
//! message exchanges, every message framed as `HEADER || tag || payload`:
//!
//! ```text
//! CLIENT                                   SERVER
//!   ASSOC ------------------------------------>
//!   <----------------------------- ACK(pub_s)
//!   ACK(pub_c) ------------------------------->
//!   <------------------------ SYN(E_k(nonce))
//!   SYN(E_k(nonce)) -------------------------->   mismatch => NACK
//!   <------------------------ EOT(E_k(token))
//!   EOT(E_k(mirrored token)) ----------------->
//!   DONE                                   DONE
//! ```
//!
//! `k` is derived from the ACK-stage ECDH exchange and only protects the
//! handshake itself. The token carries a fresh EOT-stage public key, the
//! ratchet offset and the four track assignments; the final shared secret
//! comes from the two EOT-stage keys.
//!
//! `engine` is a sans-IO state machine; `driver` runs it over a `Channel`.

pub mod driver;
pub mod engine;
pub mod message;
pub mod token;

pub use driver::perform_handshake_synchronously;
pub use engine::{HandshakeEngine, Step};
pub use message::{HandshakeMessage, HandshakeStage, HEADER};
pub use token::{SessionToken, TrackAssignment, TOKEN_LEN};

use crate::error::{CommError, Result};
use crate::security::EcdhKeyPair;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// Which side of the handshake a transport plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionMode {
    Client,
    Server,
}

impl ConnectionMode {
    /// The opposite role
    pub fn peer(self) -> Self {
        match self {
            ConnectionMode::Client => ConnectionMode::Server,
            ConnectionMode::Server => ConnectionMode::Client,
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::Client => f.write_str("client"),
            ConnectionMode::Server => f.write_str("server"),
        }
    }
}

/// Output of a completed handshake
#[derive(Default)]
pub struct SessionParameters {
    peer_public_key: Option<Vec<u8>>,
    local_keypair: Option<EcdhKeyPair>,

    /// Ratchet offset handed to `KeyFactory::reseed`
    pub offset: u16,

    pub tracks: TrackAssignment,

    pub completed_no_errors: bool,
}

impl SessionParameters {
    pub(crate) fn new(
        peer_public_key: Vec<u8>,
        local_keypair: EcdhKeyPair,
        offset: u16,
        tracks: TrackAssignment,
    ) -> Self {
        Self {
            peer_public_key: Some(peer_public_key),
            local_keypair: Some(local_keypair),
            offset,
            tracks,
            completed_no_errors: true,
        }
    }

    pub fn peer_public_key(&self) -> Option<&[u8]> {
        self.peer_public_key.as_deref()
    }

    pub fn local_public_key(&self) -> Option<&[u8]> {
        self.local_keypair.as_ref().map(|k| k.public_blob())
    }

    /// Whether the local private key is still held
    pub fn has_private_key(&self) -> bool {
        self.local_keypair.is_some()
    }

    /// Derive the session's shared secret.
    ///
    /// Consumes the local private key: a second call fails.
    pub fn derive_shared_secret(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        let peer = self
            .peer_public_key
            .as_deref()
            .ok_or_else(|| CommError::InvalidState("No peer public key".into()))?;
        let keypair = self
            .local_keypair
            .take()
            .ok_or_else(|| CommError::InvalidState("Local private key already consumed".into()))?;

        keypair.agree(peer)
    }

    pub(crate) fn dispose(&mut self) {
        self.local_keypair = None;
        self.completed_no_errors = false;
    }
}

impl fmt::Debug for SessionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParameters")
            .field("offset", &self.offset)
            .field("tracks", &self.tracks)
            .field("has_peer_key", &self.peer_public_key.is_some())
            .field("has_private_key", &self.has_private_key())
            .field("completed_no_errors", &self.completed_no_errors)
            .finish()
    }
}
