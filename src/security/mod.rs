//! Cryptographic building blocks
//!
//! - `key_factory`: the 256-track per-message key ratchet
//! - `cipher`: AES-256-CBC framing for handshake and transport messages
//! - `ecdh`: ephemeral P-521 key agreement with 140-byte public blobs

pub mod cipher;
pub mod ecdh;
pub mod key_factory;

pub use cipher::SessionCipher;
pub use ecdh::EcdhKeyPair;
pub use key_factory::KeyFactory;
