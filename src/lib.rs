//! # tor-comm
//!
//! Encrypted peer-to-peer messaging between two endpoints, typically a
//! client and a hidden service reached through Tor.
//!
//! ## Architecture
//!
//! ```text
//! AppContext
//!   ↓
//! TransportProtocol ── outbound / inbound workers
//!   ↓                        ↓
//! Handshake (P-521)     KeyFactory tracks → AES-256-CBC per message
//!   ↓
//! Channel (TCP, SOCKS5 via Tor, in-memory)
//! ```
//!
//! A connection runs a six-stage handshake (ASSOC, ACK, SYN, EOT, DONE, with
//! NACK on failure) that agrees on a shared secret, a Fibonacci offset and
//! four key-sequence tracks. Both peers seed identical `KeyFactory`
//! instances from that, so every message gets a fresh key and IV without
//! any further negotiation.
//!
//! ## Features
//!
//! - **Blocking API**: plain threads, no async runtime
//! - **Tor integration**: SOCKS5 connect to `.onion` names, control port
//!   client for publishing hidden services
//! - **Testable**: every transport runs over the `Channel` trait, with an
//!   in-memory pair for tests

pub mod channel;
pub mod config;
pub mod context;
pub mod control;
pub mod directory;
mod error;
pub mod handshake;
pub mod security;
pub mod transport;

pub use channel::{Channel, MemoryChannel, TcpChannel};
pub use config::{CommConfig, ControlConfig};
pub use context::AppContext;
pub use control::{ControlPort, TorControlClient};
pub use directory::{RouterDirectory, RouterRecord};
pub use error::{CommError, ErrorCode, Result};
pub use handshake::{ConnectionMode, SessionParameters};
pub use security::KeyFactory;
pub use transport::{TransportProtocol, TransportState};
