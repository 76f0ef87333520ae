//! Byte-stream channels
//!
//! A `Channel` is the reliable, in-order, message-framed duplex link the
//! handshake and transport run over. The core never cares whether frames
//! travel over a direct TCP socket, a socket tunnelled through Tor's SOCKS
//! port, or an in-memory pipe.

pub mod memory;
pub mod notifier;
pub mod socks;
pub mod tcp;

pub use memory::MemoryChannel;
pub use notifier::DataNotifier;
pub use tcp::TcpChannel;

use crate::error::Result;

/// Duplex frame channel shared between the handshake, the workers and the
/// notifier thread
pub trait Channel: Send + Sync {
    /// Write one frame
    fn send(&self, frame: &[u8]) -> Result<()>;

    /// Read one frame if one is ready.
    ///
    /// `Ok(None)` means nothing is available yet. A closed or failed link is
    /// an error.
    fn try_receive(&self) -> Result<Option<Vec<u8>>>;

    /// Whether a `try_receive` would make progress
    fn data_available(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Close the link. Idempotent.
    fn close(&self);

    /// Peer description for logs
    fn peer_label(&self) -> String {
        "peer".to_string()
    }
}
