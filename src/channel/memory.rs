//! In-memory channel pair
//!
//! Two connected endpoints backed by shared queues. Used to run both sides
//! of a handshake or transport inside one process. An outbound filter can
//! rewrite or drop frames to simulate a hostile or broken link.

use super::Channel;
use crate::error::{CommError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Rewrites an outbound frame; `None` drops it
pub type FrameFilter = Box<dyn FnMut(Vec<u8>) -> Option<Vec<u8>> + Send>;

type Pipe = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// One end of an in-memory duplex link
pub struct MemoryChannel {
    label: &'static str,
    inbox: Pipe,
    outbox: Pipe,
    connected: Arc<AtomicBool>,
    filter: Mutex<Option<FrameFilter>>,
}

impl MemoryChannel {
    /// Create two connected endpoints
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        let a_to_b: Pipe = Arc::default();
        let b_to_a: Pipe = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));

        let a = MemoryChannel {
            label: "memory-a",
            inbox: Arc::clone(&b_to_a),
            outbox: Arc::clone(&a_to_b),
            connected: Arc::clone(&connected),
            filter: Mutex::new(None),
        };
        let b = MemoryChannel {
            label: "memory-b",
            inbox: a_to_b,
            outbox: b_to_a,
            connected,
            filter: Mutex::new(None),
        };
        (a, b)
    }

    /// Pass every frame this end sends through `filter`
    pub fn set_outbound_filter<F>(&self, filter: F)
    where
        F: FnMut(Vec<u8>) -> Option<Vec<u8>> + Send + 'static,
    {
        *self.filter.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(filter));
    }

    /// Frames waiting to be read at this end
    pub fn pending(&self) -> usize {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Channel for MemoryChannel {
    fn send(&self, frame: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(CommError::NotConnected);
        }

        let frame = {
            let mut filter = self.filter.lock().unwrap_or_else(PoisonError::into_inner);
            match filter.as_mut() {
                Some(f) => f(frame.to_vec()),
                None => Some(frame.to_vec()),
            }
        };

        if let Some(frame) = frame {
            self.outbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(frame);
        }
        Ok(())
    }

    fn try_receive(&self) -> Result<Option<Vec<u8>>> {
        // Frames already delivered stay readable after close, like a socket
        if let Some(frame) = self.inbox.lock().unwrap_or_else(PoisonError::into_inner).pop_front() {
            return Ok(Some(frame));
        }
        if !self.is_connected() {
            return Err(CommError::TransportFailure(format!("{} closed", self.label)));
        }
        Ok(None)
    }

    fn data_available(&self) -> bool {
        self.pending() > 0
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn peer_label(&self) -> String {
        self.label.to_string()
    }
}
