//! Background data-available notifier
//!
//! Polls a channel on its own thread and fires a callback once per
//! availability episode. The consumer calls `rearm` after draining the
//! channel to receive the next notification.

use super::Channel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct DataNotifier {
    active: Arc<AtomicBool>,
    notified: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DataNotifier {
    /// Start polling `channel` every `interval`
    pub fn start<F>(channel: Arc<dyn Channel>, interval: Duration, callback: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let notified = Arc::new(AtomicBool::new(false));

        let thread_active = Arc::clone(&active);
        let thread_notified = Arc::clone(&notified);
        let handle = thread::Builder::new()
            .name("data-notifier".into())
            .spawn(move || {
                while thread_active.load(Ordering::SeqCst) {
                    if !thread_notified.load(Ordering::SeqCst) && channel.data_available() {
                        thread_notified.store(true, Ordering::SeqCst);
                        callback();
                    }
                    thread::sleep(interval);
                }
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!("❌ Failed to start data notifier: {}", e);
                None
            }
        };

        Self {
            active,
            notified,
            handle,
        }
    }

    /// Allow the next notification
    pub fn rearm(&self) {
        self.notified.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && self.active.load(Ordering::SeqCst)
    }

    /// Stop polling and join the thread
    pub fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DataNotifier {
    fn drop(&mut self) {
        self.stop();
    }
}
