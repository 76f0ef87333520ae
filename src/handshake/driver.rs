//! Runs a `HandshakeEngine` over a `Channel`
//!
//! A dedicated thread owns the engine and keeps one receive outstanding at a
//! time, woken by a `DataNotifier`. The caller blocks in
//! `perform_handshake_synchronously`, polling the published stage until the
//! thread reports `DONE` or the handshake budget runs out.

use super::engine::{HandshakeEngine, Step};
use super::message::HandshakeStage;
use super::{ConnectionMode, SessionParameters};
use crate::channel::{Channel, DataNotifier};
use crate::config::CommConfig;
use crate::error::{CommError, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Perform the handshake and block until it finishes.
///
/// On timeout the channel is closed and `CommError::Timeout` is returned.
pub fn perform_handshake_synchronously(
    channel: Arc<dyn Channel>,
    mode: ConnectionMode,
    config: &CommConfig,
) -> Result<SessionParameters> {
    let stage = Arc::new(AtomicU32::new(HandshakeStage::Assoc.tag()));
    let cancelled = Arc::new(AtomicBool::new(false));

    let handle = {
        let channel = Arc::clone(&channel);
        let stage = Arc::clone(&stage);
        let cancelled = Arc::clone(&cancelled);
        let wake = config.notifier_poll();
        thread::Builder::new()
            .name(format!("handshake-{}", mode))
            .spawn(move || run_handshake(channel, mode, stage, cancelled, wake))
            .map_err(|e| CommError::InvalidState(format!("Cannot spawn handshake thread: {}", e)))?
    };

    log::debug!("🤝 [{}] Handshake started with {}", mode, channel.peer_label());
    let timeout = config.handshake_timeout();
    let deadline = Instant::now() + timeout;

    while stage.load(Ordering::SeqCst) != HandshakeStage::Done.tag() && !handle.is_finished() {
        let now = Instant::now();
        if now >= deadline {
            log::warn!("⏱️ [{}] Handshake timed out after {:?}", mode, timeout);
            cancelled.store(true, Ordering::SeqCst);
            channel.close();
            let _ = handle.join();
            return Err(CommError::Timeout(format!("Handshake did not finish within {:?}", timeout)));
        }
        thread::sleep(config.handshake_poll().min(deadline - now));
    }

    handle
        .join()
        .map_err(|_| CommError::InvalidState("Handshake thread panicked".into()))?
}

fn run_handshake(
    channel: Arc<dyn Channel>,
    mode: ConnectionMode,
    stage: Arc<AtomicU32>,
    cancelled: Arc<AtomicBool>,
    wake: Duration,
) -> Result<SessionParameters> {
    let mut engine = HandshakeEngine::new(mode);
    let outcome = drive(&mut engine, &channel, &stage, &cancelled, wake);
    if outcome.is_err() {
        engine.terminate();
    }
    stage.store(HandshakeStage::Done.tag(), Ordering::SeqCst);

    outcome?;
    engine.into_parameters()
}

fn drive(
    engine: &mut HandshakeEngine,
    channel: &Arc<dyn Channel>,
    stage: &AtomicU32,
    cancelled: &AtomicBool,
    wake: Duration,
) -> Result<()> {
    let (tx, rx) = mpsc::channel::<()>();
    let notifier = DataNotifier::start(Arc::clone(channel), wake, move || {
        let _ = tx.send(());
    });

    if let Some(opening) = engine.start() {
        channel.send(&opening)?;
    }
    stage.store(engine.stage().tag(), Ordering::SeqCst);

    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Err(CommError::Timeout("Handshake cancelled".into()));
        }

        let _ = rx.recv_timeout(wake);

        while let Some(frame) = channel.try_receive()? {
            match engine.handle(&frame)? {
                Step::Reply(reply) => channel.send(&reply)?,
                Step::Finished(last) => {
                    if let Some(last) = last {
                        channel.send(&last)?;
                    }
                    return Ok(());
                }
                Step::Rejected(nack, err) => {
                    if let Err(e) = channel.send(&nack) {
                        log::debug!("Could not deliver NACK: {}", e);
                    }
                    return Err(err);
                }
            }
            stage.store(engine.stage().tag(), Ordering::SeqCst);
        }
        notifier.rearm();

        if !channel.is_connected() {
            return Err(CommError::TransportFailure("Connection lost during handshake".into()));
        }
    }
}
