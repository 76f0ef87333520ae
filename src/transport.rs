//! Secured message transport
//!
//! `TransportProtocol` owns one connection at a time:
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> HANDSHAKING -> SECURED -> DISCONNECTED
//! ```
//!
//! Once the handshake succeeds the Key Factory is reseeded with
//! `base64(shared secret)` and the negotiated offset, and two workers start:
//!
//! - **outbound**: drains the send queue in FIFO order, sealing each message
//!   with a key and IV mask pulled from this role's own tracks.
//! - **inbound**: reads frames as they arrive and opens them with the
//!   *peer's* tracks, since each side writes with its own track pair.
//!
//! Any transport or decryption failure tears the connection down from a
//! separate thread; callers observe it through `is_connected()`.

use crate::channel::socks;
use crate::channel::{Channel, TcpChannel};
use crate::config::CommConfig;
use crate::error::{CommError, Result};
use crate::handshake::{self, ConnectionMode, TrackAssignment};
use crate::security::cipher;
use crate::security::KeyFactory;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    Disconnected = 0,
    Connecting = 1,
    Handshaking = 2,
    Secured = 3,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransportState::Connecting,
            2 => TransportState::Handshaking,
            3 => TransportState::Secured,
            _ => TransportState::Disconnected,
        }
    }
}

/// Key bits pulled per message
const MESSAGE_KEY_BITS: usize = 256;
const MESSAGE_IV_BITS: usize = 128;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Authenticated, ratcheted message transport
pub struct TransportProtocol {
    inner: Arc<Inner>,
}

struct Inner {
    config: CommConfig,
    mode: Mutex<ConnectionMode>,

    connected: AtomicBool,
    secured: AtomicBool,
    accepting: AtomicBool,
    state: AtomicU8,
    /// Bumped for every connection attempt
    epoch: AtomicU64,
    /// Serializes teardown against new connection attempts
    teardown: Mutex<()>,

    channel: Mutex<Option<Arc<dyn Channel>>>,
    service_address: Mutex<Option<SocketAddr>>,
    key_factory: KeyFactory,
    tracks: Mutex<Option<TrackAssignment>>,

    inbound: Mutex<VecDeque<String>>,
    outbound: Mutex<VecDeque<String>>,

    workers: Mutex<Vec<JoinHandle<()>>>,
    establisher: Mutex<Option<JoinHandle<()>>>,
    last_error: Mutex<Option<CommError>>,
}

impl TransportProtocol {
    /// Create a transport with the default configuration
    pub fn new(mode: ConnectionMode) -> Self {
        Self::build(mode, CommConfig::default())
    }

    /// Create a transport with `config`, rejecting unusable values
    pub fn with_config(mode: ConnectionMode, config: CommConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(mode, config))
    }

    fn build(mode: ConnectionMode, config: CommConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                mode: Mutex::new(mode),
                connected: AtomicBool::new(false),
                secured: AtomicBool::new(false),
                accepting: AtomicBool::new(false),
                state: AtomicU8::new(TransportState::Disconnected as u8),
                epoch: AtomicU64::new(0),
                teardown: Mutex::new(()),
                channel: Mutex::new(None),
                service_address: Mutex::new(None),
                key_factory: KeyFactory::new(),
                tracks: Mutex::new(None),
                inbound: Mutex::new(VecDeque::new()),
                outbound: Mutex::new(VecDeque::new()),
                workers: Mutex::new(Vec::new()),
                establisher: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &CommConfig {
        &self.inner.config
    }

    pub fn mode(&self) -> ConnectionMode {
        *lock(&self.inner.mode)
    }

    /// Change role. Refused while a connection is active.
    pub fn set_operational_mode(&self, mode: ConnectionMode) -> Result<()> {
        if self.inner.state() != TransportState::Disconnected {
            return Err(CommError::InvalidState(
                "Cannot change mode while a connection is active".into(),
            ));
        }
        *lock(&self.inner.mode) = mode;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn is_secured(&self) -> bool {
        self.inner.secured.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TransportState {
        self.inner.state()
    }

    /// Address the server side is listening on
    pub fn service_address(&self) -> Option<SocketAddr> {
        *lock(&self.inner.service_address)
    }

    /// Most recent failure that ended a connection or handshake
    pub fn last_error(&self) -> Option<CommError> {
        lock(&self.inner.last_error).clone()
    }

    /// Listen on the configured `bind_port` (SERVER only)
    pub fn bind_default(&self) -> Result<SocketAddr> {
        self.bind(self.inner.config.bind_port)
    }

    /// Listen on `port` and accept one peer in the background (SERVER only)
    pub fn bind(&self, port: u16) -> Result<SocketAddr> {
        self.require_mode(ConnectionMode::Server, "bind")?;
        self.inner.begin()?;

        let listener = TcpListener::bind((self.inner.config.bind_address.as_str(), port))
            .and_then(|l| l.set_nonblocking(true).map(|_| l))
            .map_err(|e| self.inner.abort(e.into()))?;
        let local = listener.local_addr().map_err(|e| self.inner.abort(e.into()))?;

        *lock(&self.inner.service_address) = Some(local);
        self.inner.accepting.store(true, Ordering::SeqCst);
        log::info!("🎧 Listening on {}", local);

        let inner = Arc::clone(&self.inner);
        self.inner.spawn_establisher("transport-accept", move || {
            match inner.accept_one(&listener) {
                Ok(Some(channel)) => {
                    let _ = Inner::establish(&inner, channel);
                }
                Ok(None) => log::debug!("Accept cancelled"),
                Err(e) => inner.fail(e),
            }
        })?;
        Ok(local)
    }

    /// Connect to `address:port` in the background (CLIENT only).
    ///
    /// Uses the configured SOCKS proxy when one is set.
    pub fn connect(&self, address: &str, port: u16) -> Result<()> {
        if let Some(proxy) = self.inner.config.socks_proxy.clone() {
            return self.connect_via_proxy(&proxy, address, port);
        }
        self.require_mode(ConnectionMode::Client, "connect")?;
        self.inner.begin()?;

        let inner = Arc::clone(&self.inner);
        let address = address.to_string();
        self.inner.spawn_establisher("transport-connect", move || {
            let config = &inner.config;
            match TcpChannel::connect(&address, port, config.connect_timeout(), config.max_frame_len) {
                Ok(channel) => {
                    let _ = Inner::establish(&inner, Arc::new(channel));
                }
                Err(e) => inner.fail(e),
            }
        })
    }

    /// Connect to `host:port` through a SOCKS5 proxy in the background
    /// (CLIENT only). `host` may be an `.onion` name.
    pub fn connect_via_proxy(&self, proxy: &str, host: &str, port: u16) -> Result<()> {
        self.require_mode(ConnectionMode::Client, "connect")?;
        self.inner.begin()?;

        let inner = Arc::clone(&self.inner);
        let (proxy, host) = (proxy.to_string(), host.to_string());
        self.inner.spawn_establisher("transport-socks", move || {
            let config = &inner.config;
            let channel = socks::connect(&proxy, &host, port, config.connect_timeout())
                .and_then(|stream| TcpChannel::from_stream(stream, config.max_frame_len));
            match channel {
                Ok(channel) => {
                    let _ = Inner::establish(&inner, Arc::new(channel));
                }
                Err(e) => inner.fail(e),
            }
        })
    }

    /// Run the handshake over an already-connected channel and block until
    /// the transport is secured or the handshake fails
    pub fn attach(&self, channel: Arc<dyn Channel>) -> Result<()> {
        self.inner.begin()?;
        Inner::establish(&self.inner, channel)
    }

    /// Block until secured, the connection fails, or `timeout` elapses
    pub fn wait_until_secured(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match self.state() {
                TransportState::Secured => return true,
                TransportState::Disconnected => return false,
                _ => thread::sleep(self.inner.config.worker_poll().min(Duration::from_millis(10))),
            }
        }
        self.is_secured()
    }

    /// Queue a message for sending.
    ///
    /// Returns `false` without side effects unless the transport is
    /// connected, secured, the message is non-empty and the send queue
    /// holds fewer than `max_queue_len` messages.
    pub fn transmit(&self, message: &str) -> bool {
        if message.is_empty() || !self.is_connected() || !self.is_secured() {
            return false;
        }
        let mut outbound = lock(&self.inner.outbound);
        if outbound.len() >= self.inner.config.max_queue_len {
            log::debug!("Send queue full ({} messages)", outbound.len());
            return false;
        }
        outbound.push_back(message.to_string());
        true
    }

    /// Take the next received message, if any
    pub fn receive(&self) -> Option<String> {
        lock(&self.inner.inbound).pop_front()
    }

    /// Messages queued but not yet sent
    pub fn pending_outbound(&self) -> usize {
        lock(&self.inner.outbound).len()
    }

    /// Tear the connection down. Idempotent and safe from any state.
    pub fn disconnect(&self) {
        self.inner.disconnect();
        if let Some(handle) = lock(&self.inner.establisher).take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn require_mode(&self, expected: ConnectionMode, operation: &str) -> Result<()> {
        let mode = self.mode();
        if mode != expected {
            return Err(CommError::InvalidState(format!(
                "{} is only valid in {} mode (transport is {})",
                operation, expected, mode
            )));
        }
        Ok(())
    }
}

impl Drop for TransportProtocol {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Inner {
    fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: TransportState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Claim the transport for a new connection attempt
    fn begin(&self) -> Result<()> {
        let _teardown = lock(&self.teardown);
        let claimed = self.state.compare_exchange(
            TransportState::Disconnected as u8,
            TransportState::Connecting as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if claimed.is_err() {
            return Err(CommError::InvalidState("A connection is already active".into()));
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_error) = None;
        Ok(())
    }

    /// Undo `begin` after a synchronous setup failure
    fn abort(&self, err: CommError) -> CommError {
        self.set_state(TransportState::Disconnected);
        err
    }

    fn record_error(&self, err: CommError) {
        *lock(&self.last_error) = Some(err);
    }

    /// Record a connection failure and tear down
    fn fail(&self, err: CommError) {
        log::error!("❌ Connection failed: {}", err);
        self.record_error(err);
        self.disconnect();
    }

    fn spawn_establisher<F>(&self, name: &str, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(task)
            .map_err(|e| self.abort(CommError::InvalidState(format!("Cannot spawn {}: {}", name, e))))?;
        *lock(&self.establisher) = Some(handle);
        Ok(())
    }

    /// Poll the listener until a peer arrives or accepting is cancelled
    fn accept_one(&self, listener: &TcpListener) -> Result<Option<Arc<dyn Channel>>> {
        while self.accepting.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    self.accepting.store(false, Ordering::SeqCst);
                    stream.set_nonblocking(false)?;
                    log::info!("🔌 Accepted connection from {}", addr);
                    return Ok(Some(Arc::new(TcpChannel::from_stream(stream, self.config.max_frame_len)?)));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(self.config.worker_poll()),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Handshake, reseed and start the workers
    fn establish(inner: &Arc<Inner>, channel: Arc<dyn Channel>) -> Result<()> {
        *lock(&inner.channel) = Some(Arc::clone(&channel));
        inner.connected.store(channel.is_connected(), Ordering::SeqCst);
        if !channel.is_connected() {
            inner.fail(CommError::NotConnected);
            return Err(CommError::NotConnected);
        }

        inner.set_state(TransportState::Handshaking);
        let mode = *lock(&inner.mode);
        log::info!("🤝 [{}] Securing connection with {}", mode, channel.peer_label());

        match inner.secure(Arc::clone(&channel), mode) {
            Ok(tracks) => {
                if !inner.connected.load(Ordering::SeqCst) {
                    // disconnect() raced the handshake
                    return Err(CommError::NotConnected);
                }
                lock(&inner.inbound).clear();
                lock(&inner.outbound).clear();
                inner.secured.store(true, Ordering::SeqCst);
                inner.set_state(TransportState::Secured);
                Inner::start_workers(inner, channel, mode, tracks);
                log::info!("🔒 [{}] Connection secured", mode);
                Ok(())
            }
            Err(e) => {
                inner.fail(e.clone());
                Err(e)
            }
        }
    }

    fn secure(&self, channel: Arc<dyn Channel>, mode: ConnectionMode) -> Result<TrackAssignment> {
        let mut params = handshake::perform_handshake_synchronously(channel, mode, &self.config)?;
        if !params.completed_no_errors {
            return Err(CommError::HandshakeFailed("Handshake finished with errors".into()));
        }

        let secret = params.derive_shared_secret()?;
        let vector = Zeroizing::new(STANDARD.encode(&secret[..]));
        self.key_factory.reseed(vector.as_bytes(), params.offset as u32)?;

        *lock(&self.tracks) = Some(params.tracks);
        Ok(params.tracks)
    }

    fn start_workers(inner: &Arc<Inner>, channel: Arc<dyn Channel>, mode: ConnectionMode, tracks: TrackAssignment) {
        let mut workers = lock(&inner.workers);

        let spawned = [
            ("transport-outbound", {
                let inner = Arc::clone(inner);
                let channel = Arc::clone(&channel);
                Box::new(move || inner.outbound_loop(channel, tracks.outbound(mode))) as Box<dyn FnOnce() + Send>
            }),
            ("transport-inbound", {
                let inner = Arc::clone(inner);
                Box::new(move || inner.inbound_loop(channel, tracks.inbound(mode))) as Box<dyn FnOnce() + Send>
            }),
        ];

        for (name, task) in spawned {
            match thread::Builder::new().name(name.to_string()).spawn(task) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    drop(workers);
                    Inner::spawn_disconnect(inner, CommError::InvalidState(format!("Cannot spawn {}: {}", name, e)));
                    return;
                }
            }
        }
    }

    fn outbound_loop(self: Arc<Self>, channel: Arc<dyn Channel>, (key_track, iv_track): (usize, usize)) {
        while self.connected.load(Ordering::SeqCst) {
            let Some(message) = self.next_outbound() else {
                thread::sleep(self.config.worker_poll());
                continue;
            };

            let sent = self
                .seal(key_track, iv_track, &message)
                .and_then(|frame| channel.send(&frame));
            match sent {
                Ok(()) => log::trace!("📤 Sent {} byte message", message.len()),
                Err(e) => {
                    Inner::spawn_disconnect(&self, e);
                    return;
                }
            }
        }
    }

    /// Pop the next message, spinning on contention up to the retry cap.
    ///
    /// Exhausting the cap leaves the queue untouched; the message is picked
    /// up on the next pass.
    fn next_outbound(&self) -> Option<String> {
        for _ in 0..self.config.dequeue_retry_limit {
            match self.outbound.try_lock() {
                Ok(mut queue) => return queue.pop_front(),
                Err(TryLockError::Poisoned(poisoned)) => return poisoned.into_inner().pop_front(),
                Err(TryLockError::WouldBlock) => std::hint::spin_loop(),
            }
        }
        log::warn!("⚠️ Outbound queue contended for {} attempts", self.config.dequeue_retry_limit);
        None
    }

    fn inbound_loop(self: Arc<Self>, channel: Arc<dyn Channel>, (key_track, iv_track): (usize, usize)) {
        while self.connected.load(Ordering::SeqCst) {
            if !channel.data_available() {
                if !channel.is_connected() {
                    Inner::spawn_disconnect(&self, CommError::TransportFailure("Peer went away".into()));
                    return;
                }
                thread::sleep(self.config.worker_poll());
                continue;
            }

            // Backpressure: leave frames on the wire until the queue drains
            if lock(&self.inbound).len() >= self.config.max_queue_len {
                thread::sleep(self.config.worker_poll());
                continue;
            }

            match channel.try_receive() {
                Ok(Some(frame)) => match self.open(key_track, iv_track, &frame) {
                    Ok(message) => {
                        log::trace!("📥 Received {} byte message", message.len());
                        lock(&self.inbound).push_back(message);
                    }
                    Err(e) => {
                        log::error!("❌ Dropping connection after undecryptable frame: {}", e);
                        Inner::spawn_disconnect(&self, e);
                        return;
                    }
                },
                Ok(None) => thread::sleep(self.config.worker_poll()),
                Err(e) => {
                    Inner::spawn_disconnect(&self, e);
                    return;
                }
            }
        }
    }

    fn seal(&self, key_track: usize, iv_track: usize, message: &str) -> Result<Vec<u8>> {
        let key = self.key_factory.get_key_from_track(key_track, MESSAGE_KEY_BITS)?;
        let iv_mask = self.key_factory.get_key_from_track(iv_track, MESSAGE_IV_BITS)?;
        cipher::seal_message(&key, &iv_mask, message)
    }

    fn open(&self, key_track: usize, iv_track: usize, frame: &[u8]) -> Result<String> {
        let key = self.key_factory.get_key_from_track(key_track, MESSAGE_KEY_BITS)?;
        let iv_mask = self.key_factory.get_key_from_track(iv_track, MESSAGE_IV_BITS)?;
        cipher::open_message(&key, &iv_mask, frame)
    }

    /// Tear down from a worker without joining itself.
    ///
    /// A teardown that starts after the transport has moved on to a new
    /// connection is skipped.
    fn spawn_disconnect(inner: &Arc<Inner>, reason: CommError) {
        log::warn!("⚠️ Connection lost: {}", reason);
        inner.record_error(reason);
        inner.connected.store(false, Ordering::SeqCst);

        let epoch = inner.epoch.load(Ordering::SeqCst);
        let inner = Arc::clone(inner);
        if let Err(e) = thread::Builder::new()
            .name("transport-disconnect".into())
            .spawn(move || {
                let _teardown = lock(&inner.teardown);
                if inner.epoch.load(Ordering::SeqCst) == epoch {
                    inner.close_connection();
                } else {
                    log::debug!("Stale teardown skipped");
                }
            })
        {
            log::error!("❌ Cannot spawn disconnect thread: {}", e);
        }
    }

    fn disconnect(&self) {
        let _teardown = lock(&self.teardown);
        self.close_connection();
    }

    fn close_connection(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        let was_active = self.state() != TransportState::Disconnected;

        self.accepting.store(false, Ordering::SeqCst);
        self.secured.store(false, Ordering::SeqCst);

        if let Some(channel) = lock(&self.channel).take() {
            channel.close();
        }

        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        *lock(&self.tracks) = None;
        self.set_state(TransportState::Disconnected);

        if was_connected || was_active {
            log::info!("🔌 Disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;

    #[test]
    fn test_transmit_requires_secured() {
        let transport = TransportProtocol::new(ConnectionMode::Client);
        assert!(!transport.transmit("x"));
        assert_eq!(transport.pending_outbound(), 0);
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[test]
    fn test_mode_guards() {
        let transport = TransportProtocol::new(ConnectionMode::Client);
        assert!(matches!(transport.bind(0), Err(CommError::InvalidState(_))));

        transport.set_operational_mode(ConnectionMode::Server).unwrap();
        assert!(matches!(
            transport.connect("127.0.0.1", 1),
            Err(CommError::InvalidState(_))
        ));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let transport = TransportProtocol::new(ConnectionMode::Server);
        transport.disconnect();
        transport.disconnect();
        assert!(!transport.is_connected());
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[test]
    fn test_attach_closed_channel() {
        let (a, _b) = MemoryChannel::pair();
        a.close();
        let transport = TransportProtocol::with_config(ConnectionMode::Client, CommConfig::fast()).unwrap();
        assert!(transport.attach(Arc::new(a)).is_err());
        assert_eq!(transport.state(), TransportState::Disconnected);
        assert!(transport.last_error().is_some());
    }

    #[test]
    fn test_bind_then_cancel() {
        let transport = TransportProtocol::with_config(ConnectionMode::Server, CommConfig::fast()).unwrap();
        let addr = transport.bind(0).unwrap();
        assert_eq!(transport.service_address(), Some(addr));
        assert_eq!(transport.state(), TransportState::Connecting);
        assert!(transport.set_operational_mode(ConnectionMode::Client).is_err());

        transport.disconnect();
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[test]
    fn test_rejects_unusable_config() {
        let stalled = CommConfig {
            dequeue_retry_limit: 0,
            ..CommConfig::fast()
        };
        assert!(matches!(
            TransportProtocol::with_config(ConnectionMode::Client, stalled),
            Err(CommError::Config(_))
        ));

        let spinning = CommConfig::fast().with_worker_poll(Duration::ZERO);
        assert!(matches!(
            TransportProtocol::with_config(ConnectionMode::Client, spinning),
            Err(CommError::Config(_))
        ));
    }

    #[test]
    fn test_bind_default_uses_configured_port() {
        let port = {
            let free = TcpListener::bind("127.0.0.1:0").unwrap();
            free.local_addr().unwrap().port()
        };
        let config = CommConfig {
            bind_port: port,
            ..CommConfig::fast()
        };
        let transport = TransportProtocol::with_config(ConnectionMode::Server, config).unwrap();

        let addr = transport.bind_default().unwrap();
        assert_eq!(addr.port(), port);
        assert_eq!(transport.service_address(), Some(addr));
        transport.disconnect();
    }
}
