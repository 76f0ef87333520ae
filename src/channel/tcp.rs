//! TCP channel
//!
//! Frames are carried with a 4-byte little-endian length prefix so message
//! boundaries survive TCP coalescing. Reads use a short socket timeout so a
//! receive call never blocks longer than one poll interval.

use super::Channel;
use crate::error::{CommError, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Upper bound on how long a single read blocks
pub const READ_POLL: Duration = Duration::from_millis(10);

const LENGTH_PREFIX: usize = 4;

struct FrameReader {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl FrameReader {
    /// Pop one complete frame from the buffer
    fn take_frame(&mut self, max_frame_len: usize) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]) as usize;
        if len > max_frame_len {
            return Err(CommError::ProtocolViolation(format!(
                "Frame of {} bytes exceeds limit of {}",
                len, max_frame_len
            )));
        }
        if self.buffer.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }

        let frame = self.buffer[LENGTH_PREFIX..LENGTH_PREFIX + len].to_vec();
        self.buffer.drain(..LENGTH_PREFIX + len);
        Ok(Some(frame))
    }

    fn has_frame(&self) -> bool {
        self.buffer.len() >= LENGTH_PREFIX && {
            let len = u32::from_le_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]) as usize;
            self.buffer.len() >= LENGTH_PREFIX + len
        }
    }
}

/// Length-prefixed frames over a `TcpStream`
pub struct TcpChannel {
    reader: Mutex<FrameReader>,
    writer: Mutex<TcpStream>,
    connected: AtomicBool,
    peer: String,
    max_frame_len: usize,
}

impl TcpChannel {
    /// Wrap an already-connected stream
    pub fn from_stream(stream: TcpStream, max_frame_len: usize) -> Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_POLL))?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let writer = stream.try_clone()?;

        Ok(Self {
            reader: Mutex::new(FrameReader {
                stream,
                buffer: Vec::new(),
            }),
            writer: Mutex::new(writer),
            connected: AtomicBool::new(true),
            peer,
            max_frame_len,
        })
    }

    /// Connect directly, trying every resolved address in turn
    pub fn connect(address: &str, port: u16, timeout: Duration, max_frame_len: usize) -> Result<Self> {
        let addrs: Vec<SocketAddr> = (address, port).to_socket_addrs()?.collect();
        let mut last_err = CommError::TransportFailure(format!("{}:{} did not resolve", address, port));

        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    log::info!("🔌 Connected to {}", addr);
                    return Self::from_stream(stream, max_frame_len);
                }
                Err(e) => {
                    log::debug!("Connect to {} failed: {}", addr, e);
                    last_err = e.into();
                }
            }
        }
        Err(last_err)
    }

    /// Accept one connection from a listener
    pub fn accept(listener: &TcpListener, max_frame_len: usize) -> Result<Self> {
        let (stream, addr) = listener.accept()?;
        stream.set_nonblocking(false)?;
        log::info!("🔌 Accepted connection from {}", addr);
        Self::from_stream(stream, max_frame_len)
    }

    fn lock_reader(&self) -> Result<MutexGuard<'_, FrameReader>> {
        self.reader
            .lock()
            .map_err(|_| CommError::InvalidState("reader lock poisoned".into()))
    }

    fn fail(&self, err: CommError) -> CommError {
        self.connected.store(false, Ordering::SeqCst);
        err
    }
}

impl Channel for TcpChannel {
    fn send(&self, frame: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(CommError::NotConnected);
        }
        let len = u32::try_from(frame.len())
            .map_err(|_| CommError::ProtocolViolation("Frame too large".into()))?;

        let mut packet = Vec::with_capacity(LENGTH_PREFIX + frame.len());
        packet.extend_from_slice(&len.to_le_bytes());
        packet.extend_from_slice(frame);

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| CommError::InvalidState("writer lock poisoned".into()))?;
        writer
            .write_all(&packet)
            .and_then(|_| writer.flush())
            .map_err(|e| self.fail(e.into()))
    }

    fn try_receive(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.lock_reader()?;
        if let Some(frame) = reader.take_frame(self.max_frame_len).map_err(|e| self.fail(e))? {
            return Ok(Some(frame));
        }
        if !self.is_connected() {
            return Err(CommError::NotConnected);
        }

        let mut chunk = [0u8; 4096];
        match reader.stream.read(&mut chunk) {
            Ok(0) => Err(self.fail(CommError::TransportFailure(format!(
                "{} closed the connection",
                self.peer
            )))),
            Ok(n) => {
                reader.buffer.extend_from_slice(&chunk[..n]);
                reader.take_frame(self.max_frame_len).map_err(|e| self.fail(e))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                Ok(None)
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    fn data_available(&self) -> bool {
        let Ok(reader) = self.lock_reader() else {
            return false;
        };
        if reader.has_frame() {
            return true;
        }
        if !self.is_connected() {
            return false;
        }

        // EOF also counts: the next read reports it
        let mut peeked = [0u8; 1];
        match reader.stream.peek(&mut peeked) {
            Ok(_) => true,
            Err(e) => !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            log::debug!("🔌 Closing connection to {}", self.peer);
        }
        if let Ok(writer) = self.writer.lock() {
            let _ = writer.shutdown(Shutdown::Both);
        }
    }

    fn peer_label(&self) -> String {
        self.peer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn loopback_pair() -> (TcpChannel, TcpChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = TcpChannel::connect("127.0.0.1", port, Duration::from_secs(2), 1 << 20).unwrap();
        let server = TcpChannel::accept(&listener, 1 << 20).unwrap();
        (client, server)
    }

    fn receive_within(channel: &TcpChannel, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(frame) = channel.try_receive().unwrap() {
                return Some(frame);
            }
        }
        None
    }

    #[test]
    fn test_frames_keep_boundaries() {
        let (client, server) = loopback_pair();
        client.send(b"first").unwrap();
        client.send(b"").unwrap();
        client.send(b"third").unwrap();

        let timeout = Duration::from_secs(2);
        assert_eq!(receive_within(&server, timeout).unwrap(), b"first");
        assert_eq!(receive_within(&server, timeout).unwrap(), b"");
        assert_eq!(receive_within(&server, timeout).unwrap(), b"third");
    }

    #[test]
    fn test_empty_poll_returns_none() {
        let (_client, server) = loopback_pair();
        assert!(server.try_receive().unwrap().is_none());
        assert!(!server.data_available());
    }

    #[test]
    fn test_peer_close_is_error() {
        let (client, server) = loopback_pair();
        client.close();
        assert!(!client.is_connected());
        assert!(matches!(client.send(b"x"), Err(CommError::NotConnected)));

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match server.try_receive() {
                Err(_) => break,
                Ok(_) => assert!(Instant::now() < deadline, "close never observed"),
            }
        }
        assert!(!server.is_connected());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut raw = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let server = TcpChannel::accept(&listener, 1024).unwrap();

        raw.write_all(&(1u32 << 20).to_le_bytes()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match server.try_receive() {
                Err(e) => {
                    assert!(matches!(e, CommError::ProtocolViolation(_)));
                    break;
                }
                Ok(_) => assert!(Instant::now() < deadline),
            }
        }
    }
}
