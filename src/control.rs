//! Tor control port client
//!
//! Line-based control protocol over TCP. Replies are assembled from
//! `250-` continuation lines, `250+` data blocks terminated by `.`, and a
//! final `250 ` line. Asynchronous `6xx` events are routed to registered
//! handlers instead of the command that happens to be waiting.
//!
//! The transport core never depends on this module; the application uses
//! it to publish the transport's service address as a hidden service.

use crate::config::ControlConfig;
use crate::error::{CommError, Result};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Callback for asynchronous control port events
pub type EventHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Events needed to follow hidden service descriptor fetches
pub const HS_DESCRIPTOR_EVENTS: [&str; 2] = ["HS_DESC", "HS_DESC_CONTENT"];

/// Control port capability the application depends on
pub trait ControlPort: Send + Sync {
    /// Send one command and return the full reply
    fn send_command(&self, command: &str) -> Result<String>;

    /// Register a handler for asynchronous events
    fn on_async_message(&self, handler: EventHandler);

    fn response_ok(&self, response: &str) -> bool {
        response.starts_with("250")
    }

    /// `SETEVENTS` for the given event names
    fn subscribe_to_events(&self, events: &[&str]) -> Result<bool> {
        let response = self.send_command(&format!("SETEVENTS {}", events.join(" ")))?;
        Ok(self.response_ok(&response))
    }
}

/// `SETCONF` command that publishes `service_address` as a hidden service
/// stored under `service_dir`
pub fn hidden_service_command(service_dir: &Path, service_address: SocketAddr) -> String {
    format!(
        "SETCONF HiddenServiceDir=\"{}\" HiddenServicePort=\"80 {}\" HiddenServiceMaxStreams=2 HiddenServiceMaxStreamsCloseCircuit=1",
        service_dir.display(),
        service_address
    )
}

/// Publish a hidden service through any control port
pub fn publish_hidden_service(
    control: &dyn ControlPort,
    service_dir: &Path,
    service_address: SocketAddr,
) -> Result<()> {
    let response = control.send_command(&hidden_service_command(service_dir, service_address))?;
    if !control.response_ok(&response) {
        return Err(CommError::ControlPort(format!(
            "Hidden service rejected: {}",
            response
        )));
    }
    log::info!("🧅 Hidden service for {} published in {}", service_address, service_dir.display());
    Ok(())
}

/// Read the onion hostname Tor writes into a hidden service directory
pub fn hidden_service_hostname(service_dir: &Path) -> Result<Option<String>> {
    let path = service_dir.join("hostname");
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)?;
    Ok(contents.lines().next().map(|line| line.trim().to_string()))
}

/// Control port client over TCP
pub struct TorControlClient {
    writer: Mutex<TcpStream>,
    replies: Mutex<Receiver<String>>,
    handlers: Arc<Mutex<Vec<EventHandler>>>,
    connected: Arc<AtomicBool>,
    authenticated: AtomicBool,
    reply_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TorControlClient {
    /// Connect to the configured control port and authenticate
    pub fn connect(config: &ControlConfig) -> Result<Self> {
        let stream = TcpStream::connect((config.address.as_str(), config.port))
            .map_err(|e| CommError::ControlPort(format!("{}:{}: {}", config.address, config.port, e)))?;
        log::info!("🎛️ Connected to control port {}:{}", config.address, config.port);

        let client = Self::from_stream(stream, Duration::from_millis(config.reply_timeout_ms))?;
        client.authenticate(&config.password)?;
        Ok(client)
    }

    /// Wrap a connected stream and start the reply reader
    pub fn from_stream(stream: TcpStream, reply_timeout: Duration) -> Result<Self> {
        let read_half = stream.try_clone()?;
        let (tx, rx) = mpsc::channel();
        let handlers: Arc<Mutex<Vec<EventHandler>>> = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));

        let reader = {
            let handlers = Arc::clone(&handlers);
            let connected = Arc::clone(&connected);
            thread::Builder::new()
                .name("control-reader".into())
                .spawn(move || {
                    read_replies(BufReader::new(read_half), tx, &handlers);
                    connected.store(false, Ordering::SeqCst);
                })
                .map_err(|e| CommError::ControlPort(format!("Cannot spawn reader: {}", e)))?
        };

        Ok(Self {
            writer: Mutex::new(stream),
            replies: Mutex::new(rx),
            handlers,
            connected,
            authenticated: AtomicBool::new(false),
            reply_timeout,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// `AUTHENTICATE "<password>"`
    pub fn authenticate(&self, password: &str) -> Result<()> {
        let escaped = password.replace('\\', "\\\\").replace('"', "\\\"");
        let response = self.send_command(&format!("AUTHENTICATE \"{}\"", escaped))?;
        if !self.response_ok(&response) {
            return Err(CommError::ControlPort(format!("Authentication refused: {}", response)));
        }
        self.authenticated.store(true, Ordering::SeqCst);
        log::info!("🎛️ Control port authenticated");
        Ok(())
    }

    /// `GETINFO <key>`, returning the value of the `250-key=value` line
    pub fn get_info(&self, key: &str) -> Result<String> {
        let response = self.send_command(&format!("GETINFO {}", key))?;
        if !self.response_ok(&response) {
            return Err(CommError::ControlPort(response));
        }

        let prefix = format!("{}=", key);
        let mut lines = response.lines();
        while let Some(line) = lines.next() {
            let body = line.get(4..).unwrap_or_default();
            // Multi-line value: 250+key= followed by a data block
            if line.starts_with("250+") && body == prefix {
                let block: Vec<&str> = lines.by_ref().take_while(|l| *l != ".").collect();
                return Ok(block.join("\n"));
            }
            if let Some(value) = body.strip_prefix(&prefix) {
                return Ok(value.to_string());
            }
        }
        Err(CommError::ControlPort(format!("GETINFO reply has no {}", key)))
    }

    /// Ask Tor to fetch a hidden service descriptor (`HSFETCH`)
    pub fn fetch_descriptor(&self, onion_address: &str) -> Result<()> {
        let address = onion_address.trim_end_matches(".onion");
        let response = self.send_command(&format!("HSFETCH {}", address))?;
        if !self.response_ok(&response) {
            return Err(CommError::ControlPort(format!("HSFETCH refused: {}", response)));
        }
        Ok(())
    }

    /// Publish a hidden service pointing at `service_address`
    pub fn publish_hidden_service(&self, service_dir: &Path, service_address: SocketAddr) -> Result<()> {
        publish_hidden_service(self, service_dir, service_address)
    }

    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(writer) = self.writer.lock() {
            let _ = writer.shutdown(std::net::Shutdown::Both);
        }
        if let Some(handle) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = handle.join();
        }
    }
}

impl ControlPort for TorControlClient {
    fn send_command(&self, command: &str) -> Result<String> {
        if !self.is_connected() {
            return Err(CommError::NotConnected);
        }

        let mut line = command.to_string();
        if !line.ends_with("\r\n") {
            line.push_str("\r\n");
        }

        // Holding the reply queue pairs this command with the next reply
        let replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.write_all(line.as_bytes())?;
            writer.flush()?;
        }
        log::trace!("🎛️ > {}", command.split_whitespace().next().unwrap_or_default());

        match replies.recv_timeout(self.reply_timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => Err(CommError::Timeout(format!(
                "No control port reply within {:?}",
                self.reply_timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(CommError::ControlPort("Control connection closed".into()))
            }
        }
    }

    fn on_async_message(&self, handler: EventHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }
}

impl Drop for TorControlClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader loop: split the stream into replies and events
fn read_replies<R: BufRead>(reader: R, replies: Sender<String>, handlers: &Mutex<Vec<EventHandler>>) {
    let mut current: Vec<String> = Vec::new();
    let mut in_data = false;

    for line in reader.lines() {
        let Ok(line) = line else { break };
        let line = line.trim_end_matches('\r').to_string();

        if in_data {
            in_data = line != ".";
            current.push(line);
            continue;
        }

        let separator = line.as_bytes().get(3).copied();
        let is_event = line.starts_with('6');
        current.push(line);

        match separator {
            Some(b'+') => in_data = true,
            Some(b' ') | None => {
                let reply = current.join("\n");
                current.clear();
                if is_event {
                    log::debug!("🎛️ Event: {}", reply.lines().next().unwrap_or_default());
                    for handler in handlers.lock().unwrap_or_else(PoisonError::into_inner).iter() {
                        handler(&reply);
                    }
                } else if replies.send(reply).is_err() {
                    break;
                }
            }
            _ => {}
        }
    }
    log::debug!("🎛️ Control connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;

    #[test]
    fn test_reply_assembly() {
        let wire = "250-version=0.4.8\r\n250+config-text=\r\nSocksPort 9050\r\n.\r\n250 OK\r\n650 CIRC 1 BUILT\r\n250 OK\r\n";
        let (tx, rx) = mpsc::channel();
        let events: Arc<Mutex<Vec<String>>> = Arc::default();
        let handlers: Mutex<Vec<EventHandler>> = Mutex::new(Vec::new());
        {
            let events = Arc::clone(&events);
            handlers
                .lock()
                .unwrap()
                .push(Box::new(move |e: &str| events.lock().unwrap().push(e.to_string())));
        }

        read_replies(Cursor::new(wire), tx, &handlers);

        let first = rx.recv().unwrap();
        assert_eq!(
            first,
            "250-version=0.4.8\n250+config-text=\nSocksPort 9050\n.\n250 OK"
        );
        assert_eq!(rx.recv().unwrap(), "250 OK");
        assert!(rx.recv().is_err());
        assert_eq!(events.lock().unwrap().as_slice(), ["650 CIRC 1 BUILT"]);
    }

    #[test]
    fn test_hidden_service_command() {
        let command = hidden_service_command(Path::new("/var/lib/tor/comm"), "127.0.0.1:42790".parse().unwrap());
        assert_eq!(
            command,
            "SETCONF HiddenServiceDir=\"/var/lib/tor/comm\" HiddenServicePort=\"80 127.0.0.1:42790\" HiddenServiceMaxStreams=2 HiddenServiceMaxStreamsCloseCircuit=1"
        );
    }

    #[test]
    fn test_client_against_fake_control_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut lines = BufReader::new(stream).lines();

            let auth = lines.next().unwrap().unwrap();
            assert_eq!(auth, "AUTHENTICATE \"hunter2\"");
            writer.write_all(b"250 OK\r\n").unwrap();

            let setevents = lines.next().unwrap().unwrap();
            assert_eq!(setevents, "SETEVENTS HS_DESC HS_DESC_CONTENT");
            writer.write_all(b"650 HS_DESC REQUESTED abc\r\n250 OK\r\n").unwrap();

            let getinfo = lines.next().unwrap().unwrap();
            assert_eq!(getinfo, "GETINFO version");
            writer.write_all(b"250-version=0.4.8.9\r\n250 OK\r\n").unwrap();

            let bad = lines.next().unwrap().unwrap();
            assert!(bad.starts_with("SETCONF"));
            writer.write_all(b"552 Unrecognized option\r\n").unwrap();
        });

        let config = ControlConfig {
            port,
            password: "hunter2".into(),
            reply_timeout_ms: 2000,
            ..Default::default()
        };
        let client = TorControlClient::connect(&config).unwrap();
        assert!(client.is_authenticated());

        let events: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&events);
        client.on_async_message(Box::new(move |e: &str| sink.lock().unwrap().push(e.to_string())));

        assert!(client.subscribe_to_events(&HS_DESCRIPTOR_EVENTS).unwrap());
        assert_eq!(client.get_info("version").unwrap(), "0.4.8.9");

        let result = client.publish_hidden_service(Path::new("/tmp/hs"), "127.0.0.1:42790".parse().unwrap());
        assert!(matches!(result, Err(CommError::ControlPort(_))));

        server.join().unwrap();
        assert_eq!(events.lock().unwrap().len(), 1);
        client.close();
    }

    #[test]
    fn test_missing_hostname() {
        let dir = std::env::temp_dir().join("tor-comm-no-such-hs-dir");
        assert_eq!(hidden_service_hostname(&dir).unwrap(), None);
    }
}
