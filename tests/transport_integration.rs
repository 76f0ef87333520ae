//! Transport integration tests
//!
//! Two `TransportProtocol` instances secured against each other, over an
//! in-memory pair and over loopback TCP.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tor_comm::channel::Channel;
use tor_comm::{CommConfig, ConnectionMode, MemoryChannel, TransportProtocol, TransportState};

const WAIT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn transport(mode: ConnectionMode) -> TransportProtocol {
    TransportProtocol::with_config(mode, CommConfig::fast()).unwrap()
}

/// Secure a client/server pair over memory channels; returns the client's
/// end of the link so tests can tamper with it
fn secured_pair() -> (TransportProtocol, TransportProtocol, Arc<MemoryChannel>) {
    secured_pair_with(CommConfig::fast())
}

fn secured_pair_with(config: CommConfig) -> (TransportProtocol, TransportProtocol, Arc<MemoryChannel>) {
    let (a, b) = MemoryChannel::pair();
    let a = Arc::new(a);
    let client = TransportProtocol::with_config(ConnectionMode::Client, config.clone()).unwrap();
    let server = TransportProtocol::with_config(ConnectionMode::Server, config).unwrap();

    thread::scope(|s| {
        let accepting = s.spawn(|| server.attach(Arc::new(b)));
        client.attach(a.clone()).unwrap();
        accepting.join().unwrap().unwrap();
    });
    (client, server, a)
}

fn poll_receive(transport: &TransportProtocol) -> Option<String> {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if let Some(message) = transport.receive() {
            return Some(message);
        }
        thread::sleep(Duration::from_millis(2));
    }
    None
}

fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_transmit_before_secured() {
    init_logging();
    let client = transport(ConnectionMode::Client);
    assert!(!client.transmit("x"));
    assert!(client.receive().is_none());
}

#[test]
fn test_transmit_during_handshake() {
    init_logging();
    let (a, silent) = MemoryChannel::pair();
    let client = transport(ConnectionMode::Client);

    thread::scope(|s| {
        let attaching = s.spawn(|| client.attach(Arc::new(a)));

        assert!(wait_for(|| client.state() == TransportState::Handshaking));
        assert!(client.is_connected());
        assert!(!client.is_secured());
        assert!(!client.transmit("too early"));
        assert_eq!(client.pending_outbound(), 0);

        client.disconnect();
        assert!(attaching.join().unwrap().is_err());
    });

    assert_eq!(client.state(), TransportState::Disconnected);
    // Only the ASSOC reached the peer
    assert_eq!(silent.pending(), 1);
}

#[test]
fn test_send_queue_is_bounded() {
    init_logging();
    let config = CommConfig {
        max_queue_len: 4,
        ..CommConfig::fast().with_worker_poll(Duration::from_millis(1000))
    };
    let (client, server, _) = secured_pair_with(config);

    let accepted: Vec<String> = (0..100)
        .map(|i| format!("m{}", i))
        .filter(|m| client.transmit(m))
        .collect();
    assert!(accepted.len() < 100);
    assert!(client.pending_outbound() <= 4);

    for message in accepted {
        assert_eq!(poll_receive(&server), Some(message));
    }
    assert!(wait_for(|| client.pending_outbound() == 0));
    assert!(client.transmit("after drain"));
    assert_eq!(poll_receive(&server).as_deref(), Some("after drain"));
}

#[test]
fn test_single_message() {
    init_logging();
    let (client, server, _) = secured_pair();
    assert!(client.is_secured() && server.is_secured());
    assert_eq!(server.state(), TransportState::Secured);

    assert!(!client.transmit(""));
    assert!(client.transmit("x"));
    assert_eq!(poll_receive(&server).as_deref(), Some("x"));
}

#[test]
fn test_both_directions_in_order() {
    init_logging();
    let (client, server, _) = secured_pair();

    for i in 0..50 {
        assert!(client.transmit(&format!("c{}", i)));
        assert!(server.transmit(&format!("s{}", i)));
    }

    for i in 0..50 {
        assert_eq!(poll_receive(&server), Some(format!("c{}", i)));
        assert_eq!(poll_receive(&client), Some(format!("s{}", i)));
    }
}

#[test]
fn test_large_message() {
    init_logging();
    let (client, server, _) = secured_pair();
    let message = "ü".repeat(40_000);
    assert!(server.transmit(&message));
    assert_eq!(poll_receive(&client), Some(message));
}

#[test]
fn test_disconnect_reaches_peer() {
    init_logging();
    let (client, server, _) = secured_pair();

    client.disconnect();
    assert!(!client.is_connected());
    assert_eq!(client.state(), TransportState::Disconnected);
    assert!(!client.transmit("late"));

    assert!(wait_for(|| !server.is_connected()));
    assert!(wait_for(|| server.state() == TransportState::Disconnected));
}

#[test]
fn test_tampered_frame_tears_down() {
    init_logging();
    let (client, server, link) = secured_pair();
    // A truncated frame no longer fills whole cipher blocks
    link.set_outbound_filter(|mut frame| {
        frame.pop();
        Some(frame)
    });

    assert!(client.transmit("tampered"));
    assert!(wait_for(|| !server.is_connected()));
    assert!(server.receive().is_none());
    assert!(server.last_error().is_some());
    assert!(wait_for(|| !client.is_connected()));
}

#[test]
fn test_reconnect_after_disconnect() {
    init_logging();
    let (client, server, _) = secured_pair();
    client.disconnect();
    server.disconnect();

    let (a, b) = MemoryChannel::pair();
    thread::scope(|s| {
        let accepting = s.spawn(|| server.attach(Arc::new(b)));
        client.attach(Arc::new(a)).unwrap();
        accepting.join().unwrap().unwrap();
    });

    assert!(client.transmit("again"));
    assert_eq!(poll_receive(&server).as_deref(), Some("again"));
}

#[test]
fn test_loopback_tcp() {
    init_logging();
    let server = transport(ConnectionMode::Server);
    let client = transport(ConnectionMode::Client);

    let address = server.bind(0).unwrap();
    client.connect("127.0.0.1", address.port()).unwrap();

    assert!(client.wait_until_secured(WAIT));
    assert!(server.wait_until_secured(WAIT));

    assert!(client.transmit("over tcp"));
    assert_eq!(poll_receive(&server).as_deref(), Some("over tcp"));
    assert!(server.transmit("and back"));
    assert_eq!(poll_receive(&client).as_deref(), Some("and back"));

    server.disconnect();
    assert!(wait_for(|| !client.is_connected()));
}

#[test]
fn test_connect_refused() {
    init_logging();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = transport(ConnectionMode::Client);
    client.connect("127.0.0.1", port).unwrap();
    assert!(!client.wait_until_secured(WAIT));
    assert!(client.last_error().is_some());
}
