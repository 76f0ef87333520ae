//! Sans-IO handshake state machine
//!
//! The engine never touches a socket. `start` yields the opening message (if
//! any) and every inbound message is fed to `handle`, which returns what to
//! send next. `stage` is always the message type the engine expects next.
//!
//! Any error terminates the engine: ephemeral keys and the session cipher
//! are dropped (zeroized) and the stage becomes `DONE` without success.

use super::message::{HandshakeMessage, HandshakeStage};
use super::token::{SessionToken, TrackAssignment, OFFSET_RANGE};
use super::{ConnectionMode, SessionParameters};
use crate::error::{CommError, Result};
use crate::security::ecdh;
use crate::security::{EcdhKeyPair, SessionCipher};
use rand::rngs::OsRng;
use rand::Rng;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// What the caller must do after feeding a message to the engine
#[derive(Debug)]
pub enum Step {
    /// Send the message and wait for the next one
    Reply(Vec<u8>),

    /// Handshake succeeded; send the final message if there is one
    Finished(Option<Vec<u8>>),

    /// Peer failed authentication; send the NACK and give up
    Rejected(Vec<u8>, CommError),
}

/// One side of a handshake
pub struct HandshakeEngine {
    mode: ConnectionMode,
    stage: HandshakeStage,

    /// Server's ACK-stage key, held until the client's ACK arrives
    ack_keypair: Option<EcdhKeyPair>,

    session: Option<SessionCipher>,

    /// Server's outstanding challenge
    nonce: Option<Zeroizing<String>>,

    parameters: SessionParameters,
}

impl HandshakeEngine {
    pub fn new(mode: ConnectionMode) -> Self {
        Self {
            mode,
            stage: HandshakeStage::Assoc,
            ack_keypair: None,
            session: None,
            nonce: None,
            parameters: SessionParameters::default(),
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    pub fn is_done(&self) -> bool {
        self.stage == HandshakeStage::Done
    }

    pub fn parameters(&self) -> &SessionParameters {
        &self.parameters
    }

    /// Begin the exchange.
    ///
    /// The client returns the ASSOC message; the server returns nothing and
    /// waits for one.
    pub fn start(&mut self) -> Option<Vec<u8>> {
        match self.mode {
            ConnectionMode::Client => {
                self.stage = HandshakeStage::Ack;
                log::debug!("🤝 [client] Sending ASSOC");
                Some(HandshakeMessage::bare(HandshakeStage::Assoc).encode())
            }
            ConnectionMode::Server => {
                self.stage = HandshakeStage::Assoc;
                None
            }
        }
    }

    /// Process one inbound message
    pub fn handle(&mut self, bytes: &[u8]) -> Result<Step> {
        if self.is_done() {
            return Err(CommError::InvalidState("Handshake already finished".into()));
        }

        let result = self.dispatch(bytes);
        match &result {
            Ok(Step::Rejected(_, err)) | Err(err) => {
                log::warn!("❌ [{}] Handshake aborted at {}: {}", self.mode, self.stage, err);
                self.terminate();
            }
            Ok(_) => log::debug!("🤝 [{}] Now expecting {}", self.mode, self.stage),
        }
        result
    }

    /// Abort: dispose key material and mark the handshake done without success
    pub fn terminate(&mut self) {
        self.finish();
        self.parameters.dispose();
    }

    /// Hand over the session parameters of a successful handshake
    pub fn into_parameters(mut self) -> Result<SessionParameters> {
        if !self.parameters.completed_no_errors {
            return Err(CommError::HandshakeFailed("Handshake did not complete".into()));
        }
        Ok(std::mem::take(&mut self.parameters))
    }

    fn finish(&mut self) {
        self.stage = HandshakeStage::Done;
        self.ack_keypair = None;
        self.session = None;
        self.nonce = None;
    }

    fn dispatch(&mut self, bytes: &[u8]) -> Result<Step> {
        if self.mode == ConnectionMode::Server && self.stage == HandshakeStage::Assoc {
            return self.server_on_assoc(bytes);
        }

        let message = HandshakeMessage::decode(bytes)?;
        if message.stage == HandshakeStage::Nack {
            return Err(CommError::AuthenticationFailure(
                "Peer rejected the session (NACK)".into(),
            ));
        }
        if message.stage != self.stage {
            return Err(CommError::ProtocolViolation(format!(
                "Expected {} but received {}",
                self.stage, message.stage
            )));
        }

        match (self.mode, message.stage) {
            (ConnectionMode::Client, HandshakeStage::Ack) => self.client_on_ack(&message.payload),
            (ConnectionMode::Server, HandshakeStage::Ack) => self.server_on_ack(&message.payload),
            (ConnectionMode::Client, HandshakeStage::Syn) => self.client_on_syn(&message.payload),
            (ConnectionMode::Server, HandshakeStage::Syn) => self.server_on_syn(&message.payload),
            (ConnectionMode::Client, HandshakeStage::Eot) => self.client_on_eot(&message.payload),
            (ConnectionMode::Server, HandshakeStage::Eot) => self.server_on_eot(&message.payload),
            (_, stage) => Err(CommError::ProtocolViolation(format!(
                "Unexpected {} message",
                stage
            ))),
        }
    }

    fn session(&self) -> Result<&SessionCipher> {
        self.session
            .as_ref()
            .ok_or_else(|| CommError::InvalidState("Session cipher not established".into()))
    }

    // ===== Server =====

    fn server_on_assoc(&mut self, bytes: &[u8]) -> Result<Step> {
        if bytes != HandshakeMessage::bare(HandshakeStage::Assoc).encode().as_slice() {
            return Err(CommError::ProtocolViolation("Malformed ASSOC message".into()));
        }

        let keypair = EcdhKeyPair::generate();
        let reply = HandshakeMessage::new(HandshakeStage::Ack, keypair.public_blob().to_vec());
        self.ack_keypair = Some(keypair);
        self.stage = HandshakeStage::Ack;
        Ok(Step::Reply(reply.encode()))
    }

    fn server_on_ack(&mut self, peer_key: &[u8]) -> Result<Step> {
        let keypair = self
            .ack_keypair
            .take()
            .ok_or_else(|| CommError::InvalidState("ACK keypair missing".into()))?;
        let secret = keypair.agree(peer_key)?;
        let session = SessionCipher::from_shared_secret(&secret);

        let nonce = Zeroizing::new(generate_nonce());
        let payload = session.seal(&nonce)?;

        self.session = Some(session);
        self.nonce = Some(nonce);
        self.stage = HandshakeStage::Syn;
        Ok(Step::Reply(HandshakeMessage::new(HandshakeStage::Syn, payload).encode()))
    }

    fn server_on_syn(&mut self, payload: &[u8]) -> Result<Step> {
        let expected = self
            .nonce
            .take()
            .ok_or_else(|| CommError::InvalidState("No outstanding nonce".into()))?;

        let echoed = self.session()?.open(payload).ok();
        let matches = echoed
            .as_deref()
            .map(|echo| {
                echo.len() == expected.len() && bool::from(echo.as_bytes().ct_eq(expected.as_bytes()))
            })
            .unwrap_or(false);

        if !matches {
            self.stage = HandshakeStage::Nack;
            return Ok(Step::Rejected(
                HandshakeMessage::bare(HandshakeStage::Nack).encode(),
                CommError::AuthenticationFailure("Nonce echo mismatch".into()),
            ));
        }

        let tracks = TrackAssignment::random();
        let offset = OsRng.gen_range(0..OFFSET_RANGE);
        let keypair = EcdhKeyPair::generate();
        let token = Zeroizing::new(SessionToken::new(keypair.public_blob(), offset, tracks).encode());
        let payload = self.session()?.seal(&token)?;

        self.parameters.local_keypair = Some(keypair);
        self.parameters.offset = offset;
        self.parameters.tracks = tracks;
        self.stage = HandshakeStage::Eot;
        Ok(Step::Reply(HandshakeMessage::new(HandshakeStage::Eot, payload).encode()))
    }

    fn server_on_eot(&mut self, payload: &[u8]) -> Result<Step> {
        let token = self.open_token(payload)?;
        if token.offset != self.parameters.offset || token.tracks != self.parameters.tracks {
            return Err(CommError::ProtocolViolation(
                "Client token does not mirror the offered session".into(),
            ));
        }

        self.parameters.peer_public_key = Some(token.public_key);
        self.parameters.completed_no_errors = true;
        self.finish();
        log::info!("✅ [server] Handshake complete");
        Ok(Step::Finished(None))
    }

    // ===== Client =====

    fn client_on_ack(&mut self, peer_key: &[u8]) -> Result<Step> {
        let keypair = EcdhKeyPair::generate();
        let secret = keypair.agree(peer_key)?;
        self.session = Some(SessionCipher::from_shared_secret(&secret));

        self.stage = HandshakeStage::Syn;
        let reply = HandshakeMessage::new(HandshakeStage::Ack, keypair.public_blob().to_vec());
        Ok(Step::Reply(reply.encode()))
    }

    fn client_on_syn(&mut self, payload: &[u8]) -> Result<Step> {
        let nonce = Zeroizing::new(
            self.session()?
                .open(payload)
                .map_err(|e| CommError::ProtocolViolation(format!("Unreadable nonce: {}", e)))?,
        );
        let echo = self.session()?.seal(&nonce)?;

        self.stage = HandshakeStage::Eot;
        Ok(Step::Reply(HandshakeMessage::new(HandshakeStage::Syn, echo).encode()))
    }

    fn client_on_eot(&mut self, payload: &[u8]) -> Result<Step> {
        let token = self.open_token(payload)?;

        let keypair = EcdhKeyPair::generate();
        let mirrored = Zeroizing::new(
            SessionToken::new(keypair.public_blob(), token.offset, token.tracks).encode(),
        );
        let reply = HandshakeMessage::new(HandshakeStage::Eot, self.session()?.seal(&mirrored)?);

        self.parameters = SessionParameters::new(token.public_key, keypair, token.offset, token.tracks);
        self.finish();
        log::info!("✅ [client] Handshake complete");
        Ok(Step::Finished(Some(reply.encode())))
    }

    /// Decrypt, parse and check a session token
    fn open_token(&self, payload: &[u8]) -> Result<SessionToken> {
        let text = Zeroizing::new(
            self.session()?
                .open(payload)
                .map_err(|e| CommError::ProtocolViolation(format!("Unreadable session token: {}", e)))?,
        );
        let token = SessionToken::parse(&text)?;
        ecdh::decode_public_blob(&token.public_key)?;
        Ok(token)
    }
}

/// Random decimal challenge with trailing zeros trimmed
fn generate_nonce() -> String {
    let value: u64 = OsRng.gen_range(1..=u64::MAX);
    value.to_string().trim_end_matches('0').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a handshake to completion, letting `tamper` rewrite client messages
    fn run<F>(mut tamper: F) -> (Result<SessionParameters>, Result<SessionParameters>, Vec<HandshakeStage>)
    where
        F: FnMut(&HandshakeEngine, Vec<u8>) -> Vec<u8>,
    {
        let mut client = HandshakeEngine::new(ConnectionMode::Client);
        let mut server = HandshakeEngine::new(ConnectionMode::Server);
        assert!(server.start().is_none());

        let mut seen = Vec::new();
        let mut to_server = client.start();
        let mut client_err = None;
        let mut server_err = None;

        while let Some(bytes) = to_server.take() {
            let bytes = tamper(&client, bytes);
            seen.push(HandshakeMessage::decode(&bytes).map(|m| m.stage).unwrap_or(HandshakeStage::Done));

            let to_client = match server.handle(&bytes) {
                Ok(Step::Reply(reply)) => reply,
                Ok(Step::Finished(_)) => break,
                Ok(Step::Rejected(nack, err)) => {
                    server_err = Some(err);
                    nack
                }
                Err(err) => {
                    server_err = Some(err);
                    break;
                }
            };
            seen.push(HandshakeMessage::decode(&to_client).unwrap().stage);

            match client.handle(&to_client) {
                Ok(Step::Reply(reply)) => to_server = Some(reply),
                Ok(Step::Finished(last)) => to_server = last,
                Ok(Step::Rejected(..)) => unreachable!("client never rejects"),
                Err(err) => client_err = Some(err),
            }
        }

        let finish = |engine: HandshakeEngine, err: Option<CommError>| match err {
            Some(err) => Err(err),
            None => engine.into_parameters(),
        };
        (finish(client, client_err), finish(server, server_err), seen)
    }

    #[test]
    fn test_full_handshake() {
        let (client, server, seen) = run(|_, bytes| bytes);
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        assert!(client.completed_no_errors && server.completed_no_errors);
        assert_eq!(client.offset, server.offset);
        assert_eq!(client.tracks, server.tracks);
        assert!(client.offset < OFFSET_RANGE);
        client.tracks.validate().unwrap();

        let a = client.derive_shared_secret().unwrap();
        let b = server.derive_shared_secret().unwrap();
        assert_eq!(*a, *b);
        assert!(!client.has_private_key());
        assert!(client.derive_shared_secret().is_err());

        use HandshakeStage::*;
        assert_eq!(seen, vec![Assoc, Ack, Ack, Syn, Syn, Eot, Eot]);
    }

    #[test]
    fn test_corrupted_nonce_echo() {
        let (client, server, seen) = run(|client, bytes| {
            let msg = HandshakeMessage::decode(&bytes).unwrap();
            if msg.stage != HandshakeStage::Syn {
                return bytes;
            }
            let forged = client.session.as_ref().unwrap().seal("12345x").unwrap();
            HandshakeMessage::new(HandshakeStage::Syn, forged).encode()
        });

        assert!(matches!(server, Err(CommError::AuthenticationFailure(_))));
        assert!(matches!(client, Err(CommError::AuthenticationFailure(_))));
        assert_eq!(seen.last(), Some(&HandshakeStage::Nack));
        assert!(!seen.contains(&HandshakeStage::Eot));
    }

    #[test]
    fn test_flipped_ciphertext_is_nack() {
        let (client, server, seen) = run(|_, mut bytes| {
            if bytes[16] == 0x16 {
                let last = bytes.len() - 1;
                bytes[last] ^= 0xFF;
            }
            bytes
        });

        assert!(matches!(server, Err(CommError::AuthenticationFailure(_))));
        assert!(client.is_err());
        assert!(!seen.contains(&HandshakeStage::Eot));
    }

    #[test]
    fn test_malformed_assoc() {
        let mut server = HandshakeEngine::new(ConnectionMode::Server);
        server.start();
        let mut bytes = HandshakeMessage::bare(HandshakeStage::Assoc).encode();
        bytes.push(0);

        let result = server.handle(&bytes);
        assert!(matches!(result, Err(CommError::ProtocolViolation(_))));
        assert!(server.is_done());
    }

    #[test]
    fn test_out_of_order_message() {
        let mut client = HandshakeEngine::new(ConnectionMode::Client);
        client.start();
        let eot = HandshakeMessage::new(HandshakeStage::Eot, vec![0; 48]).encode();
        assert!(matches!(client.handle(&eot), Err(CommError::ProtocolViolation(_))));
        assert!(client.handle(&eot).is_err());
    }

    #[test]
    fn test_truncated_token() {
        let mut client = HandshakeEngine::new(ConnectionMode::Client);
        let mut server = HandshakeEngine::new(ConnectionMode::Server);
        server.start();

        let mut to_server = client.start().unwrap();
        let eot = loop {
            let Step::Reply(to_client) = server.handle(&to_server).unwrap() else {
                panic!("server finished early");
            };
            if HandshakeMessage::decode(&to_client).unwrap().stage == HandshakeStage::Eot {
                break to_client;
            }
            let Step::Reply(next) = client.handle(&to_client).unwrap() else {
                panic!("client finished early");
            };
            to_server = next;
        };

        let session = server.session.as_ref().unwrap();
        let token = session.open(&HandshakeMessage::decode(&eot).unwrap().payload).unwrap();
        let truncated = session.seal(&token[..token.len() - 1]).unwrap();
        let forged = HandshakeMessage::new(HandshakeStage::Eot, truncated).encode();

        let result = client.handle(&forged);
        assert!(matches!(result, Err(CommError::ProtocolViolation(_))));
        assert!(client.is_done());
        assert!(!client.parameters().completed_no_errors);
        assert!(client.parameters().peer_public_key().is_none());
        assert_eq!(client.parameters().tracks, TrackAssignment::default());
    }

    #[test]
    fn test_nonce_format() {
        for _ in 0..32 {
            let nonce = generate_nonce();
            assert!(!nonce.is_empty());
            assert!(!nonce.ends_with('0'));
            assert!(nonce.bytes().all(|b| b.is_ascii_digit()));
        }
    }
}
