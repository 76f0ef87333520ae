//! Error types for the tor-comm transport
//!
//! This module provides the error taxonomy shared by every layer:
//! - Detailed variants for protocol, state, transport and crypto failures
//! - Error classification (fatal vs retryable)
//! - User-friendly messages
//! - Error codes for programmatic handling

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CommError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Connection errors (1xx)
    TransportFailure = 100,
    ConnectionTimeout = 101,
    NotConnected = 102,
    ProxyFailure = 103,

    // Protocol errors (2xx)
    ProtocolViolation = 200,
    HandshakeFailed = 201,

    // Security errors (4xx) - FATAL
    AuthenticationFailure = 400,

    // Cryptographic errors (5xx)
    CryptoError = 500,

    // Control port errors (6xx)
    ControlPortError = 600,

    // Configuration errors (8xx)
    ConfigError = 800,

    // Internal errors (9xx)
    InvalidState = 900,
}

/// Main error type for the transport, handshake and key factory
#[derive(Error, Debug, Clone)]
pub enum CommError {
    // ===== Connection Errors =====
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not connected")]
    NotConnected,

    #[error("SOCKS proxy failure: {0}")]
    Proxy(String),

    // ===== Protocol Errors =====
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    // ===== Security Errors (FATAL) =====
    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),

    // ===== Cryptographic Errors =====
    #[error("Crypto error: {0}")]
    Crypto(String),

    // ===== Control Port Errors =====
    #[error("Control port error: {0}")]
    ControlPort(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Config(String),

    // ===== State Errors =====
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl CommError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            CommError::TransportFailure(_) => ErrorCode::TransportFailure,
            CommError::Timeout(_) => ErrorCode::ConnectionTimeout,
            CommError::NotConnected => ErrorCode::NotConnected,
            CommError::Proxy(_) => ErrorCode::ProxyFailure,

            CommError::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
            CommError::HandshakeFailed(_) => ErrorCode::HandshakeFailed,

            CommError::AuthenticationFailure(_) => ErrorCode::AuthenticationFailure,

            CommError::Crypto(_) => ErrorCode::CryptoError,

            CommError::ControlPort(_) => ErrorCode::ControlPortError,

            CommError::Config(_) => ErrorCode::ConfigError,

            CommError::InvalidState(_) => ErrorCode::InvalidState,
        }
    }

    /// Whether this error is fatal to the session it occurred in
    ///
    /// Protocol and authentication violations are never retried on the same
    /// connection; the peer must be treated as untrusted until a fresh
    /// connection and handshake succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CommError::ProtocolViolation(_)
                | CommError::AuthenticationFailure(_)
                | CommError::Crypto(_)
                | CommError::InvalidState(_)
        )
    }

    /// Whether the caller may re-establish the connection and try again
    ///
    /// Nothing is retried automatically; this only classifies the failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CommError::TransportFailure(_)
                | CommError::Timeout(_)
                | CommError::NotConnected
                | CommError::Proxy(_)
                | CommError::HandshakeFailed(_)
        )
    }

    /// Get a user-friendly message for display
    pub fn user_message(&self) -> String {
        match self {
            CommError::TransportFailure(_) => {
                "The connection to the peer was lost. Please reconnect.".into()
            }
            CommError::Timeout(_) => {
                "The operation timed out. The Tor circuit may be slow or unreachable.".into()
            }
            CommError::NotConnected => "No connection is currently established.".into(),
            CommError::Proxy(_) => {
                "The Tor SOCKS proxy refused the connection. Is Tor running?".into()
            }

            CommError::ProtocolViolation(_) => {
                "The peer sent malformed handshake data. Connection closed.".into()
            }
            CommError::HandshakeFailed(_) => {
                "Failed to establish a secure session. Please try again.".into()
            }

            CommError::AuthenticationFailure(_) => {
                "⚠️ SECURITY ERROR: The peer failed session authentication. Do not continue!"
                    .into()
            }

            CommError::Crypto(_) => "A cryptographic error occurred. Connection closed.".into(),

            CommError::ControlPort(_) => {
                "The Tor control port rejected the request. Check the control password.".into()
            }

            CommError::Config(_) => "Invalid configuration. Please check your settings.".into(),

            CommError::InvalidState(_) => {
                "The transport is in an invalid state. Please report this bug.".into()
            }
        }
    }
}

impl From<std::io::Error> for CommError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => CommError::Timeout(err.to_string()),
            _ => CommError::TransportFailure(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CommError {
    fn from(err: serde_json::Error) -> Self {
        CommError::Config(err.to_string())
    }
}
