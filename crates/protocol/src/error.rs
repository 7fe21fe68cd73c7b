//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A base64 token could not be decoded.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// The frame's HMAC did not match its IV and ciphertext.
    #[error("authentication failed: frame tag mismatch")]
    AuthenticationFailed,

    /// Session key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    // Handshake errors
    /// The challenge-response handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Attempted to use the channel before the session key exists.
    #[error("handshake incomplete: cannot perform operation before handshake is finished")]
    HandshakeIncomplete,

    // Frame errors
    /// A sealed frame did not have exactly three tokens.
    #[error("malformed frame: expected {expected} tokens, got {got}")]
    MalformedFrame {
        /// Expected token count.
        expected: usize,
        /// Actual token count received.
        got: usize,
    },

    /// A decrypted message carried a header this side does not know.
    #[error("unknown header: {0}")]
    UnknownHeader(String),

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::InvalidEncoding(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for ProtocolError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        ProtocolError::Decryption(format!("plaintext is not utf-8: {}", err))
    }
}
