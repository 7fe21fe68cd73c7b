//! Wire grammar for handshake messages, sealed frames and data messages.
//!
//! # Handshake messages
//!
//! Sent in the clear, one per transport message:
//!
//! ```text
//! ding
//! dong  <nonce_b64>
//! salt  <digest_b64>
//! sugar <digest_b64>
//! hello <iv_b64> <ciphertext_b64> <hmac_b64>
//! world <iv_b64> <ciphertext_b64> <hmac_b64>
//! stop
//! ```
//!
//! # Sealed frames
//!
//! Once a session key exists every transport message is exactly three
//! space-separated base64 tokens: `IV CT HMAC`. The plaintext under `CT` is a
//! [`DataMessage`]: `HEADER SP BASE64(PAYLOAD)`.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{ProtocolError, Result};
use crate::messages::Header;

/// Number of space-separated tokens in a sealed frame.
pub const SEALED_FRAME_TOKENS: usize = 3;

/// Splits a message into its first word and the remainder.
///
/// Leading spaces are skipped, and so are the spaces between the word and
/// the remainder. An empty message yields two empty strings.
pub fn split_command(raw: &str) -> (&str, &str) {
    let trimmed = raw.trim_start_matches(' ');
    match trimmed.split_once(' ') {
        Some((head, rest)) => (head, rest.trim_start_matches(' ')),
        None => (trimmed, ""),
    }
}

/// Discriminant of a [`HandshakeMessage`], used by the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ding,
    Dong,
    Salt,
    Sugar,
    Hello,
    World,
    Stop,
}

/// A message of the unauthenticated handshake phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// Initiator's opening move.
    Ding,
    /// Responder's fresh nonce.
    Dong(String),
    /// First verification digest.
    Salt(String),
    /// Second verification digest.
    Sugar(String),
    /// Initiator's sealed socket info (kept raw, parsed leniently).
    Hello(String),
    /// Responder's sealed socket info (kept raw, parsed leniently).
    World(String),
    /// Abort the handshake.
    Stop,
}

impl HandshakeMessage {
    /// Parses a raw transport message. Unknown words yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (head, payload) = split_command(raw);
        let payload = payload.to_string();
        match head {
            "ding" => Some(HandshakeMessage::Ding),
            "dong" => Some(HandshakeMessage::Dong(payload)),
            "salt" => Some(HandshakeMessage::Salt(payload)),
            "sugar" => Some(HandshakeMessage::Sugar(payload)),
            "hello" => Some(HandshakeMessage::Hello(payload)),
            "world" => Some(HandshakeMessage::World(payload)),
            "stop" => Some(HandshakeMessage::Stop),
            _ => None,
        }
    }

    /// Returns the message kind.
    pub fn kind(&self) -> MessageKind {
        match self {
            HandshakeMessage::Ding => MessageKind::Ding,
            HandshakeMessage::Dong(_) => MessageKind::Dong,
            HandshakeMessage::Salt(_) => MessageKind::Salt,
            HandshakeMessage::Sugar(_) => MessageKind::Sugar,
            HandshakeMessage::Hello(_) => MessageKind::Hello,
            HandshakeMessage::World(_) => MessageKind::World,
            HandshakeMessage::Stop => MessageKind::Stop,
        }
    }

    /// Encodes the message for the transport.
    pub fn encode(&self) -> String {
        match self {
            HandshakeMessage::Ding => "ding".to_string(),
            HandshakeMessage::Dong(p) => format!("dong {}", p),
            HandshakeMessage::Salt(p) => format!("salt {}", p),
            HandshakeMessage::Sugar(p) => format!("sugar {}", p),
            HandshakeMessage::Hello(p) => format!("hello {}", p),
            HandshakeMessage::World(p) => format!("world {}", p),
            HandshakeMessage::Stop => "stop".to_string(),
        }
    }
}

/// An encrypted, authenticated frame: `IV CT HMAC`, all base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedFrame {
    /// Base64 of the 16-byte counter-mode IV.
    pub iv: String,
    /// Base64 of the ciphertext.
    pub ciphertext: String,
    /// Base64 of `HMAC-SHA256(secretHash, iv || ciphertext)`.
    pub tag: String,
}

impl SealedFrame {
    /// Parses a frame, requiring exactly three space-separated tokens.
    pub fn parse(raw: &str) -> Result<Self> {
        let tokens: Vec<&str> = raw.split(' ').collect();
        if tokens.len() != SEALED_FRAME_TOKENS {
            return Err(ProtocolError::MalformedFrame {
                expected: SEALED_FRAME_TOKENS,
                got: tokens.len(),
            });
        }
        Ok(Self {
            iv: tokens[0].to_string(),
            ciphertext: tokens[1].to_string(),
            tag: tokens[2].to_string(),
        })
    }

    /// Encodes the frame for the transport.
    pub fn encode(&self) -> String {
        format!("{} {} {}", self.iv, self.ciphertext, self.tag)
    }
}

impl fmt::Display for SealedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// The plaintext of a post-handshake sealed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    /// What the payload means.
    pub header: Header,
    /// Decoded UTF-8 payload.
    pub payload: String,
}

impl DataMessage {
    /// Creates a new data message.
    pub fn new(header: Header, payload: impl Into<String>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Encodes as `HEADER SP BASE64(PAYLOAD)`.
    pub fn encode(&self) -> String {
        format!("{} {}", self.header, STANDARD.encode(self.payload.as_bytes()))
    }

    /// Decodes a plaintext produced by [`DataMessage::encode`].
    pub fn decode(plaintext: &str) -> Result<Self> {
        let (head, payload) = split_command(plaintext);
        let header = head.parse::<Header>()?;
        let bytes = STANDARD.decode(payload)?;
        let payload = String::from_utf8(bytes)
            .map_err(|e| ProtocolError::Deserialization(format!("payload is not utf-8: {}", e)))?;
        Ok(Self { header, payload })
    }
}
