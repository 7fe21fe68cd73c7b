//! # remterm Protocol Library
//!
//! Protocol definitions and cryptographic primitives for the remterm
//! remote terminal.
//!
//! ## Overview
//!
//! This crate is pure and synchronous. It knows nothing about sockets or
//! tasks; callers feed it transport messages and send back whatever it
//! returns.
//!
//! - **Handshake**: shared-secret challenge-response state machine
//! - **Crypto**: secret hashing, scrypt key derivation, AES-256-CTR + HMAC-SHA256
//! - **Framing**: handshake grammar, sealed frames and data messages
//! - **Messages**: data headers, peer info and capability requests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Data message  HEADER B64(PAYLOAD)   │
//! ├─────────────────────────────────────────┤
//! │   Sealed frame  IV CT HMAC (AES-CTR)    │
//! ├─────────────────────────────────────────┤
//! │    Handshake  ding/dong/salt/sugar/...  │
//! ├─────────────────────────────────────────┤
//! │      Transport (WebSocket, in-memory)   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{DataMessage, Handshake, Header, SecretHash, SocketInfo, Step};
//!
//! let mut client = Handshake::new(SecretHash::from_secret("s3cr3t"), SocketInfo::new("Client", "alice"))
//!     .with_kdf_log_n(4);
//! let mut server = Handshake::new(SecretHash::from_secret("s3cr3t"), SocketInfo::new("Server", "Admin"))
//!     .with_kdf_log_n(4);
//!
//! let ding = client.start().unwrap();
//! let Step::Reply(dong) = server.receive(&ding) else { unreachable!() };
//! let Step::Reply(salt) = client.receive(&dong) else { unreachable!() };
//! let Step::Reply(sugar) = server.receive(&salt) else { unreachable!() };
//! let Step::Reply(hello) = client.receive(&sugar) else { unreachable!() };
//! let Step::Completed { reply: Some(world), .. } = server.receive(&hello) else { unreachable!() };
//! assert!(matches!(client.receive(&world), Step::Completed { .. }));
//!
//! let frame = client
//!     .cipher()
//!     .unwrap()
//!     .seal(&DataMessage::new(Header::Text, "/version").encode())
//!     .unwrap();
//! let plaintext = server.cipher().unwrap().open(&frame).unwrap();
//! assert_eq!(DataMessage::decode(&plaintext).unwrap().payload, "/version");
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: Secret hashing, key derivation and frame sealing
//! - [`handshake`]: Handshake state machine
//! - [`framing`]: Wire grammar
//! - [`messages`]: Message definitions
//! - [`error`]: Error types

pub mod crypto;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod messages;

pub use crypto::{
    FrameCipher, SecretHash, SessionKey, CONFIRM_SALT, DEFAULT_KDF_LOG_N, IV_LENGTH, KEY_LENGTH,
    NONCE_LENGTH, VERIFY_SALT,
};
pub use error::{ProtocolError, Result};
pub use framing::{split_command, DataMessage, HandshakeMessage, MessageKind, SealedFrame};
pub use handshake::{Handshake, HandshakeState, Role, Step, FAILED_STATE_CODE};
pub use messages::{Header, RequestData, SocketInfo, PROTOCOL_VERSION, UNKNOWN};
