//! Shared-secret challenge-response handshake.
//!
//! Six messages, the opener becomes the initiator:
//!
//! ```text
//! I -> R  ding
//! R -> I  dong  <nonce>
//! I -> R  salt  <H1>            H1 = SHA256(salt1 | nonce | secretHash)
//! R -> I  sugar <H2>            H2 = SHA256(salt1 | nonce | secretHash | salt2 | secretHash)
//! I -> R  hello <sealed info>   both sides derive K = scrypt(secretHash, nonce)
//! R -> I  world <sealed info>
//! ```
//!
//! Each side holds a [`HandshakeState`]. A message is acted upon only if the
//! transition table accepts its kind in the current state; anything else
//! leaves the state unchanged and is reported as [`Step::Ignored`]. A digest
//! mismatch or a `stop` moves the side to [`HandshakeState::Failed`], which
//! is terminal.

use crate::crypto::{
    confirmation_digest, digests_match, generate_nonce, verification_digest, FrameCipher,
    SecretHash, SessionKey, DEFAULT_KDF_LOG_N,
};
use crate::error::{ProtocolError, Result};
use crate::framing::{HandshakeMessage, MessageKind, SealedFrame};
use crate::messages::SocketInfo;

/// Legacy integer code of the failed state.
pub const FAILED_STATE_CODE: u16 = 1000;

/// Role in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent `ding`.
    Initiator,
    /// Answered `ding`.
    Responder,
}

/// Per-channel handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent or received yet.
    Idle,
    /// Initiator: sent `ding`, waiting for `dong`.
    AwaitDong,
    /// Responder: sent `dong`, waiting for `salt`.
    AwaitSalt,
    /// Initiator: sent `salt`, waiting for `sugar`.
    AwaitSugar,
    /// Responder: sent `sugar`, waiting for `hello`.
    AwaitHello,
    /// Initiator: sent `hello`, waiting for `world`.
    AwaitWorld,
    /// Session key agreed.
    Established(Role),
    /// Terminal failure.
    Failed,
}

impl HandshakeState {
    /// Returns the legacy integer code for this state.
    pub fn code(&self) -> u16 {
        match self {
            HandshakeState::Idle => 0,
            HandshakeState::AwaitDong => 100,
            HandshakeState::AwaitSalt => 1,
            HandshakeState::AwaitSugar => 101,
            HandshakeState::AwaitHello => 2,
            HandshakeState::AwaitWorld => 102,
            HandshakeState::Established(Role::Responder) => 3,
            HandshakeState::Established(Role::Initiator) => 103,
            HandshakeState::Failed => FAILED_STATE_CODE,
        }
    }

    /// Returns whether the session key has been agreed.
    pub fn is_established(&self) -> bool {
        matches!(self, HandshakeState::Established(_))
    }

    /// Returns whether the handshake failed.
    pub fn is_failed(&self) -> bool {
        *self == HandshakeState::Failed
    }

    /// Transition table: whether a message of `kind` is acted upon here.
    pub fn accepts(&self, kind: MessageKind) -> bool {
        use HandshakeState::*;
        match (self, kind) {
            (Established(_) | Failed, _) => false,
            (_, MessageKind::Stop) => true,
            (Idle, MessageKind::Ding)
            | (AwaitDong, MessageKind::Dong)
            | (AwaitSalt, MessageKind::Salt)
            | (AwaitSugar, MessageKind::Sugar)
            | (AwaitHello, MessageKind::Hello)
            | (AwaitWorld, MessageKind::World) => true,
            _ => false,
        }
    }
}

/// Outcome of feeding one message into a [`Handshake`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Not valid in the current state; nothing changed.
    Ignored,
    /// Advanced; send `reply` to the peer.
    Reply(String),
    /// Handshake failed; send `reply` if present.
    Failed { reply: Option<String> },
    /// Session key agreed; send `reply` if present.
    Completed {
        reply: Option<String>,
        peer: SocketInfo,
    },
}

/// One side of a handshake.
pub struct Handshake {
    secret: SecretHash,
    local_info: SocketInfo,
    kdf_log_n: u8,
    state: HandshakeState,
    role: Option<Role>,
    nonce: Option<String>,
    cipher: Option<FrameCipher>,
    peer_info: Option<SocketInfo>,
}

impl Handshake {
    /// Creates an idle handshake for the given secret hash and local info.
    pub fn new(secret: SecretHash, local_info: SocketInfo) -> Self {
        Self {
            secret,
            local_info,
            kdf_log_n: DEFAULT_KDF_LOG_N,
            state: HandshakeState::Idle,
            role: None,
            nonce: None,
            cipher: None,
            peer_info: None,
        }
    }

    /// Overrides the scrypt cost exponent. Both sides must agree.
    pub fn with_kdf_log_n(mut self, log_n: u8) -> Self {
        self.kdf_log_n = log_n;
        self
    }

    /// Returns the current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Returns the role, once one has been taken.
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Returns the frame cipher once the handshake is established.
    pub fn cipher(&self) -> Option<&FrameCipher> {
        self.cipher.as_ref()
    }

    /// Returns the peer's info once it has been received.
    pub fn peer_info(&self) -> Option<&SocketInfo> {
        self.peer_info.as_ref()
    }

    /// Returns the secret hash this side was configured with.
    pub fn secret(&self) -> &SecretHash {
        &self.secret
    }

    /// Opens the handshake as initiator. Returns `None` unless idle.
    pub fn start(&mut self) -> Option<String> {
        if self.state != HandshakeState::Idle {
            return None;
        }
        self.role = Some(Role::Initiator);
        self.state = HandshakeState::AwaitDong;
        Some(HandshakeMessage::Ding.encode())
    }

    /// Aborts the handshake locally. Returns the `stop` message to send,
    /// or `None` if the handshake already ended.
    pub fn abort(&mut self) -> Option<String> {
        if self.state.is_established() || self.state.is_failed() {
            return None;
        }
        self.state = HandshakeState::Failed;
        Some(HandshakeMessage::Stop.encode())
    }

    /// Feeds one raw transport message into the state machine.
    pub fn receive(&mut self, raw: &str) -> Step {
        let Some(message) = HandshakeMessage::parse(raw) else {
            return Step::Ignored;
        };
        if !self.state.accepts(message.kind()) {
            return Step::Ignored;
        }

        match message {
            HandshakeMessage::Stop => {
                self.state = HandshakeState::Failed;
                Step::Failed { reply: None }
            }
            HandshakeMessage::Ding => {
                let nonce = generate_nonce();
                let reply = HandshakeMessage::Dong(nonce.clone()).encode();
                self.role = Some(Role::Responder);
                self.nonce = Some(nonce);
                self.state = HandshakeState::AwaitSalt;
                Step::Reply(reply)
            }
            HandshakeMessage::Dong(nonce) => {
                let digest = verification_digest(&nonce, &self.secret);
                self.nonce = Some(nonce);
                self.state = HandshakeState::AwaitSugar;
                Step::Reply(HandshakeMessage::Salt(digest).encode())
            }
            HandshakeMessage::Salt(received) => {
                let nonce = self.nonce.clone().unwrap_or_default();
                if !digests_match(&verification_digest(&nonce, &self.secret), &received) {
                    return self.fail();
                }
                self.state = HandshakeState::AwaitHello;
                Step::Reply(HandshakeMessage::Sugar(confirmation_digest(&nonce, &self.secret)).encode())
            }
            HandshakeMessage::Sugar(received) => {
                let nonce = self.nonce.clone().unwrap_or_default();
                if !digests_match(&confirmation_digest(&nonce, &self.secret), &received) {
                    return self.fail();
                }
                let sealed = match self.agree_key(&nonce).and_then(|_| self.seal_local_info()) {
                    Ok(sealed) => sealed,
                    Err(_) => return self.fail(),
                };
                self.state = HandshakeState::AwaitWorld;
                Step::Reply(HandshakeMessage::Hello(sealed).encode())
            }
            HandshakeMessage::Hello(sealed) => {
                let nonce = self.nonce.clone().unwrap_or_default();
                if self.agree_key(&nonce).is_err() {
                    return self.fail();
                }
                let peer = self.open_peer_info(&sealed);
                let reply = match self.seal_local_info() {
                    Ok(sealed) => HandshakeMessage::World(sealed).encode(),
                    Err(_) => return self.fail(),
                };
                self.peer_info = Some(peer.clone());
                self.state = HandshakeState::Established(Role::Responder);
                Step::Completed {
                    reply: Some(reply),
                    peer,
                }
            }
            HandshakeMessage::World(sealed) => {
                let peer = self.open_peer_info(&sealed);
                self.peer_info = Some(peer.clone());
                self.state = HandshakeState::Established(Role::Initiator);
                Step::Completed { reply: None, peer }
            }
        }
    }

    fn fail(&mut self) -> Step {
        self.state = HandshakeState::Failed;
        self.cipher = None;
        Step::Failed {
            reply: Some(HandshakeMessage::Stop.encode()),
        }
    }

    fn agree_key(&mut self, nonce: &str) -> Result<()> {
        let key = SessionKey::derive(&self.secret, nonce, self.kdf_log_n)?;
        self.cipher = Some(FrameCipher::new(key, self.secret.clone()));
        Ok(())
    }

    fn seal_local_info(&self) -> Result<String> {
        let cipher = self.cipher.as_ref().ok_or(ProtocolError::HandshakeIncomplete)?;
        Ok(cipher.seal(&self.local_info.to_json()?)?.encode())
    }

    /// Decodes the peer's sealed info. Anything that does not open or
    /// parse yields default info.
    fn open_peer_info(&self, sealed: &str) -> SocketInfo {
        let cipher = self.cipher.as_ref().ok_or(ProtocolError::HandshakeIncomplete);
        cipher
            .and_then(|cipher| cipher.open(&SealedFrame::parse(sealed)?))
            .map(|json| SocketInfo::parse_lenient(&json))
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("state", &self.state)
            .field("role", &self.role)
            .field("peer_info", &self.peer_info)
            .finish_non_exhaustive()
    }
}
