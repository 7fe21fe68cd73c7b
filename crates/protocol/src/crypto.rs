//! Cryptographic primitives for the secure channel.
//!
//! Everything is derived from a pre-shared secret. The secret itself never
//! leaves the process; the channel works with [`SecretHash`], the base64 text
//! of its SHA-256 digest.
//!
//! - Handshake verification uses two running SHA-256 digests over fixed salts,
//!   the responder's nonce and the secret hash.
//! - The session key is `scrypt(secretHash, nonce)`.
//! - Frames are sealed with AES-256 in counter mode under a fresh IV and
//!   authenticated with HMAC-SHA256 keyed by the secret hash.

use aes::Aes256;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{ProtocolError, Result};
use crate::framing::SealedFrame;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Salt of the first verification round.
pub const VERIFY_SALT: &str = "cake";

/// Salt of the second verification round.
pub const CONFIRM_SALT: &str = "lie";

/// Number of random bytes in a handshake nonce.
pub const NONCE_LENGTH: usize = 64;

/// Length of the counter-mode IV in bytes.
pub const IV_LENGTH: usize = 16;

/// Length of the derived session key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Default scrypt cost exponent (N = 16384).
pub const DEFAULT_KDF_LOG_N: u8 = 14;

const KDF_BLOCK_SIZE: u32 = 8;
const KDF_PARALLELISM: u32 = 1;

/// Base64 text of SHA-256 over the pre-shared secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretHash(String);

impl SecretHash {
    /// Hashes a pre-shared secret.
    pub fn from_secret(secret: &str) -> Self {
        Self(STANDARD.encode(Sha256::digest(secret.as_bytes())))
    }

    /// Returns the hash as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretHash([REDACTED])")
    }
}

/// Generates a fresh handshake nonce, returned as base64 text.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

fn verification_hasher(nonce: &str, secret: &SecretHash) -> Sha256 {
    let mut hasher = Sha256::new();
    hasher.update(VERIFY_SALT.as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(secret.as_str().as_bytes());
    hasher
}

/// First-round digest, sent by the initiator in `salt`.
pub fn verification_digest(nonce: &str, secret: &SecretHash) -> String {
    STANDARD.encode(verification_hasher(nonce, secret).finalize())
}

/// Second-round digest, sent by the responder in `sugar`.
///
/// Continues the first-round hash with the second salt and the secret hash
/// again, so it cannot be computed without knowing the secret.
pub fn confirmation_digest(nonce: &str, secret: &SecretHash) -> String {
    let mut hasher = verification_hasher(nonce, secret);
    hasher.update(CONFIRM_SALT.as_bytes());
    hasher.update(secret.as_str().as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Compares two digests in constant time.
pub fn digests_match(expected: &str, received: &str) -> bool {
    expected.as_bytes().ct_eq(received.as_bytes()).into()
}

/// Symmetric key shared by both endpoints after a successful handshake.
#[derive(Clone)]
pub struct SessionKey([u8; KEY_LENGTH]);

impl SessionKey {
    /// Derives the session key with scrypt (`N = 2^log_n`, `r = 8`, `p = 1`).
    pub fn derive(secret: &SecretHash, nonce: &str, log_n: u8) -> Result<Self> {
        let params = scrypt::Params::new(log_n, KDF_BLOCK_SIZE, KDF_PARALLELISM, KEY_LENGTH)
            .map_err(|e| ProtocolError::KeyDerivation(format!("invalid scrypt parameters: {}", e)))?;
        let mut key = [0u8; KEY_LENGTH];
        scrypt::scrypt(secret.as_str().as_bytes(), nonce.as_bytes(), &params, &mut key)
            .map_err(|e| ProtocolError::KeyDerivation(e.to_string()))?;
        Ok(Self(key))
    }

    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for SessionKey {}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// Seals and opens frames under a session key.
#[derive(Clone, Debug)]
pub struct FrameCipher {
    key: SessionKey,
    secret: SecretHash,
}

impl FrameCipher {
    /// Creates a cipher for an established session.
    pub fn new(key: SessionKey, secret: SecretHash) -> Self {
        Self { key, secret }
    }

    /// Returns the session key.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    fn tag(&self, iv: &str, ciphertext: &str) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_str().as_bytes())
            .map_err(|e| ProtocolError::Encryption(format!("invalid hmac key: {}", e)))?;
        mac.update(iv.as_bytes());
        mac.update(ciphertext.as_bytes());
        Ok(mac)
    }

    fn apply_keystream(&self, iv: &[u8], buf: &mut [u8]) -> Result<()> {
        let mut cipher = Aes256Ctr::new_from_slices(self.key.as_bytes(), iv)
            .map_err(|e| ProtocolError::Encryption(format!("invalid key or iv: {}", e)))?;
        cipher.apply_keystream(buf);
        Ok(())
    }

    /// Encrypts `plaintext` under a fresh random IV and authenticates it.
    pub fn seal(&self, plaintext: &str) -> Result<SealedFrame> {
        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);

        let mut buf = plaintext.as_bytes().to_vec();
        self.apply_keystream(&iv, &mut buf)?;

        let iv = STANDARD.encode(iv);
        let ciphertext = STANDARD.encode(&buf);
        let tag = STANDARD.encode(self.tag(&iv, &ciphertext)?.finalize().into_bytes());

        Ok(SealedFrame {
            iv,
            ciphertext,
            tag,
        })
    }

    /// Verifies the frame's tag, then decrypts it.
    ///
    /// Nothing is decrypted unless the tag matches.
    pub fn open(&self, frame: &SealedFrame) -> Result<String> {
        let tag = STANDARD.decode(&frame.tag)?;
        self.tag(&frame.iv, &frame.ciphertext)?
            .verify_slice(&tag)
            .map_err(|_| ProtocolError::AuthenticationFailed)?;

        let iv = STANDARD.decode(&frame.iv)?;
        if iv.len() != IV_LENGTH {
            return Err(ProtocolError::Decryption(format!(
                "iv must be {} bytes, got {}",
                IV_LENGTH,
                iv.len()
            )));
        }
        let mut buf = STANDARD.decode(&frame.ciphertext)?;
        self.apply_keystream(&iv, &mut buf)
            .map_err(|e| ProtocolError::Decryption(e.to_string()))?;

        Ok(String::from_utf8(buf)?)
    }
}
