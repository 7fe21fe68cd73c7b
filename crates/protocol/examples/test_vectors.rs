//! Print handshake test vectors for interop testing against other peers.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::crypto::{confirmation_digest, verification_digest, SecretHash, SessionKey};
use protocol::{DataMessage, Header, DEFAULT_KDF_LOG_N};

const SECRET: &str = "s3cr3t";
const NONCE: &str = "bm9uY2Vub25jZW5vbmNlbm9uY2Vub25jZW5vbmNlbm9uY2Vub25jZW5vbmNlbm9uY2U=";

fn main() {
    let secret = SecretHash::from_secret(SECRET);

    print_test_vector("secret_hash", secret.as_str());
    print_test_vector("nonce", NONCE);
    print_test_vector("salt", &verification_digest(NONCE, &secret));
    print_test_vector("sugar", &confirmation_digest(NONCE, &secret));

    match SessionKey::derive(&secret, NONCE, DEFAULT_KDF_LOG_N) {
        Ok(key) => print_bytes("session_key", key.as_bytes()),
        Err(e) => eprintln!("key derivation failed: {}", e),
    }

    print_test_vector(
        "text_version",
        &DataMessage::new(Header::Text, "/version").encode(),
    );
    print_test_vector(
        "request_history",
        &DataMessage::new(Header::Request, r#"{"history":true}"#).encode(),
    );
}

fn print_test_vector(name: &str, value: &str) {
    println!("export const {} = {:?};", name, value);
}

fn print_bytes(name: &str, bytes: &[u8]) {
    print!("export const {} = new Uint8Array([", name);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            print!(", ");
        }
        print!("{}", b);
    }
    println!("]);");
}
