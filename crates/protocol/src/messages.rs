//! Message definitions carried inside sealed frames.
//!
//! After the handshake every transport message is one sealed frame whose
//! plaintext is `HEADER SP BASE64(PAYLOAD)`. The header selects how the peer
//! interprets the payload.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Current protocol version, advertised in [`SocketInfo`].
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Placeholder used for every [`SocketInfo`] field the peer did not supply.
pub const UNKNOWN: &str = "unknown";

/// Header of a post-handshake data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Header {
    /// A console line, routed to the terminal with sender attribution.
    Text,
    /// Bulk scrollback reply.
    History,
    /// JSON array of command names for completion.
    Completions,
    /// New prompt string for the peer's front end.
    PromptString,
    /// JSON-encoded [`RequestData`].
    Request,
    /// Liveness check.
    Ping,
    /// Liveness reply.
    Pong,
    /// Graceful close, payload is the reason.
    Disconnect,
}

impl Header {
    /// Returns the wire name of this header.
    pub fn as_str(&self) -> &'static str {
        match self {
            Header::Text => "text",
            Header::History => "history",
            Header::Completions => "completions",
            Header::PromptString => "promptString",
            Header::Request => "request",
            Header::Ping => "ping",
            Header::Pong => "pong",
            Header::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Header {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Header::Text),
            "history" => Ok(Header::History),
            "completions" => Ok(Header::Completions),
            "promptString" => Ok(Header::PromptString),
            "request" => Ok(Header::Request),
            "ping" => Ok(Header::Ping),
            "pong" => Ok(Header::Pong),
            "disconnect" => Ok(Header::Disconnect),
            other => Err(ProtocolError::UnknownHeader(other.to_string())),
        }
    }
}

/// Peer metadata exchanged in the `hello`/`world` handshake messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SocketInfo {
    /// Display name of the peer's host process.
    pub name: String,
    /// Name of the user operating the peer terminal.
    pub user_name: String,
    /// Protocol version of the peer.
    pub version: String,
}

impl Default for SocketInfo {
    fn default() -> Self {
        Self {
            name: UNKNOWN.to_string(),
            user_name: UNKNOWN.to_string(),
            version: UNKNOWN.to_string(),
        }
    }
}

impl SocketInfo {
    /// Creates the local info for a terminal, stamped with [`PROTOCOL_VERSION`].
    pub fn new(name: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user_name: user_name.into(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Parses peer info, falling back to all defaults if the JSON is unusable.
    ///
    /// Fields missing from an otherwise valid object keep their defaults.
    pub fn parse_lenient(json: &str) -> Self {
        serde_json::from_str(json).unwrap_or_default()
    }

    /// Serializes to the JSON carried inside `hello`/`world`.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::from)
    }
}

/// Capability request sent with the `request` header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestData {
    /// Ask the peer to resend its scrollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<bool>,
}

impl RequestData {
    /// A request for the peer's scrollback history.
    pub fn history() -> Self {
        Self {
            history: Some(true),
        }
    }

    /// Returns whether scrollback was requested.
    pub fn wants_history(&self) -> bool {
        self.history.unwrap_or(false)
    }
}
