//! # remterm Terminal Library
//!
//! Remote terminal sessions over a shared-secret secure channel.
//!
//! ## Overview
//!
//! A host runs a [`TerminalProcess`]: a named command interpreter with a
//! bounded scrollback. Local operators and remote clients each get their
//! own [`Terminal`] session on that process. Every participant is a node on
//! a [`Fabric`] and data moves between nodes only along explicit pipes.
//!
//! ```text
//!   Prompt ──▶ Terminal ──▶ TerminalProcess
//!                 ▲               │
//!                 └── echo/output ┘
//!
//!   Terminal ◀──▶ SecureChannel ◀══ WebSocket ══▶ SecureChannel ◀──▶ Terminal
//!   (server)                                                        (client)
//! ```
//!
//! The [`SecureChannel`] authenticates both ends with a pre-shared secret,
//! derives a session key with scrypt and seals every frame with
//! AES-256-CTR plus HMAC-SHA256. See the `protocol` crate for the wire
//! format.
//!
//! ## Modules
//!
//! - [`fabric`]: Node registry and pipe routing
//! - [`user`]: Identities and privilege levels
//! - [`command`]: Command table and dispatch errors
//! - [`process`]: Host process and scrollback
//! - [`session`]: Terminal sessions
//! - [`prompt`]: Interactive front end node
//! - [`transport`]: WebSocket and in-memory frame transports
//! - [`channel`]: Secure channel node
//! - [`server`]: Server binding
//! - [`client`]: Client binding
//! - [`config`]: Configuration loading and defaults
//! - [`shutdown`]: Signal handling and disconnect reasons

pub mod channel;
pub mod client;
pub mod command;
pub mod config;
pub mod fabric;
pub mod process;
pub mod prompt;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod transport;
pub mod user;

// Re-export protocol for convenience
pub use protocol;

pub use channel::{ChannelError, ChannelEvent, ChannelSettings, ChannelSide, SecureChannel};
pub use client::{Client, ClientError};
pub use command::{Command, CommandContext, CommandError, CommandScope};
pub use config::{Config, ConfigError};
pub use fabric::{DataEnvelope, Fabric, Handler, Node, NodeId, Payload, Pipe, Surface};
pub use process::{ScreenBuffer, TerminalProcess};
pub use prompt::{Prompt, PromptEvent};
pub use server::{RemoteSession, Server, ServerError};
pub use session::Terminal;
pub use transport::{Inbound, Transport, TransportError, TransportHandle};
pub use user::{User, UserLevel};
