//! Server binding.
//!
//! Accepts WebSocket connections and gives each one its own [`Terminal`] on
//! the shared [`TerminalProcess`], wired through a fresh [`SecureChannel`]:
//!
//! ```text
//!   channel.output ──▶ terminal.input    (remote lines into the process)
//!   terminal.output ──▶ channel.input    (process output to the peer)
//! ```
//!
//! Sessions stay on the roster until their channel disconnects.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use protocol::{Header, SecretHash, SocketInfo};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelEvent, ChannelSettings, ChannelSide, SecureChannel};
use crate::command::{Command, CommandError};
use crate::fabric::{Handler, Node, Surface};
use crate::process::TerminalProcess;
use crate::session::Terminal;
use crate::shutdown::REASON_SHUTTING_DOWN;
use crate::transport::{self, Transport};
use crate::user::{User, UserLevel};

/// Reason given to sessions removed with `/kick`.
pub const REASON_KICKED: &str = "kicked";

/// How long [`Server::shutdown`] waits for sessions to leave the roster.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server is already listening on {0}")]
    AlreadyListening(SocketAddr),
}

/// One connected remote terminal.
pub struct RemoteSession {
    pub id: Uuid,
    pub terminal: Arc<Terminal>,
    pub channel: Arc<SecureChannel>,
    pub connected_at: SystemTime,
    peer: Mutex<Option<SocketInfo>>,
}

impl RemoteSession {
    /// Peer info, once the handshake completed.
    pub fn peer(&self) -> Option<SocketInfo> {
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Display name of the remote user.
    pub fn user_name(&self) -> String {
        self.terminal.user().name().to_string()
    }
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("id", &self.id)
            .field("user", &self.user_name())
            .field("peer", &self.channel.peer_address())
            .finish_non_exhaustive()
    }
}

pub struct Server {
    process: Arc<TerminalProcess>,
    secret: SecretHash,
    settings: ChannelSettings,
    roster: DashMap<Uuid, Arc<RemoteSession>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(process: &Arc<TerminalProcess>, secret: &str, settings: ChannelSettings) -> Arc<Self> {
        let server = Arc::new(Self {
            process: process.clone(),
            secret: SecretHash::from_secret(secret),
            settings,
            roster: DashMap::new(),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        });
        server.register_commands();
        server
    }

    fn lock_addr(&self) -> MutexGuard<'_, Option<SocketAddr>> {
        self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn process(&self) -> &Arc<TerminalProcess> {
        &self.process
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.lock_addr()
    }

    /// Starts listening on `addr` and accepting connections in the
    /// background. Returns the bound address.
    pub async fn bind(self: &Arc<Self>, addr: &str) -> Result<SocketAddr, ServerError> {
        if let Some(existing) = self.local_addr() {
            return Err(ServerError::AlreadyListening(existing));
        }
        let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        *self.lock_addr() = Some(local_addr);

        self.process.print(format!(
            "Starting server [{}] on port:{}...",
            self.process.name(),
            local_addr.port()
        ));
        info!(addr = %local_addr, "listening for remote terminals");

        let server = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let server = server.clone();
                            tokio::spawn(async move {
                                match transport::accept(stream).await {
                                    Ok(transport) => {
                                        if let Some(server) = server.upgrade() {
                                            server.attach(transport);
                                        }
                                    }
                                    Err(e) => warn!(peer = %peer, "rejected connection: {}", e),
                                }
                            });
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    },
                }
            }
            debug!("accept loop stopped");
        });

        self.process.print("Now running.");
        Ok(local_addr)
    }

    /// Binds a connected transport to a new remote session.
    pub fn attach(self: &Arc<Self>, transport: Transport) -> Uuid {
        let terminal = Terminal::new(&self.process, User::new("RemoteUser", UserLevel::Remote));
        let (channel, events) = SecureChannel::new(
            self.process.fabric(),
            transport.handle,
            self.secret.clone(),
            SocketInfo::new(self.process.name(), terminal.user().name()),
            ChannelSide::Server,
            self.settings.clone(),
        );
        channel.set_attribution(terminal.user());

        let fabric = self.process.fabric();
        fabric.pipe_to(channel.id(), terminal.id(), Surface::Output, Handler::Input);
        fabric.pipe_to(terminal.id(), channel.id(), Surface::Output, Handler::Input);

        let session = Arc::new(RemoteSession {
            id: Uuid::new_v4(),
            terminal,
            channel: channel.clone(),
            connected_at: SystemTime::now(),
            peer: Mutex::new(None),
        });
        let id = session.id;
        self.roster.insert(id, session.clone());
        info!(session = %id, peer = %channel.peer_address(), "remote terminal attached");

        tokio::spawn(channel.clone().run(transport.inbound));
        tokio::spawn(Self::handle_events(Arc::downgrade(self), session, events));
        channel.start_heartbeat();
        id
    }

    async fn handle_events(
        server: Weak<Self>,
        session: Arc<RemoteSession>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(server) = server.upgrade() else { break };
            let process = &server.process;
            let channel = &session.channel;
            match event {
                ChannelEvent::Handshake(peer) => {
                    session.terminal.set_user_name(peer.user_name.clone());
                    channel.set_attribution(session.terminal.user());
                    process.print(format!("Handshake done with client [{}].", peer.user_name));
                    *session.peer.lock().unwrap_or_else(PoisonError::into_inner) = Some(peer);

                    let prompt = format!("@{}{}", process.name(), session.terminal.prompt_string());
                    channel.try_send(Header::PromptString, &prompt);
                    match serde_json::to_string(&process.completions()) {
                        Ok(json) => {
                            channel.try_send(Header::Completions, &json);
                        }
                        Err(e) => warn!("failed to encode completions: {}", e),
                    }
                }
                ChannelEvent::HandshakeFailed => process.print("Handshake failed with client."),
                ChannelEvent::HistoryRequested => {
                    channel.try_send(Header::History, &process.history());
                }
                ChannelEvent::Notice(line) => process.print(line),
                ChannelEvent::Completions(_) | ChannelEvent::PromptString(_) => {
                    debug!(session = %session.id, "ignoring client-side advertisement");
                }
                ChannelEvent::Disconnected(reason) => {
                    server.roster.remove(&session.id);
                    session.terminal.destroy();
                    process.print(format!(
                        "Client [{}] disconnected. Reason: {}",
                        session.user_name(),
                        reason
                    ));
                    break;
                }
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.roster.len()
    }

    pub fn sessions(&self) -> Vec<Arc<RemoteSession>> {
        self.roster.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Connected remote users as `[name] [name]`.
    pub fn users(&self) -> String {
        let mut sessions = self.sessions();
        sessions.sort_by_key(|s| s.connected_at);
        sessions
            .iter()
            .map(|s| format!("[{}]", s.user_name()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Disconnects every session whose user is `name`. Returns how many.
    pub fn kick(&self, name: &str) -> usize {
        let targets: Vec<_> = self
            .sessions()
            .into_iter()
            .filter(|s| s.user_name() == name)
            .collect();
        for session in &targets {
            session.channel.disconnect(REASON_KICKED);
        }
        targets.len()
    }

    /// Stops accepting and disconnects every session, waiting briefly for
    /// the roster to drain.
    pub async fn shutdown(&self) {
        self.shutdown_with(REASON_SHUTTING_DOWN).await;
    }

    pub async fn shutdown_with(&self, reason: &str) {
        self.cancel.cancel();
        for session in self.sessions() {
            session.channel.disconnect(reason);
        }
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.roster.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        info!(remaining = self.roster.len(), "server stopped");
    }

    fn register_commands(self: &Arc<Self>) {
        let server = Arc::downgrade(self);
        self.process.register_command(Command::new(
            "/users",
            "List connected remote users",
            move |ctx| {
                let server = server
                    .upgrade()
                    .ok_or_else(|| CommandError::Failed("server is gone".to_string()))?;
                let users = server.users();
                if users.is_empty() {
                    ctx.reply("No remote users connected.");
                } else {
                    ctx.reply(users);
                }
                Ok(())
            },
        ));

        let server = Arc::downgrade(self);
        self.process.register_command(
            Command::new("/kick", "Disconnect a remote user", move |ctx| {
                let name = ctx
                    .arg(0)
                    .ok_or_else(|| CommandError::Usage("/kick <user>".to_string()))?;
                let server = server
                    .upgrade()
                    .ok_or_else(|| CommandError::Failed("server is gone".to_string()))?;
                match server.kick(name) {
                    0 => Err(CommandError::Failed(format!("no remote user named '{}'", name))),
                    n => {
                        ctx.reply(format!("Kicked {} session(s) of [{}].", n, name));
                        Ok(())
                    }
                }
            })
            .usage("<user>")
            .level(UserLevel::Admin),
        );
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.process.name())
            .field("local_addr", &self.local_addr())
            .field("sessions", &self.roster.len())
            .finish_non_exhaustive()
    }
}
