//! Client binding.
//!
//! A [`Client`] owns a local `RemoteClient` process and one terminal on it.
//! While connected, the terminal's input edge is moved from the local
//! process to a [`SecureChannel`] and the channel's output is piped back to
//! the terminal. Local-scope commands (`/connect`, `/disconnect`, ...) are
//! still handled by the local process.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use protocol::{Header, RequestData, SecretHash, SocketInfo, PROTOCOL_VERSION};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelSettings, ChannelSide, SecureChannel};
use crate::command::{Command, CommandError};
use crate::fabric::{Fabric, Handler, Node, Surface};
use crate::process::TerminalProcess;
use crate::session::Terminal;
use crate::shutdown::REASON_BY_USER;
use crate::transport::{self, Transport, TransportError};
use crate::user::User;

/// Name of the client's local process.
pub const CLIENT_PROCESS_NAME: &str = "RemoteClient";

const BANNER_WIDTH: usize = 40;
const RELEASE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: TransportError,
    },

    #[error("there is no previous server to reconnect to")]
    NoPreviousServer,
}

#[derive(Clone)]
struct Credentials {
    address: String,
    secret: String,
}

struct ClientState {
    channel: Option<Arc<SecureChannel>>,
    last: Option<Credentials>,
    request_history: bool,
}

pub struct Client {
    process: Arc<TerminalProcess>,
    terminal: Arc<Terminal>,
    settings: ChannelSettings,
    state: Mutex<ClientState>,
}

impl Client {
    pub fn new(fabric: &Arc<Fabric>, user: User, settings: ChannelSettings) -> Arc<Self> {
        let process = TerminalProcess::new(fabric, CLIENT_PROCESS_NAME);
        let terminal = Terminal::new(&process, user);
        let client = Arc::new(Self {
            process,
            terminal,
            settings,
            state: Mutex::new(ClientState {
                channel: None,
                last: None,
                request_history: true,
            }),
        });
        client.register_commands();
        client
    }

    /// Controls whether scrollback is requested after each handshake.
    pub fn set_history_request(&self, enabled: bool) {
        self.lock_state().request_history = enabled;
    }

    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn process(&self) -> &Arc<TerminalProcess> {
        &self.process
    }

    pub fn terminal(&self) -> &Arc<Terminal> {
        &self.terminal
    }

    /// The live channel, if any.
    pub fn channel(&self) -> Option<Arc<SecureChannel>> {
        self.lock_state().channel.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.channel().is_some()
    }

    /// Dials `address` and runs the handshake with `secret`.
    pub async fn connect(self: &Arc<Self>, address: &str, secret: &str) -> Result<(), ClientError> {
        self.process
            .print(format!("Connecting to server: {}...", address));
        let transport = match transport::connect(address).await {
            Ok(transport) => transport,
            Err(source) => {
                self.process.print(format!("Failed to connect: {}", source));
                return Err(ClientError::Connect {
                    address: address.to_string(),
                    source,
                });
            }
        };
        self.process
            .print("WebSocket Connected. Now checking secret key...");
        self.lock_state().last = Some(Credentials {
            address: address.to_string(),
            secret: secret.to_string(),
        });
        self.attach(transport, secret);
        Ok(())
    }

    /// Re-runs [`Client::connect`] with the last used address and secret.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), ClientError> {
        let last = self.lock_state().last.clone();
        match last {
            Some(credentials) => self.connect(&credentials.address, &credentials.secret).await,
            None => {
                self.process
                    .print("There is no previous server to reconnect to.");
                Err(ClientError::NoPreviousServer)
            }
        }
    }

    /// Binds a connected transport, replacing any current channel, and
    /// starts the handshake.
    pub fn attach(self: &Arc<Self>, transport: Transport, secret: &str) -> Arc<SecureChannel> {
        let previous = self.lock_state().channel.take();
        if let Some(previous) = previous {
            previous.disconnect("reconnecting");
        }

        let fabric = self.process.fabric();
        let (channel, events) = SecureChannel::new(
            fabric,
            transport.handle,
            SecretHash::from_secret(secret),
            SocketInfo::new(self.process.name(), self.terminal.user().name()),
            ChannelSide::Client,
            self.settings.clone(),
        );
        channel.set_attribution(self.terminal.user());
        channel.intercept_local_commands(&self.process);

        self.terminal.detach_process_input();
        fabric.pipe_to(self.terminal.id(), channel.id(), Surface::Input, Handler::Input);
        fabric.pipe_to(channel.id(), self.terminal.id(), Surface::Output, Handler::Output);
        self.lock_state().channel = Some(channel.clone());

        tokio::spawn(channel.clone().run(transport.inbound));
        tokio::spawn(Self::handle_events(
            Arc::downgrade(self),
            channel.clone(),
            events,
        ));
        channel.start_heartbeat();
        channel.handshake();
        channel
    }

    async fn handle_events(
        client: Weak<Self>,
        channel: Arc<SecureChannel>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(client) = client.upgrade() else { break };
            let process = &client.process;
            match event {
                ChannelEvent::Handshake(peer) => {
                    process.print(format!("Handshake done with server [{}].", peer.name));
                    process.print(format!("Client Terminal version: {}.", PROTOCOL_VERSION));
                    process.print(format!("Server Terminal version: {}.", peer.version));
                    process.print("=".repeat(BANNER_WIDTH));
                    if client.lock_state().request_history {
                        if let Err(e) = channel.request(&RequestData::history()) {
                            warn!("history request failed: {}", e);
                        }
                    }
                }
                ChannelEvent::HandshakeFailed => process.print("Handshake failed."),
                ChannelEvent::Completions(completions) => {
                    client.terminal.set_extra_completions(completions);
                }
                ChannelEvent::PromptString(prompt_string) => {
                    client.terminal.set_prompt_string(prompt_string);
                }
                ChannelEvent::HistoryRequested => {
                    channel.try_send(Header::History, &process.history());
                }
                ChannelEvent::Notice(line) => process.print(line),
                ChannelEvent::Disconnected(reason) => {
                    client.release_channel(&channel);
                    process.print(format!("Disconnected from server. Reason: {}", reason));
                    break;
                }
            }
        }
    }

    /// Restores local routing if `channel` is still the current one.
    pub fn release_channel(&self, channel: &Arc<SecureChannel>) -> bool {
        {
            let mut state = self.lock_state();
            match &state.channel {
                Some(current) if Arc::ptr_eq(current, channel) => state.channel = None,
                _ => return false,
            }
        }
        self.terminal.attach_process_input();
        self.terminal.set_extra_completions(Vec::new());
        self.terminal.set_prompt_string(self.process.prompt_string());
        debug!("channel released, local routing restored");
        true
    }

    /// Disconnects from the server with `reason`.
    pub fn disconnect_with(&self, reason: &str) -> bool {
        match self.channel() {
            Some(channel) => channel.disconnect(reason),
            None => {
                self.process.print("There is no server to disconnect from.");
                false
            }
        }
    }

    pub fn disconnect(&self) -> bool {
        self.disconnect_with(REASON_BY_USER)
    }

    /// Disconnects and waits briefly until local routing is restored.
    pub async fn shutdown(&self) {
        let Some(channel) = self.channel() else {
            return;
        };
        channel.disconnect(REASON_BY_USER);
        let deadline = tokio::time::Instant::now() + RELEASE_GRACE;
        while self.is_connected() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        info!("client stopped");
    }

    fn register_commands(self: &Arc<Self>) {
        let client = Arc::downgrade(self);
        self.process.register_command(
            Command::new("/connect", "Connect to a remote terminal", move |ctx| {
                let (Some(address), Some(secret)) = (ctx.arg(0), ctx.arg(1)) else {
                    return Err(CommandError::Usage("/connect <address> <secret>".to_string()));
                };
                let client = upgrade(&client)?;
                let (address, secret) = (address.to_string(), secret.to_string());
                tokio::spawn(async move {
                    if let Err(e) = client.connect(&address, &secret).await {
                        debug!("connect failed: {}", e);
                    }
                });
                Ok(())
            })
            .usage("<address> <secret>")
            .local(),
        );

        let client = Arc::downgrade(self);
        self.process.register_command(
            Command::new("/disconnect", "Disconnect from the remote terminal", move |_| {
                upgrade(&client)?.disconnect();
                Ok(())
            })
            .local(),
        );

        let client = Arc::downgrade(self);
        self.process.register_command(
            Command::new("/reconnect", "Reconnect to the last remote terminal", move |_| {
                let client = upgrade(&client)?;
                tokio::spawn(async move {
                    if let Err(e) = client.reconnect().await {
                        debug!("reconnect failed: {}", e);
                    }
                });
                Ok(())
            })
            .local(),
        );

        let client = Arc::downgrade(self);
        self.process.register_command(
            Command::new("/testpassword", "Try out masked input", move |ctx| {
                let client = upgrade(&client)?;
                let prompt = client
                    .terminal
                    .prompt()
                    .ok_or_else(|| CommandError::Failed("no interactive prompt".to_string()))?;
                ctx.process.await_password("testpassword", |process, password| {
                    process.print(format!(
                        "Received a password of {} characters.",
                        password.chars().count()
                    ));
                });
                ctx.reply("Enter a password:");
                prompt.ask_password("testpassword");
                Ok(())
            })
            .local(),
        );
    }
}

fn upgrade(client: &Weak<Client>) -> Result<Arc<Client>, CommandError> {
    client
        .upgrade()
        .ok_or_else(|| CommandError::Failed("client is gone".to_string()))
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{Prompt, PromptEvent};
    use crate::transport::memory_pair;
    use crate::user::UserLevel;
    use tokio::time::sleep;

    fn settings() -> ChannelSettings {
        ChannelSettings {
            kdf_log_n: 4,
            ..ChannelSettings::default()
        }
    }

    fn client() -> Arc<Client> {
        Client::new(&Fabric::new(), User::new("alice", UserLevel::Admin), settings())
    }

    #[tokio::test]
    async fn test_local_commands_registered() {
        let client = client();
        let completions = client.process().completions();
        for name in ["/connect", "/disconnect", "/reconnect", "/testpassword"] {
            assert!(completions.contains(&name.to_string()), "{}", name);
            assert!(client.process().is_local_command(name));
        }
        assert!(!client.process().is_local_command("/version"));
        assert!(client.process().is_local_command("/localversion"));
    }

    #[tokio::test]
    async fn test_disconnect_without_server() {
        let client = client();
        client.terminal().send("/disconnect");
        assert_eq!(
            client.process().screen().last().unwrap(),
            "There is no server to disconnect from.\n"
        );
    }

    #[tokio::test]
    async fn test_reconnect_without_history() {
        let client = client();
        assert!(matches!(
            client.reconnect().await,
            Err(ClientError::NoPreviousServer)
        ));
    }

    #[tokio::test]
    async fn test_connect_usage() {
        let client = client();
        client.terminal().send("/connect onlyaddress");
        assert_eq!(
            client.process().screen().last().unwrap(),
            "usage: /connect <address> <secret>\n"
        );
    }

    #[tokio::test]
    async fn test_attach_moves_input_edge_and_release_restores_it() {
        let client = client();
        let (a, _b) = memory_pair();
        let channel = client.attach(a, "s3cr3t");

        assert!(!client.terminal().has_process_input());
        assert!(client.is_connected());

        assert!(client.disconnect());
        sleep(Duration::from_millis(50)).await;

        assert!(!client.is_connected());
        assert!(channel.is_closed());
        assert!(client.terminal().has_process_input());
        assert!(!client.release_channel(&channel));
    }

    #[tokio::test]
    async fn test_testpassword_masks_next_line() {
        let client = client();
        let fabric = client.process().fabric().clone();
        let (prompt, mut rx) = Prompt::new(&fabric);
        client.terminal().use_prompt(&prompt);

        prompt.submit("/testpassword");
        assert!(prompt.is_password_mode());
        prompt.submit("hunter2");

        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PromptEvent::Line(line) = event {
                lines.push(line);
            }
        }
        assert_eq!(
            lines,
            vec!["Enter a password:", "Received a password of 7 characters."]
        );
        assert!(client
            .process()
            .screen()
            .iter()
            .all(|line| !line.contains("hunter2")));
    }
}
