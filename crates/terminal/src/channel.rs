//! Secure channel node.
//!
//! A [`SecureChannel`] drives the shared-secret handshake over a transport,
//! then carries sealed data messages:
//!
//! - lines arriving on its `input` surface are sent to the peer as `text`
//! - decoded `text`/`history` messages leave on its `output` surface
//! - everything else (handshake results, prompt updates, teardown) is
//!   reported to the owning binding as a [`ChannelEvent`]
//!
//! Bad frames are dropped and reported without closing the channel. A failed
//! handshake, a `disconnect` frame, a heartbeat timeout or a lost transport
//! tear the channel down, exactly once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use protocol::{
    DataMessage, Handshake, HandshakeState, Header, ProtocolError, RequestData, SealedFrame,
    SecretHash, SessionKey, SocketInfo, Step, DEFAULT_KDF_LOG_N,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::fabric::{DataEnvelope, Fabric, Node, NodeId};
use crate::process::TerminalProcess;
use crate::transport::{Inbound, TransportError, TransportHandle};
use crate::user::{User, UserLevel};

/// Default interval between heartbeat ticks.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default silence budget before a channel times out.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_CONNECTION_LOST: &str = "connection lost";
pub const REASON_HANDSHAKE_FAILED: &str = "handshake failed";

const ERR_FORMAT: &str = "ERROR: incorrect data format.";
const ERR_CORRUPTED: &str = "ERROR: data corrupted.";
const ERR_DECRYPT: &str = "ERROR: failed to decrypt data.";
const ERR_PARSE: &str = "ERROR: failed to parse data.";

/// Which end of the connection this channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSide {
    /// Accepted by a listener; sends heartbeat pings.
    Server,
    /// Dialed out; answers pings.
    Client,
}

/// Tunables for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
    pub heartbeat_interval: Duration,
    pub timeout: Duration,
    /// scrypt cost exponent for the session key.
    pub kdf_log_n: u8,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            kdf_log_n: DEFAULT_KDF_LOG_N,
        }
    }
}

/// Notifications for the binding that owns a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Handshake completed; carries the peer's info.
    Handshake(SocketInfo),
    HandshakeFailed,
    /// The channel is gone. Always the last event.
    Disconnected(String),
    /// The peer advertised its command names.
    Completions(Vec<String>),
    /// The peer advertised a prompt string.
    PromptString(String),
    /// The peer asked for our scrollback.
    HistoryRequested,
    /// A human-readable failure line for the owning terminal.
    Notice(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,

    #[error("handshake has not completed")]
    NotEstablished,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct ChannelState {
    handshake: Handshake,
    attribution: User,
    health: Duration,
    closed: Option<String>,
    interceptor: Option<Weak<TerminalProcess>>,
}

pub struct SecureChannel {
    id: NodeId,
    fabric: Arc<Fabric>,
    side: ChannelSide,
    settings: ChannelSettings,
    transport: TransportHandle,
    events: mpsc::UnboundedSender<ChannelEvent>,
    cancel: CancellationToken,
    state: Mutex<ChannelState>,
}

impl SecureChannel {
    pub fn new(
        fabric: &Arc<Fabric>,
        transport: TransportHandle,
        secret: SecretHash,
        local_info: SocketInfo,
        side: ChannelSide,
        settings: ChannelSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let handshake = Handshake::new(secret, local_info).with_kdf_log_n(settings.kdf_log_n);
        let channel = Arc::new_cyclic(|weak: &Weak<Self>| {
            let node: Weak<dyn Node> = weak.clone();
            Self {
                id: fabric.register("Socket", node),
                fabric: fabric.clone(),
                side,
                transport,
                events,
                cancel: CancellationToken::new(),
                state: Mutex::new(ChannelState {
                    handshake,
                    attribution: User::new("Socket", UserLevel::System),
                    health: settings.timeout,
                    closed: None,
                    interceptor: None,
                }),
                settings,
            }
        });
        debug!(channel = %channel.id, peer = %channel.transport.peer(), side = ?side, "channel created");
        (channel, rx)
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_event(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            trace!(channel = %self.id, "no binding listening for channel events");
        }
    }

    fn transmit(&self, frame: String) {
        if let Err(e) = self.transport.send(frame) {
            debug!(channel = %self.id, error = %e, "dropping outgoing frame");
        }
    }

    fn notice(&self, line: &str) {
        warn!(channel = %self.id, peer = %self.transport.peer(), "{}", line);
        self.emit_event(ChannelEvent::Notice(line.to_string()));
    }

    pub fn side(&self) -> ChannelSide {
        self.side
    }

    pub fn peer_address(&self) -> &str {
        self.transport.peer()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.lock_state().handshake.state()
    }

    pub fn is_established(&self) -> bool {
        self.handshake_state().is_established()
    }

    pub fn peer_info(&self) -> Option<SocketInfo> {
        self.lock_state().handshake.peer_info().cloned()
    }

    pub fn session_key(&self) -> Option<SessionKey> {
        self.lock_state()
            .handshake
            .cipher()
            .map(|cipher| cipher.key().clone())
    }

    pub fn health(&self) -> Duration {
        self.lock_state().health
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed.is_some()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.lock_state().closed.clone()
    }

    /// Sets the user decoded `text` is attributed to.
    pub fn set_attribution(&self, user: User) {
        self.lock_state().attribution = user;
    }

    /// Lines that `process` must handle itself are passed to it instead of
    /// the peer.
    pub fn intercept_local_commands(&self, process: &Arc<TerminalProcess>) {
        self.lock_state().interceptor = Some(Arc::downgrade(process));
    }

    /// Opens the handshake as initiator.
    pub fn handshake(&self) {
        let opening = self.lock_state().handshake.start();
        match opening {
            Some(ding) => self.transmit(ding),
            None => debug!(channel = %self.id, "handshake already started"),
        }
    }

    /// Processes one raw transport message.
    pub fn receive(&self, raw: &str) {
        let step = {
            let mut state = self.lock_state();
            if state.closed.is_some() {
                trace!(channel = %self.id, "frame after close ignored");
                return;
            }
            if state.handshake.state().is_established() {
                None
            } else {
                Some(state.handshake.receive(raw))
            }
        };
        match step {
            Some(step) => self.advance(step),
            None => self.receive_frame(raw),
        }
    }

    fn advance(&self, step: Step) {
        match step {
            Step::Ignored => {
                debug!(channel = %self.id, state = ?self.handshake_state(), "ignored out-of-state handshake message");
            }
            Step::Reply(reply) => self.transmit(reply),
            Step::Failed { reply } => {
                if let Some(stop) = reply {
                    self.transmit(stop);
                }
                warn!(channel = %self.id, peer = %self.transport.peer(), "handshake failed");
                self.emit_event(ChannelEvent::HandshakeFailed);
                self.teardown(REASON_HANDSHAKE_FAILED, false);
            }
            Step::Completed { reply, peer } => {
                if let Some(world) = reply {
                    self.transmit(world);
                }
                self.lock_state().health = self.settings.timeout;
                info!(channel = %self.id, peer = %peer.name, user = %peer.user_name, "handshake established");
                self.emit_event(ChannelEvent::Handshake(peer));
            }
        }
    }

    fn receive_frame(&self, raw: &str) {
        let frame = match SealedFrame::parse(raw) {
            Ok(frame) => frame,
            Err(_) => return self.notice(ERR_FORMAT),
        };
        let opened = {
            let state = self.lock_state();
            match state.handshake.cipher() {
                Some(cipher) => cipher.open(&frame),
                None => Err(ProtocolError::HandshakeIncomplete),
            }
        };
        let plaintext = match opened {
            Ok(plaintext) => plaintext,
            Err(ProtocolError::AuthenticationFailed) => return self.notice(ERR_CORRUPTED),
            Err(_) => return self.notice(ERR_DECRYPT),
        };
        match DataMessage::decode(&plaintext) {
            Ok(message) => self.handle(message),
            Err(_) => self.notice(ERR_PARSE),
        }
    }

    fn handle(&self, message: DataMessage) {
        trace!(channel = %self.id, header = %message.header, "data message");
        match message.header {
            Header::Text | Header::History => {
                let user = self.lock_state().attribution.clone();
                self.output(DataEnvelope::new(message.payload, user));
            }
            Header::Completions => match serde_json::from_str::<Vec<String>>(&message.payload) {
                Ok(completions) => self.emit_event(ChannelEvent::Completions(completions)),
                Err(_) => self.notice(ERR_PARSE),
            },
            Header::PromptString => self.emit_event(ChannelEvent::PromptString(message.payload)),
            Header::Request => {
                let request: RequestData = serde_json::from_str(&message.payload).unwrap_or_default();
                if request.wants_history() {
                    self.emit_event(ChannelEvent::HistoryRequested);
                }
            }
            Header::Ping => {
                self.reset_health();
                self.try_send(Header::Pong, "");
            }
            Header::Pong => self.reset_health(),
            Header::Disconnect => {
                self.teardown(&message.payload, false);
            }
        }
    }

    fn reset_health(&self) {
        self.lock_state().health = self.settings.timeout;
    }

    /// Seals and sends one data message.
    pub fn send(&self, header: Header, payload: &str) -> Result<(), ChannelError> {
        let sealed = {
            let state = self.lock_state();
            if state.closed.is_some() {
                return Err(ChannelError::Closed);
            }
            if !state.handshake.state().is_established() {
                return Err(ChannelError::NotEstablished);
            }
            let cipher = state
                .handshake
                .cipher()
                .ok_or(ChannelError::NotEstablished)?;
            cipher.seal(&DataMessage::new(header, payload).encode())?
        };
        self.transport.send(sealed.encode())?;
        Ok(())
    }

    /// Like [`SecureChannel::send`], logging instead of failing.
    pub fn try_send(&self, header: Header, payload: &str) -> bool {
        match self.send(header, payload) {
            Ok(()) => true,
            Err(e) => {
                debug!(channel = %self.id, header = %header, error = %e, "message not sent");
                false
            }
        }
    }

    /// Sends a capability request.
    pub fn request(&self, request: &RequestData) -> Result<(), ChannelError> {
        let json = serde_json::to_string(request).map_err(ProtocolError::from)?;
        self.send(Header::Request, &json)
    }

    fn send_text(&self, envelope: DataEnvelope) {
        let interceptor = self
            .lock_state()
            .interceptor
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(process) = interceptor {
            if process.is_local_input(&envelope) {
                trace!(channel = %self.id, "line handled locally");
                process.input(envelope);
                return;
            }
        }
        self.try_send(Header::Text, &envelope.text());
    }

    /// Tells the peer why, then tears down. Returns false if already closed.
    pub fn disconnect(&self, reason: &str) -> bool {
        self.teardown(reason, true)
    }

    /// Tears down after the transport went away without a goodbye.
    pub fn transport_closed(&self) -> bool {
        self.teardown(REASON_CONNECTION_LOST, false)
    }

    fn teardown(&self, reason: &str, notify_peer: bool) -> bool {
        let farewell = {
            let mut state = self.lock_state();
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(reason.to_string());
            if state.handshake.state().is_established() {
                match state.handshake.cipher() {
                    Some(cipher) if notify_peer => cipher
                        .seal(&DataMessage::new(Header::Disconnect, reason).encode())
                        .map(|frame| frame.encode())
                        .ok(),
                    _ => None,
                }
            } else {
                state.handshake.abort().filter(|_| notify_peer)
            }
        };

        if let Some(frame) = farewell {
            self.transmit(frame);
        }
        self.transport.close();
        self.cancel.cancel();
        self.fabric.un_pipe_all(self.id);
        info!(channel = %self.id, peer = %self.transport.peer(), reason, "channel disconnected");
        self.emit_event(ChannelEvent::Disconnected(reason.to_string()));
        true
    }

    /// One heartbeat period. Returns false once the channel is gone.
    pub fn tick(&self) -> bool {
        let (timed_out, established) = {
            let mut state = self.lock_state();
            if state.closed.is_some() {
                return false;
            }
            state.health = state.health.saturating_sub(self.settings.heartbeat_interval);
            (state.health.is_zero(), state.handshake.state().is_established())
        };
        if timed_out {
            warn!(channel = %self.id, peer = %self.transport.peer(), "heartbeat timed out");
            self.teardown(REASON_TIMEOUT, true);
            return false;
        }
        if self.side == ChannelSide::Server && established {
            self.try_send(Header::Ping, "");
        }
        true
    }

    /// Spawns the heartbeat timer. It stops when the channel tears down.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let channel = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.settings.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(channel) = channel.upgrade() else { break };
                        if !channel.tick() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Feeds transport messages into the channel until either side closes.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(Inbound::Frame(raw)) if self.is_established() => self.receive(&raw),
                    Some(Inbound::Frame(raw)) => {
                        // Handshake steps may run scrypt.
                        let channel = self.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || channel.receive(&raw)).await {
                            warn!(channel = %self.id, "handshake step panicked: {}", e);
                            break;
                        }
                    }
                    Some(Inbound::Closed) | None => break,
                },
            }
        }
        self.transport_closed();
    }
}

impl Node for SecureChannel {
    fn id(&self) -> NodeId {
        self.id
    }

    fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    fn on_input(&self, envelope: DataEnvelope) {
        self.send_text(envelope);
    }
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.fabric.destroy(self.id);
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("peer", &self.transport.peer())
            .field("state", &self.handshake_state())
            .finish_non_exhaustive()
    }
}
