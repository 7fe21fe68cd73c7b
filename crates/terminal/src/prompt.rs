//! Interactive front-end node.
//!
//! [`Prompt`] is the boundary to whatever renders the terminal (stdin/stdout
//! in the binary, a channel receiver in tests). Submitted lines enter the
//! fabric on its `input` surface; everything it needs to render leaves as a
//! [`PromptEvent`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tracing::trace;

use crate::command::COMMAND_SIGIL;
use crate::fabric::{DataEnvelope, Fabric, Node, NodeId};
use crate::user::{User, UserLevel};

/// Envelope option marking a line typed at a prompt.
pub const FROM_PROMPT_OPTION: &str = "fromPrompt";

/// Envelope option carrying the token of a password request.
pub const TOKEN_OPTION: &str = "token";

/// Envelope option carrying the masked line.
pub const PASSWORD_OPTION: &str = "password";

/// What the front end has to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptEvent {
    /// A line of output.
    Line(String),
    /// The prompt text changed.
    Prompt(String),
    /// The completion candidates changed.
    Completions(Vec<String>),
    /// Masked input was switched on or off.
    PasswordMode(bool),
}

#[derive(Default)]
struct PromptState {
    prompt: String,
    completions: Vec<String>,
    password_token: Option<String>,
}

pub struct Prompt {
    id: NodeId,
    fabric: Arc<Fabric>,
    user: User,
    state: Mutex<PromptState>,
    events: mpsc::UnboundedSender<PromptEvent>,
}

impl Prompt {
    pub fn new(fabric: &Arc<Fabric>) -> (Arc<Self>, mpsc::UnboundedReceiver<PromptEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let prompt = Arc::new_cyclic(|weak: &Weak<Self>| {
            let node: Weak<dyn Node> = weak.clone();
            Self {
                id: fabric.register("Prompt", node),
                fabric: fabric.clone(),
                user: User::new("Prompt", UserLevel::Local),
                state: Mutex::new(PromptState::default()),
                events,
            }
        });
        (prompt, rx)
    }

    fn lock_state(&self) -> MutexGuard<'_, PromptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: PromptEvent) {
        if self.events.send(event).is_err() {
            trace!(node = %self.id, "prompt renderer gone");
        }
    }

    /// Feeds one typed line into the fabric.
    ///
    /// While a password is requested, the line is carried in the envelope's
    /// options and the payload is empty.
    pub fn submit(&self, line: impl Into<String>) {
        let line = line.into();
        let token = self.lock_state().password_token.take();
        let envelope = match token {
            Some(token) => {
                self.notify(PromptEvent::PasswordMode(false));
                DataEnvelope::new("", self.user.clone())
                    .with_option(TOKEN_OPTION, token)
                    .with_option(PASSWORD_OPTION, line)
            }
            None => DataEnvelope::new(line, self.user.clone()),
        };
        self.input(envelope.with_option(FROM_PROMPT_OPTION, "true"));
    }

    /// Masks the next submitted line and tags it with `token`.
    pub fn ask_password(&self, token: impl Into<String>) {
        self.lock_state().password_token = Some(token.into());
        self.notify(PromptEvent::PasswordMode(true));
    }

    pub fn is_password_mode(&self) -> bool {
        self.lock_state().password_token.is_some()
    }

    pub fn set_prompt(&self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        self.lock_state().prompt = prompt.clone();
        self.notify(PromptEvent::Prompt(prompt));
    }

    pub fn prompt_text(&self) -> String {
        self.lock_state().prompt.clone()
    }

    pub fn set_completions(&self, completions: Vec<String>) {
        self.lock_state().completions = completions.clone();
        self.notify(PromptEvent::Completions(completions));
    }

    pub fn completions(&self) -> Vec<String> {
        self.lock_state().completions.clone()
    }

    /// Completion candidates for a partially typed line.
    ///
    /// Only command lines complete. When nothing matches, every known
    /// command is offered.
    pub fn complete(&self, line: &str) -> Vec<String> {
        if !line.starts_with(COMMAND_SIGIL) {
            return Vec::new();
        }
        let completions = self.completions();
        let hits: Vec<String> = completions
            .iter()
            .filter(|c| c.starts_with(line))
            .cloned()
            .collect();
        if hits.is_empty() {
            completions
        } else {
            hits
        }
    }
}

impl Node for Prompt {
    fn id(&self) -> NodeId {
        self.id
    }

    fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    fn on_output(&self, envelope: DataEnvelope) {
        self.notify(PromptEvent::Line(envelope.text()));
    }
}

impl Drop for Prompt {
    fn drop(&mut self) {
        self.fabric.destroy(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::tests::Recorder;
    use crate::fabric::{Handler, Surface};

    #[test]
    fn test_submit_tags_line() {
        let fabric = Fabric::new();
        let (prompt, _rx) = Prompt::new(&fabric);
        let sink = Recorder::new(&fabric, "Sink");
        fabric.pipe_to(prompt.id(), sink.id(), Surface::Input, Handler::Input);

        prompt.submit("/version");
        let received = sink.received.lock().unwrap();
        assert_eq!(received[0].1.text(), "/version");
        assert_eq!(received[0].1.option(FROM_PROMPT_OPTION), Some("true"));
    }

    #[test]
    fn test_ask_password_masks_next_line_only() {
        let fabric = Fabric::new();
        let (prompt, mut rx) = Prompt::new(&fabric);
        let sink = Recorder::new(&fabric, "Sink");
        fabric.pipe_to(prompt.id(), sink.id(), Surface::Input, Handler::Input);

        prompt.ask_password("tok");
        assert!(prompt.is_password_mode());
        prompt.submit("secret");
        prompt.submit("visible");

        let received = sink.received.lock().unwrap();
        assert_eq!(received[0].1.text(), "");
        assert_eq!(received[0].1.option(TOKEN_OPTION), Some("tok"));
        assert_eq!(received[0].1.option(PASSWORD_OPTION), Some("secret"));
        assert_eq!(received[1].1.text(), "visible");
        assert_eq!(received[1].1.option(TOKEN_OPTION), None);

        assert_eq!(rx.try_recv().unwrap(), PromptEvent::PasswordMode(true));
        assert_eq!(rx.try_recv().unwrap(), PromptEvent::PasswordMode(false));
    }

    #[test]
    fn test_complete() {
        let fabric = Fabric::new();
        let (prompt, _rx) = Prompt::new(&fabric);
        prompt.set_completions(vec![
            "/help".to_string(),
            "/version".to_string(),
            "/localversion".to_string(),
        ]);

        assert!(prompt.complete("ver").is_empty());
        assert_eq!(prompt.complete("/v"), vec!["/version"]);
        assert_eq!(prompt.complete("/zzz").len(), 3);
        assert_eq!(prompt.complete("/").len(), 3);
    }

    #[test]
    fn test_output_becomes_line_event() {
        let fabric = Fabric::new();
        let (prompt, mut rx) = Prompt::new(&fabric);
        prompt.output(DataEnvelope::new("hi", User::new("x", UserLevel::Local)));
        assert_eq!(rx.try_recv().unwrap(), PromptEvent::Line("hi".to_string()));
    }
}
