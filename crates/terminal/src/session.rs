//! Terminal sessions.
//!
//! A [`Terminal`] is one user's view of a [`TerminalProcess`]. On creation it
//! subscribes to the process:
//!
//! ```text
//!   process.input        ──▶ terminal.echoInput
//!   process.output       ──▶ terminal.output
//!   process.promptString ──▶ terminal.setPromptString
//!   terminal.input       ──▶ process.input
//! ```
//!
//! A front end attaches with [`Terminal::use_prompt`]. Remote bindings reroute
//! the input edge through a secure channel with
//! [`Terminal::detach_process_input`] and restore it afterwards.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use crate::fabric::{DataEnvelope, Fabric, Handler, Node, NodeId, Surface};
use crate::process::TerminalProcess;
use crate::prompt::{Prompt, FROM_PROMPT_OPTION, TOKEN_OPTION};
use crate::user::User;

struct TerminalState {
    user: User,
    prompt_string: String,
    prompt: Option<Arc<Prompt>>,
    extra_completions: Vec<String>,
}

pub struct Terminal {
    id: NodeId,
    fabric: Arc<Fabric>,
    process: Arc<TerminalProcess>,
    state: Mutex<TerminalState>,
}

impl Terminal {
    pub fn new(process: &Arc<TerminalProcess>, user: User) -> Arc<Self> {
        let fabric = process.fabric().clone();
        let terminal = Arc::new_cyclic(|weak: &Weak<Self>| {
            let node: Weak<dyn Node> = weak.clone();
            Self {
                id: fabric.register("Terminal", node),
                fabric: fabric.clone(),
                process: process.clone(),
                state: Mutex::new(TerminalState {
                    user,
                    prompt_string: process.prompt_string(),
                    prompt: None,
                    extra_completions: Vec::new(),
                }),
            }
        });

        let (id, pid) = (terminal.id, process.id());
        fabric.pipe_from(id, pid, Surface::Input, Handler::EchoInput);
        fabric.pipe_from(id, pid, Surface::Output, Handler::Output);
        fabric.pipe_from(id, pid, Surface::PromptString, Handler::PromptString);
        terminal.attach_process_input();
        terminal
    }

    fn lock_state(&self) -> MutexGuard<'_, TerminalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn process(&self) -> &Arc<TerminalProcess> {
        &self.process
    }

    pub fn user(&self) -> User {
        self.lock_state().user.clone()
    }

    pub fn set_user_name(&self, name: impl Into<String>) {
        self.lock_state().user.set_name(name);
        self.update();
    }

    pub fn prompt_string(&self) -> String {
        self.lock_state().prompt_string.clone()
    }

    pub fn set_prompt_string(&self, prompt_string: impl Into<String>) {
        self.lock_state().prompt_string = prompt_string.into();
        self.update();
    }

    /// Full prompt text, e.g. `[ADMIN]Admin>`.
    pub fn prompt_text(&self) -> String {
        let state = self.lock_state();
        format!("{}{}", state.user.prompt(), state.prompt_string)
    }

    /// Completions contributed by a remote peer, merged after the local ones.
    pub fn set_extra_completions(&self, completions: Vec<String>) {
        self.lock_state().extra_completions = completions;
        self.update();
    }

    pub fn completions(&self) -> Vec<String> {
        let mut completions = self.process.completions();
        for extra in self.lock_state().extra_completions.iter() {
            if !completions.contains(extra) {
                completions.push(extra.clone());
            }
        }
        completions
    }

    pub fn prompt(&self) -> Option<Arc<Prompt>> {
        self.lock_state().prompt.clone()
    }

    /// Binds an interactive front end, replacing any previous one.
    pub fn use_prompt(&self, prompt: &Arc<Prompt>) {
        let previous = self.lock_state().prompt.replace(prompt.clone());
        if let Some(previous) = previous {
            self.fabric
                .un_pipe_from(self.id, previous.id(), Surface::Input, Handler::Input);
            self.fabric
                .un_pipe_to(self.id, previous.id(), Surface::Output, Handler::Output);
        }
        self.fabric
            .pipe_from(self.id, prompt.id(), Surface::Input, Handler::Input);
        self.fabric
            .pipe_to(self.id, prompt.id(), Surface::Output, Handler::Output);
        self.update();
    }

    /// Pushes prompt text and completions to the front end.
    pub fn update(&self) {
        let Some(prompt) = self.prompt() else {
            return;
        };
        prompt.set_prompt(self.prompt_text());
        prompt.set_completions(self.completions());
    }

    /// Replays the process scrollback to the front end.
    pub fn redraw(&self) {
        let Some(prompt) = self.prompt() else {
            return;
        };
        for line in self.process.screen() {
            prompt.output(DataEnvelope::new(
                line.trim_end_matches('\n'),
                self.process.user().clone(),
            ));
        }
    }

    /// Routes this session's input into the process.
    pub fn attach_process_input(&self) -> bool {
        self.fabric
            .pipe_to(self.id, self.process.id(), Surface::Input, Handler::Input)
    }

    /// Stops routing this session's input into the process.
    pub fn detach_process_input(&self) -> bool {
        self.fabric
            .un_pipe_to(self.id, self.process.id(), Surface::Input, Handler::Input)
    }

    pub fn has_process_input(&self) -> bool {
        self.fabric.has_pipe(&crate::fabric::Pipe {
            source: self.id,
            event: Surface::Input,
            target: self.process.id(),
            handler: Handler::Input,
        })
    }

    /// Submits a line as this session's user.
    pub fn send(&self, line: impl Into<String>) {
        self.input(DataEnvelope::new(line.into(), self.user()));
    }

    /// Outputs a line attributed to the process.
    pub fn print(&self, text: impl Into<String>) {
        self.output(DataEnvelope::new(text.into(), self.process.user().clone()));
    }

    /// Removes every pipe of this session and unregisters it.
    pub fn destroy(&self) {
        debug!(node = %self.id, "terminal destroyed");
        self.fabric.destroy(self.id);
    }

    fn echo_input(&self, envelope: DataEnvelope) {
        if envelope.option(TOKEN_OPTION).is_some() || envelope.user.same_as(&self.user()) {
            return;
        }
        let line = format!("{}>{}", envelope.user.prompt(), envelope.text());
        self.output(DataEnvelope::new(line, envelope.user));
    }
}

impl Node for Terminal {
    fn id(&self) -> NodeId {
        self.id
    }

    fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    fn on_event(&self, handler: Handler, mut envelope: DataEnvelope) {
        match handler {
            Handler::Input => {
                if envelope.option(FROM_PROMPT_OPTION).is_some() {
                    envelope.user = self.user();
                }
                self.input(envelope);
            }
            Handler::Output => self.output(envelope),
            Handler::EchoInput => self.echo_input(envelope),
            Handler::PromptString => self.set_prompt_string(envelope.text()),
        }
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        self.fabric.destroy(self.id);
    }
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("id", &self.id)
            .field("user", &self.user())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::PromptEvent;
    use crate::user::UserLevel;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn lines(rx: &mut UnboundedReceiver<PromptEvent>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PromptEvent::Line(line) = event {
                lines.push(line);
            }
        }
        lines
    }

    fn setup() -> (
        Arc<TerminalProcess>,
        Arc<Terminal>,
        Arc<Prompt>,
        UnboundedReceiver<PromptEvent>,
    ) {
        let fabric = Fabric::new();
        let process = TerminalProcess::new(&fabric, "Server");
        let terminal = Terminal::new(&process, User::new("Admin", UserLevel::Admin));
        let (prompt, rx) = Prompt::new(&fabric);
        terminal.use_prompt(&prompt);
        (process, terminal, prompt, rx)
    }

    #[test]
    fn test_prompt_line_runs_as_terminal_user() {
        let (process, _terminal, prompt, mut rx) = setup();
        prompt.submit("/version");

        assert_eq!(
            lines(&mut rx),
            vec![format!("Terminal version: {}", protocol::PROTOCOL_VERSION)]
        );
        assert_eq!(process.screen()[0], "[ADMIN]Admin>/version\n");
    }

    #[test]
    fn test_prompt_text_and_completions() {
        let (process, terminal, prompt, _rx) = setup();
        assert_eq!(prompt.prompt_text(), "[ADMIN]Admin>");
        assert_eq!(prompt.completions(), process.completions());

        process.set_prompt_string("$");
        assert_eq!(terminal.prompt_string(), "$");
        assert_eq!(prompt.prompt_text(), "[ADMIN]Admin$");

        terminal.set_user_name("root");
        assert_eq!(prompt.prompt_text(), "[ADMIN]root$");
    }

    #[test]
    fn test_extra_completions_are_merged() {
        let (_process, terminal, prompt, _rx) = setup();
        terminal.set_extra_completions(vec!["/users".to_string(), "/version".to_string()]);
        let completions = prompt.completions();
        assert_eq!(completions.last().unwrap(), "/users");
        assert_eq!(
            completions.iter().filter(|c| c.as_str() == "/version").count(),
            1
        );
    }

    #[test]
    fn test_echo_skips_own_input() {
        let (process, terminal, _prompt, mut rx) = setup();
        let other = Terminal::new(&process, User::new("bob", UserLevel::Remote));

        other.send("hello");
        assert_eq!(lines(&mut rx), vec!["[REMOTE]bob>hello"]);

        terminal.send("hi");
        assert!(lines(&mut rx).is_empty());
    }

    #[test]
    fn test_use_prompt_replaces_previous() {
        let (_process, terminal, old, mut old_rx) = setup();
        let fabric = terminal.fabric().clone();
        let (new, mut new_rx) = Prompt::new(&fabric);
        terminal.use_prompt(&new);

        old.submit("/version");
        assert!(lines(&mut old_rx).is_empty());
        assert!(lines(&mut new_rx).is_empty());

        new.submit("/version");
        assert_eq!(lines(&mut new_rx).len(), 1);
        assert!(lines(&mut old_rx).is_empty());
    }

    #[test]
    fn test_detach_and_attach_process_input() {
        let (process, terminal, prompt, _rx) = setup();
        assert!(terminal.detach_process_input());
        assert!(!terminal.detach_process_input());
        prompt.submit("ignored");
        assert!(process.screen().is_empty());

        assert!(terminal.attach_process_input());
        assert!(terminal.has_process_input());
        prompt.submit("seen");
        assert_eq!(process.screen(), vec!["[ADMIN]Admin>seen\n"]);
    }

    #[test]
    fn test_redraw_replays_scrollback() {
        let (process, terminal, _prompt, mut rx) = setup();
        process.print("one");
        process.print("two");
        lines(&mut rx);

        terminal.redraw();
        assert_eq!(lines(&mut rx), vec!["one", "two"]);
    }

    #[test]
    fn test_destroy_removes_all_pipes() {
        let (process, terminal, _prompt, _rx) = setup();
        let fabric = terminal.fabric().clone();
        terminal.destroy();
        assert!(fabric.pipes_into(process.id()).is_empty());
        assert!(fabric.pipes_out_of(process.id()).is_empty());
    }
}
