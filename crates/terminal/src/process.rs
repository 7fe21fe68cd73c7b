//! Terminal host process.
//!
//! A [`TerminalProcess`] is the authority every terminal session attaches
//! to. It owns the scrollback and the command table. Input lines are recorded
//! with their sender's prompt, and lines starting with the command sigil are
//! dispatched. Output from any source is recorded before it fans out to the
//! attached sessions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, warn};

use crate::command::{Command, CommandContext, CommandError, CommandTable, COMMAND_SIGIL};
use crate::fabric::{DataEnvelope, Fabric, Node, NodeId, Surface};
use crate::prompt::{PASSWORD_OPTION, TOKEN_OPTION};
use crate::user::{User, UserLevel};

/// Default scrollback size in lines.
pub const DEFAULT_SCREEN_LIMIT: usize = 1000;

/// Default prompt string shown after the user's prompt.
pub const DEFAULT_PROMPT_STRING: &str = ">";

/// Bounded scrollback. Lines are stored newline-terminated and the oldest
/// line is evicted once the limit is exceeded.
#[derive(Debug, Clone)]
pub struct ScreenBuffer {
    lines: VecDeque<String>,
    limit: usize,
}

impl ScreenBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        let mut line = line.into();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.lines.push_back(line);
        while self.lines.len() > self.limit {
            self.lines.pop_front();
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// The whole scrollback as one string.
    pub fn joined(&self) -> String {
        self.lines.iter().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

type PasswordHandler = Box<dyn FnOnce(&TerminalProcess, String) + Send>;

struct ProcessState {
    prompt_string: String,
    screen: ScreenBuffer,
    commands: CommandTable,
    current_user: Option<User>,
    password_handlers: HashMap<String, PasswordHandler>,
}

/// The command-dispatching, scrollback-owning node.
pub struct TerminalProcess {
    id: NodeId,
    fabric: Arc<Fabric>,
    name: String,
    user: User,
    state: Mutex<ProcessState>,
    dispatch: Mutex<()>,
}

impl TerminalProcess {
    pub fn new(fabric: &Arc<Fabric>, name: impl Into<String>) -> Arc<Self> {
        Self::with_screen_limit(fabric, name, DEFAULT_SCREEN_LIMIT)
    }

    pub fn with_screen_limit(
        fabric: &Arc<Fabric>,
        name: impl Into<String>,
        screen_limit: usize,
    ) -> Arc<Self> {
        let name = name.into();
        let process = Arc::new_cyclic(|weak: &Weak<Self>| {
            let node: Weak<dyn Node> = weak.clone();
            Self {
                id: fabric.register(format!("Process[{}]", name), node),
                fabric: fabric.clone(),
                user: User::new(format!("Process[{}]", name), UserLevel::System),
                name,
                state: Mutex::new(ProcessState {
                    prompt_string: DEFAULT_PROMPT_STRING.to_string(),
                    screen: ScreenBuffer::new(screen_limit),
                    commands: CommandTable::new(),
                    current_user: None,
                    password_handlers: HashMap::new(),
                }),
                dispatch: Mutex::new(()),
            }
        });
        process.register_builtins();
        process
    }

    fn lock_state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The SYSTEM-level user self-originated output is attributed to.
    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn prompt_string(&self) -> String {
        self.lock_state().prompt_string.clone()
    }

    /// Changes the prompt string and notifies subscribed sessions.
    pub fn set_prompt_string(&self, prompt_string: impl Into<String>) {
        let prompt_string = prompt_string.into();
        self.lock_state().prompt_string = prompt_string.clone();
        self.fabric.emit(
            self.id,
            Surface::PromptString,
            &DataEnvelope::new(prompt_string, self.user.clone()),
        );
    }

    /// Scrollback lines, oldest first.
    pub fn screen(&self) -> Vec<String> {
        self.lock_state().screen.lines()
    }

    /// Scrollback joined into one string.
    pub fn history(&self) -> String {
        self.lock_state().screen.joined()
    }

    pub fn clear_screen(&self) {
        self.lock_state().screen.clear();
    }

    /// The user whose command is being dispatched, if any. Commands run one
    /// at a time per process, so this is the caller for the whole run.
    pub fn current_user(&self) -> Option<User> {
        self.lock_state().current_user.clone()
    }

    pub fn register_command(&self, command: Command) {
        debug!(process = %self.name, command = %command.name(), "command registered");
        self.lock_state().commands.register(command);
    }

    pub fn completions(&self) -> Vec<String> {
        self.lock_state().commands.completions()
    }

    pub fn is_local_command(&self, line: &str) -> bool {
        self.lock_state().commands.is_local(line)
    }

    /// Returns whether `envelope` must be handled here even when the session
    /// is attached to a remote peer.
    pub fn is_local_input(&self, envelope: &DataEnvelope) -> bool {
        if let Some(token) = envelope.option(TOKEN_OPTION) {
            if self.lock_state().password_handlers.contains_key(token) {
                return true;
            }
        }
        self.is_local_command(&envelope.text())
    }

    pub fn help_text(&self, topic: Option<&str>) -> Result<String, CommandError> {
        self.lock_state().commands.help_text(topic)
    }

    /// Routes the next input carrying `token` to `handler` instead of the
    /// scrollback and command table.
    pub fn await_password<F>(&self, token: impl Into<String>, handler: F)
    where
        F: FnOnce(&TerminalProcess, String) + Send + 'static,
    {
        self.lock_state()
            .password_handlers
            .insert(token.into(), Box::new(handler));
    }

    /// Outputs a line attributed to the process itself.
    pub fn print(&self, text: impl Into<String>) {
        self.output(DataEnvelope::new(text.into(), self.user.clone()));
    }

    pub fn output_as(&self, text: impl Into<String>, user: User) {
        self.output(DataEnvelope::new(text.into(), user));
    }

    fn dispatch(&self, line: &str, envelope: &DataEnvelope) {
        // Held for the whole run. Actions must not feed input back into
        // their own process.
        let _running = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);

        let (name, args) = match CommandTable::parse(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(process = %self.name, line, "failed to parse command");
                self.print(e.to_string());
                return;
            }
        };

        // Resolve under the lock, run without it: actions may re-enter.
        let resolved = self.lock_state().commands.resolve(&name, &envelope.user);
        let command = match resolved {
            Ok(command) => command,
            Err(e) => {
                debug!(process = %self.name, command = %name, error = %e, "command rejected");
                self.print(e.to_string());
                return;
            }
        };

        self.lock_state().current_user = Some(envelope.user.clone());
        let ctx = CommandContext {
            process: self,
            user: &envelope.user,
            args: &args,
            envelope,
        };
        let result = command.run(&ctx);
        self.lock_state().current_user = None;

        if let Err(e) = result {
            debug!(process = %self.name, command = %name, error = %e, "command failed");
            self.print(e.to_string());
        }
    }

    fn register_builtins(&self) {
        self.register_command(
            Command::new("/help", "Show available commands", |ctx| {
                let text = ctx.process.help_text(ctx.arg(0))?;
                ctx.reply(text);
                Ok(())
            })
            .usage("[command]"),
        );
        self.register_command(Command::new("/version", "Show the terminal version", |ctx| {
            ctx.reply(format!("Terminal version: {}", protocol::PROTOCOL_VERSION));
            Ok(())
        }));
        self.register_command(
            Command::new(
                "/localversion",
                "Show the version of this terminal",
                |ctx| {
                    ctx.reply(format!(
                        "Local Terminal version: {}",
                        protocol::PROTOCOL_VERSION
                    ));
                    Ok(())
                },
            )
            .local(),
        );
        self.register_command(
            Command::new("/pipeDebug", "Dump the pipes of this process", |ctx| {
                let process = ctx.process;
                ctx.reply(process.fabric.pipe_debug(process.id));
                Ok(())
            })
            .level(UserLevel::Local),
        );
        self.register_command(
            Command::new("/pipeLog", "Dump the pipe operation log", |ctx| {
                let process = ctx.process;
                let log = process.fabric.pipe_log(process.id);
                if log.is_empty() {
                    ctx.reply("Pipe log is empty.");
                } else {
                    let lines: Vec<String> = log.iter().map(ToString::to_string).collect();
                    ctx.reply(lines.join("\n"));
                }
                Ok(())
            })
            .level(UserLevel::Local),
        );
    }
}

impl Node for TerminalProcess {
    fn id(&self) -> NodeId {
        self.id
    }

    fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    fn on_input(&self, envelope: DataEnvelope) {
        if let Some(token) = envelope.option(TOKEN_OPTION) {
            let handler = self.lock_state().password_handlers.remove(token);
            if let Some(handler) = handler {
                let password = envelope.option(PASSWORD_OPTION).unwrap_or_default();
                handler(self, password.to_string());
                return;
            }
        }

        let line = envelope.text();
        self.lock_state()
            .screen
            .push(format!("{}>{}", envelope.user.prompt(), line));

        if line.starts_with(COMMAND_SIGIL) {
            self.dispatch(&line, &envelope);
        }
    }

    fn on_output(&self, envelope: DataEnvelope) {
        self.lock_state().screen.push(envelope.text());
    }
}

impl Drop for TerminalProcess {
    fn drop(&mut self) {
        self.fabric.destroy(self.id);
    }
}

impl std::fmt::Debug for TerminalProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalProcess")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::tests::Recorder;
    use crate::fabric::Handler;

    fn setup() -> (Arc<Fabric>, Arc<TerminalProcess>, Arc<Recorder>) {
        let fabric = Fabric::new();
        let process = TerminalProcess::new(&fabric, "Server");
        let observer = Recorder::new(&fabric, "Observer");
        fabric.pipe_from(observer.id(), process.id(), Surface::Output, Handler::Output);
        (fabric, process, observer)
    }

    fn admin() -> User {
        User::new("Admin", UserLevel::Admin)
    }

    #[test]
    fn test_screen_buffer_evicts_oldest() {
        let mut screen = ScreenBuffer::new(2);
        screen.push("a");
        screen.push("b\n");
        screen.push("c");
        assert_eq!(screen.lines(), vec!["b\n", "c\n"]);
        assert_eq!(screen.joined(), "b\nc\n");
    }

    #[test]
    fn test_screen_buffer_zero_limit_clamped() {
        let mut screen = ScreenBuffer::new(0);
        screen.push("a");
        assert_eq!(screen.len(), 1);
        assert_eq!(screen.limit(), 1);
    }

    #[test]
    fn test_version_records_input_and_output() {
        let (_fabric, process, observer) = setup();
        process.input(DataEnvelope::new("/version", admin()));

        let expected = format!("Terminal version: {}", protocol::PROTOCOL_VERSION);
        assert_eq!(observer.texts(), vec![expected.clone()]);
        assert_eq!(
            process.screen(),
            vec![
                "[ADMIN]Admin>/version\n".to_string(),
                format!("{}\n", expected)
            ]
        );
    }

    #[test]
    fn test_plain_line_is_only_recorded() {
        let (_fabric, process, observer) = setup();
        process.input(DataEnvelope::new("hello there", admin()));
        assert!(observer.texts().is_empty());
        assert_eq!(process.screen(), vec!["[ADMIN]Admin>hello there\n"]);
    }

    #[test]
    fn test_unknown_command() {
        let (_fabric, process, observer) = setup();
        process.input(DataEnvelope::new("/foo", admin()));
        assert_eq!(observer.texts(), vec!["error: unknown command '/foo'"]);
    }

    #[test]
    fn test_parse_failure_reports_internal_error() {
        let (_fabric, process, observer) = setup();
        process.input(DataEnvelope::new("/help \"unterminated", admin()));
        assert_eq!(
            observer.texts(),
            vec!["Internal Error: Terminal failed to parse command."]
        );
        let received = observer.received.lock().unwrap();
        assert!(received[0].1.user.same_as(process.user()));
    }

    #[test]
    fn test_help_accepts_name_without_sigil() {
        let (_fabric, process, observer) = setup();
        process.input(DataEnvelope::new("/help version", admin()));
        let texts = observer.texts();
        assert!(texts[0].starts_with("/version"));
    }

    #[test]
    fn test_completions_order() {
        let fabric = Fabric::new();
        let process = TerminalProcess::new(&fabric, "Server");
        assert_eq!(
            process.completions(),
            vec!["/help", "/version", "/localversion", "/pipeDebug", "/pipeLog"]
        );
    }

    #[test]
    fn test_current_user_during_dispatch() {
        let (_fabric, process, observer) = setup();
        process.register_command(Command::new("/whoami", "", |ctx| {
            let current = ctx.process.current_user().map(|u| u.name().to_string());
            ctx.reply(current.unwrap_or_default());
            Ok(())
        }));
        process.input(DataEnvelope::new("/whoami", admin()));
        assert_eq!(observer.texts(), vec!["Admin"]);
        assert!(process.current_user().is_none());
    }

    #[test]
    fn test_reply_is_attributed_to_caller() {
        let (_fabric, process, observer) = setup();
        process.input(DataEnvelope::new("/version", User::new("bob", UserLevel::Remote)));

        let received = observer.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1.user.name(), "bob");
    }

    #[test]
    fn test_concurrent_dispatch_keeps_caller() {
        let (_fabric, process, observer) = setup();
        process.register_command(Command::new("/slow", "", |ctx| {
            std::thread::sleep(std::time::Duration::from_millis(100));
            let current = ctx.process.current_user().map(|u| u.name().to_string());
            ctx.reply(format!("{}:{}", ctx.user.name(), current.unwrap_or_default()));
            Ok(())
        }));

        let callers: Vec<_> = ["alice", "bob"]
            .into_iter()
            .map(|name| {
                let process = process.clone();
                std::thread::spawn(move || {
                    process.input(DataEnvelope::new("/slow", User::new(name, UserLevel::Remote)));
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        let mut texts = observer.texts();
        texts.sort();
        assert_eq!(texts, vec!["alice:alice", "bob:bob"]);
        assert!(process.current_user().is_none());
    }

    #[test]
    fn test_command_level_enforced() {
        let (_fabric, process, observer) = setup();
        let remote = User::new("bob", UserLevel::Remote);
        process.input(DataEnvelope::new("/pipeDebug", remote));
        assert_eq!(
            observer.texts(),
            vec!["error: '/pipeDebug' requires LOCAL privileges"]
        );
    }

    #[test]
    fn test_pipe_debug_lists_observer() {
        let (_fabric, process, observer) = setup();
        process.input(DataEnvelope::new("/pipeDebug", admin()));
        let dump = &observer.texts()[0];
        assert!(dump.contains("Observer#"));
    }

    #[test]
    fn test_prompt_string_emits() {
        let (fabric, process, observer) = setup();
        fabric.pipe_from(
            observer.id(),
            process.id(),
            Surface::PromptString,
            Handler::PromptString,
        );
        process.set_prompt_string("$ ");
        assert_eq!(process.prompt_string(), "$ ");
        let received = observer.received.lock().unwrap();
        assert_eq!(received[0].0, Handler::PromptString);
        assert_eq!(received[0].1.text(), "$ ");
    }

    #[test]
    fn test_password_handler_consumes_line() {
        let (_fabric, process, observer) = setup();
        process.await_password("t1", |process, password| {
            process.print(format!("got {}", password));
        });

        let env = DataEnvelope::new("", admin())
            .with_option(TOKEN_OPTION, "t1")
            .with_option(PASSWORD_OPTION, "hunter2");
        assert!(process.is_local_input(&env));
        process.input(env.clone());

        assert_eq!(observer.texts(), vec!["got hunter2"]);
        assert!(!process.is_local_input(&env));
        // The masked line itself is never recorded.
        assert_eq!(process.screen(), vec!["got hunter2\n"]);
    }

    #[test]
    fn test_drop_unregisters() {
        let fabric = Fabric::new();
        let process = TerminalProcess::new(&fabric, "Server");
        let id = process.id();
        drop(process);
        assert!(!fabric.contains(id));
    }
}
