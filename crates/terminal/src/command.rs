//! Command table.
//!
//! Commands are keyed by a path-like name that starts with the command sigil
//! (`/version`, `/pipeDebug`). Lines are tokenized with shell quoting rules,
//! so `/kick "Some User"` passes one argument.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::fabric::DataEnvelope;
use crate::process::TerminalProcess;
use crate::user::{User, UserLevel};

/// Leading character of every command line.
pub const COMMAND_SIGIL: char = '/';

/// Name of the built-in help command.
pub const HELP_COMMAND: &str = "/help";

/// Errors surfaced while dispatching a command line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Internal Error: Terminal failed to parse command.")]
    Parse(String),

    #[error("error: unknown command '{0}'")]
    Unknown(String),

    #[error("error: '{command}' requires {required} privileges")]
    PermissionDenied { command: String, required: UserLevel },

    #[error("usage: {0}")]
    Usage(String),

    #[error("error: {0}")]
    Failed(String),
}

/// Where a command runs when the terminal is attached to a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandScope {
    /// Forwarded to the remote process like any other line.
    #[default]
    Shared,
    /// Always executed by the local process.
    Local,
}

/// Everything a command action can see.
pub struct CommandContext<'a> {
    pub process: &'a TerminalProcess,
    /// The user who issued the line.
    pub user: &'a User,
    pub args: &'a [String],
    pub envelope: &'a DataEnvelope,
}

impl CommandContext<'_> {
    /// Outputs a line attributed to the calling user.
    pub fn reply(&self, text: impl Into<String>) {
        self.process.output_as(text, self.user.clone());
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

type Action = Arc<dyn Fn(&CommandContext<'_>) -> Result<(), CommandError> + Send + Sync>;

/// A named command with its action.
#[derive(Clone)]
pub struct Command {
    name: String,
    about: String,
    usage: String,
    level: UserLevel,
    scope: CommandScope,
    action: Action,
}

impl Command {
    /// Creates a command. The sigil is added to `name` if missing.
    pub fn new<F>(name: &str, about: impl Into<String>, action: F) -> Self
    where
        F: Fn(&CommandContext<'_>) -> Result<(), CommandError> + Send + Sync + 'static,
    {
        Self {
            name: normalize(name),
            about: about.into(),
            usage: String::new(),
            level: UserLevel::None,
            scope: CommandScope::Shared,
            action: Arc::new(action),
        }
    }

    /// Sets the argument synopsis shown by `/help`.
    pub fn usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = usage.into();
        self
    }

    /// Sets the minimum level required to run the command.
    pub fn level(mut self, level: UserLevel) -> Self {
        self.level = level;
        self
    }

    /// Marks the command as local-only.
    pub fn local(mut self) -> Self {
        self.scope = CommandScope::Local;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn about(&self) -> &str {
        &self.about
    }

    pub fn required_level(&self) -> UserLevel {
        self.level
    }

    pub fn scope(&self) -> CommandScope {
        self.scope
    }

    pub fn synopsis(&self) -> String {
        if self.usage.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.name, self.usage)
        }
    }

    /// Runs the action.
    pub fn run(&self, ctx: &CommandContext<'_>) -> Result<(), CommandError> {
        (self.action)(ctx)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("level", &self.level)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

fn normalize(name: &str) -> String {
    if name.starts_with(COMMAND_SIGIL) {
        name.to_string()
    } else {
        format!("{}{}", COMMAND_SIGIL, name)
    }
}

/// Commands in registration order.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    commands: Vec<Command>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a command, replacing one with the same name in place.
    pub fn register(&mut self, command: Command) -> Option<Command> {
        match self.commands.iter_mut().find(|c| c.name == command.name) {
            Some(existing) => Some(std::mem::replace(existing, command)),
            None => {
                self.commands.push(command);
                None
            }
        }
    }

    /// Looks a command up; the sigil is optional.
    pub fn get(&self, name: &str) -> Option<&Command> {
        let name = normalize(name);
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Command names for completion, `/help` first.
    pub fn completions(&self) -> Vec<String> {
        std::iter::once(HELP_COMMAND.to_string())
            .chain(
                self.commands
                    .iter()
                    .filter(|c| c.name != HELP_COMMAND)
                    .map(|c| c.name.clone()),
            )
            .collect()
    }

    /// Returns whether `line` is exactly the name of a local command.
    pub fn is_local(&self, line: &str) -> bool {
        let line = line.trim();
        line != HELP_COMMAND
            && self
                .commands
                .iter()
                .any(|c| c.scope == CommandScope::Local && c.name == line)
    }

    /// Looks up `name` and checks that `user` may run it.
    pub fn resolve(&self, name: &str, user: &User) -> Result<Command, CommandError> {
        let command = self
            .get(name)
            .ok_or_else(|| CommandError::Unknown(name.to_string()))?;
        if !user.satisfy(command.level) {
            return Err(CommandError::PermissionDenied {
                command: command.name.clone(),
                required: command.level,
            });
        }
        Ok(command.clone())
    }

    /// Listing of every command, or the help of one.
    pub fn help_text(&self, topic: Option<&str>) -> Result<String, CommandError> {
        match topic {
            Some(topic) => {
                let command = self
                    .get(topic)
                    .ok_or_else(|| CommandError::Unknown(normalize(topic)))?;
                let mut text = command.synopsis();
                if !command.about.is_empty() {
                    text.push_str("\n  ");
                    text.push_str(&command.about);
                }
                Ok(text)
            }
            None => {
                let width = self
                    .commands
                    .iter()
                    .map(|c| c.synopsis().len())
                    .max()
                    .unwrap_or(0);
                let lines: Vec<String> = self
                    .commands
                    .iter()
                    .map(|c| format!("  {:<width$}  {}", c.synopsis(), c.about, width = width))
                    .collect();
                Ok(format!("Available commands:\n{}", lines.join("\n")))
            }
        }
    }

    /// Splits a command line into its name and arguments.
    pub fn parse(line: &str) -> Result<(String, Vec<String>), CommandError> {
        let mut words =
            shlex::split(line.trim()).ok_or_else(|| CommandError::Parse(line.to_string()))?;
        if words.is_empty() {
            return Err(CommandError::Parse(line.to_string()));
        }
        let name = words.remove(0);
        if !name.starts_with(COMMAND_SIGIL) {
            return Err(CommandError::Parse(line.to_string()));
        }
        Ok((name, words))
    }
}
