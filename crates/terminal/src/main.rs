//! remterm
//!
//! Host a terminal process over the network, or connect to one.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use terminal::config::{default_config_path, Config};
use terminal::prompt::{Prompt, PromptEvent};
use terminal::shutdown::wait_for_shutdown_signal;
use terminal::{Client, Fabric, Server, Terminal, TerminalProcess, User, UserLevel};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// remterm - remote terminal sessions over a shared-secret secure channel.
#[derive(Parser, Debug)]
#[command(name = "remterm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Host the terminal process and accept remote clients
    Serve {
        /// Address to listen on (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(long, short)]
        port: Option<u16>,

        /// Shared secret (overrides config)
        #[arg(long, short)]
        secret: Option<String>,
    },

    /// Connect to a remote terminal
    Connect {
        /// Server address as host:port or ws://host:port (defaults to config)
        address: Option<String>,

        /// Shared secret (overrides config)
        #[arg(long, short)]
        secret: Option<String>,
    },

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.general.log_level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Serve { host, port, secret } => {
            if let Some(host) = host {
                config.network.host = host;
            }
            if let Some(port) = port {
                config.network.port = port;
            }
            if let Some(secret) = secret {
                config.security.secret = secret;
            }
            config.validate()?;
            run_server(&config).await?;
        }
        Commands::Connect { address, secret } => {
            if let Some(secret) = secret {
                config.security.secret = secret;
            }
            config.validate()?;
            let address = address.unwrap_or_else(|| config.network.address());
            run_client(&config, &address).await?;
        }
        Commands::InitConfig { force } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
            println!("Set [security] secret before running `remterm serve`.");
        }
    }

    Ok(())
}

/// Hosts the process, with a local operator console on stdin/stdout.
async fn run_server(config: &Config) -> anyhow::Result<()> {
    let fabric = Fabric::new();
    let process = TerminalProcess::with_screen_limit(
        &fabric,
        config.general.name.clone(),
        config.session.screen_limit,
    );
    let server = Server::new(
        &process,
        &config.security.secret,
        config.channel_settings(),
    );

    let operator = Terminal::new(
        &process,
        User::new(config.general.user_name.clone(), UserLevel::Admin),
    );
    let (prompt, events) = Prompt::new(&fabric);
    operator.use_prompt(&prompt);
    operator.redraw();

    server
        .bind(&config.network.address())
        .await
        .context("Failed to start server")?;

    let result = run_console(&prompt, events).await;

    tracing::info!("Shutting down server...");
    server.shutdown().await;
    operator.destroy();
    result
}

/// Runs the client binding with a console on stdin/stdout.
async fn run_client(config: &Config, address: &str) -> anyhow::Result<()> {
    let fabric = Fabric::new();
    let client = Client::new(
        &fabric,
        User::new(config.general.user_name.clone(), UserLevel::Local),
        config.channel_settings(),
    );
    client.set_history_request(config.session.request_history);

    let (prompt, events) = Prompt::new(&fabric);
    client.terminal().use_prompt(&prompt);

    if let Err(e) = client.connect(address, &config.security.secret).await {
        tracing::warn!("Initial connection failed: {}", e);
    }

    let result = run_console(&prompt, events).await;

    client.shutdown().await;
    result
}

/// Feeds stdin lines into `prompt` and renders its events until stdin
/// closes or a shutdown signal arrives.
async fn run_console(
    prompt: &Arc<Prompt>,
    mut events: mpsc::UnboundedReceiver<PromptEvent>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    let mut prompt_text = String::new();
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("Failed to register signal handlers")?;
                break;
            }
            event = events.recv() => match event {
                Some(event) => render(event, &mut prompt_text)?,
                None => break,
            },
            line = lines.next_line() => match line.context("Failed to read from stdin")? {
                Some(line) => prompt.submit(line),
                None => {
                    tracing::debug!("stdin closed");
                    break;
                }
            },
        }
    }
    Ok(())
}

fn render(event: PromptEvent, prompt_text: &mut String) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    match event {
        PromptEvent::Line(line) => {
            writeln!(stdout, "{}", line.trim_end_matches('\n'))?;
            write!(stdout, "{} ", prompt_text)?;
        }
        PromptEvent::Prompt(text) => {
            *prompt_text = text;
            write!(stdout, "{} ", prompt_text)?;
        }
        PromptEvent::PasswordMode(true) => {
            write!(stdout, "(password) ")?;
        }
        PromptEvent::PasswordMode(false) => {}
        PromptEvent::Completions(completions) => {
            tracing::debug!("completions: {}", completions.join(" "));
        }
    }
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::try_parse_from(["remterm", "serve"]).unwrap();
        match cli.command {
            Commands::Serve { host, port, secret } => {
                assert!(host.is_none());
                assert!(port.is_none());
                assert!(secret.is_none());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_with_overrides() {
        let cli = Cli::try_parse_from([
            "remterm", "serve", "--host", "0.0.0.0", "-p", "9000", "--secret", "s3cr3t",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve { host, port, secret } => {
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
                assert_eq!(port, Some(9000));
                assert_eq!(secret.as_deref(), Some("s3cr3t"));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_invalid_port() {
        assert!(Cli::try_parse_from(["remterm", "serve", "--port", "99999"]).is_err());
    }

    #[test]
    fn test_connect_command() {
        let cli = Cli::try_parse_from(["remterm", "connect", "10.0.0.2:8080", "-s", "key"]).unwrap();
        match cli.command {
            Commands::Connect { address, secret } => {
                assert_eq!(address.as_deref(), Some("10.0.0.2:8080"));
                assert_eq!(secret.as_deref(), Some("key"));
            }
            _ => panic!("Expected Connect command"),
        }
    }

    #[test]
    fn test_connect_without_address() {
        let cli = Cli::try_parse_from(["remterm", "connect"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Connect { address: None, secret: None }
        ));
    }

    #[test]
    fn test_init_config_command() {
        let cli = Cli::try_parse_from(["remterm", "init-config", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::InitConfig { force: true }));
    }

    #[test]
    fn test_global_options() {
        let cli =
            Cli::try_parse_from(["remterm", "connect", "-v", "-c", "/tmp/remterm.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/remterm.toml")));
    }

    #[test]
    fn test_missing_subcommand() {
        assert!(Cli::try_parse_from(["remterm"]).is_err());
    }
}
