//! clissh
//!
//! An SSH client for application containers: authenticates with a one-time
//! passcode, verifies the host key fingerprint, runs an interactive shell or
//! a command and forwards local ports through the connection.

mod config;
mod error;
#[cfg(test)]
mod fakes;
mod fingerprint;
mod forward;
mod shell;
mod terminal;
mod transport;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, Level};
use tracing_subscriber::EnvFilter;

use crate::config::ShellConfig;
use crate::error::Error;
use crate::forward::{LocalPortForward, TcpListenerFactory};
use crate::shell::{ConnectOptions, SecureShell};
use crate::terminal::{CrosstermTerminal, TtyRequest};
use crate::transport::RusshDialer;

/// clissh - secure shell into an application container
#[derive(Parser, Debug)]
#[command(name = "clissh", version, about)]
struct Cli {
    /// SSH endpoint, `host:port`
    #[arg(required_unless_present = "generate_config")]
    endpoint: Option<String>,

    /// Command to run instead of a login shell
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,

    /// Username presented to the server
    #[arg(short, long, required_unless_present = "generate_config")]
    user: Option<String>,

    /// One-time passcode used as the password
    #[arg(short, long, env = "CLISSH_PASSCODE", hide_env_values = true)]
    passcode: Option<String>,

    /// Expected host key fingerprint (MD5 hex, SHA1 hex or base64 SHA256)
    #[arg(long, default_value = "")]
    fingerprint: String,

    /// Skip host key validation
    #[arg(short = 'k', long)]
    skip_host_validation: bool,

    /// Local port forward: [bind_address:]port:host:hostport
    #[arg(short = 'L', value_name = "SPEC")]
    forward: Vec<LocalPortForward>,

    /// Do not run a remote command, only hold the connection for forwarding
    #[arg(short = 'N')]
    no_command: bool,

    /// Request a pseudo-tty; repeat to force one without a local terminal
    #[arg(short = 't', action = ArgAction::Count, conflicts_with = "disable_tty")]
    tty: u8,

    /// Disable pseudo-tty allocation
    #[arg(short = 'T')]
    disable_tty: bool,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Generate default configuration and exit; written to --config when given
    #[arg(long)]
    generate_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn tty_request(&self, config: &ShellConfig) -> TtyRequest {
        if self.disable_tty {
            return TtyRequest::No;
        }
        match self.tty {
            0 => config.request_tty,
            1 => TtyRequest::Yes,
            _ => TtyRequest::Force,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging; stderr only so the remote session owns stdout
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::WARN.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<Error>().map(Error::exit_code).unwrap_or(1)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    // Handle --generate-config
    if cli.generate_config {
        let config = ShellConfig::default();
        match &cli.config {
            Some(path) => {
                config.save(path)?;
                println!("Wrote default configuration to {}", path.display());
            }
            None => {
                let content = toml::to_string_pretty(&config)?;
                println!("{}", content);
            }
        }
        return Ok(0);
    }

    let config_path = cli.config.clone().unwrap_or_else(ShellConfig::default_path);
    let config = ShellConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let mut forwards = config.local_forwards()?;
    forwards.extend(cli.forward.iter().cloned());

    let opts = ConnectOptions {
        username: cli.user.clone().context("--user is required")?,
        passcode: cli
            .passcode
            .clone()
            .context("--passcode or CLISSH_PASSCODE is required")?,
        endpoint: cli.endpoint.clone().context("endpoint is required")?,
        host_key_fingerprint: cli.fingerprint.clone(),
        skip_host_validation: cli.skip_host_validation || config.skip_host_validation,
    };
    let tty = cli.tty_request(&config);

    let mut shell = SecureShell::new(
        Arc::new(RusshDialer::new()),
        Arc::new(CrosstermTerminal),
        Arc::new(TcpListenerFactory),
        config.keepalive_interval(),
    );

    shell.connect(&opts).await?;

    let outcome = async {
        shell.local_port_forward(&forwards).await?;
        if cli.no_command {
            shell.wait().await
        } else {
            shell.interactive_session(&cli.command, tty).await
        }
    }
    .await;

    if let Err(e) = shell.close().await {
        debug!("Close: {}", e);
    }

    match outcome {
        Ok(()) => Ok(0),
        Err(Error::RemoteExit(status)) => Ok(status as i32),
        Err(e) => Err(e.into()),
    }
}
