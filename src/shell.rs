//! Secure shell orchestration: connect, run an interactive or batch
//! session, forward local ports and tear everything down.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::Pty;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fingerprint::FingerprintVerifier;
use crate::forward::{
    accept_loop, copy_and_close, copy_and_flush, ListenerFactory, LocalPortForward,
    TrackedListener,
};
use crate::terminal::{
    window_dimensions, RawModeGuard, TerminalHelper, TtyRequest, WindowSize,
};
use crate::transport::{ClientConfig, SecureClient, SecureDialer, SecureSession};

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Terminal type sent with the PTY request when `TERM` is unset or empty.
const DEFAULT_TERM: &str = "xterm";

fn terminal_type(term: Option<String>) -> String {
    term.filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_TERM.to_string())
}

/// Connection parameters for one attempt. Supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub username: String,
    pub passcode: String,
    /// `host:port`
    pub endpoint: String,
    pub host_key_fingerprint: String,
    pub skip_host_validation: bool,
}

pub struct SecureShell {
    dialer: Arc<dyn SecureDialer>,
    terminal: Arc<dyn TerminalHelper>,
    listener_factory: Arc<dyn ListenerFactory>,
    keepalive_interval: Duration,
    client: Option<Arc<dyn SecureClient>>,
    listeners: Mutex<Vec<Arc<TrackedListener>>>,
}

impl SecureShell {
    pub fn new(
        dialer: Arc<dyn SecureDialer>,
        terminal: Arc<dyn TerminalHelper>,
        listener_factory: Arc<dyn ListenerFactory>,
        keepalive_interval: Duration,
    ) -> Self {
        Self {
            dialer,
            terminal,
            listener_factory,
            keepalive_interval,
            client: None,
            listeners: Mutex::new(Vec::new()),
        }
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn client(&self) -> Result<Arc<dyn SecureClient>> {
        self.client.clone().ok_or(Error::NotConnected)
    }

    /// Open and authenticate the connection.
    pub async fn connect(&mut self, opts: &ConnectOptions) -> Result<()> {
        let config = ClientConfig {
            user: opts.username.clone(),
            password: opts.passcode.clone(),
            host_key_verifier: FingerprintVerifier::new(
                opts.host_key_fingerprint.clone(),
                opts.skip_host_validation,
            ),
        };

        let client = self
            .dialer
            .dial("tcp", &opts.endpoint, config)
            .await
            .map_err(classify_dial_error)?;

        info!("Connected to {}", opts.endpoint);
        self.client = Some(client);
        Ok(())
    }

    /// Run a remote shell (no commands) or the joined command line.
    pub async fn interactive_session(&self, commands: &[String], tty: TtyRequest) -> Result<()> {
        let client = self.client()?;

        let session = client
            .new_session()
            .await
            .map_err(|e| Error::SessionAllocation(e.to_string()))?;

        let result = self.run_session(&client, session.as_ref(), commands, tty).await;

        if let Err(e) = session.close().await {
            debug!("Session close: {}", e);
        }
        result
    }

    async fn run_session(
        &self,
        client: &Arc<dyn SecureClient>,
        session: &dyn SecureSession,
        commands: &[String],
        tty: TtyRequest,
    ) -> Result<()> {
        let streams = self.terminal.std_streams();
        let remote_stdin = session.stdin_pipe()?;
        let remote_stdout = session.stdout_pipe()?;
        let remote_stderr = session.stderr_pipe()?;

        let stdin_is_terminal = self.terminal.stdin_is_terminal();
        let stdout_is_terminal = self.terminal.stdout_is_terminal();

        let _raw_mode = if tty.should_allocate(!commands.is_empty(), stdin_is_terminal) {
            let modes = [
                (Pty::ECHO, 1),
                (Pty::TTY_OP_ISPEED, 115200),
                (Pty::TTY_OP_OSPEED, 115200),
            ];
            let size = window_dimensions(self.terminal.as_ref());
            let term = terminal_type(std::env::var("TERM").ok());

            debug!("Requesting {} PTY {}x{}", term, size.width, size.height);
            session.request_pty(&term, size, &modes).await?;

            Some(RawModeGuard::enter(self.terminal.clone()))
        } else {
            None
        };

        if commands.is_empty() {
            session.shell().await?;
        } else {
            session.start(&commands.join(" ")).await?;
        }

        // Closes the remote stdin at local EOF; nothing waits on it.
        tokio::spawn(copy_and_close(streams.stdin, remote_stdin));
        let stdout_pump = tokio::spawn(copy_and_flush(remote_stdout, streams.stdout));
        let stderr_pump = tokio::spawn(copy_and_flush(remote_stderr, streams.stderr));

        // Side loops stop when this sender is dropped.
        let (stop_tx, stop_rx) = watch::channel(());

        let resize = if stdout_is_terminal {
            Some(self.watch_window_size(session, stop_rx.clone()))
        } else {
            None
        };
        let keepalive = tokio::spawn(keepalive_loop(
            client.clone(),
            self.keepalive_interval,
            stop_rx,
        ));

        let result = match resize {
            Some(resize) => {
                let (result, ()) = tokio::join!(
                    async {
                        let result = session.wait().await;
                        stop_tx.send_replace(());
                        result
                    },
                    resize,
                );
                result
            }
            None => session.wait().await,
        };
        drop(stop_tx);

        if let Err(e) = keepalive.await {
            debug!("Keepalive task ended abnormally: {}", e);
        }
        for pump in [stdout_pump, stderr_pump] {
            if let Err(e) = pump.await {
                debug!("Output pump ended abnormally: {}", e);
            }
        }

        result
    }

    /// Forward window size changes until stopped. Runs on the session's
    /// task since the session is borrowed.
    fn watch_window_size<'a>(
        &'a self,
        session: &'a dyn SecureSession,
        mut stop: watch::Receiver<()>,
    ) -> impl std::future::Future<Output = ()> + Send + 'a {
        let mut events = self.terminal.resize_events();
        let terminal = self.terminal.clone();
        async move {
            let mut previous: Option<WindowSize> = None;
            loop {
                tokio::select! {
                    event = events.recv() => {
                        if event.is_none() {
                            break;
                        }
                    }
                    _ = stop.changed() => break,
                }

                let size = window_dimensions(terminal.as_ref());
                if previous == Some(size) {
                    continue;
                }
                debug!("Window resized to {}x{}", size.width, size.height);
                if let Err(e) = session.window_change(size).await {
                    debug!("window-change failed: {}", e);
                }
                previous = Some(size);
            }
        }
    }

    /// Block until the connection ends (`-N`), keeping it alive meanwhile.
    pub async fn wait(&self) -> Result<()> {
        let client = self.client()?;

        let (stop_tx, stop_rx) = watch::channel(());
        let keepalive = tokio::spawn(keepalive_loop(
            client.clone(),
            self.keepalive_interval,
            stop_rx,
        ));

        let result = client.wait().await;
        drop(stop_tx);
        let _ = keepalive.await;
        result
    }

    /// Start listening for every forward, in order. Stops at the first
    /// listen failure; listeners already opened stay registered for `close`.
    pub async fn local_port_forward(&self, forwards: &[LocalPortForward]) -> Result<()> {
        let client = self.client()?;

        for forward in forwards {
            let listener = self
                .listener_factory
                .listen("tcp", &forward.local_address)
                .await?;
            let listener = Arc::new(TrackedListener::new(listener));

            self.listeners
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(listener.clone());

            info!(
                "Forwarding {} -> {}",
                forward.local_address, forward.remote_address
            );
            tokio::spawn(accept_loop(
                listener,
                client.clone(),
                forward.remote_address.clone(),
            ));
        }

        Ok(())
    }

    /// Close every forward listener, then the connection.
    pub async fn close(&mut self) -> Result<()> {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for listener in listeners {
            if let Err(e) = listener.close() {
                debug!("Listener close: {}", e);
            }
        }

        match self.client.take() {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }
}

fn classify_dial_error(err: Error) -> Error {
    match err {
        Error::UnableToAuthenticate(_) => err,
        other if other.to_string().contains("unable to authenticate") => {
            Error::UnableToAuthenticate(other.to_string())
        }
        other => other,
    }
}

/// Send a want-reply keep-alive every `interval` until stopped.
async fn keepalive_loop(
    client: Arc<dyn SecureClient>,
    interval: Duration,
    mut stop: watch::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = client.send_keepalive(true).await {
                    warn!("Keepalive failed: {}", e);
                }
            }
            _ = stop.changed() => break,
        }
    }
}
