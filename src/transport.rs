//! SSH client transport built on russh.
//!
//! The shell talks to the network only through the [`SecureDialer`],
//! [`SecureClient`] and [`SecureSession`] capabilities so it can be driven
//! by in-memory fakes in tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use russh::client;
use russh::keys::PublicKey;
use russh::{ChannelMsg, Disconnect, Pty};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fingerprint::FingerprintVerifier;
use crate::forward::BoxConn;
use crate::terminal::{BoxReader, BoxWriter, WindowSize};

/// Buffer between the channel reader and a local stdout/stderr pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Credentials and host key policy for one connection attempt.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub user: String,
    pub password: String,
    pub host_key_verifier: FingerprintVerifier,
}

#[async_trait]
pub trait SecureDialer: Send + Sync {
    /// Connect, verify the host key and authenticate.
    async fn dial(
        &self,
        network: &str,
        address: &str,
        config: ClientConfig,
    ) -> Result<Arc<dyn SecureClient>>;
}

/// An authenticated SSH connection.
#[async_trait]
pub trait SecureClient: Send + Sync {
    async fn new_session(&self) -> Result<Box<dyn SecureSession>>;

    /// Open a direct-tcpip tunnel to `address` as seen from the server.
    async fn dial(&self, network: &str, address: &str) -> Result<BoxConn>;

    /// Send a keep-alive global request on the raw connection.
    async fn send_keepalive(&self, want_reply: bool) -> Result<()>;

    /// Resolve once the connection has gone away.
    async fn wait(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// One session channel: a remote shell or command.
#[async_trait]
pub trait SecureSession: Send + Sync {
    async fn request_pty(&self, term: &str, size: WindowSize, modes: &[(Pty, u32)]) -> Result<()>;

    /// Send a window-change request (no reply wanted).
    async fn window_change(&self, size: WindowSize) -> Result<()>;

    fn stdin_pipe(&self) -> Result<BoxWriter>;

    fn stdout_pipe(&self) -> Result<BoxReader>;

    fn stderr_pipe(&self) -> Result<BoxReader>;

    async fn start(&self, command: &str) -> Result<()>;

    async fn shell(&self) -> Result<()>;

    /// Wait for the remote side to exit. Non-zero status, a signal or a
    /// missing status are errors.
    async fn wait(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Dials real SSH servers.
pub struct RusshDialer {
    config: Arc<client::Config>,
}

impl RusshDialer {
    pub fn new() -> Self {
        Self {
            config: Arc::new(client::Config {
                inactivity_timeout: None,
                ..Default::default()
            }),
        }
    }
}

impl Default for RusshDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecureDialer for RusshDialer {
    async fn dial(
        &self,
        network: &str,
        address: &str,
        config: ClientConfig,
    ) -> Result<Arc<dyn SecureClient>> {
        if network != "tcp" {
            return Err(Error::Other(format!("unsupported network: {}", network)));
        }

        info!("Connecting to {}", address);
        let (closed_tx, closed_rx) = watch::channel(false);
        let handler = ClientHandler {
            verifier: config.host_key_verifier,
            _closed: closed_tx,
        };

        let mut handle = client::connect(self.config.clone(), address, handler).await?;
        debug!("SSH handshake completed");

        let auth = handle
            .authenticate_password(&config.user, &config.password)
            .await?;
        if !auth.success() {
            return Err(Error::UnableToAuthenticate(
                "ssh: unable to authenticate, attempted methods [none password], no supported methods remain"
                    .to_string(),
            ));
        }
        info!("Authenticated as {}", config.user);

        Ok(Arc::new(RusshClient {
            handle,
            closed: closed_rx,
        }))
    }
}

/// russh callbacks. Dropped by russh when the connection ends, which is
/// what [`RusshClient::wait`] observes.
pub struct ClientHandler {
    verifier: FingerprintVerifier,
    _closed: watch::Sender<bool>,
}

impl client::Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool> {
        self.verifier.verify_public_key(server_public_key)?;
        debug!("Host key accepted");
        Ok(true)
    }
}

pub struct RusshClient {
    handle: client::Handle<ClientHandler>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl SecureClient for RusshClient {
    async fn new_session(&self) -> Result<Box<dyn SecureSession>> {
        let channel = self.handle.channel_open_session().await?;
        debug!("Session channel opened: {:?}", channel.id());
        Ok(Box::new(RusshSession::new(channel)))
    }

    async fn dial(&self, network: &str, address: &str) -> Result<BoxConn> {
        if network != "tcp" {
            return Err(Error::Other(format!("unsupported network: {}", network)));
        }
        let (host, port) = split_host_port(address)?;
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port, "127.0.0.1", 0)
            .await?;
        debug!("Opened direct-tcpip channel to {}", address);
        Ok(Box::new(channel.into_stream()))
    }

    async fn send_keepalive(&self, want_reply: bool) -> Result<()> {
        // russh's Handle has no arbitrary global requests; this sends keepalive@openssh.com
        self.handle.send_keepalive(want_reply).await?;
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let mut closed = self.closed.clone();
        // errors once the handler is dropped
        let _ = closed.wait_for(|closed| *closed).await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.handle.is_closed() {
            return Ok(());
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

/// Split `host:port`, stripping IPv6 brackets.
fn split_host_port(address: &str) -> Result<(&str, u32)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::Other(format!("missing port in address: {}", address)))?;
    let port = port
        .parse::<u32>()
        .map_err(|_| Error::Other(format!("invalid port in address: {}", address)))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Ok((host, port))
}

/// How the remote command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ExitOutcome {
    Status(u32),
    Signal { signal: String, message: String },
    Missing,
}

impl ExitOutcome {
    fn into_result(self) -> Result<()> {
        match self {
            ExitOutcome::Status(0) => Ok(()),
            ExitOutcome::Status(status) => Err(Error::RemoteExit(status)),
            ExitOutcome::Signal { signal, message } => Err(Error::RemoteSignal { signal, message }),
            ExitOutcome::Missing => Err(Error::ExitMissing),
        }
    }
}

pub struct RusshSession {
    writer: russh::ChannelWriteHalf<client::Msg>,
    stdout: Mutex<Option<DuplexStream>>,
    stderr: Mutex<Option<DuplexStream>>,
    stdin_taken: Mutex<bool>,
    replies: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<bool>>,
    exit: tokio::sync::Mutex<Option<oneshot::Receiver<ExitOutcome>>>,
}

impl RusshSession {
    fn new(channel: russh::Channel<client::Msg>) -> Self {
        let (reader, writer) = channel.split();
        let (stdout_tx, stdout_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_tx, stderr_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (reply_tx, reply_rx) = tokio::sync::mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(pump_channel(reader, stdout_tx, stderr_tx, reply_tx, exit_tx));

        Self {
            writer,
            stdout: Mutex::new(Some(stdout_rx)),
            stderr: Mutex::new(Some(stderr_rx)),
            stdin_taken: Mutex::new(false),
            replies: tokio::sync::Mutex::new(reply_rx),
            exit: tokio::sync::Mutex::new(Some(exit_rx)),
        }
    }

    async fn expect_reply(&self, request: &str) -> Result<()> {
        match self.replies.lock().await.recv().await {
            Some(true) => Ok(()),
            Some(false) => Err(Error::Other(format!("ssh: {} request rejected", request))),
            None => Err(Error::Other(format!(
                "ssh: channel closed before {} reply",
                request
            ))),
        }
    }
}

fn take_pipe(slot: &Mutex<Option<DuplexStream>>, name: &str) -> Result<BoxReader> {
    slot.lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
        .map(|pipe| Box::new(pipe) as BoxReader)
        .ok_or_else(|| Error::Other(format!("ssh: {} already taken", name)))
}

#[async_trait]
impl SecureSession for RusshSession {
    async fn request_pty(&self, term: &str, size: WindowSize, modes: &[(Pty, u32)]) -> Result<()> {
        self.writer
            .request_pty(true, term, size.width, size.height, 0, 0, modes)
            .await?;
        self.expect_reply("pty-req").await
    }

    async fn window_change(&self, size: WindowSize) -> Result<()> {
        self.writer
            .window_change(size.width, size.height, 0, 0)
            .await?;
        Ok(())
    }

    fn stdin_pipe(&self) -> Result<BoxWriter> {
        let mut taken = self.stdin_taken.lock().unwrap_or_else(|e| e.into_inner());
        if *taken {
            return Err(Error::Other("ssh: stdin already taken".to_string()));
        }
        *taken = true;
        Ok(Box::new(self.writer.make_writer()))
    }

    fn stdout_pipe(&self) -> Result<BoxReader> {
        take_pipe(&self.stdout, "stdout")
    }

    fn stderr_pipe(&self) -> Result<BoxReader> {
        take_pipe(&self.stderr, "stderr")
    }

    async fn start(&self, command: &str) -> Result<()> {
        debug!("Executing remote command: {}", command);
        self.writer.exec(true, command).await?;
        self.expect_reply("exec").await
    }

    async fn shell(&self) -> Result<()> {
        self.writer.request_shell(true).await?;
        self.expect_reply("shell").await
    }

    async fn wait(&self) -> Result<()> {
        let exit = self
            .exit
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Other("ssh: session already waited".to_string()))?;
        exit.await.unwrap_or(ExitOutcome::Missing).into_result()
    }

    async fn close(&self) -> Result<()> {
        self.writer.close().await?;
        Ok(())
    }
}

/// Route channel messages to the local pipes until the channel closes.
async fn pump_channel(
    mut reader: russh::ChannelReadHalf,
    stdout: DuplexStream,
    stderr: DuplexStream,
    replies: tokio::sync::mpsc::UnboundedSender<bool>,
    exit_tx: oneshot::Sender<ExitOutcome>,
) {
    let mut stdout = Some(stdout);
    let mut stderr = Some(stderr);
    let mut outcome = ExitOutcome::Missing;

    while let Some(msg) = reader.wait().await {
        match msg {
            ChannelMsg::Data { data } => forward_output(&mut stdout, &data).await,
            ChannelMsg::ExtendedData { data, ext: 1 } => forward_output(&mut stderr, &data).await,
            ChannelMsg::ExtendedData { ext, .. } => debug!("Ignoring extended data type {}", ext),
            ChannelMsg::Success => {
                let _ = replies.send(true);
            }
            ChannelMsg::Failure => {
                let _ = replies.send(false);
            }
            ChannelMsg::ExitStatus { exit_status } => {
                debug!("Remote exit status {}", exit_status);
                outcome = ExitOutcome::Status(exit_status);
            }
            ChannelMsg::ExitSignal {
                signal_name,
                error_message,
                ..
            } => {
                debug!("Remote exit signal {:?}", signal_name);
                outcome = ExitOutcome::Signal {
                    signal: format!("{:?}", signal_name),
                    message: error_message,
                };
            }
            ChannelMsg::Eof => {
                stdout.take();
                stderr.take();
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    drop(stdout);
    drop(stderr);
    let _ = exit_tx.send(outcome);
}

async fn forward_output(pipe: &mut Option<DuplexStream>, data: &[u8]) {
    let Some(writer) = pipe.as_mut() else {
        return;
    };
    if let Err(e) = writer.write_all(data).await {
        // nobody reads this pipe any more
        warn!("Dropping remote output: {}", e);
        pipe.take();
    }
}
