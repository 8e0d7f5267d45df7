//! Local port forwarding (`-L`).
//!
//! Each forward owns a local listener. Every accepted connection is dialed
//! through the SSH connection (direct-tcpip) and bridged byte-for-byte in
//! both directions.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::transport::SecureClient;

/// Delay before accepting again after a temporary accept error.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A bidirectional byte stream: a local TCP socket or an SSH tunnel.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

pub type BoxConn = Box<dyn Conn>;

#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next connection. Returns an error once closed.
    async fn accept(&self) -> std::io::Result<BoxConn>;

    /// Stop listening; a pending `accept` returns an error.
    fn close(&self) -> std::io::Result<()>;
}

#[async_trait]
pub trait ListenerFactory: Send + Sync {
    async fn listen(&self, network: &str, address: &str) -> std::io::Result<Arc<dyn Listener>>;
}

/// One `-L` forward: where to listen locally and what to reach remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPortForward {
    pub local_address: String,
    pub remote_address: String,
}

impl LocalPortForward {
    #[cfg(test)]
    pub fn new(local_address: impl Into<String>, remote_address: impl Into<String>) -> Self {
        Self {
            local_address: local_address.into(),
            remote_address: remote_address.into(),
        }
    }
}

impl FromStr for LocalPortForward {
    type Err = Error;

    /// Parse `[bind_address:]port:host:hostport`. IPv6 addresses go in
    /// brackets; an empty or `*` bind address listens on all interfaces.
    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        let parts = tokenize_forward_spec(arg)?;

        let (bind, port, host, host_port) = match parts.as_slice() {
            [port, host, host_port] => ("localhost", port, host, host_port),
            [bind, port, host, host_port] => {
                let bind = if bind == "*" { "" } else { bind.as_str() };
                (bind, port, host, host_port)
            }
            _ => {
                return Err(Error::ForwardSpec(format!(
                    "Unable to parse local forwarding argument: {:?}",
                    arg
                )));
            }
        };

        Ok(Self {
            local_address: format!("{}:{}", bind, port),
            remote_address: format!("{}:{}", host, host_port),
        })
    }
}

fn tokenize_forward_spec(arg: &str) -> Result<Vec<String>, Error> {
    let mut parts = Vec::new();
    let mut rest = arg;

    loop {
        if rest.starts_with('[') {
            let end = rest.find(']').ok_or_else(|| {
                Error::ForwardSpec(format!("Argument missing closing bracket: {:?}", rest))
            })?;
            parts.push(rest[..=end].to_string());
            rest = &rest[end + 1..];

            if rest.is_empty() {
                break;
            }
            match rest.strip_prefix(':') {
                Some(next) => rest = next,
                None => return Err(Error::ForwardSpec(format!("Unexpected token: {:?}", rest))),
            }
            continue;
        }

        match rest.find(':') {
            Some(idx) => {
                parts.push(rest[..idx].to_string());
                rest = &rest[idx + 1..];
            }
            None => {
                parts.push(rest.to_string());
                break;
            }
        }
    }

    Ok(parts)
}

/// Listens on local TCP sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpListenerFactory;

#[async_trait]
impl ListenerFactory for TcpListenerFactory {
    async fn listen(&self, network: &str, address: &str) -> std::io::Result<Arc<dyn Listener>> {
        if !matches!(network, "tcp" | "tcp4" | "tcp6") {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsupported network: {}", network),
            ));
        }

        // ":port" means every interface
        let bind_addr = if address.starts_with(':') {
            format!("0.0.0.0{}", address)
        } else {
            address.to_string()
        };

        let listener = TcpListener::bind(&bind_addr).await?;
        debug!("Listening on {}", listener.local_addr()?);
        Ok(Arc::new(TcpListenerHandle::new(listener)))
    }
}

/// A tokio listener that can be closed from another task.
pub struct TcpListenerHandle {
    listener: Mutex<Option<Arc<TcpListener>>>,
    closed: watch::Sender<bool>,
}

impl TcpListenerHandle {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            closed: watch::Sender::new(false),
        }
    }

    fn current(&self) -> Option<Arc<TcpListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Listener for TcpListenerHandle {
    async fn accept(&self) -> std::io::Result<BoxConn> {
        let mut closed = self.closed.subscribe();
        let listener = self.current().ok_or_else(closed_listener_error)?;

        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                debug!("Accepted connection from {}", peer);
                Ok(Box::new(stream) as BoxConn)
            }
            _ = closed.wait_for(|closed| *closed) => Err(closed_listener_error()),
        }
    }

    fn close(&self) -> std::io::Result<()> {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.closed.send_replace(true);
        Ok(())
    }
}

fn closed_listener_error() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "use of closed network connection",
    )
}

/// Wraps a listener so the underlying close runs exactly once, whether the
/// accept loop or the shell gets there first.
pub struct TrackedListener {
    inner: Arc<dyn Listener>,
    closed: AtomicBool,
}

impl TrackedListener {
    pub fn new(inner: Arc<dyn Listener>) -> Self {
        Self {
            inner,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn accept(&self) -> std::io::Result<BoxConn> {
        self.inner.accept().await
    }

    pub fn close(&self) -> std::io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.close()
    }
}

/// Errors after which accepting again is worthwhile.
pub fn is_temporary(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    #[cfg(unix)]
    {
        // EMFILE, ENFILE
        if matches!(err.raw_os_error(), Some(23) | Some(24)) {
            return true;
        }
    }

    matches!(
        err.kind(),
        ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::TimedOut
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
    )
}

/// Accept connections until the listener is closed or fails permanently.
pub async fn accept_loop(
    listener: Arc<TrackedListener>,
    client: Arc<dyn SecureClient>,
    remote_address: String,
) {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                let client = client.clone();
                let remote_address = remote_address.clone();
                tokio::spawn(async move {
                    handle_forward_connection(conn, client, &remote_address).await;
                });
            }
            Err(e) if is_temporary(&e) => {
                debug!("Temporary accept error, retrying: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
            Err(e) => {
                debug!("Stopped accepting for {}: {}", remote_address, e);
                break;
            }
        }
    }

    if let Err(e) = listener.close() {
        debug!("Failed to close listener: {}", e);
    }
}

/// Dial the target through the tunnel and relay bytes both ways.
pub async fn handle_forward_connection(
    conn: BoxConn,
    client: Arc<dyn SecureClient>,
    target_address: &str,
) {
    let target = match client.dial("tcp", target_address).await {
        Ok(target) => target,
        Err(e) => {
            warn!("connect to {} failed: {}", target_address, e);
            return;
        }
    };
    info!("Forwarding connection to {}", target_address);

    let (local_read, local_write) = tokio::io::split(conn);
    let (remote_read, remote_write) = tokio::io::split(target);

    let (sent, received) = tokio::join!(
        copy_and_close(local_read, remote_write),
        copy_and_close(remote_read, local_write),
    );
    debug!(
        "Forward to {} finished ({} bytes out, {} bytes in)",
        target_address, sent, received
    );
}

/// Copy until `src` is exhausted, then shut down `dest`.
pub async fn copy_and_close<R, W>(mut src: R, mut dest: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match tokio::io::copy(&mut src, &mut dest).await {
        Ok(n) => n,
        Err(e) => {
            debug!("Copy ended: {}", e);
            0
        }
    };
    let _ = dest.shutdown().await;
    copied
}

/// Copy until `src` is exhausted, flushing `dest` but leaving it open.
pub async fn copy_and_flush<R, W>(mut src: R, mut dest: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 32 * 1024];
    let mut copied = 0u64;
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Read ended: {}", e);
                break;
            }
        };
        if dest.write_all(&buf[..n]).await.is_err() || dest.flush().await.is_err() {
            break;
        }
        copied += n as u64;
    }
    copied
}
