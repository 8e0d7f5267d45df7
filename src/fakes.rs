//! In-memory implementations of the terminal, transport and listener
//! capabilities, recording how they were driven.

use std::collections::VecDeque;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use russh::Pty;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Notify};

use crate::error::{Error, Result};
use crate::forward::{BoxConn, Listener, ListenerFactory};
use crate::terminal::{
    BoxReader, BoxWriter, RawModeState, ResizeEvents, StdStreams, TerminalHelper, WindowSize,
};
use crate::transport::{ClientConfig, SecureClient, SecureDialer, SecureSession};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Poll `condition` until it holds, panicking after about a second.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// A writer whose contents can be inspected after the fact.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.0).clone()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        lock(&self.0).extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Terminal
// ---------------------------------------------------------------------------

pub struct FakeTerminal {
    stdin: Mutex<Vec<u8>>,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    stdin_tty: Mutex<bool>,
    stdout_tty: Mutex<bool>,
    raw_fails: Mutex<bool>,
    raw_count: AtomicUsize,
    restore_count: AtomicUsize,
    window_size: Mutex<Option<WindowSize>>,
    resize_tx: Mutex<Option<mpsc::Sender<()>>>,
    resize_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FakeTerminal {
    pub fn new() -> Self {
        let (resize_tx, resize_rx) = mpsc::channel(16);
        Self {
            stdin: Mutex::new(Vec::new()),
            stdout: SharedBuffer::default(),
            stderr: SharedBuffer::default(),
            stdin_tty: Mutex::new(false),
            stdout_tty: Mutex::new(false),
            raw_fails: Mutex::new(false),
            raw_count: AtomicUsize::new(0),
            restore_count: AtomicUsize::new(0),
            window_size: Mutex::new(None),
            resize_tx: Mutex::new(Some(resize_tx)),
            resize_rx: Mutex::new(Some(resize_rx)),
        }
    }

    pub fn set_stdin(&self, input: &[u8]) {
        *lock(&self.stdin) = input.to_vec();
    }

    pub fn set_tty(&self, stdin: bool, stdout: bool) {
        *lock(&self.stdin_tty) = stdin;
        *lock(&self.stdout_tty) = stdout;
    }

    pub fn set_window_size(&self, size: WindowSize) {
        *lock(&self.window_size) = Some(size);
    }

    pub fn fail_raw_mode(&self) {
        *lock(&self.raw_fails) = true;
    }

    /// Take the sending side of the resize event source.
    pub fn resize_sender(&self) -> mpsc::Sender<()> {
        match lock(&self.resize_tx).take() {
            Some(tx) => tx,
            None => panic!("resize sender already taken"),
        }
    }

    pub fn stdout(&self) -> Vec<u8> {
        self.stdout.contents()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.stderr.contents()
    }

    pub fn raw_count(&self) -> usize {
        self.raw_count.load(Ordering::SeqCst)
    }

    pub fn restore_count(&self) -> usize {
        self.restore_count.load(Ordering::SeqCst)
    }
}

impl TerminalHelper for FakeTerminal {
    fn std_streams(&self) -> StdStreams {
        let input = std::mem::take(&mut *lock(&self.stdin));
        StdStreams {
            stdin: Box::new(Cursor::new(input)),
            stdout: Box::new(self.stdout.clone()),
            stderr: Box::new(self.stderr.clone()),
        }
    }

    fn stdin_is_terminal(&self) -> bool {
        *lock(&self.stdin_tty)
    }

    fn stdout_is_terminal(&self) -> bool {
        *lock(&self.stdout_tty)
    }

    fn set_raw_mode(&self) -> std::io::Result<RawModeState> {
        if *lock(&self.raw_fails) {
            return Err(std::io::Error::other("not a terminal"));
        }
        self.raw_count.fetch_add(1, Ordering::SeqCst);
        Ok(RawModeState { was_raw: false })
    }

    fn restore_terminal(&self, _state: RawModeState) -> std::io::Result<()> {
        self.restore_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn window_size(&self) -> std::io::Result<WindowSize> {
        (*lock(&self.window_size))
            .ok_or_else(|| std::io::Error::other("no window size"))
    }

    fn resize_events(&self) -> ResizeEvents {
        let rx = lock(&self.resize_rx).take().unwrap_or_else(|| mpsc::channel(1).1);
        ResizeEvents::Channel(rx)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SessionState {
    calls: Mutex<Vec<String>>,
    pty_requests: Mutex<Vec<(String, WindowSize, Vec<(String, u32)>)>>,
    window_changes: Mutex<Vec<WindowSize>>,
    stdin: SharedBuffer,
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
    pty_error: Mutex<Option<String>>,
    start_error: Mutex<Option<String>>,
    exit_status: Mutex<u32>,
    wait_delay: Mutex<Option<Duration>>,
    hold_wait: Mutex<bool>,
    released: Notify,
    close_count: AtomicUsize,
}

/// Cloneable handle; every clone observes the same recorded state.
#[derive(Clone, Default)]
pub struct FakeSession {
    state: Arc<SessionState>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: impl Into<String>) {
        lock(&self.state.calls).push(call.into());
    }

    pub fn set_output(&self, stdout: &[u8], stderr: &[u8]) {
        *lock(&self.state.stdout) = stdout.to_vec();
        *lock(&self.state.stderr) = stderr.to_vec();
    }

    pub fn set_exit_status(&self, status: u32) {
        *lock(&self.state.exit_status) = status;
    }

    pub fn fail_pty(&self, message: &str) {
        *lock(&self.state.pty_error) = Some(message.to_string());
    }

    pub fn fail_start(&self, message: &str) {
        *lock(&self.state.start_error) = Some(message.to_string());
    }

    pub fn set_wait_delay(&self, delay: Duration) {
        *lock(&self.state.wait_delay) = Some(delay);
    }

    /// Make `wait` block until `release_wait`.
    pub fn hold_wait(&self) {
        *lock(&self.state.hold_wait) = true;
    }

    pub fn release_wait(&self) {
        self.state.released.notify_one();
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state.calls).clone()
    }

    pub fn pty_requests(&self) -> Vec<(String, WindowSize, Vec<(String, u32)>)> {
        lock(&self.state.pty_requests).clone()
    }

    pub fn window_changes(&self) -> Vec<WindowSize> {
        lock(&self.state.window_changes).clone()
    }

    pub fn stdin(&self) -> Vec<u8> {
        self.state.stdin.contents()
    }

    pub fn close_count(&self) -> usize {
        self.state.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecureSession for FakeSession {
    async fn request_pty(&self, term: &str, size: WindowSize, modes: &[(Pty, u32)]) -> Result<()> {
        self.record("request_pty");
        let modes = modes
            .iter()
            .map(|(opcode, value)| (format!("{:?}", opcode), *value))
            .collect();
        lock(&self.state.pty_requests).push((term.to_string(), size, modes));

        match lock(&self.state.pty_error).clone() {
            Some(message) => Err(Error::Other(message)),
            None => Ok(()),
        }
    }

    async fn window_change(&self, size: WindowSize) -> Result<()> {
        lock(&self.state.window_changes).push(size);
        Ok(())
    }

    fn stdin_pipe(&self) -> Result<BoxWriter> {
        Ok(Box::new(self.state.stdin.clone()))
    }

    fn stdout_pipe(&self) -> Result<BoxReader> {
        Ok(Box::new(Cursor::new(lock(&self.state.stdout).clone())))
    }

    fn stderr_pipe(&self) -> Result<BoxReader> {
        Ok(Box::new(Cursor::new(lock(&self.state.stderr).clone())))
    }

    async fn start(&self, command: &str) -> Result<()> {
        self.record(format!("start:{}", command));
        match lock(&self.state.start_error).clone() {
            Some(message) => Err(Error::Other(message)),
            None => Ok(()),
        }
    }

    async fn shell(&self) -> Result<()> {
        self.record("shell");
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        self.record("wait");
        let delay = *lock(&self.state.wait_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let hold = *lock(&self.state.hold_wait);
        if hold {
            self.state.released.notified().await;
        }

        match *lock(&self.state.exit_status) {
            0 => Ok(()),
            status => Err(Error::RemoteExit(status)),
        }
    }

    async fn close(&self) -> Result<()> {
        self.record("close");
        self.state.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Client and dialer
// ---------------------------------------------------------------------------

pub struct FakeClient {
    session: FakeSession,
    session_error: Mutex<Option<String>>,
    dial_args: Mutex<Vec<(String, String)>>,
    dial_error: Mutex<Option<String>>,
    dial_over_tcp: Mutex<bool>,
    next_conns: Mutex<VecDeque<BoxConn>>,
    keepalive_count: AtomicUsize,
    wait_delay: Mutex<Option<Duration>>,
    close_count: AtomicUsize,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::with_session(FakeSession::new())
    }

    pub fn with_session(session: FakeSession) -> Self {
        Self {
            session,
            session_error: Mutex::new(None),
            dial_args: Mutex::new(Vec::new()),
            dial_error: Mutex::new(None),
            dial_over_tcp: Mutex::new(false),
            next_conns: Mutex::new(VecDeque::new()),
            keepalive_count: AtomicUsize::new(0),
            wait_delay: Mutex::new(None),
            close_count: AtomicUsize::new(0),
        }
    }

    pub fn fail_sessions(&self, message: &str) {
        *lock(&self.session_error) = Some(message.to_string());
    }

    pub fn fail_dials(&self, message: &str) {
        *lock(&self.dial_error) = Some(message.to_string());
    }

    /// Tunnel dials become plain TCP connections to the target address.
    pub fn connect_dials_over_tcp(&self) {
        *lock(&self.dial_over_tcp) = true;
    }

    /// Queue a tunnel whose far end echoes everything back until EOF.
    pub fn echo_dials(&self) -> tokio::task::JoinHandle<()> {
        let (near, far) = tokio::io::duplex(1024);
        lock(&self.next_conns).push_back(Box::new(near));
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(far);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
            let _ = writer.shutdown().await;
        })
    }

    pub fn set_wait_delay(&self, delay: Duration) {
        *lock(&self.wait_delay) = Some(delay);
    }

    pub fn dial_args(&self) -> Vec<(String, String)> {
        lock(&self.dial_args).clone()
    }

    pub fn dial_count(&self) -> usize {
        lock(&self.dial_args).len()
    }

    pub fn keepalive_count(&self) -> usize {
        self.keepalive_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecureClient for FakeClient {
    async fn new_session(&self) -> Result<Box<dyn SecureSession>> {
        if let Some(message) = lock(&self.session_error).clone() {
            return Err(Error::Other(message));
        }
        Ok(Box::new(self.session.clone()))
    }

    async fn dial(&self, network: &str, address: &str) -> Result<BoxConn> {
        lock(&self.dial_args).push((network.to_string(), address.to_string()));

        if let Some(message) = lock(&self.dial_error).clone() {
            return Err(Error::Other(message));
        }
        if let Some(conn) = lock(&self.next_conns).pop_front() {
            return Ok(conn);
        }
        let over_tcp = *lock(&self.dial_over_tcp);
        if over_tcp {
            let stream = tokio::net::TcpStream::connect(address).await?;
            return Ok(Box::new(stream));
        }
        Err(Error::Other(format!("no route to {}", address)))
    }

    async fn send_keepalive(&self, _want_reply: bool) -> Result<()> {
        self.keepalive_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let delay = *lock(&self.wait_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeDialer {
    client: Arc<FakeClient>,
    dials: Mutex<Vec<(String, String, ClientConfig)>>,
    error: Mutex<Option<String>>,
    host_key: Mutex<Option<Vec<u8>>>,
}

impl FakeDialer {
    pub fn new(client: Arc<FakeClient>) -> Self {
        Self {
            client,
            dials: Mutex::new(Vec::new()),
            error: Mutex::new(None),
            host_key: Mutex::new(None),
        }
    }

    pub fn fail_with(&self, message: &str) {
        *lock(&self.error) = Some(message.to_string());
    }

    /// Run the host key callback against `key` during every dial.
    pub fn present_host_key(&self, key: &[u8]) {
        *lock(&self.host_key) = Some(key.to_vec());
    }

    pub fn dials(&self) -> Vec<(String, String, ClientConfig)> {
        lock(&self.dials).clone()
    }
}

#[async_trait]
impl SecureDialer for FakeDialer {
    async fn dial(
        &self,
        network: &str,
        address: &str,
        config: ClientConfig,
    ) -> Result<Arc<dyn SecureClient>> {
        lock(&self.dials).push((network.to_string(), address.to_string(), config.clone()));

        if let Some(message) = lock(&self.error).clone() {
            return Err(Error::Other(message));
        }
        let host_key = lock(&self.host_key).clone();
        if let Some(key) = host_key {
            config.host_key_verifier.verify(&key)?;
        }
        Ok(self.client.clone())
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

pub enum AcceptStep {
    Temporary,
    Permanent,
    Conn(BoxConn),
}

/// Plays back scripted accept results, then blocks until closed.
pub struct FakeListener {
    steps: Mutex<VecDeque<AcceptStep>>,
    closed: watch::Sender<bool>,
    accept_count: AtomicUsize,
    close_count: AtomicUsize,
}

impl FakeListener {
    pub fn new(steps: Vec<AcceptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            closed: watch::Sender::new(false),
            accept_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
        }
    }

    pub fn accept_count(&self) -> usize {
        self.accept_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Listener for FakeListener {
    async fn accept(&self) -> std::io::Result<BoxConn> {
        self.accept_count.fetch_add(1, Ordering::SeqCst);

        let step = lock(&self.steps).pop_front();
        match step {
            Some(AcceptStep::Temporary) => Err(std::io::ErrorKind::Interrupted.into()),
            Some(AcceptStep::Permanent) => Err(std::io::Error::other("listener broken")),
            Some(AcceptStep::Conn(conn)) => Ok(conn),
            None => {
                let mut closed = self.closed.subscribe();
                let _ = closed.wait_for(|closed| *closed).await;
                Err(std::io::ErrorKind::NotConnected.into())
            }
        }
    }

    fn close(&self) -> std::io::Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.closed.send_replace(true);
        Ok(())
    }
}

pub struct FakeListenerFactory {
    listen_calls: Mutex<Vec<(String, String)>>,
    fail_on: Mutex<Option<String>>,
    opened: Mutex<Vec<Arc<FakeListener>>>,
}

impl FakeListenerFactory {
    pub fn new() -> Self {
        Self {
            listen_calls: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_on(&self, address: &str) {
        *lock(&self.fail_on) = Some(address.to_string());
    }

    pub fn listen_calls(&self) -> Vec<(String, String)> {
        lock(&self.listen_calls).clone()
    }

    pub fn opened(&self) -> Vec<Arc<FakeListener>> {
        lock(&self.opened).clone()
    }
}

#[async_trait]
impl ListenerFactory for FakeListenerFactory {
    async fn listen(&self, network: &str, address: &str) -> std::io::Result<Arc<dyn Listener>> {
        lock(&self.listen_calls).push((network.to_string(), address.to_string()));

        if lock(&self.fail_on).as_deref() == Some(address) {
            return Err(std::io::ErrorKind::AddrInUse.into());
        }
        let listener = Arc::new(FakeListener::new(Vec::new()));
        lock(&self.opened).push(listener.clone());
        Ok(listener)
    }
}
