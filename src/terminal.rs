//! Local terminal access: standard streams, raw mode, window size and
//! resize notifications.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

/// Window size used when the local terminal cannot be queried.
pub const DEFAULT_WINDOW_SIZE: WindowSize = WindowSize {
    width: 80,
    height: 43,
};

/// Polling period on platforms without a window-change signal.
pub const RESIZE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Requested pseudo-terminal allocation behaviour (`-T`, `-t`, `-tt`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtyRequest {
    /// Allocate only for interactive logins on a terminal.
    #[default]
    Auto,
    No,
    Yes,
    Force,
}

impl TtyRequest {
    /// Whether a remote PTY should be requested for this invocation.
    pub fn should_allocate(self, has_commands: bool, stdin_is_terminal: bool) -> bool {
        match self {
            TtyRequest::Force => true,
            TtyRequest::No => false,
            TtyRequest::Yes => stdin_is_terminal,
            TtyRequest::Auto => !has_commands && stdin_is_terminal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

/// Snapshot of the terminal mode taken before entering raw mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawModeState {
    pub was_raw: bool,
}

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct StdStreams {
    pub stdin: BoxReader,
    pub stdout: BoxWriter,
    pub stderr: BoxWriter,
}

/// Source of "the window may have been resized" notifications.
///
/// Picked once per platform: SIGWINCH where it exists, a fixed-rate poll
/// otherwise. The watcher re-reads the window size on every event, so
/// spurious events are harmless.
pub enum ResizeEvents {
    #[cfg(unix)]
    Signal(tokio::signal::unix::Signal),
    Ticker(tokio::time::Interval),
    #[cfg(test)]
    Channel(tokio::sync::mpsc::Receiver<()>),
}

impl ResizeEvents {
    pub fn for_platform() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::window_change()) {
                Ok(signal) => return ResizeEvents::Signal(signal),
                Err(e) => warn!("Failed to watch SIGWINCH, polling instead: {}", e),
            }
        }
        Self::ticker(RESIZE_POLL_INTERVAL)
    }

    pub fn ticker(period: Duration) -> Self {
        let start = tokio::time::Instant::now() + period;
        ResizeEvents::Ticker(tokio::time::interval_at(start, period))
    }

    /// Wait for the next event; `None` once the source is exhausted.
    pub async fn recv(&mut self) -> Option<()> {
        match self {
            #[cfg(unix)]
            ResizeEvents::Signal(signal) => signal.recv().await,
            ResizeEvents::Ticker(interval) => {
                interval.tick().await;
                Some(())
            }
            #[cfg(test)]
            ResizeEvents::Channel(rx) => rx.recv().await,
        }
    }
}

/// Capability set for everything the shell needs from the local terminal.
pub trait TerminalHelper: Send + Sync {
    /// Take the process's standard streams.
    fn std_streams(&self) -> StdStreams;

    fn stdin_is_terminal(&self) -> bool;

    fn stdout_is_terminal(&self) -> bool;

    /// Put the local terminal into raw mode, returning the previous state.
    fn set_raw_mode(&self) -> std::io::Result<RawModeState>;

    fn restore_terminal(&self, state: RawModeState) -> std::io::Result<()>;

    fn window_size(&self) -> std::io::Result<WindowSize>;

    fn resize_events(&self) -> ResizeEvents;
}

/// Query the window size, falling back to 80x43.
pub fn window_dimensions(terminal: &dyn TerminalHelper) -> WindowSize {
    terminal.window_size().unwrap_or(DEFAULT_WINDOW_SIZE)
}

/// The real terminal, via crossterm and tokio's std streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrosstermTerminal;

impl TerminalHelper for CrosstermTerminal {
    fn std_streams(&self) -> StdStreams {
        StdStreams {
            stdin: Box::new(tokio::io::stdin()),
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
        }
    }

    fn stdin_is_terminal(&self) -> bool {
        std::io::stdin().is_terminal()
    }

    fn stdout_is_terminal(&self) -> bool {
        std::io::stdout().is_terminal()
    }

    fn set_raw_mode(&self) -> std::io::Result<RawModeState> {
        let was_raw = crossterm::terminal::is_raw_mode_enabled()?;
        crossterm::terminal::enable_raw_mode()?;
        Ok(RawModeState { was_raw })
    }

    fn restore_terminal(&self, state: RawModeState) -> std::io::Result<()> {
        if state.was_raw {
            return Ok(());
        }
        crossterm::terminal::disable_raw_mode()
    }

    fn window_size(&self) -> std::io::Result<WindowSize> {
        let (cols, rows) = crossterm::terminal::size()?;
        Ok(WindowSize {
            width: cols as u32,
            height: rows as u32,
        })
    }

    fn resize_events(&self) -> ResizeEvents {
        ResizeEvents::for_platform()
    }
}

/// Restores the terminal mode when dropped, on every exit path.
pub struct RawModeGuard {
    terminal: Arc<dyn TerminalHelper>,
    state: Option<RawModeState>,
}

impl RawModeGuard {
    /// Enter raw mode. Failure is not fatal: the session carries on
    /// without raw mode and nothing is restored later.
    pub fn enter(terminal: Arc<dyn TerminalHelper>) -> Self {
        let state = match terminal.set_raw_mode() {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Failed to put terminal into raw mode: {}", e);
                None
            }
        };
        Self { terminal, state }
    }

    #[cfg(test)]
    pub fn is_raw(&self) -> bool {
        self.state.is_some()
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            if let Err(e) = self.terminal.restore_terminal(state) {
                warn!("Failed to restore terminal: {}", e);
            }
        }
    }
}
