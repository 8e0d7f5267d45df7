//! Error types for the secure shell core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Host key verification failures raised from the fingerprint callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostKeyError {
    #[error("Unable to verify identity of host.\n\nThe fingerprint of the received key was {0:?}.")]
    NoFingerprint(String),

    #[error("Host key verification failed.\n\nThe fingerprint of the received key was {0:?}.")]
    Mismatch(String),

    #[error("Unsupported host key fingerprint format")]
    UnsupportedFormat,
}

#[derive(Debug, Error)]
pub enum Error {
    /// The server rejected the one-time passcode.
    #[error("Error opening SSH connection: {0}")]
    UnableToAuthenticate(String),

    #[error(transparent)]
    HostKey(#[from] HostKeyError),

    #[error("SSH session allocation failed: {0}")]
    SessionAllocation(String),

    #[error("Process exited with status {0}")]
    RemoteExit(u32),

    #[error("Process terminated by signal {signal}: {message}")]
    RemoteSignal { signal: String, message: String },

    #[error("wait: remote command exited without exit status or exit signal")]
    ExitMissing,

    #[error("Not connected")]
    NotConnected,

    #[error("{0}")]
    ForwardSpec(String),

    #[error("{0}")]
    Ssh(#[from] russh::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Exit code to report to the local shell for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::RemoteExit(status) => *status as i32,
            Error::RemoteSignal { .. } | Error::ExitMissing => 255,
            _ => 1,
        }
    }
}
