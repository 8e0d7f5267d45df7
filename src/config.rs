//! Client configuration loaded from TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::forward::LocalPortForward;
use crate::shell::DEFAULT_KEEPALIVE_INTERVAL;
use crate::terminal::TtyRequest;

/// Defaults applied to every invocation; command line flags take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Seconds between keep-alive requests (default: 30)
    pub keepalive_interval_secs: u64,

    /// PTY allocation when no -t/-T flag is given: auto, no, yes or force
    pub request_tty: TtyRequest,

    /// Accept any host key without verification
    pub skip_host_validation: bool,

    /// Local forwards in `-L` notation, set up on every connection
    #[serde(default)]
    pub forwards: Vec<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL.as_secs(),
            request_tty: TtyRequest::Auto,
            skip_host_validation: false,
            forwards: Vec::new(),
        }
    }
}

impl ShellConfig {
    /// `<config dir>/clissh/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("clissh")
            .join("config.toml")
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn keepalive_interval(&self) -> Duration {
        // zero would make the ticker spin
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    /// Parse the configured forwards.
    pub fn local_forwards(&self) -> Result<Vec<LocalPortForward>> {
        self.forwards
            .iter()
            .map(|spec| {
                spec.parse::<LocalPortForward>()
                    .with_context(|| format!("Invalid forward in config: {}", spec))
            })
            .collect()
    }
}
