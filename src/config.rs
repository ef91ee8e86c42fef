//! Channel configuration
//!
//! Can be built in code or parsed from TOML:
//!
//! ```toml
//! target_path = "/opt/tools/helper"
//! args = ["--quiet"]
//! loop_interval_ms = 10
//! echo_output = false
//! default_timeout_ms = 5000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

fn default_loop_interval_ms() -> u64 {
    5
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_stop_grace_ms() -> u64 {
    2_000
}

fn default_true() -> bool {
    true
}

/// How to launch and talk to the child process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Executable to spawn
    pub target_path: PathBuf,

    /// Extra arguments, placed after the parent pid when one is passed
    #[serde(default)]
    pub args: Vec<String>,

    /// Base interval for reader backoff and blocking-call latency
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,

    /// Broadcast non-protocol child output as channel events
    #[serde(default = "default_true")]
    pub echo_output: bool,

    /// Pass this process's pid as `argv[1]` so the child can watch its parent
    #[serde(default = "default_true")]
    pub pass_parent_pid: bool,

    /// Timeout for `get`; 0 waits forever
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// How long a stopped child may take to exit before it is killed
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Working directory for the child
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl ChannelConfig {
    pub fn new(target_path: impl Into<PathBuf>) -> Self {
        Self {
            target_path: target_path.into(),
            args: Vec::new(),
            loop_interval_ms: default_loop_interval_ms(),
            echo_output: true,
            pass_parent_pid: true,
            default_timeout_ms: default_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            working_dir: None,
        }
    }

    /// Config for an executable found by name under the default search roots
    /// or on `PATH`
    pub fn locate(name: &str) -> Result<Self> {
        let roots = crate::utils::default_search_roots();
        let path = crate::utils::locate_executable(name, &roots)?;
        Ok(Self::new(path))
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ChannelConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse channel config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read configuration from a TOML file
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read channel config {:?}: {}", path, e))
        })?;
        let config = Self::from_toml_str(&content)?;

        tracing::debug!("Loaded channel config for {:?}", config.target_path);

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.target_path.as_os_str().is_empty() {
            return Err(Error::Config("target_path must not be empty".to_string()));
        }
        if self.loop_interval_ms == 0 {
            return Err(Error::Config(
                "loop_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_loop_interval(mut self, interval: Duration) -> Self {
        self.loop_interval_ms = (interval.as_millis() as u64).max(1);
        self
    }

    pub fn with_echo_output(mut self, echo: bool) -> Self {
        self.echo_output = echo;
        self
    }

    pub fn with_parent_pid(mut self, pass: bool) -> Self {
        self.pass_parent_pid = pass;
        self
    }

    /// `None` waits forever
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout_ms = timeout.map(|t| (t.as_millis() as u64).max(1)).unwrap_or(0);
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms.max(1))
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        match self.default_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Full argument list after `argv[0]`
    pub(crate) fn command_args(&self, parent_pid: u32) -> Vec<String> {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        if self.pass_parent_pid {
            args.push(parent_pid.to_string());
        }
        args.extend(self.args.iter().cloned());
        args
    }
}
