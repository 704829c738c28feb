// src/config.rs

//! Manages runtime configuration, loaded from a TOML file.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration whose values match the runtime's fixed constants:
//! a 5 second thread start timeout, a 5 second disconnect wait, two rebuild
//! attempts before a 10 second backoff, and three 50 ms acquisition retries.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// The top-level configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub affinity: AffinityConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Settings for the worker thread pool that hosts event loops and deferred work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorConfig {
    /// Upper bound on concurrently running work items.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
    /// How long an idle worker thread lingers before exiting.
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,
}

/// CPU placement of event-loop threads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AffinityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Added to the pool index before wrapping by the CPU count.
    #[serde(default = "default_affinity_offset")]
    pub offset: usize,
}

/// Per-session parameters, used for both client and server sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Number of connections a client session opens.
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// Timeout applied to connect and call operations when the caller supplies none.
    #[serde(with = "humantime_serde", default = "default_conn_timeout")]
    pub conn_timeout: Duration,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    #[serde(default = "default_max_header_len")]
    pub max_header_len: usize,
    /// Largest single body segment accepted by the request pipeline.
    #[serde(default = "default_max_iov_len")]
    pub max_iov_len: usize,
    /// Close instead of rebuild on teardown, and reconnect lazily on acquisition.
    #[serde(default)]
    pub auto_disconnect: bool,
    #[serde(with = "humantime_serde", default = "default_five_seconds")]
    pub thread_start_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_five_seconds")]
    pub disconnect_timeout: Duration,
    /// Pause between event-loop restarts on a client connection.
    #[serde(with = "humantime_serde", default = "default_reconnect_interval")]
    pub reconnect_interval: Duration,
    /// Minimum spacing between two logged status dumps of the same session.
    #[serde(with = "humantime_serde", default = "default_status_interval")]
    pub status_interval: Duration,
    #[serde(default)]
    pub rebuild: RebuildConfig,
    #[serde(default)]
    pub acquire: AcquireConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RebuildConfig {
    /// Consecutive rebuild attempts allowed before the session sleeps.
    #[serde(default = "default_rebuild_attempts")]
    pub max_attempts: u32,
    #[serde(with = "humantime_serde", default = "default_rebuild_backoff")]
    pub backoff: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcquireConfig {
    #[serde(default = "default_acquire_retries")]
    pub retries: u32,
    #[serde(with = "humantime_serde", default = "default_acquire_wait")]
    pub wait: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Number of work bindings (listening event loops) per bound endpoint.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_threads() -> usize {
    512
}
fn default_thread_name() -> String {
    "tether-worker".to_string()
}
fn default_keep_alive() -> Duration {
    Duration::from_secs(10)
}
fn default_true() -> bool {
    true
}
fn default_affinity_offset() -> usize {
    1
}
fn default_connections() -> usize {
    4
}
fn default_conn_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_max_message_len() -> usize {
    4 * 1024 * 1024
}
fn default_max_header_len() -> usize {
    4 * 1024
}
fn default_max_iov_len() -> usize {
    1024 * 1024
}
fn default_five_seconds() -> Duration {
    Duration::from_secs(5)
}
fn default_reconnect_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_status_interval() -> Duration {
    Duration::from_secs(3)
}
fn default_rebuild_attempts() -> u32 {
    2
}
fn default_rebuild_backoff() -> Duration {
    Duration::from_secs(10)
}
fn default_acquire_retries() -> u32 {
    3
}
fn default_acquire_wait() -> Duration {
    Duration::from_millis(50)
}
fn default_endpoint() -> String {
    "loopback://tether".to_string()
}
fn default_workers() -> usize {
    2
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_threads: default_max_threads(),
            thread_name: default_thread_name(),
            keep_alive: default_keep_alive(),
        }
    }
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            offset: default_affinity_offset(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connections: default_connections(),
            conn_timeout: default_conn_timeout(),
            max_message_len: default_max_message_len(),
            max_header_len: default_max_header_len(),
            max_iov_len: default_max_iov_len(),
            auto_disconnect: false,
            thread_start_timeout: default_five_seconds(),
            disconnect_timeout: default_five_seconds(),
            reconnect_interval: default_reconnect_interval(),
            status_interval: default_status_interval(),
            rebuild: RebuildConfig::default(),
            acquire: AcquireConfig::default(),
        }
    }
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_rebuild_attempts(),
            backoff: default_rebuild_backoff(),
        }
    }
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            retries: default_acquire_retries(),
            wait: default_acquire_wait(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            workers: default_workers(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            executor: ExecutorConfig::default(),
            affinity: AffinityConfig::default(),
            session: SessionConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file and validates it.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to load configuration from '{path}'"))
    }

    /// Parses configuration from an in-memory TOML document and validates it.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.executor.max_threads == 0 {
            return Err(anyhow!("executor.max_threads cannot be 0"));
        }
        if self.executor.thread_name.trim().is_empty() {
            return Err(anyhow!("executor.thread_name cannot be empty"));
        }
        self.session.validate()?;
        if self.server.workers == 0 {
            return Err(anyhow!("server.workers cannot be 0"));
        }
        if self.server.endpoint.trim().is_empty() {
            return Err(anyhow!("server.endpoint cannot be empty"));
        }
        Ok(())
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connections == 0 {
            return Err(anyhow!("session.connections cannot be 0"));
        }
        if self.max_message_len == 0 || self.max_iov_len == 0 {
            return Err(anyhow!(
                "session.max_message_len and session.max_iov_len must be positive"
            ));
        }
        if self.max_header_len > self.max_message_len {
            return Err(anyhow!(
                "session.max_header_len ({}) cannot exceed session.max_message_len ({})",
                self.max_header_len,
                self.max_message_len
            ));
        }
        if self.acquire.retries == 0 {
            return Err(anyhow!("session.acquire.retries cannot be 0"));
        }
        if self.acquire.wait.is_zero() {
            return Err(anyhow!("session.acquire.wait cannot be 0"));
        }
        if self.thread_start_timeout.is_zero() {
            return Err(anyhow!("session.thread_start_timeout cannot be 0"));
        }
        Ok(())
    }
}
