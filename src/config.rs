//! Configuration for EmberKV
//!
//! Centralized configuration with sensible defaults.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::EmberError;

/// Main configuration for an EmberKV instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Persistence Configuration
    // -------------------------------------------------------------------------
    /// Whether mutating commands are journaled to the append-only file
    pub append_only: bool,

    /// Path of the append-only file
    pub append_filename: PathBuf,

    /// How aggressively the append-only file is flushed to stable storage
    pub append_fsync: FsyncPolicy,

    /// Replay an existing append-only file before serving traffic
    pub load_on_startup: bool,

    /// Rewrite output starts with a snapshot preamble instead of plain commands
    pub use_snapshot_preamble: bool,

    /// Directory for rewrite scratch files.
    /// Defaults to the directory of `append_filename` so the final rename is atomic.
    pub rewrite_tmp_dir: Option<PathBuf>,

    /// Capacity of the background append queue
    pub aof_queue_size: usize,

    // -------------------------------------------------------------------------
    // Keyspace Configuration
    // -------------------------------------------------------------------------
    /// Number of logical databases addressable with SELECT
    pub databases: usize,

    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// TCP listen address
    pub listen_addr: String,

    /// Max concurrent client connections
    pub max_connections: usize,

    /// Connection read timeout (milliseconds, 0 disables)
    pub read_timeout_ms: u64,

    /// Connection write timeout (milliseconds, 0 disables)
    pub write_timeout_ms: u64,
}

/// AOF fsync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Write inline and fsync before `record` returns
    Always,

    /// Queue writes, fsync once per second from a ticker thread
    EverySec,

    /// Queue writes, leave flushing to the OS
    No,
}

impl FromStr for FsyncPolicy {
    type Err = EmberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(FsyncPolicy::Always),
            "everysec" => Ok(FsyncPolicy::EverySec),
            "no" => Ok(FsyncPolicy::No),
            other => Err(EmberError::Config(format!(
                "unknown appendfsync policy '{}' (expected always, everysec or no)",
                other
            ))),
        }
    }
}

impl fmt::Display for FsyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsyncPolicy::Always => "always",
            FsyncPolicy::EverySec => "everysec",
            FsyncPolicy::No => "no",
        };
        f.write_str(name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            append_only: true,
            append_filename: PathBuf::from("appendonly.aof"),
            append_fsync: FsyncPolicy::EverySec,
            load_on_startup: true,
            use_snapshot_preamble: false,
            rewrite_tmp_dir: None,
            aof_queue_size: 1 << 16,
            databases: 16,
            listen_addr: "127.0.0.1:6399".to_string(),
            max_connections: 1000,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Directory where rewrite scratch files are created
    pub fn rewrite_dir(&self) -> PathBuf {
        if let Some(dir) = &self.rewrite_tmp_dir {
            return dir.clone();
        }
        match self.append_filename.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Enable or disable the append-only file
    pub fn append_only(mut self, enabled: bool) -> Self {
        self.config.append_only = enabled;
        self
    }

    /// Set the append-only file path
    pub fn append_filename(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.append_filename = path.into();
        self
    }

    /// Set the fsync policy
    pub fn append_fsync(mut self, policy: FsyncPolicy) -> Self {
        self.config.append_fsync = policy;
        self
    }

    /// Replay the append-only file on startup
    pub fn load_on_startup(mut self, load: bool) -> Self {
        self.config.load_on_startup = load;
        self
    }

    /// Prefer a snapshot preamble when rewriting
    pub fn use_snapshot_preamble(mut self, enabled: bool) -> Self {
        self.config.use_snapshot_preamble = enabled;
        self
    }

    /// Set the directory for rewrite scratch files
    pub fn rewrite_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.rewrite_tmp_dir = Some(dir.into());
        self
    }

    /// Set the append queue capacity
    pub fn aof_queue_size(mut self, size: usize) -> Self {
        self.config.aof_queue_size = size;
        self
    }

    /// Set the number of logical databases
    pub fn databases(mut self, count: usize) -> Self {
        self.config.databases = count;
        self
    }

    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set the write timeout (in milliseconds)
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
