//! Configuration for the qcosim bridge
//!
//! Construction-time parameters only: the quantum, the synchronization
//! strategy, the direct access ceiling and the tick ratio. They are read
//! once when an instance is built.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Largest supported minimum page size, in bits
pub const MAX_PAGE_BITS: u32 = 30;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub memory: MemoryConfig,
    pub debug: DebugConfig,
}

/// Time synchronization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Time a CPU may run ahead of the kernel before it must yield
    pub quantum_ns: u64,
    pub policy: SyncPolicy,
    pub idle_scope: IdleScope,
    pub thread_model: ThreadModel,
    /// One engine tick is `1 << tick_shift` kernel nanoseconds
    pub tick_shift: u32,
}

/// How CPU execution is interleaved with the simulation kernel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Engine and kernel share one native thread
    Cooperative,
    /// The engine runs on its own OS threads and a sync waits until every
    /// running CPU has reached the synced point
    #[default]
    MultiThread,
    /// Like `MultiThread`, but the engine only yields when forced to and a
    /// sync never waits for the kernel to catch up
    Unconstrained,
}

impl SyncPolicy {
    /// Whether the engine runs on threads other than the kernel's
    pub fn is_threaded(self) -> bool {
        !matches!(self, Self::Cooperative)
    }
}

/// How engine threads map onto CPUs under a threaded policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum ThreadModel {
    /// One OS thread per CPU
    #[default]
    PerCpu,
    /// All CPUs of an instance take turns on a single OS thread
    Single,
}

/// Granularity of the work-available flag in multi-threaded mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum IdleScope {
    #[default]
    PerCpu,
    Instance,
}

/// Direct memory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_aliases_per_initiator: usize,
    /// Engine-imposed minimum page size, in bits
    pub min_page_bits: u32,
}

/// Debug settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
    /// Recompute every translation cache hit and compare
    pub verify_translations: bool,
}

/// Logging level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Filter directive understood by `EnvFilter`
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

// Default implementations

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            quantum_ns: 1_000,
            policy: SyncPolicy::default(),
            idle_scope: IdleScope::default(),
            thread_model: ThreadModel::default(),
            tick_shift: 0,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_aliases_per_initiator: 250,
            min_page_bits: 12,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            verify_translations: cfg!(debug_assertions),
        }
    }
}

impl Config {
    /// Load configuration from the default location, or create it if it doesn't exist
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Self::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| BridgeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("qcosim")
            .join("config.toml")
    }

    /// Reject parameter combinations the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sync.quantum_ns == 0 {
            return Err(BridgeError::Config("sync.quantum_ns must be non-zero".into()));
        }
        if self.sync.tick_shift >= 32 {
            return Err(BridgeError::Config(format!(
                "sync.tick_shift {} is out of range",
                self.sync.tick_shift
            )));
        }
        if self.memory.max_aliases_per_initiator == 0 {
            return Err(BridgeError::Config(
                "memory.max_aliases_per_initiator must be non-zero".into(),
            ));
        }
        if self.memory.min_page_bits == 0 || self.memory.min_page_bits > MAX_PAGE_BITS {
            return Err(BridgeError::Config(format!(
                "memory.min_page_bits {} is out of range",
                self.memory.min_page_bits
            )));
        }
        Ok(())
    }
}
