//! Configuration structures for the tally-runtime.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Where to find the engine shared library
//! - [`ExecutionSettings`]: Per-call limits handed to the engine
//! - [`DispatchConfig`]: Caller-side concurrency settings

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for the tally-runtime.
/// It is usually loaded from the `[runtime]` table of a TOML file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Engine library configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Settings passed to every engine call.
    #[serde(default)]
    pub execution: ExecutionSettings,

    /// Caller-side dispatch configuration.
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// Engine library configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Path to the engine shared library.
    ///
    /// When unset, the platform file name (e.g. `libtally_vm.so`) is
    /// resolved through the system loader search path.
    #[serde(default)]
    pub library_path: Option<PathBuf>,
}

/// Limits and locations handed to the engine on every call.
///
/// The value is owned by the caller and threaded explicitly into each
/// dispatch. It must not be mutated while a call that reads it is in flight;
/// no internal locking is provided.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExecutionSettings {
    /// Root directory under which the engine keeps its compilation cache.
    #[serde(default = "defaults::cache_root")]
    pub cache_root: PathBuf,

    /// Largest result buffer the engine may return.
    ///
    /// Larger results are reported with exit code 255, no result bytes,
    /// and the untruncated length in `result_len`.
    #[serde(default = "defaults::max_result_bytes")]
    pub max_result_bytes: usize,

    /// Per-entry byte limit for captured stdout.
    #[serde(default = "defaults::max_stdout_bytes")]
    pub max_stdout_bytes: usize,

    /// Per-entry byte limit for captured stderr.
    #[serde(default = "defaults::max_stderr_bytes")]
    pub max_stderr_bytes: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            cache_root: defaults::cache_root(),
            max_result_bytes: defaults::max_result_bytes(),
            max_stdout_bytes: defaults::max_stdout_bytes(),
            max_stderr_bytes: defaults::max_stderr_bytes(),
        }
    }
}

impl ExecutionSettings {
    /// Create settings rooted at `cache_root` with default limits.
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            ..Default::default()
        }
    }

    /// Override the result byte limit.
    pub fn with_max_result_bytes(mut self, bytes: usize) -> Self {
        self.max_result_bytes = bytes;
        self
    }

    /// Override both output byte limits.
    pub fn with_output_limits(mut self, stdout: usize, stderr: usize) -> Self {
        self.max_stdout_bytes = stdout;
        self.max_stderr_bytes = stderr;
        self
    }

    /// Get the cache root.
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }
}

/// Caller-side dispatch configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Maximum number of concurrent engine calls in caller-parallel mode.
    ///
    /// Defaults to one less than the available parallelism, never below one.
    #[serde(default)]
    pub max_parallelism: Option<usize>,
}

impl DispatchConfig {
    /// Resolve the effective caller-parallel width.
    pub fn parallelism(&self) -> usize {
        self.max_parallelism
            .unwrap_or_else(defaults::max_parallelism)
            .max(1)
    }
}

/// Default value functions for serde.
mod defaults {
    use std::path::PathBuf;

    pub fn cache_root() -> PathBuf {
        PathBuf::from("./tally-home")
    }

    pub const fn max_result_bytes() -> usize {
        1024
    }

    pub const fn max_stdout_bytes() -> usize {
        512
    }

    pub const fn max_stderr_bytes() -> usize {
        512
    }

    pub fn max_parallelism() -> usize {
        std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .saturating_sub(1)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert!(config.engine.library_path.is_none());
        assert_eq!(config.execution.cache_root, PathBuf::from("./tally-home"));
        assert_eq!(config.execution.max_result_bytes, 1024);
        assert_eq!(config.execution.max_stdout_bytes, 512);
        assert_eq!(config.execution.max_stderr_bytes, 512);
        assert!(config.dispatch.max_parallelism.is_none());
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig {
            execution: ExecutionSettings::new("/var/tally").with_max_result_bytes(64),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.execution, deserialized.execution);
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"execution": {"max_result_bytes": 1}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.execution.max_result_bytes, 1);
        assert_eq!(config.execution.max_stdout_bytes, 512);
        assert_eq!(config.execution.cache_root, PathBuf::from("./tally-home"));
    }

    #[test]
    fn test_settings_builders() {
        let settings = ExecutionSettings::new("/tmp/home")
            .with_max_result_bytes(8)
            .with_output_limits(2, 3);

        assert_eq!(settings.cache_root(), Path::new("/tmp/home"));
        assert_eq!(settings.max_result_bytes, 8);
        assert_eq!(settings.max_stdout_bytes, 2);
        assert_eq!(settings.max_stderr_bytes, 3);
    }

    #[test]
    fn test_parallelism_never_zero() {
        let config = DispatchConfig {
            max_parallelism: Some(0),
        };
        assert_eq!(config.parallelism(), 1);

        let config = DispatchConfig {
            max_parallelism: Some(6),
        };
        assert_eq!(config.parallelism(), 6);

        assert!(DispatchConfig::default().parallelism() >= 1);
    }
}
