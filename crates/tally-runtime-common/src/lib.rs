//! Common types, errors, and configuration for tally-runtime.
//!
//! This crate provides the shared model used across the tally-runtime workspace:
//! - Request and result types exchanged with the engine
//! - Execution settings and configuration file structures
//! - Error types using `thiserror` for type-safe error handling

pub mod config;
pub mod config_file;
pub mod error;
pub mod types;

pub use config::{DispatchConfig, EngineConfig, ExecutionSettings, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError, LogConfig};
pub use error::{CacheError, EncodeError, EngineLoadError, RuntimeError};
pub use types::{CacheInfo, ExecutionRequest, ExecutionResult, ExitInfo, ExitKind, VmMode};
