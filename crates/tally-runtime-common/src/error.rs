//! Error types for the tally-runtime.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Top-level errors for the runtime
//! - [`EngineLoadError`]: The engine library could not be bound (fatal)
//! - [`EncodeError`]: A request could not be represented at the boundary
//! - [`CacheError`]: Cache housekeeping failed (recoverable)
//!
//! Engine outcomes (gas exhaustion, oversized results, guest failures) are
//! never errors; they are reported as data in
//! [`ExecutionResult`](crate::ExecutionResult).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level runtime errors.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The engine library could not be loaded.
    #[error(transparent)]
    EngineLoad(#[from] EngineLoadError),

    /// A request or setting could not be encoded for the engine.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Cache housekeeping failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl RuntimeError {
    /// Returns `true` if the process cannot continue without reconfiguration.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::EngineLoad(_))
    }
}

/// The engine library could not be bound.
///
/// These errors abort initialization; they are never folded into results.
#[derive(Error, Debug)]
pub enum EngineLoadError {
    /// The shared library could not be located or opened.
    #[error("Failed to load engine library '{path}': {reason}")]
    LibraryLoad {
        /// The path (or file name) that was attempted.
        path: String,
        /// Loader diagnostic.
        reason: String,
    },

    /// A required symbol is not exported by the library.
    #[error("Engine library is missing symbol '{symbol}': {reason}")]
    MissingSymbol {
        /// The symbol name.
        symbol: String,
        /// Loader diagnostic.
        reason: String,
    },
}

impl EngineLoadError {
    /// Create a new `LibraryLoad` error.
    pub fn library_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LibraryLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `MissingSymbol` error.
    pub fn missing_symbol(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MissingSymbol {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }
}

/// A value could not be converted into its boundary representation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A string contains a NUL byte and cannot become a C string.
    #[error("{field} contains a NUL byte at position {position}")]
    InteriorNul {
        /// Which input was rejected, e.g. `argument 2` or `env key FOO`.
        field: String,
        /// Byte offset of the first NUL.
        position: usize,
    },
}

impl EncodeError {
    /// Create a new `InteriorNul` error.
    pub fn interior_nul(field: impl Into<String>, position: usize) -> Self {
        Self::InteriorNul {
            field: field.into(),
            position,
        }
    }
}

/// Cache housekeeping errors.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A filesystem operation on the cache failed.
    #[error("Cache I/O error at {}: {source}", path.display())]
    Io {
        /// The path being listed or removed.
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The engine reported no current version, so no directory can be kept.
    #[error("Engine reported an empty cache version for {}", root.display())]
    EmptyVersion {
        /// The cache root that was not touched.
        root: PathBuf,
    },
}

impl CacheError {
    /// Create a new `Io` error.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a new `EmptyVersion` error.
    pub fn empty_version(root: impl Into<PathBuf>) -> Self {
        Self::EmptyVersion { root: root.into() }
    }
}
