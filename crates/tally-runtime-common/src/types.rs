//! Request and result model shared by the codec and the dispatcher.
//!
//! - [`ExecutionRequest`]: One unit of work (payload, arguments, environment)
//! - [`ExecutionResult`]: The decoded, caller-owned outcome of one request
//! - [`ExitInfo`] and [`ExitKind`]: The engine's exit-code contract
//! - [`CacheInfo`]: Cache location and version reported by the engine

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment key carrying the gas limit for a tally execution.
pub const GAS_LIMIT_ENV: &str = "DR_TALLY_GAS_LIMIT";

/// Environment key selecting the execution mode of the hosted program.
pub const VM_MODE_ENV: &str = "VM_MODE";

/// Environment key flagging that consensus was reached.
pub const CONSENSUS_ENV: &str = "CONSENSUS";

/// Environment key carrying the replication factor.
pub const REPLICATION_FACTOR_ENV: &str = "DR_REPLICATION_FACTOR";

/// Exit code used by the engine for generic failures.
pub const EXIT_FAILURE: i32 = 255;

/// One unit of work for the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// The WebAssembly program bytes.
    pub payload: Vec<u8>,

    /// Ordered program arguments.
    pub arguments: Vec<String>,

    /// Environment variables. Iteration order carries no meaning.
    pub environment: HashMap<String, String>,
}

impl ExecutionRequest {
    /// Create a request for the given program bytes with no arguments.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Append a program argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    /// Append several program arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable, replacing any previous value.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Set the gas limit for this execution.
    pub fn with_gas_limit(self, gas_limit: u64) -> Self {
        self.with_env(GAS_LIMIT_ENV, gas_limit.to_string())
    }

    /// Set the execution mode of the hosted program.
    pub fn with_vm_mode(self, mode: VmMode) -> Self {
        self.with_env(VM_MODE_ENV, mode.to_string())
    }
}

/// Execution mode understood by the hosted program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmMode {
    /// Aggregate reveals into a final result.
    Tally,
    /// Execute a data request.
    Dr,
}

impl fmt::Display for VmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmMode::Tally => write!(f, "tally"),
            VmMode::Dr => write!(f, "dr"),
        }
    }
}

/// Exit status reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Human-readable status, e.g. `Ok` or `Result larger than 1bytes.`.
    pub message: String,

    /// Raw exit code.
    pub code: i32,
}

impl ExitInfo {
    /// Create exit info from a message and code.
    pub fn new(message: impl Into<String>, code: i32) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    /// Classify the exit code.
    pub fn kind(&self) -> ExitKind {
        ExitKind::from_code(self.code)
    }
}

/// Classification of engine exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Code 0.
    Success,
    /// Code 1: the hosted program exited non-zero.
    UserlandError,
    /// Code 250: the gas limit was reached.
    GasExceeded,
    /// Code 252: the hosted program failed to allocate memory.
    MemoryAllocation,
    /// Code 255: generic failure, including oversized results.
    Failure,
    /// Any code outside the documented table.
    Other(i32),
}

impl ExitKind {
    /// Map a raw exit code to its classification.
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::UserlandError,
            250 => Self::GasExceeded,
            252 => Self::MemoryAllocation,
            EXIT_FAILURE => Self::Failure,
            other => Self::Other(other),
        }
    }
}

/// Decoded, caller-owned outcome of one request.
///
/// `gas_used` is always populated, including on failure. When
/// `exit.code == 255` the result bytes are never surfaced, while
/// `result_len` still reports the size the engine tried to return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Captured stdout entries, each truncated by the engine.
    pub stdout: Vec<String>,

    /// Captured stderr entries, each truncated by the engine.
    pub stderr: Vec<String>,

    /// Result bytes, absent for exit code 255.
    pub result: Option<Vec<u8>>,

    /// Untruncated length of the result the engine produced.
    pub result_len: usize,

    /// Exit status.
    pub exit: ExitInfo,

    /// Gas consumed by the execution.
    pub gas_used: u64,
}

impl ExecutionResult {
    /// Build a failure result for a request that never reached the engine.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            exit: ExitInfo::new(message, EXIT_FAILURE),
            ..Default::default()
        }
    }

    /// Returns `true` if the engine reported success.
    pub fn is_success(&self) -> bool {
        self.exit.kind() == ExitKind::Success
    }

    /// Returns `true` if the result was withheld for exceeding the byte limit.
    pub fn exceeded_result_limit(&self) -> bool {
        self.exit.code == EXIT_FAILURE && self.result.is_none() && self.result_len > 0
    }
}

/// Cache location and current version tag reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    /// Directory holding one subdirectory per engine version.
    pub root_path: PathBuf,

    /// Version tag of the loaded engine build.
    pub current_version: String,
}
