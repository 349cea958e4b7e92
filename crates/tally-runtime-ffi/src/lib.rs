//! Boundary between tally-runtime and the engine library.
//!
//! This crate owns everything that touches foreign memory:
//! - [`abi`]: `#[repr(C)]` layouts and exported symbol names
//! - [`codec`]: Encoding requests with scoped release, decoding results
//!   into owned values and releasing engine buffers exactly once
//! - [`engine`]: Loading the library and issuing blocking boundary calls
//!
//! # Ownership
//!
//! ```text
//! ExecutionRequest ──encode──▶ EncodedRequest (owns C strings, borrows payload)
//!                                    │
//!                                    ▼  boundary call (blocking)
//!                              OwnedResult / ResultArray (engine memory)
//!                                    │
//! ExecutionResult ◀──decode──────────┘  then free_ffi_vm_result, once
//! ```
//!
//! With the `mock-engine` feature, [`mock`] provides an in-process engine
//! implementing the same ABI for tests.

pub mod abi;
pub mod codec;
pub mod engine;

#[cfg(any(test, feature = "mock-engine"))]
pub mod mock;

pub use engine::{BatchStrategy, Engine, EngineApi, default_library_name};
