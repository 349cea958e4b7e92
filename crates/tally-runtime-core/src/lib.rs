//! Execution dispatch and cache housekeeping for tally-runtime.
//!
//! This crate sits on top of the engine binding:
//! - [`Dispatcher`]: Runs requests in one of four [`DispatchMode`]s with
//!   index-aligned results
//! - [`CacheInvalidator`]: Prunes stale engine cache versions
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Dispatcher                         │
//! │  - single / caller-parallel (semaphore-gated)           │
//! │  - engine batch / engine batch-parallel                 │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Engine (shared, Arc)                   │
//! │  - blocking boundary calls                              │
//! │  - encode / decode / release                            │
//! └─────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │
//! ┌─────────────────────────────────────────────────────────┐
//! │                   CacheInvalidator                      │
//! │  (off the execution path)                               │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod dispatcher;

pub use cache::{CacheInvalidator, InvalidationReport, invalidate};
pub use dispatcher::{DispatchMode, Dispatcher, UnknownDispatchMode};
