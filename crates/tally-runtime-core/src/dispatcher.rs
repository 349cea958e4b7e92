//! Execution dispatch strategies.
//!
//! [`Dispatcher`] runs one or many requests through the engine using one of
//! four strategies. All of them return results index-aligned with the
//! requests and none of them aborts the group when a single request fails:
//!
//! - [`DispatchMode::Single`]: one boundary call per request, in order
//! - [`DispatchMode::CallerParallel`]: one blocking task per request, gated
//!   by a semaphore
//! - [`DispatchMode::EngineBatch`]: all requests in one boundary call
//! - [`DispatchMode::EngineBatchParallel`]: one boundary call, executed with
//!   engine-internal parallelism

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{Span, debug, error, info, instrument};
use uuid::Uuid;

use tally_runtime_common::{DispatchConfig, ExecutionRequest, ExecutionResult, ExecutionSettings};
use tally_runtime_ffi::{BatchStrategy, Engine};

/// Strategy used to submit requests to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Sequential single calls.
    Single,
    /// Concurrent single calls from the caller side.
    CallerParallel,
    /// One batch call, executed sequentially by the engine.
    EngineBatch,
    /// One batch call, executed in parallel by the engine.
    EngineBatchParallel,
}

impl DispatchMode {
    /// All modes, in declaration order.
    pub const ALL: [DispatchMode; 4] = [
        DispatchMode::Single,
        DispatchMode::CallerParallel,
        DispatchMode::EngineBatch,
        DispatchMode::EngineBatchParallel,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DispatchMode::Single => "single",
            DispatchMode::CallerParallel => "parallel",
            DispatchMode::EngineBatch => "batch",
            DispatchMode::EngineBatchParallel => "batch-parallel",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unrecognized dispatch mode name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown dispatch mode '{0}' (expected single, parallel, batch or batch-parallel)")]
pub struct UnknownDispatchMode(pub String);

impl FromStr for DispatchMode {
    type Err = UnknownDispatchMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DispatchMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| UnknownDispatchMode(s.to_string()))
    }
}

/// Runs requests through a bound engine.
///
/// The dispatcher is cheap to clone; clones share the engine and the
/// caller-parallel semaphore.
#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<Engine>,
    semaphore: Arc<Semaphore>,
    parallelism: usize,
}

impl Dispatcher {
    /// Create a dispatcher over `engine`.
    pub fn new(engine: Arc<Engine>, config: &DispatchConfig) -> Self {
        let parallelism = config.parallelism();
        info!(parallelism, engine = engine.source(), "Dispatcher initialized");

        Self {
            engine,
            semaphore: Arc::new(Semaphore::new(parallelism)),
            parallelism,
        }
    }

    /// Get the bound engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Maximum number of concurrent caller-parallel boundary calls.
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Execute one request. Blocks the calling thread.
    #[instrument(skip_all, fields(dispatch_id = %Uuid::new_v4()))]
    pub fn execute(
        &self,
        settings: &ExecutionSettings,
        request: &ExecutionRequest,
    ) -> ExecutionResult {
        let result = self.engine.execute(settings, request);
        log_outcome(0, &result);
        result
    }

    /// Execute requests one after another. Blocks the calling thread.
    #[instrument(skip_all, fields(dispatch_id = %Uuid::new_v4(), count = requests.len()))]
    pub fn execute_sequential(
        &self,
        settings: &ExecutionSettings,
        requests: &[ExecutionRequest],
    ) -> Vec<ExecutionResult> {
        requests
            .iter()
            .enumerate()
            .map(|(index, request)| {
                let result = self.engine.execute(settings, request);
                log_outcome(index, &result);
                result
            })
            .collect()
    }

    /// Execute requests concurrently, one blocking task per request.
    ///
    /// At most [`parallelism`](Self::parallelism) boundary calls are in
    /// flight at once across all callers of this dispatcher. A task that
    /// panics yields a failure result in its slot; siblings are unaffected.
    #[instrument(skip_all, fields(dispatch_id = %Uuid::new_v4(), count = requests.len()))]
    pub async fn execute_parallel(
        &self,
        settings: &ExecutionSettings,
        requests: Vec<ExecutionRequest>,
    ) -> Vec<ExecutionResult> {
        let settings = Arc::new(settings.clone());
        let mut tasks = Vec::with_capacity(requests.len());

        for (index, request) in requests.into_iter().enumerate() {
            // The semaphore is never closed; a failed acquire only drops the bound.
            let permit = self.semaphore.clone().acquire_owned().await.ok();
            let engine = Arc::clone(&self.engine);
            let settings = Arc::clone(&settings);
            let span = Span::current();

            tasks.push(tokio::task::spawn_blocking(move || {
                let _entered = span.enter();
                debug!(index, "Executing");
                let result = engine.execute(&settings, &request);
                drop(permit);
                result
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for (index, task) in tasks.into_iter().enumerate() {
            let result = task.await.unwrap_or_else(|e| {
                error!(index, error = %e, "Execution task failed");
                ExecutionResult::failure(format!("Execution task failed: {e}"))
            });
            log_outcome(index, &result);
            results.push(result);
        }
        results
    }

    /// Execute requests in one boundary call. Blocks the calling thread.
    #[instrument(skip_all, fields(dispatch_id = %Uuid::new_v4(), count = requests.len()))]
    pub fn execute_batch(
        &self,
        settings: &ExecutionSettings,
        requests: &[ExecutionRequest],
    ) -> Vec<ExecutionResult> {
        self.batch(settings, requests, BatchStrategy::Sequential)
    }

    /// Execute requests in one boundary call using engine-internal
    /// parallelism. Blocks the calling thread.
    #[instrument(skip_all, fields(dispatch_id = %Uuid::new_v4(), count = requests.len()))]
    pub fn execute_batch_parallel(
        &self,
        settings: &ExecutionSettings,
        requests: &[ExecutionRequest],
    ) -> Vec<ExecutionResult> {
        self.batch(settings, requests, BatchStrategy::Parallel)
    }

    /// Execute requests with the chosen strategy without blocking the
    /// async runtime.
    pub async fn dispatch(
        &self,
        mode: DispatchMode,
        settings: &ExecutionSettings,
        requests: Vec<ExecutionRequest>,
    ) -> Vec<ExecutionResult> {
        if mode == DispatchMode::CallerParallel {
            return self.execute_parallel(settings, requests).await;
        }

        let count = requests.len();
        let dispatcher = self.clone();
        let settings = settings.clone();
        let task = tokio::task::spawn_blocking(move || match mode {
            DispatchMode::EngineBatch => dispatcher.execute_batch(&settings, &requests),
            DispatchMode::EngineBatchParallel => {
                dispatcher.execute_batch_parallel(&settings, &requests)
            }
            DispatchMode::Single | DispatchMode::CallerParallel => {
                dispatcher.execute_sequential(&settings, &requests)
            }
        });

        task.await.unwrap_or_else(|e| {
            error!(%mode, error = %e, "Dispatch task failed");
            vec![ExecutionResult::failure(format!("Execution task failed: {e}")); count]
        })
    }

    fn batch(
        &self,
        settings: &ExecutionSettings,
        requests: &[ExecutionRequest],
        strategy: BatchStrategy,
    ) -> Vec<ExecutionResult> {
        let results = self.engine.execute_batch(settings, requests, strategy);
        for (index, result) in results.iter().enumerate() {
            log_outcome(index, result);
        }
        results
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("engine", &self.engine)
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

fn log_outcome(index: usize, result: &ExecutionResult) {
    if result.is_success() {
        debug!(index, gas_used = result.gas_used, "Request succeeded");
    } else {
        debug!(
            index,
            exit_code = result.exit.code,
            exit_message = %result.exit.message,
            gas_used = result.gas_used,
            result_len = result.result_len,
            "Request exited non-zero"
        );
    }
}

#[cfg(test)]
mod tests {
    use tally_runtime_ffi::mock;

    use super::*;

    fn dispatcher(parallelism: usize) -> Dispatcher {
        let config = DispatchConfig {
            max_parallelism: Some(parallelism),
        };
        Dispatcher::new(Arc::new(mock::engine()), &config)
    }

    fn echo(tag: u8) -> ExecutionRequest {
        ExecutionRequest::new(vec![tag; 4])
            .with_arg("echo")
            .with_gas_limit(1_000_000)
    }

    #[test]
    fn test_mode_names_round_trip() {
        for mode in DispatchMode::ALL {
            assert_eq!(mode.to_string().parse::<DispatchMode>(), Ok(mode));
        }
        assert!("sideways".parse::<DispatchMode>().is_err());
    }

    #[test]
    fn test_parallelism_from_config() {
        assert_eq!(dispatcher(3).parallelism(), 3);
        assert_eq!(dispatcher(0).parallelism(), 1);
    }

    #[test]
    fn test_execute_single() {
        let dispatcher = dispatcher(1);
        let settings = ExecutionSettings::new(std::env::temp_dir());

        let result = dispatcher.execute(&settings, &echo(7));

        assert!(result.is_success());
        assert_eq!(result.result, Some(vec![7; 4]));
    }

    #[test]
    fn test_execute_parallel_with_block_on() {
        let dispatcher = dispatcher(2);
        let settings = ExecutionSettings::new(std::env::temp_dir());
        let requests: Vec<_> = (0..5).map(echo).collect();

        let results = tokio_test::block_on(dispatcher.execute_parallel(&settings, requests));

        assert_eq!(results.len(), 5);
        for (tag, result) in (0u8..).zip(&results) {
            assert_eq!(result.result, Some(vec![tag; 4]));
        }
    }

    #[tokio::test]
    async fn test_dispatch_empty_group() {
        let dispatcher = dispatcher(2);
        let settings = ExecutionSettings::new(std::env::temp_dir());

        for mode in DispatchMode::ALL {
            assert!(dispatcher.dispatch(mode, &settings, Vec::new()).await.is_empty());
        }
    }

    #[test]
    fn test_dispatcher_debug() {
        let debug_str = format!("{:?}", dispatcher(2));
        assert!(debug_str.contains("Dispatcher"));
        assert!(debug_str.contains("parallelism"));
    }
}
