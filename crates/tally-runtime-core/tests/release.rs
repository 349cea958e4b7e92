//! Boundary memory release.
//!
//! Lives in its own test binary, as a single test, so the mock's
//! process-wide allocation counter is not disturbed by concurrent tests.

use std::sync::Arc;

use tempfile::TempDir;

use tally_runtime_common::{DispatchConfig, ExecutionRequest, ExecutionSettings};
use tally_runtime_core::{CacheInvalidator, DispatchMode, Dispatcher};
use tally_runtime_ffi::mock;

#[tokio::test]
async fn test_every_engine_allocation_is_released() {
    let dispatcher = Dispatcher::new(
        Arc::new(mock::engine()),
        &DispatchConfig {
            max_parallelism: Some(2),
        },
    );
    let home = TempDir::new().unwrap();
    let settings = ExecutionSettings::new(home.path()).with_max_result_bytes(8);
    let requests = vec![
        ExecutionRequest::new(b"ok".to_vec())
            .with_arg("echo")
            .with_arg("out")
            .with_gas_limit(1_000_000),
        ExecutionRequest::new(vec![9; 64]).with_arg("echo").with_gas_limit(1_000_000),
        ExecutionRequest::new(b"none".to_vec()).with_gas_limit(1_000_000),
        ExecutionRequest::new(b"bad".to_vec()).with_env("KEY", "nul\0"),
        ExecutionRequest::new(b"gas".to_vec()).with_arg("echo").with_gas_limit(10),
    ];

    for _ in 0..3 {
        for mode in DispatchMode::ALL {
            let results = dispatcher.dispatch(mode, &settings, requests.clone()).await;
            assert_eq!(results.len(), requests.len());
        }
    }

    let invalidator = CacheInvalidator::new(Arc::new(mock::engine()));
    let info = invalidator.info(home.path()).unwrap();
    assert_eq!(info.current_version, mock::MOCK_VERSION);

    let null_batch = Dispatcher::new(
        Arc::new(mock::engine_without_batch_results()),
        &DispatchConfig::default(),
    );
    let results = null_batch.execute_batch(&settings, &requests);
    assert!(results.iter().all(|r| r.exit.code == 255));

    assert_eq!(mock::live_allocations(), 0);
}
