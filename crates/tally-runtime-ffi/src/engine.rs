//! Engine library binding.
//!
//! [`Engine`] resolves the engine's exported symbols once at startup and
//! exposes safe, blocking calls that encode, cross the boundary, decode and
//! release. Failing to load the library or any required symbol is fatal and
//! reported as [`EngineLoadError`]; everything that happens after that is
//! reported per request as an [`ExecutionResult`].

#![allow(unsafe_code)]

use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::Path;

use libloading::Library;
use tracing::{debug, error, info, warn};

use tally_runtime_common::{
    CacheInfo, EncodeError, EngineConfig, EngineLoadError, ExecutionRequest, ExecutionResult,
    ExecutionSettings,
};

use crate::abi::{
    CacheInfoFn, ExecuteBatchFn, ExecuteFn, FfiTallyRequest, FreeCacheInfoFn, FreeResultFn,
    FreeResultsFn, symbols,
};
use crate::codec::{
    EncodedRequest, EncodedSettings, OwnedCacheInfo, OwnedResult, ResultArray, encode_path,
};

/// Base name of the engine library, without platform prefix or suffix.
pub const LIBRARY_NAME: &str = "tally_vm";

/// Platform file name of the engine library, e.g. `libtally_vm.so`.
pub fn default_library_name() -> String {
    format!("{DLL_PREFIX}{LIBRARY_NAME}{DLL_SUFFIX}")
}

/// Resolved engine entry points.
#[derive(Debug, Clone, Copy)]
pub struct EngineApi {
    pub execute_tally_request: ExecuteFn,
    pub execute_tally_requests: ExecuteBatchFn,
    pub execute_tally_requests_parallel: ExecuteBatchFn,
    pub free_ffi_vm_result: FreeResultFn,
    /// Releases a batch result container. Older engines do not export it,
    /// in which case the container is left to the engine.
    pub free_ffi_vm_results: Option<FreeResultsFn>,
    pub invalidate_wasm_cache_info: CacheInfoFn,
    pub free_ffi_invalidate_wasm_cache_info: FreeCacheInfoFn,
}

/// How the engine should run a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStrategy {
    /// One request after another inside the engine.
    Sequential,
    /// Engine-internal parallelism.
    Parallel,
}

/// A bound engine.
///
/// `Engine` is `Send + Sync`; boundary calls are blocking and may be issued
/// from several threads at once.
pub struct Engine {
    api: EngineApi,
    source: String,
    _library: Option<Library>,
}

impl Engine {
    /// Load the engine library at `path` and resolve its symbols.
    ///
    /// # Errors
    ///
    /// Returns an error if the library cannot be opened or a required
    /// symbol is missing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineLoadError> {
        let path = path.as_ref();
        let source = path.display().to_string();

        // SAFETY: loading runs the library's initializers; the engine
        // library is trusted configuration.
        let library = unsafe { Library::new(path) }
            .map_err(|e| EngineLoadError::library_load(&source, e.to_string()))?;

        // SAFETY: symbol types match the engine's exported ABI.
        let api = unsafe {
            EngineApi {
                execute_tally_request: symbol(&library, symbols::EXECUTE)?,
                execute_tally_requests: symbol(&library, symbols::EXECUTE_BATCH)?,
                execute_tally_requests_parallel: symbol(&library, symbols::EXECUTE_BATCH_PARALLEL)?,
                free_ffi_vm_result: symbol(&library, symbols::FREE_RESULT)?,
                free_ffi_vm_results: symbol(&library, symbols::FREE_RESULTS).ok(),
                invalidate_wasm_cache_info: symbol(&library, symbols::CACHE_INFO)?,
                free_ffi_invalidate_wasm_cache_info: symbol(&library, symbols::FREE_CACHE_INFO)?,
            }
        };

        if api.free_ffi_vm_results.is_none() {
            warn!(
                library = %source,
                symbol = symbols::FREE_RESULTS,
                "Engine does not export a batch container release"
            );
        }
        info!(library = %source, "Engine library loaded");

        Ok(Self {
            api,
            source,
            _library: Some(library),
        })
    }

    /// Load the engine library by its platform file name.
    pub fn load_default() -> Result<Self, EngineLoadError> {
        Self::load(default_library_name())
    }

    /// Load the engine library named by the configuration.
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineLoadError> {
        match &config.library_path {
            Some(path) => Self::load(path),
            None => Self::load_default(),
        }
    }

    /// Bind an engine from an already-resolved function table.
    ///
    /// # Safety
    ///
    /// Every function in `api` must honor the boundary ABI and remain
    /// callable for the lifetime of the returned value.
    pub unsafe fn from_api(api: EngineApi, source: impl Into<String>) -> Self {
        Self {
            api,
            source: source.into(),
            _library: None,
        }
    }

    /// Get the resolved entry points.
    pub fn api(&self) -> &EngineApi {
        &self.api
    }

    /// Where the engine was loaded from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Execute one request. Blocks until the engine returns.
    pub fn execute(
        &self,
        settings: &ExecutionSettings,
        request: &ExecutionRequest,
    ) -> ExecutionResult {
        let settings = match EncodedSettings::encode(settings) {
            Ok(settings) => settings,
            Err(e) => return rejected(&e),
        };
        let encoded = match EncodedRequest::encode(request) {
            Ok(encoded) => encoded,
            Err(e) => return rejected(&e),
        };

        // SAFETY: `settings` and `encoded` outlive the call; the returned
        // result is owned by the guard and released exactly once.
        let result = unsafe {
            let raw = (self.api.execute_tally_request)(settings.as_ffi(), encoded.as_ffi());
            OwnedResult::new(raw, self.api.free_ffi_vm_result)
        }
        .decode();

        debug!(
            exit_code = result.exit.code,
            gas_used = result.gas_used,
            "Engine call returned"
        );
        result
    }

    /// Execute `requests` in a single boundary call.
    ///
    /// Results are index-aligned with `requests`. A request that cannot be
    /// encoded is left out of the call and reported as a failure in its slot.
    pub fn execute_batch(
        &self,
        settings: &ExecutionSettings,
        requests: &[ExecutionRequest],
        strategy: BatchStrategy,
    ) -> Vec<ExecutionResult> {
        if requests.is_empty() {
            return Vec::new();
        }

        let settings = match EncodedSettings::encode(settings) {
            Ok(settings) => settings,
            Err(e) => return vec![rejected(&e); requests.len()],
        };

        let mut results: Vec<Option<ExecutionResult>> = vec![None; requests.len()];
        let mut encoded = Vec::with_capacity(requests.len());
        let mut slots = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            match EncodedRequest::encode(request) {
                Ok(request) => {
                    encoded.push(request);
                    slots.push(index);
                }
                Err(e) => {
                    warn!(index, error = %e, "Request excluded from batch");
                    results[index] = Some(rejected(&e));
                }
            }
        }

        if !encoded.is_empty() {
            let raw_requests: Vec<FfiTallyRequest> =
                encoded.iter().map(EncodedRequest::as_ffi).collect();
            let call = match strategy {
                BatchStrategy::Sequential => self.api.execute_tally_requests,
                BatchStrategy::Parallel => self.api.execute_tally_requests_parallel,
            };

            // SAFETY: `settings`, `encoded` and `raw_requests` outlive the
            // call; the returned array is owned by the guard.
            let array = unsafe {
                let ptr = call(settings.as_ffi(), raw_requests.as_ptr(), raw_requests.len());
                ResultArray::new(
                    ptr,
                    raw_requests.len(),
                    self.api.free_ffi_vm_result,
                    self.api.free_ffi_vm_results,
                )
            };

            let decoded = match array {
                Some(array) => array.decode_all(),
                None => {
                    error!(
                        count = raw_requests.len(),
                        ?strategy,
                        "Engine returned no batch results"
                    );
                    vec![
                        ExecutionResult::failure("Engine returned no results");
                        raw_requests.len()
                    ]
                }
            };
            for (index, result) in slots.into_iter().zip(decoded) {
                results[index] = Some(result);
            }
        }

        results
            .into_iter()
            .map(|result| {
                result.unwrap_or_else(|| ExecutionResult::failure("Missing batch result"))
            })
            .collect()
    }

    /// Ask the engine where its compilation cache lives and which version
    /// it currently writes.
    pub fn cache_info(&self, cache_root: &Path) -> Result<CacheInfo, EncodeError> {
        let root = encode_path(cache_root, "cache root")?;

        // SAFETY: `root` outlives the call; the returned info is owned by
        // the guard and released exactly once.
        let info = unsafe {
            let raw = (self.api.invalidate_wasm_cache_info)(root.as_ptr());
            OwnedCacheInfo::new(raw, self.api.free_ffi_invalidate_wasm_cache_info)
        }
        .decode();

        Ok(info)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("source", &self.source)
            .field("batch_release", &self.api.free_ffi_vm_results.is_some())
            .finish_non_exhaustive()
    }
}

/// Resolve one symbol as a copied function pointer.
unsafe fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T, EngineLoadError> {
    let symbol = unsafe { library.get::<T>(name.as_bytes()) }
        .map_err(|e| EngineLoadError::missing_symbol(name, e.to_string()))?;
    Ok(*symbol)
}

fn rejected(error: &EncodeError) -> ExecutionResult {
    warn!(error = %error, "Request rejected before reaching the engine");
    ExecutionResult::failure(format!("Invalid request: {error}"))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use tally_runtime_common::types::GAS_LIMIT_ENV;

    use super::*;
    use crate::abi::FfiVmResult;
    use crate::mock;

    fn settings() -> ExecutionSettings {
        ExecutionSettings::new(std::env::temp_dir())
    }

    fn echo(payload: &[u8]) -> ExecutionRequest {
        ExecutionRequest::new(payload.to_vec())
            .with_arg("echo")
            .with_gas_limit(1_000_000)
    }

    #[test]
    fn test_default_library_name() {
        let name = default_library_name();
        assert!(name.contains(LIBRARY_NAME));
        assert!(name.ends_with(DLL_SUFFIX));
    }

    #[test]
    fn test_load_missing_library_is_fatal() {
        let err = Engine::load("/nonexistent/libtally_vm.so").unwrap_err();
        assert!(matches!(err, EngineLoadError::LibraryLoad { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_load_library_without_engine_symbols_is_fatal() {
        let err = Engine::load("libc.so.6").unwrap_err();
        assert!(matches!(
            err,
            EngineLoadError::MissingSymbol { ref symbol, .. } if symbol == symbols::EXECUTE
        ));
        assert_eq!(symbols::EXECUTE, "execute_tally_request");
    }

    #[test]
    fn test_execute_echo() {
        let engine = mock::engine();
        let result = engine.execute(&settings(), &echo(b"abc").with_arg("line"));

        assert!(result.is_success());
        assert_eq!(result.result.as_deref(), Some(&b"abc"[..]));
        assert_eq!(result.stdout, vec!["line"]);
        assert!(result.gas_used > 0);
    }

    #[test]
    fn test_execute_rejects_nul_argument() {
        let engine = mock::engine();
        let request = echo(b"abc").with_arg("bad\0");
        let result = engine.execute(&settings(), &request);

        assert_eq!(result.exit.code, 255);
        assert!(result.exit.message.starts_with("Invalid request"));
        assert_eq!(result.gas_used, 0);
    }

    #[test]
    fn test_execute_without_gas_limit() {
        let engine = mock::engine();
        let request = ExecutionRequest::new(b"abc".to_vec()).with_arg("echo");
        let result = engine.execute(&settings(), &request);

        assert_eq!(result.exit.code, 255);
        assert!(result.exit.message.contains(GAS_LIMIT_ENV));
    }

    #[test]
    fn test_batch_splices_rejected_requests() {
        let engine = mock::engine();
        let requests = vec![echo(b"a"), echo(b"b").with_env("BAD", "\0"), echo(b"c")];

        let results = engine.execute_batch(&settings(), &requests, BatchStrategy::Sequential);

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].result.as_deref(), Some(&b"a"[..]));
        assert_eq!(results[1].exit.code, 255);
        assert!(results[1].exit.message.starts_with("Invalid request"));
        assert_eq!(results[2].result.as_deref(), Some(&b"c"[..]));
    }

    #[test]
    fn test_batch_empty() {
        let engine = mock::engine();
        let results = engine.execute_batch(&settings(), &[], BatchStrategy::Parallel);
        assert!(results.is_empty());
    }

    #[test]
    fn test_batch_null_array() {
        let engine = mock::engine_without_batch_results();
        let requests = vec![echo(b"a"), echo(b"b")];

        let results = engine.execute_batch(&settings(), &requests, BatchStrategy::Sequential);

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.exit.code == 255));
    }

    #[test]
    fn test_batch_without_container_release() {
        let engine = mock::engine_without_batch_release();
        assert!(engine.api().free_ffi_vm_results.is_none());
        let requests = vec![echo(b"a"), echo(b"b"), echo(b"c")];

        let results = engine.execute_batch(&settings(), &requests, BatchStrategy::Parallel);

        let payloads: Vec<_> = results.iter().map(|r| r.result.clone()).collect();
        assert_eq!(
            payloads,
            vec![Some(b"a".to_vec()), Some(b"b".to_vec()), Some(b"c".to_vec())]
        );
    }

    #[test]
    fn test_batch_releases_each_element_once_without_container_release() {
        thread_local! {
            static FREED: Cell<usize> = const { Cell::new(0) };
        }

        unsafe extern "C" fn counting_free(raw: *mut FfiVmResult) {
            FREED.with(|f| f.set(f.get() + 1));
            unsafe { mock::free_result(raw) };
        }

        let api = EngineApi {
            free_ffi_vm_result: counting_free,
            free_ffi_vm_results: None,
            ..mock::api()
        };
        // SAFETY: the mock table with a counting wrapper keeps the contract.
        let engine = unsafe { Engine::from_api(api, "mock-counting") };
        let requests = vec![echo(b"a"), echo(b"b").with_arg("x\0"), echo(b"c"), echo(b"d")];

        let results = engine.execute_batch(&settings(), &requests, BatchStrategy::Sequential);

        assert_eq!(results.len(), 4);
        assert!(results[1].exit.message.starts_with("Invalid request"));
        assert_eq!(FREED.with(Cell::get), 3);
    }

    #[test]
    fn test_cache_info() {
        let engine = mock::engine();
        let root = std::env::temp_dir();

        let info = engine.cache_info(&root).unwrap();

        assert_eq!(info.root_path, root.join("wasm_cache"));
        assert_eq!(info.current_version, mock::MOCK_VERSION);
    }

    #[test]
    fn test_engine_debug() {
        let engine = mock::engine();
        let debug_str = format!("{engine:?}");
        assert!(debug_str.contains("Engine"));
        assert!(debug_str.contains("mock"));
    }
}
