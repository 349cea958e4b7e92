//! C ABI shared with the engine library.
//!
//! Field order is part of the contract. Every pointer handed to the engine
//! is owned by this side and stays valid for the duration of one call.
//! Every pointer returned by the engine is owned by the engine and must be
//! released through the paired `free_*` symbol exactly once.

use std::ffi::c_char;

/// Limits passed by value on every call.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct FfiVmSettings {
    pub cache_root: *const c_char,
    pub max_result_bytes: usize,
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
}

/// One request.
///
/// Empty payloads and empty argument or environment lists are passed as
/// null pointers with a zero count.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct FfiTallyRequest {
    pub wasm_bytes: *const u8,
    pub wasm_bytes_len: usize,
    pub args_ptr: *const *const c_char,
    pub args_count: usize,
    pub env_keys_ptr: *const *const c_char,
    pub env_values_ptr: *const *const c_char,
    pub env_count: usize,
}

#[derive(Debug)]
#[repr(C)]
pub struct FfiExitInfo {
    pub exit_message: *const c_char,
    pub exit_code: i32,
}

/// Engine-owned result of one request.
#[derive(Debug)]
#[repr(C)]
pub struct FfiVmResult {
    pub stdout_ptr: *const *const c_char,
    pub stdout_len: usize,
    pub stderr_ptr: *const *const c_char,
    pub stderr_len: usize,
    pub result_ptr: *const u8,
    pub result_len: usize,
    pub exit_info: FfiExitInfo,
    pub gas_used: u64,
}

/// Engine-owned cache location and version tag.
#[derive(Debug)]
#[repr(C)]
pub struct FfiCacheInfo {
    pub cache_dirs: *const c_char,
    pub version_name: *const c_char,
}

pub type ExecuteFn = unsafe extern "C" fn(FfiVmSettings, FfiTallyRequest) -> FfiVmResult;

pub type ExecuteBatchFn =
    unsafe extern "C" fn(FfiVmSettings, *const FfiTallyRequest, usize) -> *mut FfiVmResult;

pub type FreeResultFn = unsafe extern "C" fn(*mut FfiVmResult);

pub type FreeResultsFn = unsafe extern "C" fn(*mut FfiVmResult, usize);

pub type CacheInfoFn = unsafe extern "C" fn(*const c_char) -> FfiCacheInfo;

pub type FreeCacheInfoFn = unsafe extern "C" fn(*mut FfiCacheInfo);

/// Exported symbol names.
pub mod symbols {
    pub const EXECUTE: &str = "execute_tally_request";
    pub const EXECUTE_BATCH: &str = "execute_tally_requests";
    pub const EXECUTE_BATCH_PARALLEL: &str = "execute_tally_requests_parallel";
    pub const FREE_RESULT: &str = "free_ffi_vm_result";
    pub const FREE_RESULTS: &str = "free_ffi_vm_results";
    pub const CACHE_INFO: &str = "invalidate_wasm_cache_info";
    pub const FREE_CACHE_INFO: &str = "free_ffi_invalidate_wasm_cache_info";
}
