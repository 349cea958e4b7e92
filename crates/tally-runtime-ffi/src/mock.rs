//! In-process engine implementing the boundary ABI, for tests.
//!
//! Memory is allocated and released the way a native engine library does
//! it, so the codec's ownership handling is exercised for real. Live
//! allocations are counted process-wide; see [`live_allocations`].
//!
//! The hosted "program" is simulated. `DR_TALLY_GAS_LIMIT` is required.
//! Startup costs [`STARTUP_GAS`] plus [`GAS_PER_BYTE`] per payload byte and
//! a limit below that halts with exit code 250 and `gas_used` equal to the
//! limit. The first argument selects a command:
//!
//! | command        | outcome                                                   |
//! |----------------|-----------------------------------------------------------|
//! | *(none)*       | 255, stdout and stderr populated, no result              |
//! | `echo`         | 0, result = payload, stdout = remaining arguments        |
//! | `exit`         | 1, result = payload                                       |
//! | `alloc <n>`    | 252, stderr reports the failed allocation                 |
//! | `burn <n>`     | 0 after charging `n` gas, or 250 when it crosses the limit |
//! | anything else  | 255                                                       |
//!
//! `MOCK_STDERR`, when set, is emitted as one stderr line by `echo`.

#![allow(unsafe_code)]

use std::collections::BTreeMap;
use std::ffi::{CStr, CString, c_char};
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use tally_runtime_common::types::GAS_LIMIT_ENV;

use crate::abi::{FfiCacheInfo, FfiExitInfo, FfiTallyRequest, FfiVmResult, FfiVmSettings};
use crate::engine::{Engine, EngineApi};

/// Version tag reported by the mock's cache info call.
pub const MOCK_VERSION: &str = "mock-v1";

/// Fixed cost charged before the program runs.
pub const STARTUP_GAS: u64 = 5_000;

/// Cost per payload and argument byte.
pub const GAS_PER_BYTE: u64 = 10;

static LIVE_RESULTS: AtomicUsize = AtomicUsize::new(0);
static LIVE_ARRAYS: AtomicUsize = AtomicUsize::new(0);
static LIVE_CACHE_INFOS: AtomicUsize = AtomicUsize::new(0);

/// An engine backed by the mock.
pub fn engine() -> Engine {
    // SAFETY: every function in `api()` honors the boundary contract.
    unsafe { Engine::from_api(api(), "mock") }
}

/// A mock whose batch entry points return null.
pub fn engine_without_batch_results() -> Engine {
    let api = EngineApi {
        execute_tally_requests: null_batch,
        execute_tally_requests_parallel: null_batch,
        ..api()
    };
    // SAFETY: as above; null batch results are part of the contract.
    unsafe { Engine::from_api(api, "mock-null-batch") }
}

/// A mock that does not export a batch container release.
///
/// Elements are still released one by one; the container itself is left to
/// the engine and stays counted by [`live_allocations`].
pub fn engine_without_batch_release() -> Engine {
    let api = EngineApi {
        free_ffi_vm_results: None,
        ..api()
    };
    // SAFETY: as above; the batch container release is optional.
    unsafe { Engine::from_api(api, "mock-no-batch-release") }
}

/// The mock's function table.
pub fn api() -> EngineApi {
    EngineApi {
        execute_tally_request: execute,
        execute_tally_requests: execute_batch,
        execute_tally_requests_parallel: execute_batch_parallel,
        free_ffi_vm_result: free_result,
        free_ffi_vm_results: Some(free_results),
        invalidate_wasm_cache_info: cache_info,
        free_ffi_invalidate_wasm_cache_info: free_cache_info,
    }
}

/// Results, batch arrays and cache infos handed out and not yet released.
pub fn live_allocations() -> usize {
    LIVE_RESULTS.load(Ordering::SeqCst)
        + LIVE_ARRAYS.load(Ordering::SeqCst)
        + LIVE_CACHE_INFOS.load(Ordering::SeqCst)
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_result_bytes: usize,
    max_stdout_bytes: usize,
    max_stderr_bytes: usize,
}

#[derive(Debug)]
struct Call {
    payload: Vec<u8>,
    args: Vec<String>,
    envs: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Outcome {
    stdout: Vec<String>,
    stderr: Vec<String>,
    result: Option<Vec<u8>>,
    message: String,
    code: i32,
    gas_used: u64,
}

impl Outcome {
    fn failed(code: i32, gas_used: u64) -> Self {
        Self {
            message: "Not ok".to_string(),
            code,
            gas_used,
            ..Default::default()
        }
    }
}

fn run(call: &Call) -> Outcome {
    let Some(gas_limit) = call.envs.get(GAS_LIMIT_ENV).and_then(|v| v.parse::<u64>().ok()) else {
        return Outcome {
            message: format!("VM Error: {GAS_LIMIT_ENV} is required to be set as an env variable"),
            code: 255,
            ..Default::default()
        };
    };

    let startup = STARTUP_GAS + GAS_PER_BYTE * call.payload.len() as u64;
    if gas_limit < startup {
        return Outcome {
            stderr: vec!["gas limit exceeded during startup".to_string()],
            ..Outcome::failed(250, gas_limit)
        };
    }

    let Some((command, rest)) = call.args.split_first() else {
        return Outcome {
            stdout: vec!["tally program started".to_string()],
            stderr: vec!["no arguments supplied".to_string()],
            ..Outcome::failed(255, startup)
        };
    };

    let arg_bytes: usize = call.args.iter().map(String::len).sum();
    let gas = (startup + GAS_PER_BYTE * arg_bytes as u64).min(gas_limit);
    let amount = rest.first().and_then(|n| n.parse::<u64>().ok()).unwrap_or(0);

    match command.as_str() {
        "echo" => Outcome {
            stdout: rest.to_vec(),
            stderr: call.envs.get("MOCK_STDERR").cloned().into_iter().collect(),
            result: Some(call.payload.clone()),
            message: "Ok".to_string(),
            code: 0,
            gas_used: gas,
        },
        "exit" => Outcome {
            result: Some(call.payload.clone()),
            ..Outcome::failed(1, gas)
        },
        "alloc" => Outcome {
            stderr: vec![format!("memory allocation of {amount} bytes failed\n")],
            result: Some(Vec::new()),
            ..Outcome::failed(252, gas)
        },
        "burn" if gas.saturating_add(amount) > gas_limit => Outcome {
            stderr: vec!["gas limit exceeded".to_string()],
            ..Outcome::failed(250, gas_limit)
        },
        "burn" => Outcome {
            result: Some(Vec::new()),
            message: "Ok".to_string(),
            code: 0,
            gas_used: gas + amount,
            ..Default::default()
        },
        other => Outcome {
            stderr: vec![format!("unknown command {other}")],
            ..Outcome::failed(255, gas)
        },
    }
}

unsafe fn read_c_str(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

unsafe fn read_c_strs(ptr: *const *const c_char, len: usize) -> Vec<String> {
    if ptr.is_null() {
        return Vec::new();
    }
    (0..len).map(|i| unsafe { read_c_str(*ptr.add(i)) }).collect()
}

unsafe fn read_call(request: &FfiTallyRequest) -> Call {
    unsafe {
        let payload = if request.wasm_bytes.is_null() {
            Vec::new()
        } else {
            std::slice::from_raw_parts(request.wasm_bytes, request.wasm_bytes_len).to_vec()
        };
        let args = read_c_strs(request.args_ptr, request.args_count);
        let keys = read_c_strs(request.env_keys_ptr, request.env_count);
        let values = read_c_strs(request.env_values_ptr, request.env_count);

        Call {
            payload,
            args,
            envs: keys.into_iter().zip(values).collect(),
        }
    }
}

fn limits(settings: &FfiVmSettings) -> Limits {
    Limits {
        max_result_bytes: settings.max_result_bytes,
        max_stdout_bytes: settings.max_stdout_bytes,
        max_stderr_bytes: settings.max_stderr_bytes,
    }
}

fn raw_string(value: impl Into<Vec<u8>>) -> *const c_char {
    let mut bytes = value.into();
    bytes.retain(|&b| b != 0);
    CString::new(bytes).unwrap_or_default().into_raw()
}

fn raw_lines(lines: Vec<String>, limit: usize) -> (*const *const c_char, usize) {
    if lines.is_empty() {
        return (ptr::null(), 0);
    }
    let ptrs: Box<[*const c_char]> = lines
        .into_iter()
        .map(|line| {
            let mut bytes = line.into_bytes();
            bytes.truncate(limit);
            raw_string(bytes)
        })
        .collect();
    let len = ptrs.len();
    (Box::into_raw(ptrs).cast::<*const c_char>().cast_const(), len)
}

fn raw_bytes(bytes: Vec<u8>) -> (*const u8, usize) {
    if bytes.is_empty() {
        return (ptr::null(), 0);
    }
    let boxed = bytes.into_boxed_slice();
    let len = boxed.len();
    (Box::into_raw(boxed).cast::<u8>().cast_const(), len)
}

fn into_ffi(outcome: Outcome, limits: Limits) -> FfiVmResult {
    let result = outcome.result.unwrap_or_default();
    let result_len = result.len();
    let (message, code, result) = if result_len > limits.max_result_bytes {
        (
            format!("Result larger than {}bytes.", limits.max_result_bytes),
            255,
            Vec::new(),
        )
    } else {
        (outcome.message, outcome.code, result)
    };

    let (stdout_ptr, stdout_len) = raw_lines(outcome.stdout, limits.max_stdout_bytes);
    let (stderr_ptr, stderr_len) = raw_lines(outcome.stderr, limits.max_stderr_bytes);
    let (result_ptr, _) = raw_bytes(result);

    LIVE_RESULTS.fetch_add(1, Ordering::SeqCst);
    FfiVmResult {
        stdout_ptr,
        stdout_len,
        stderr_ptr,
        stderr_len,
        result_ptr,
        result_len,
        exit_info: FfiExitInfo {
            exit_message: raw_string(message),
            exit_code: code,
        },
        gas_used: outcome.gas_used,
    }
}

/// Build a raw result directly, without output truncation.
pub fn build_result(
    stdout: Vec<String>,
    stderr: Vec<String>,
    result: Option<Vec<u8>>,
    message: &str,
    code: i32,
    gas_used: u64,
) -> FfiVmResult {
    let outcome = Outcome {
        stdout,
        stderr,
        result,
        message: message.to_string(),
        code,
        gas_used,
    };
    into_ffi(
        outcome,
        Limits {
            max_result_bytes: usize::MAX,
            max_stdout_bytes: usize::MAX,
            max_stderr_bytes: usize::MAX,
        },
    )
}

unsafe extern "C" fn execute(settings: FfiVmSettings, request: FfiTallyRequest) -> FfiVmResult {
    let call = unsafe { read_call(&request) };
    into_ffi(run(&call), limits(&settings))
}

unsafe fn read_calls(requests: *const FfiTallyRequest, count: usize) -> Vec<Call> {
    (0..count)
        .map(|i| unsafe { read_call(&*requests.add(i)) })
        .collect()
}

fn into_array(results: Vec<FfiVmResult>) -> *mut FfiVmResult {
    LIVE_ARRAYS.fetch_add(1, Ordering::SeqCst);
    Box::into_raw(results.into_boxed_slice()).cast::<FfiVmResult>()
}

unsafe extern "C" fn execute_batch(
    settings: FfiVmSettings,
    requests: *const FfiTallyRequest,
    count: usize,
) -> *mut FfiVmResult {
    if requests.is_null() || count == 0 {
        return ptr::null_mut();
    }
    let limits = limits(&settings);
    let results = unsafe { read_calls(requests, count) }
        .iter()
        .map(|call| into_ffi(run(call), limits))
        .collect();
    into_array(results)
}

unsafe extern "C" fn execute_batch_parallel(
    settings: FfiVmSettings,
    requests: *const FfiTallyRequest,
    count: usize,
) -> *mut FfiVmResult {
    if requests.is_null() || count == 0 {
        return ptr::null_mut();
    }
    let limits = limits(&settings);
    let calls = unsafe { read_calls(requests, count) };
    let outcomes: Vec<Outcome> = thread::scope(|scope| {
        let handles: Vec<_> = calls.iter().map(|call| scope.spawn(move || run(call))).collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Outcome::failed(255, 0))
            })
            .collect()
    });
    into_array(outcomes.into_iter().map(|o| into_ffi(o, limits)).collect())
}

unsafe extern "C" fn null_batch(
    _settings: FfiVmSettings,
    _requests: *const FfiTallyRequest,
    _count: usize,
) -> *mut FfiVmResult {
    ptr::null_mut()
}

unsafe fn free_c_str(ptr: *const c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr.cast_mut()) });
    }
}

unsafe fn free_lines(ptr: *const *const c_char, len: usize) {
    if ptr.is_null() {
        return;
    }
    let lines = unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(ptr.cast_mut(), len)) };
    for &line in &lines {
        unsafe { free_c_str(line) };
    }
}

/// Release a result produced by the mock.
///
/// # Safety
///
/// `raw` must point to a live result produced by this module.
pub unsafe extern "C" fn free_result(raw: *mut FfiVmResult) {
    let Some(raw) = (unsafe { raw.as_mut() }) else {
        return;
    };
    unsafe {
        free_lines(raw.stdout_ptr, raw.stdout_len);
        free_lines(raw.stderr_ptr, raw.stderr_len);
        if !raw.result_ptr.is_null() {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                raw.result_ptr.cast_mut(),
                raw.result_len,
            )));
        }
        free_c_str(raw.exit_info.exit_message);
    }
    raw.stdout_ptr = ptr::null();
    raw.stderr_ptr = ptr::null();
    raw.result_ptr = ptr::null();
    raw.exit_info.exit_message = ptr::null();
    LIVE_RESULTS.fetch_sub(1, Ordering::SeqCst);
}

unsafe extern "C" fn free_results(results: *mut FfiVmResult, count: usize) {
    if results.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(results, count)) });
    LIVE_ARRAYS.fetch_sub(1, Ordering::SeqCst);
}

unsafe extern "C" fn cache_info(cache_root: *const c_char) -> FfiCacheInfo {
    let root = unsafe { read_c_str(cache_root) };
    let dirs = Path::new(&root).join("wasm_cache");

    LIVE_CACHE_INFOS.fetch_add(1, Ordering::SeqCst);
    FfiCacheInfo {
        cache_dirs: raw_string(dirs.to_string_lossy().into_owned()),
        version_name: raw_string(MOCK_VERSION),
    }
}

unsafe extern "C" fn free_cache_info(info: *mut FfiCacheInfo) {
    let Some(info) = (unsafe { info.as_mut() }) else {
        return;
    };
    unsafe {
        free_c_str(info.cache_dirs);
        free_c_str(info.version_name);
    }
    info.cache_dirs = ptr::null();
    info.version_name = ptr::null();
    LIVE_CACHE_INFOS.fetch_sub(1, Ordering::SeqCst);
}
