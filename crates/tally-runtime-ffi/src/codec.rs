//! Boundary codec.
//!
//! Encoding produces values that own every allocation handed to the engine;
//! dropping them releases everything, on success, error or unwind alike.
//! Decoding copies engine-owned memory into caller-owned values and then
//! releases the engine's buffers through the paired free symbol exactly once.

#![allow(unsafe_code)]

use std::ffi::{CStr, CString, c_char};
use std::path::Path;
use std::{ptr, slice};

use tracing::warn;

use tally_runtime_common::types::EXIT_FAILURE;
use tally_runtime_common::{
    CacheInfo, EncodeError, ExecutionRequest, ExecutionResult, ExecutionSettings, ExitInfo,
};

use crate::abi::{
    FfiCacheInfo, FfiTallyRequest, FfiVmResult, FfiVmSettings, FreeCacheInfoFn, FreeResultFn,
    FreeResultsFn,
};

/// Settings in their boundary representation.
#[derive(Debug)]
pub struct EncodedSettings {
    cache_root: CString,
    max_result_bytes: usize,
    max_stdout_bytes: usize,
    max_stderr_bytes: usize,
}

impl EncodedSettings {
    /// Encode settings for one or more engine calls.
    pub fn encode(settings: &ExecutionSettings) -> Result<Self, EncodeError> {
        Ok(Self {
            cache_root: encode_path(&settings.cache_root, "cache root")?,
            max_result_bytes: settings.max_result_bytes,
            max_stdout_bytes: settings.max_stdout_bytes,
            max_stderr_bytes: settings.max_stderr_bytes,
        })
    }

    /// Borrow as the ABI struct. Valid while `self` is alive.
    pub fn as_ffi(&self) -> FfiVmSettings {
        FfiVmSettings {
            cache_root: self.cache_root.as_ptr(),
            max_result_bytes: self.max_result_bytes,
            max_stdout_bytes: self.max_stdout_bytes,
            max_stderr_bytes: self.max_stderr_bytes,
        }
    }
}

/// A request in its boundary representation.
///
/// The payload is borrowed from the caller for `'a`; argument and
/// environment strings are copied into owned C strings.
#[derive(Debug)]
pub struct EncodedRequest<'a> {
    payload: &'a [u8],
    _args: Vec<CString>,
    _env_keys: Vec<CString>,
    _env_values: Vec<CString>,
    arg_ptrs: Vec<*const c_char>,
    env_key_ptrs: Vec<*const c_char>,
    env_value_ptrs: Vec<*const c_char>,
}

impl<'a> EncodedRequest<'a> {
    /// Encode a request.
    ///
    /// Environment entries keep their key/value pairing by index; the order
    /// of pairs follows the map's iteration and carries no meaning.
    pub fn encode(request: &'a ExecutionRequest) -> Result<Self, EncodeError> {
        let args = request
            .arguments
            .iter()
            .enumerate()
            .map(|(i, arg)| to_c_string(arg, || format!("argument {i}")))
            .collect::<Result<Vec<_>, _>>()?;

        let mut env_keys = Vec::with_capacity(request.environment.len());
        let mut env_values = Vec::with_capacity(request.environment.len());
        for (key, value) in &request.environment {
            env_keys.push(to_c_string(key, || format!("env key {key:?}"))?);
            env_values.push(to_c_string(value, || format!("env value for {key:?}"))?);
        }

        Ok(Self {
            payload: &request.payload,
            arg_ptrs: pointers(&args),
            env_key_ptrs: pointers(&env_keys),
            env_value_ptrs: pointers(&env_values),
            _args: args,
            _env_keys: env_keys,
            _env_values: env_values,
        })
    }

    /// Borrow as the ABI struct. Valid while `self` is alive.
    pub fn as_ffi(&self) -> FfiTallyRequest {
        FfiTallyRequest {
            wasm_bytes: if self.payload.is_empty() {
                ptr::null()
            } else {
                self.payload.as_ptr()
            },
            wasm_bytes_len: self.payload.len(),
            args_ptr: array_or_null(&self.arg_ptrs),
            args_count: self.arg_ptrs.len(),
            env_keys_ptr: array_or_null(&self.env_key_ptrs),
            env_values_ptr: array_or_null(&self.env_value_ptrs),
            env_count: self.env_key_ptrs.len(),
        }
    }
}

/// Encode a filesystem path as a C string.
pub fn encode_path(path: &Path, field: &str) -> Result<CString, EncodeError> {
    to_c_string(&path.to_string_lossy(), || field.to_string())
}

fn to_c_string(value: &str, field: impl FnOnce() -> String) -> Result<CString, EncodeError> {
    CString::new(value).map_err(|e| EncodeError::interior_nul(field(), e.nul_position()))
}

fn pointers(strings: &[CString]) -> Vec<*const c_char> {
    strings.iter().map(|s| s.as_ptr()).collect()
}

fn array_or_null(ptrs: &[*const c_char]) -> *const *const c_char {
    if ptrs.is_empty() {
        ptr::null()
    } else {
        ptrs.as_ptr()
    }
}

/// An engine-owned result. Released exactly once when dropped.
pub struct OwnedResult {
    raw: FfiVmResult,
    free: FreeResultFn,
}

impl OwnedResult {
    /// Take ownership of a result returned by the engine.
    ///
    /// # Safety
    ///
    /// `raw` must come from the engine that exports `free`, and must not
    /// have been released yet.
    pub unsafe fn new(raw: FfiVmResult, free: FreeResultFn) -> Self {
        Self { raw, free }
    }

    /// Copy the result into caller-owned memory and release it.
    pub fn decode(self) -> ExecutionResult {
        // SAFETY: the raw result is live until `self` drops below.
        unsafe { copy_result(&self.raw) }
    }
}

impl Drop for OwnedResult {
    fn drop(&mut self) {
        // SAFETY: ownership was transferred in `new`; drop runs once.
        unsafe { (self.free)(&mut self.raw) };
    }
}

/// An engine-owned array of results from a batch call.
///
/// Every element is released with the per-result free symbol when dropped,
/// followed by the container when the engine exports a release for it.
pub struct ResultArray {
    ptr: *mut FfiVmResult,
    len: usize,
    free: FreeResultFn,
    free_array: Option<FreeResultsFn>,
}

impl ResultArray {
    /// Take ownership of a batch result array. Returns `None` for null.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must point to `len` live results allocated by the
    /// engine that exports `free` and `free_array`.
    pub unsafe fn new(
        ptr: *mut FfiVmResult,
        len: usize,
        free: FreeResultFn,
        free_array: Option<FreeResultsFn>,
    ) -> Option<Self> {
        if ptr.is_null() {
            return None;
        }
        Some(Self {
            ptr,
            len,
            free,
            free_array,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy every result into caller-owned memory, in index order, and
    /// release the array.
    pub fn decode_all(self) -> Vec<ExecutionResult> {
        (0..self.len)
            // SAFETY: index is in bounds and the array is live until drop.
            .map(|i| unsafe { copy_result(&*self.ptr.add(i)) })
            .collect()
    }
}

impl Drop for ResultArray {
    fn drop(&mut self) {
        for i in 0..self.len {
            // SAFETY: each element is released exactly once, here.
            unsafe { (self.free)(self.ptr.add(i)) };
        }
        if let Some(free_array) = self.free_array {
            // SAFETY: elements are released; the container is released once.
            unsafe { free_array(self.ptr, self.len) };
        }
    }
}

/// Engine-owned cache info. Released exactly once when dropped.
pub struct OwnedCacheInfo {
    raw: FfiCacheInfo,
    free: FreeCacheInfoFn,
}

impl OwnedCacheInfo {
    /// # Safety
    ///
    /// `raw` must come from the engine that exports `free`, and must not
    /// have been released yet.
    pub unsafe fn new(raw: FfiCacheInfo, free: FreeCacheInfoFn) -> Self {
        Self { raw, free }
    }

    /// Copy the cache info into caller-owned memory and release it.
    pub fn decode(self) -> CacheInfo {
        // SAFETY: the strings are live until `self` drops below.
        unsafe {
            CacheInfo {
                root_path: copy_c_str(self.raw.cache_dirs).into(),
                current_version: copy_c_str(self.raw.version_name),
            }
        }
    }
}

impl Drop for OwnedCacheInfo {
    fn drop(&mut self) {
        // SAFETY: ownership was transferred in `new`; drop runs once.
        unsafe { (self.free)(&mut self.raw) };
    }
}

/// Copy a raw result. Exit code 255 never surfaces result bytes.
///
/// # Safety
///
/// Every non-null pointer in `raw` must be valid for its reported length.
unsafe fn copy_result(raw: &FfiVmResult) -> ExecutionResult {
    let code = raw.exit_info.exit_code;

    unsafe {
        let result = (code != EXIT_FAILURE).then(|| copy_bytes(raw.result_ptr, raw.result_len));

        ExecutionResult {
            stdout: copy_lines(raw.stdout_ptr, raw.stdout_len, "stdout"),
            stderr: copy_lines(raw.stderr_ptr, raw.stderr_len, "stderr"),
            result,
            result_len: raw.result_len,
            exit: ExitInfo::new(copy_c_str(raw.exit_info.exit_message), code),
            gas_used: raw.gas_used,
        }
    }
}

unsafe fn copy_c_str(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

unsafe fn copy_bytes(ptr: *const u8, len: usize) -> Vec<u8> {
    if len == 0 {
        return Vec::new();
    }
    if ptr.is_null() {
        warn!(len, "Engine reported result bytes behind a null pointer");
        return Vec::new();
    }
    unsafe { slice::from_raw_parts(ptr, len) }.to_vec()
}

unsafe fn copy_lines(ptr: *const *const c_char, len: usize, stream: &'static str) -> Vec<String> {
    if len == 0 {
        return Vec::new();
    }
    if ptr.is_null() {
        warn!(stream, len, "Engine reported output lines behind a null pointer");
        return Vec::new();
    }
    unsafe { slice::from_raw_parts(ptr, len) }
        .iter()
        .map(|&line| unsafe { copy_c_str(line) })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::HashMap;

    use super::*;

    thread_local! {
        static FREED: Cell<usize> = const { Cell::new(0) };
    }

    unsafe extern "C" fn counting_free(raw: *mut FfiVmResult) {
        FREED.with(|f| f.set(f.get() + 1));
        unsafe { crate::mock::free_result(raw) };
    }

    unsafe fn read_strings(ptr: *const *const c_char, len: usize) -> Vec<String> {
        unsafe { slice::from_raw_parts(ptr, len) }
            .iter()
            .map(|&p| unsafe { copy_c_str(p) })
            .collect()
    }

    #[test]
    fn test_empty_request_encodes_to_nulls() {
        let request = ExecutionRequest::default();
        let encoded = EncodedRequest::encode(&request).unwrap();
        let raw = encoded.as_ffi();

        assert!(raw.wasm_bytes.is_null());
        assert_eq!(raw.wasm_bytes_len, 0);
        assert!(raw.args_ptr.is_null());
        assert_eq!(raw.args_count, 0);
        assert!(raw.env_keys_ptr.is_null());
        assert!(raw.env_values_ptr.is_null());
        assert_eq!(raw.env_count, 0);
    }

    #[test]
    fn test_encode_arguments_in_order() {
        let request = ExecutionRequest::new(vec![1, 2, 3]).with_args(["a", "bb", ""]);
        let encoded = EncodedRequest::encode(&request).unwrap();
        let raw = encoded.as_ffi();

        assert_eq!(raw.wasm_bytes, request.payload.as_ptr());
        assert_eq!(raw.wasm_bytes_len, 3);
        let args = unsafe { read_strings(raw.args_ptr, raw.args_count) };
        assert_eq!(args, vec!["a", "bb", ""]);
    }

    #[test]
    fn test_encode_env_preserves_pairing() {
        let request = ExecutionRequest::new(Vec::new())
            .with_env("ALPHA", "1")
            .with_env("BETA", "2")
            .with_env("GAMMA", "3");
        let encoded = EncodedRequest::encode(&request).unwrap();
        let raw = encoded.as_ffi();

        let keys = unsafe { read_strings(raw.env_keys_ptr, raw.env_count) };
        let values = unsafe { read_strings(raw.env_values_ptr, raw.env_count) };
        let decoded: HashMap<String, String> = keys.into_iter().zip(values).collect();

        assert_eq!(decoded, request.environment);
    }

    #[test]
    fn test_encode_rejects_interior_nul() {
        let request = ExecutionRequest::new(Vec::new()).with_args(["ok", "bad\0arg"]);
        let err = EncodedRequest::encode(&request).unwrap_err();
        assert_eq!(err, EncodeError::interior_nul("argument 1", 3));

        let request = ExecutionRequest::new(Vec::new()).with_env("KEY", "v\0");
        let err = EncodedRequest::encode(&request).unwrap_err();
        assert!(matches!(err, EncodeError::InteriorNul { position: 1, .. }));
    }

    #[test]
    fn test_encode_settings() {
        let settings = ExecutionSettings::new("/tmp/tally").with_output_limits(2, 3);
        let encoded = EncodedSettings::encode(&settings).unwrap();
        let raw = encoded.as_ffi();

        assert_eq!(unsafe { copy_c_str(raw.cache_root) }, "/tmp/tally");
        assert_eq!(raw.max_result_bytes, 1024);
        assert_eq!(raw.max_stdout_bytes, 2);
        assert_eq!(raw.max_stderr_bytes, 3);
    }

    #[test]
    fn test_decode_copies_and_frees_once() {
        let raw = crate::mock::build_result(
            vec!["out".into()],
            vec!["err".into()],
            Some(b"payload".to_vec()),
            "Ok",
            0,
            42,
        );
        FREED.with(|f| f.set(0));

        let result = unsafe { OwnedResult::new(raw, counting_free) }.decode();

        assert_eq!(FREED.with(Cell::get), 1);
        assert_eq!(result.stdout, vec!["out"]);
        assert_eq!(result.stderr, vec!["err"]);
        assert_eq!(result.result.as_deref(), Some(&b"payload"[..]));
        assert_eq!(result.result_len, 7);
        assert_eq!(result.exit, ExitInfo::new("Ok", 0));
        assert_eq!(result.gas_used, 42);
    }

    #[test]
    fn test_decode_suppresses_result_on_255() {
        let raw = crate::mock::build_result(
            Vec::new(),
            Vec::new(),
            Some(b"should not surface".to_vec()),
            "Not ok",
            255,
            7,
        );

        let result = unsafe { OwnedResult::new(raw, crate::mock::free_result) }.decode();

        assert!(result.result.is_none());
        assert_eq!(result.result_len, 18);
        assert_eq!(result.gas_used, 7);
    }

    #[test]
    fn test_decode_empty_result_is_present_on_success() {
        let raw = crate::mock::build_result(Vec::new(), Vec::new(), None, "Ok", 0, 1);

        let result = unsafe { OwnedResult::new(raw, crate::mock::free_result) }.decode();

        assert_eq!(result.result, Some(Vec::new()));
        assert_eq!(result.result_len, 0);
        assert!(result.stdout.is_empty());
    }

    #[test]
    fn test_dropping_undecoded_result_still_frees() {
        let raw = crate::mock::build_result(vec!["x".into()], Vec::new(), None, "Ok", 0, 1);
        FREED.with(|f| f.set(0));

        drop(unsafe { OwnedResult::new(raw, counting_free) });

        assert_eq!(FREED.with(Cell::get), 1);
    }

    #[test]
    fn test_null_result_array_releases_nothing() {
        unsafe extern "C" fn counting_free_array(_results: *mut FfiVmResult, _count: usize) {
            FREED.with(|f| f.set(f.get() + 1));
        }
        FREED.with(|f| f.set(0));

        let array = unsafe {
            ResultArray::new(ptr::null_mut(), 3, counting_free, Some(counting_free_array))
        };

        assert!(array.is_none());
        assert_eq!(FREED.with(Cell::get), 0);
    }
}
