//! C FFI interface.
//!
//! All payloads cross the boundary as NUL-terminated JSON strings.
//! Naming convention: rexec_<module>_<action>

use crate::connection::Connection;
use crate::error::ConnectionError;
use crate::local::{CommandError, LocalCommand};
use crate::resolve::{resolve_connection, StaticResolver};
use anyhow::Context;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::OnceLock;

/// Global tokio runtime for async command execution.
fn runtime() -> &'static tokio::runtime::Runtime {
    static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("Failed to create tokio runtime")
    })
}

/// Borrow a C string as UTF-8. Returns `None` for null or invalid input.
fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr).to_str().ok() }
}

/// Hand a string to the caller. A string with an interior NUL cannot cross
/// the boundary and is replaced by an error document.
fn into_c_string(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(e) => {
            log::error!("Result contains a NUL byte at {}", e.nul_position());
            let err = serde_json::json!({ "error": "result contains a NUL byte" });
            CString::new(err.to_string())
                .map(CString::into_raw)
                .unwrap_or(std::ptr::null_mut())
        }
    }
}

fn error_json(message: String) -> serde_json::Value {
    serde_json::json!({ "error": message })
}

// ═══════════════════════════════════════════════════════════
// Connection FFI
// ═══════════════════════════════════════════════════════════

/// Parse a connection document and return it with defaults applied.
/// Returns null on failure.
/// Caller must free the returned string with rexec_string_free.
#[no_mangle]
pub extern "C" fn rexec_connection_normalize(json: *const c_char) -> *mut c_char {
    let Some(json) = c_str(json) else {
        return std::ptr::null_mut();
    };

    match Connection::from_json(json).and_then(|conn| conn.to_json()) {
        Ok(normalized) => into_c_string(normalized),
        Err(e) => {
            log::error!("Invalid connection: {}", e);
            std::ptr::null_mut()
        }
    }
}

/// Validate a connection document.
/// Returns 0 if valid, 1 if a required field is missing, -1 on any other error.
#[no_mangle]
pub extern "C" fn rexec_connection_check(json: *const c_char) -> i32 {
    let Some(json) = c_str(json) else {
        return -1;
    };

    match Connection::from_json(json) {
        Ok(_) => 0,
        Err(ConnectionError::MissingRequiredField { field }) => {
            log::warn!("Connection is missing `{}`", field);
            1
        }
        Err(e) => {
            log::error!("Invalid connection: {}", e);
            -1
        }
    }
}

/// Resolve the deferred values of a connection document.
/// `values_json` maps deferred ids to their values, e.g. {"vm.ip": "10.0.0.5"}.
/// Returns the resolved connection JSON, or {"error": "..."} on failure.
/// Caller must free with rexec_string_free.
#[no_mangle]
pub extern "C" fn rexec_connection_resolve(
    json: *const c_char,
    values_json: *const c_char,
) -> *mut c_char {
    let (Some(json), Some(values_json)) = (c_str(json), c_str(values_json)) else {
        return std::ptr::null_mut();
    };

    let result = (|| -> anyhow::Result<String> {
        let conn = Connection::from_json(json)?;
        let values: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(values_json).context("invalid deferred values")?;
        let resolver: StaticResolver = values.into_iter().collect();
        let resolved = runtime().block_on(resolve_connection(&conn, &resolver))?;
        Ok(serde_json::to_string(&resolved)?)
    })();

    match result {
        Ok(resolved) => into_c_string(resolved),
        Err(e) => {
            log::warn!("Failed to resolve connection: {:#}", e);
            into_c_string(error_json(format!("{:#}", e)).to_string())
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Local command FFI
// ═══════════════════════════════════════════════════════════

/// Run the create step of a local command.
/// Returns JSON: {"stdout": "...", "stderr": "...", "id": "..."} on success,
/// {"error": "...", "exit_code": N, "stderr": "..."} on failure.
/// Caller must free with rexec_string_free.
#[no_mangle]
pub extern "C" fn rexec_local_run(json: *const c_char) -> *mut c_char {
    let Some(json) = c_str(json) else {
        return std::ptr::null_mut();
    };

    let command = match LocalCommand::from_json(json) {
        Ok(command) => command,
        Err(e) => {
            log::error!("Invalid local command: {:#}", e);
            return into_c_string(error_json(format!("{:#}", e)).to_string());
        }
    };

    let result = match runtime().block_on(command.run_create()) {
        Ok(output) => match serde_json::to_value(&output) {
            Ok(value) => value,
            Err(e) => {
                log::error!("Failed to encode command output: {}", e);
                error_json(e.to_string())
            }
        },
        Err(e) => {
            log::error!("Local command failed: {:#}", e);
            match e.downcast_ref::<CommandError>() {
                Some(CommandError::Failed { code, stderr, .. }) => serde_json::json!({
                    "error": e.to_string(),
                    "exit_code": code.unwrap_or(-1),
                    "stderr": stderr,
                }),
                None => error_json(format!("{:#}", e)),
            }
        }
    };

    into_c_string(result.to_string())
}

// ═══════════════════════════════════════════════════════════
// Utility FFI
// ═══════════════════════════════════════════════════════════

/// Free a string allocated by Rust.
#[no_mangle]
pub extern "C" fn rexec_string_free(s: *mut c_char) {
    if !s.is_null() {
        unsafe {
            drop(CString::from_raw(s));
        }
    }
}

/// Initialize the Rust logger.
#[no_mangle]
pub extern "C" fn rexec_init() {
    let _ = env_logger::try_init();
    log::info!("rexec core initialized");
}
