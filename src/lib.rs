//! TunForge client library
//!
//! Split-tunnel VPN client orchestrator for Windows. The crate exposes the
//! lifecycle both as a Rust API (`vpn::client_start` and friends) and as a
//! C ABI (`Start`/`Stop`/`IsRunning`) for host applications embedding the
//! client as a DLL.

pub mod utils;
pub mod vpn;

// Re-export commonly used items
pub use utils::is_administrator;
pub use vpn::{VpnError, VpnResult};

use std::ffi::{c_char, CStr};

/// Start the client with a JSON config.
///
/// Returns 0 on success, -1 when already running (or on unusable input).
/// The config string is copied before this returns.
///
/// # Safety
/// `config` must be a valid NUL-terminated C string or null.
#[no_mangle]
pub unsafe extern "C" fn Start(config: *const c_char) -> i32 {
    if config.is_null() {
        log::error!("Start called with null config");
        return -1;
    }
    let text = CStr::from_ptr(config).to_string_lossy();
    vpn::client_start(&text)
}

/// Request a cooperative stop. Returns 0, or -2 when not running.
/// Never blocks the caller.
#[no_mangle]
pub extern "C" fn Stop() -> i32 {
    vpn::client_stop()
}

/// 1 while the client worker is running, 0 otherwise.
#[no_mangle]
pub extern "C" fn IsRunning() -> i32 {
    vpn::is_client_running()
}
