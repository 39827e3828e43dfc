//! Transport plugin loading
//!
//! The wire protocol is a black box behind five exported C symbols. The
//! loader resolves all five or fails; a plugin missing any entry point is
//! unusable and the library is freed immediately.
//!
//! The serve entry points receive two packet callbacks and a pointer to a
//! one-byte stop flag. The flag is read-only for the plugin; it must return
//! promptly once the flag reads zero.

use std::ffi::{c_char, c_void, CString};

use windows::core::{PCSTR, PCWSTR};
use windows::Win32::Foundation::{FreeLibrary, HMODULE};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};

use super::{VpnError, VpnResult};
use crate::utils::to_utf16;

/// Fills `buf` with the next IP frame captured from the adapter.
/// Returns 0 when no packet is pending, -1 on oversized, else bytes written.
pub type ReceiveCallback = unsafe extern "C" fn(buf: *mut u8, len: usize) -> isize;

/// Consumes a decoded IP frame and pushes it into the adapter.
/// Returns bytes accepted, or 0 when the frame was dropped.
pub type SendCallback = unsafe extern "C" fn(buf: *const u8, len: usize) -> isize;

type ConnectFn = unsafe extern "C" fn(config: *const c_char) -> bool;
type DisconnectFn = unsafe extern "C" fn();
type ServeFn = unsafe extern "C" fn(ReceiveCallback, SendCallback, *const u8) -> i32;

/// Loaded transport plugin with its five resolved entry points.
pub struct TransportPlugin {
    module: usize,
    client_connect: ConnectFn,
    client_disconnect: DisconnectFn,
    client_serve: ServeFn,
    server_bind: ConnectFn,
    server_serve: ServeFn,
}

// The module handle is only used for FreeLibrary; entry points are plain
// function pointers.
unsafe impl Send for TransportPlugin {}

fn resolve(module: HMODULE, name: &'static [u8]) -> VpnResult<unsafe extern "system" fn() -> isize> {
    unsafe { GetProcAddress(module, PCSTR(name.as_ptr())) }.ok_or_else(|| {
        VpnError::Plugin(format!(
            "plugin missing required symbol '{}'",
            String::from_utf8_lossy(&name[..name.len() - 1])
        ))
    })
}

impl TransportPlugin {
    /// Load the plugin DLL and resolve every entry point.
    pub fn load(path: &str) -> VpnResult<Self> {
        log::debug!("Loading plugin: {}", path);
        let wide = to_utf16(path);
        let module = unsafe { LoadLibraryW(PCWSTR(wide.as_ptr())) }
            .map_err(|e| VpnError::Plugin(format!("failed to load plugin '{}': {}", path, e)))?;

        let resolved = (|| {
            Ok::<_, VpnError>((
                resolve(module, b"Client_Connect\0")?,
                resolve(module, b"Client_Disconnect\0")?,
                resolve(module, b"Client_Serve\0")?,
                resolve(module, b"Server_Bind\0")?,
                resolve(module, b"Server_Serve\0")?,
            ))
        })();

        let (connect, disconnect, serve, bind, server_serve) = match resolved {
            Ok(fns) => fns,
            Err(e) => {
                unsafe {
                    let _ = FreeLibrary(module);
                }
                return Err(e);
            }
        };

        log::info!("Plugin loaded: {}", path);
        unsafe {
            Ok(Self {
                module: module.0 as usize,
                client_connect: std::mem::transmute::<unsafe extern "system" fn() -> isize, ConnectFn>(connect),
                client_disconnect: std::mem::transmute::<unsafe extern "system" fn() -> isize, DisconnectFn>(disconnect),
                client_serve: std::mem::transmute::<unsafe extern "system" fn() -> isize, ServeFn>(serve),
                server_bind: std::mem::transmute::<unsafe extern "system" fn() -> isize, ConnectFn>(bind),
                server_serve: std::mem::transmute::<unsafe extern "system" fn() -> isize, ServeFn>(server_serve),
            })
        }
    }

    /// Hand the config JSON to the plugin and connect its transport.
    pub fn client_connect(&self, config_json: &str) -> VpnResult<bool> {
        let config = CString::new(config_json)
            .map_err(|_| VpnError::Plugin("config contains a NUL byte".into()))?;
        Ok(unsafe { (self.client_connect)(config.as_ptr()) })
    }

    pub fn client_disconnect(&self) {
        unsafe { (self.client_disconnect)() }
    }

    /// Run the plugin's blocking serve loop. Returns its exit code.
    pub fn client_serve(
        &self,
        receive_from_net: ReceiveCallback,
        send_to_net: SendCallback,
        working_flag: *const u8,
    ) -> i32 {
        unsafe { (self.client_serve)(receive_from_net, send_to_net, working_flag) }
    }

    pub fn server_bind(&self, config_json: &str) -> VpnResult<bool> {
        let config = CString::new(config_json)
            .map_err(|_| VpnError::Plugin("config contains a NUL byte".into()))?;
        Ok(unsafe { (self.server_bind)(config.as_ptr()) })
    }

    pub fn server_serve(
        &self,
        receive_from_net: ReceiveCallback,
        send_to_net: SendCallback,
        working_flag: *const u8,
    ) -> i32 {
        unsafe { (self.server_serve)(receive_from_net, send_to_net, working_flag) }
    }
}

impl Drop for TransportPlugin {
    fn drop(&mut self) {
        log::debug!("Unloading plugin");
        unsafe {
            let _ = FreeLibrary(HMODULE(self.module as *mut c_void));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_plugin_fails() {
        let err = TransportPlugin::load(r".\does-not-exist-tunforge.dll");
        assert!(err.is_err());
    }

    #[test]
    fn test_load_library_without_symbols_fails() {
        // Any system DLL loads fine but lacks the transport entry points
        let err = TransportPlugin::load("kernel32.dll");
        match err {
            Err(VpnError::Plugin(msg)) => assert!(msg.contains("Client_Connect")),
            other => panic!("expected missing-symbol error, got {:?}", other.map(|_| ())),
        }
    }
}
