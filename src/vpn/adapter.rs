//! Wintun virtual network adapter
//!
//! Owns the TUN adapter and its packet-ring session. Addressing, routes and
//! DNS are applied elsewhere through the IP Helper surface; this module only
//! deals with the adapter object and packet I/O.
//!
//! REQUIREMENTS:
//! - wintun.dll must be present next to the executable (or on the loader path)
//! - Administrator privileges are required to create the adapter

use std::path::PathBuf;
use std::sync::Arc;

use wintun::{Adapter, Session};

use super::{VpnError, VpnResult};

/// Wintun tunnel type for adapters we create
const TUNNEL_TYPE: &str = "TunForge";

/// Ring buffer capacity for the Wintun session
pub const RING_CAPACITY: u32 = 0x400000; // 4MB

/// Find the wintun.dll file
///
/// Searches in the following order:
/// 1. Same directory as the executable
/// 2. Current working directory
fn find_wintun_dll() -> Option<PathBuf> {
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let dll_path = exe_dir.join("wintun.dll");
            if dll_path.exists() {
                return Some(dll_path);
            }
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        let dll_path = cwd.join("wintun.dll");
        if dll_path.exists() {
            return Some(dll_path);
        }
    }

    None
}

/// Load the wintun driver DLL. Done once, before any adapter work, so a
/// missing driver fails the startup before host state is touched.
pub fn load_driver() -> VpnResult<wintun::Wintun> {
    let result = match find_wintun_dll() {
        Some(path) => {
            log::info!("Found wintun.dll at: {}", path.display());
            unsafe { wintun::load_from_path(&path) }
        }
        // Fall back to the default loader search path
        None => unsafe { wintun::load() },
    };

    result.map_err(|e| {
        VpnError::Adapter(format!(
            "Failed to load wintun.dll: {}. Ensure the DLL matches your system architecture.",
            e
        ))
    })
}

/// Wrapper for the Wintun adapter and its session
pub struct TunAdapter {
    adapter: Arc<Adapter>,
    session: Option<Arc<Session>>,
    name: String,
}

impl TunAdapter {
    /// Open an adapter with the given name, creating it if none exists.
    pub fn open_or_create(wintun: &wintun::Wintun, name: &str) -> VpnResult<Self> {
        let adapter = match Adapter::open(wintun, name) {
            Ok(adapter) => {
                log::info!("Adapter opened: {}", name);
                adapter
            }
            Err(_) => {
                let adapter = Adapter::create(wintun, name, TUNNEL_TYPE, None).map_err(|e| {
                    VpnError::Adapter(format!("Failed to create adapter '{}': {}", name, e))
                })?;
                log::info!("Adapter created: {}", name);
                adapter
            }
        };

        Ok(Self {
            adapter,
            session: None,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS-assigned locally-unique interface identifier.
    pub fn luid(&self) -> u64 {
        let luid = self.adapter.get_luid();
        unsafe { luid.Value }
    }

    /// Start the packet-ring session.
    pub fn start_session(&mut self) -> VpnResult<Arc<Session>> {
        let session = self
            .adapter
            .start_session(RING_CAPACITY)
            .map_err(|e| VpnError::Adapter(format!("Failed to start session: {}", e)))?;
        let session = Arc::new(session);
        self.session = Some(Arc::clone(&session));
        log::info!("Session started (ring=0x{:X})", RING_CAPACITY);
        Ok(session)
    }

    /// End the packet-ring session; pending blocking reads are released.
    pub fn end_session(&mut self) {
        if let Some(session) = self.session.take() {
            log::debug!("Ending session");
            let _ = session.shutdown();
        }
    }
}

impl Drop for TunAdapter {
    fn drop(&mut self) {
        log::info!("Closing adapter: {}", self.name);
        self.end_session();
        // The adapter itself is closed when the last Arc drops.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_capacity_is_power_of_two() {
        // Wintun requires a power-of-two ring between 128KB and 64MB
        assert!(RING_CAPACITY.is_power_of_two());
        assert!(RING_CAPACITY >= 0x20000);
        assert!(RING_CAPACITY <= 0x4000000);
    }

    #[test]
    fn test_dll_search_never_panics() {
        // Must tolerate arbitrary cwd/exe layouts
        let _ = find_wintun_dll();
    }
}
