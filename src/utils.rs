//! Utility functions for TunForge

use std::collections::BTreeSet;
use std::net::ToSocketAddrs;

/// Check if the current process has administrator privileges
///
/// Returns true if running with elevated privileges, false otherwise.
pub fn is_administrator() -> bool {
    unsafe {
        use windows::Win32::Foundation::CloseHandle;
        use windows::Win32::Security::{
            GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
        };
        use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

        let mut token_handle = windows::Win32::Foundation::HANDLE::default();

        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token_handle).is_err() {
            return false;
        }

        let mut elevation = TOKEN_ELEVATION::default();
        let mut return_length: u32 = 0;

        let result = GetTokenInformation(
            token_handle,
            TokenElevation,
            Some(&mut elevation as *mut _ as *mut std::ffi::c_void),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut return_length,
        );

        let _ = CloseHandle(token_handle);

        if result.is_ok() {
            elevation.TokenIsElevated != 0
        } else {
            false
        }
    }
}

/// Absolute path of the running executable, via `GetModuleFileNameW`.
///
/// Grows the buffer once (MAX_PATH -> 4096); paths longer than that fail.
pub fn module_path() -> Result<String, String> {
    use windows::Win32::Foundation::MAX_PATH;
    use windows::Win32::System::LibraryLoader::GetModuleFileNameW;

    let mut buf = vec![0u16; MAX_PATH as usize];
    let mut n = unsafe { GetModuleFileNameW(None, &mut buf) } as usize;
    if n == 0 {
        return Err("GetModuleFileNameW failed".to_string());
    }
    if n >= buf.len() {
        buf = vec![0u16; 4096];
        n = unsafe { GetModuleFileNameW(None, &mut buf) } as usize;
        if n == 0 || n >= buf.len() {
            return Err("GetModuleFileNameW failed (long path)".to_string());
        }
    }
    Ok(String::from_utf16_lossy(&buf[..n]))
}

/// Strip surrounding square brackets from an IPv6-style host string.
pub fn strip_brackets(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('[') && s.ends_with(']') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Null-terminated UTF-16 for Win32 wide-string parameters.
pub fn to_utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Resolve a server host to the CSV of its addresses for the firewall
/// RemoteAddresses field.
///
/// Every resolved address is kept, deduplicated and comma-joined. When
/// resolution fails or produces nothing, the bracket-stripped literal is
/// returned so the rule still names the intended peer.
pub fn resolve_firewall_addresses(host: &str) -> String {
    let host = strip_brackets(host);
    log::debug!("Resolving server addresses for: {}", host);

    let resolved = (host, 0u16).to_socket_addrs();
    let addrs: BTreeSet<String> = match resolved {
        Ok(iter) => iter.map(|sa| sa.ip().to_string()).collect(),
        Err(e) => {
            log::warn!("Resolution failed for '{}' ({}); using literal", host, e);
            return host.to_string();
        }
    };

    if addrs.is_empty() {
        log::warn!("Resolution produced no addresses for '{}'; using literal", host);
        return host.to_string();
    }

    addrs.into_iter().collect::<Vec<_>>().join(",")
}

/// Maximum log file size before rotation (1MB)
const MAX_LOG_SIZE: u64 = 1024 * 1024;

/// Rotate a log file if it exceeds the size limit.
///
/// The current log is renamed to `.old` (replacing any previous one) so a
/// fresh file starts on the next open.
pub fn rotate_log_if_needed(log_path: &std::path::Path) -> std::io::Result<()> {
    let metadata = match std::fs::metadata(log_path) {
        Ok(m) => m,
        Err(_) => return Ok(()), // No log yet
    };

    if metadata.len() > MAX_LOG_SIZE {
        let old_path = log_path.with_extension("log.old");
        let _ = std::fs::remove_file(&old_path);
        std::fs::rename(log_path, &old_path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_brackets() {
        assert_eq!(strip_brackets("[fd00::1]"), "fd00::1");
        assert_eq!(strip_brackets("fd00::1"), "fd00::1");
        assert_eq!(strip_brackets("198.51.100.7"), "198.51.100.7");
        assert_eq!(strip_brackets(""), "");
        assert_eq!(strip_brackets("["), "[");
    }

    #[test]
    fn test_to_utf16_null_terminated() {
        let w = to_utf16("ab");
        assert_eq!(w, vec![97, 98, 0]);
    }

    #[test]
    fn test_resolve_literal_v4() {
        // Address literals resolve to themselves without touching a resolver
        assert_eq!(resolve_firewall_addresses("192.0.2.7"), "192.0.2.7");
    }

    #[test]
    fn test_resolve_literal_v6_brackets() {
        assert_eq!(resolve_firewall_addresses("[2001:db8::1]"), "2001:db8::1");
    }

    #[test]
    fn test_resolve_unresolvable_falls_back_to_literal() {
        let out = resolve_firewall_addresses("host.invalid");
        assert_eq!(out, "host.invalid");
    }
}
