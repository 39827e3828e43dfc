//! Per-interface DNS override via the resolver registry
//!
//! Writes the `NameServer` value under the interface's GUID key for each
//! address family present in the configured server list, remembering the
//! prior value so revert restores it exactly (or deletes the value if it
//! was absent). The resolver cache is flushed after both apply and revert;
//! flush failures are only warnings since cache contents are ephemeral.

use std::net::{Ipv4Addr, Ipv6Addr};

use windows::core::{GUID, PCSTR, PCWSTR};
use windows::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_SUCCESS, NO_ERROR};
use windows::Win32::NetworkManagement::IpHelper::ConvertInterfaceLuidToGuid;
use windows::Win32::System::LibraryLoader::{FreeLibrary, GetProcAddress, LoadLibraryW};
use windows::Win32::System::Registry::{
    RegCloseKey, RegDeleteValueW, RegOpenKeyExW, RegQueryValueExW, RegSetValueExW, HKEY,
    HKEY_LOCAL_MACHINE, KEY_QUERY_VALUE, KEY_SET_VALUE, KEY_WOW64_64KEY, REG_SZ, REG_VALUE_TYPE,
};

use super::network::luid_of;
use super::{VpnError, VpnResult};
use crate::utils::to_utf16;

const TCPIP_INTERFACES: &str = r"SYSTEM\CurrentControlSet\Services\Tcpip\Parameters\Interfaces\";
const TCPIP6_INTERFACES: &str = r"SYSTEM\CurrentControlSet\Services\Tcpip6\Parameters\Interfaces\";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DnsFamily {
    V4,
    V6,
}

impl DnsFamily {
    fn base_path(self) -> &'static str {
        match self {
            DnsFamily::V4 => TCPIP_INTERFACES,
            DnsFamily::V6 => TCPIP6_INTERFACES,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            DnsFamily::V4 => "v4",
            DnsFamily::V6 => "v6",
        }
    }
}

/// Split a server list into v4 and v6 literals. Any entry that parses as
/// neither aborts the whole operation before a single registry write.
pub fn partition_families(servers: &[String]) -> VpnResult<(Vec<String>, Vec<String>)> {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for server in servers {
        if server.parse::<Ipv4Addr>().is_ok() {
            v4.push(server.clone());
        } else if server.parse::<Ipv6Addr>().is_ok() {
            v6.push(server.clone());
        } else {
            return Err(VpnError::InvalidArgument(format!(
                "invalid DNS address: {}",
                server
            )));
        }
    }
    Ok((v4, v6))
}

/// Registry-style GUID string for an interface LUID: `{XXXXXXXX-....}`.
pub fn format_guid(guid: &GUID) -> String {
    format!(
        "{{{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
        guid.data1,
        guid.data2,
        guid.data3,
        guid.data4[0],
        guid.data4[1],
        guid.data4[2],
        guid.data4[3],
        guid.data4[4],
        guid.data4[5],
        guid.data4[6],
        guid.data4[7]
    )
}

fn luid_to_guid_string(luid: u64) -> VpnResult<String> {
    let mut guid = GUID::zeroed();
    let rc = unsafe { ConvertInterfaceLuidToGuid(&luid_of(luid), &mut guid) };
    if rc != NO_ERROR {
        return Err(VpnError::Dns(format!(
            "ConvertInterfaceLuidToGuid failed rc={}",
            rc.0
        )));
    }
    Ok(format_guid(&guid))
}

fn open_interface_key(family: DnsFamily, guid_str: &str, access_write: bool) -> VpnResult<HKEY> {
    let path = format!("{}{}", family.base_path(), guid_str);
    let wide = to_utf16(&path);
    let access = if access_write { KEY_SET_VALUE } else { KEY_QUERY_VALUE };

    let mut hkey = HKEY::default();
    let rc = unsafe {
        RegOpenKeyExW(
            HKEY_LOCAL_MACHINE,
            PCWSTR(wide.as_ptr()),
            0,
            access | KEY_WOW64_64KEY,
            &mut hkey,
        )
    };
    if rc != ERROR_SUCCESS {
        return Err(VpnError::Dns(format!(
            "RegOpenKeyExW failed rc={} path={}",
            rc.0, path
        )));
    }
    Ok(hkey)
}

/// Write (or delete, for an empty value) the NameServer value of an open
/// interface key.
fn write_name_server(hkey: HKEY, value: &str) -> VpnResult<()> {
    let name = to_utf16("NameServer");
    if value.is_empty() {
        log::debug!("Deleting NameServer value");
        let rc = unsafe { RegDeleteValueW(hkey, PCWSTR(name.as_ptr())) };
        if rc == ERROR_SUCCESS || rc == ERROR_FILE_NOT_FOUND {
            return Ok(());
        }
        return Err(VpnError::Dns(format!(
            "RegDeleteValueW(NameServer) failed rc={}",
            rc.0
        )));
    }

    log::debug!("Setting NameServer to '{}'", value);
    let wide = to_utf16(value);
    let bytes = unsafe {
        std::slice::from_raw_parts(wide.as_ptr() as *const u8, wide.len() * 2)
    };
    let rc = unsafe {
        RegSetValueExW(hkey, PCWSTR(name.as_ptr()), 0, REG_SZ, Some(bytes))
    };
    if rc != ERROR_SUCCESS {
        return Err(VpnError::Dns(format!(
            "RegSetValueExW(NameServer) failed rc={}",
            rc.0
        )));
    }
    Ok(())
}

/// Read the NameServer value for a family; None when the value is absent.
fn read_name_server(family: DnsFamily, guid_str: &str) -> VpnResult<Option<String>> {
    let hkey = open_interface_key(family, guid_str, false)?;
    let name = to_utf16("NameServer");

    let mut vtype = REG_VALUE_TYPE::default();
    let mut bytes: u32 = 0;
    let rc = unsafe {
        RegQueryValueExW(
            hkey,
            PCWSTR(name.as_ptr()),
            None,
            Some(&mut vtype),
            None,
            Some(&mut bytes),
        )
    };
    if rc == ERROR_FILE_NOT_FOUND {
        unsafe { let _ = RegCloseKey(hkey); };
        log::trace!("NameServer not present ({})", family.tag());
        return Ok(None);
    }
    if rc != ERROR_SUCCESS || vtype != REG_SZ || bytes == 0 {
        unsafe { let _ = RegCloseKey(hkey); };
        return Err(VpnError::Dns(format!(
            "RegQueryValueExW(NameServer) failed rc={}",
            rc.0
        )));
    }

    let mut buf = vec![0u16; (bytes as usize).div_ceil(2)];
    let rc = unsafe {
        RegQueryValueExW(
            hkey,
            PCWSTR(name.as_ptr()),
            None,
            Some(&mut vtype),
            Some(buf.as_mut_ptr() as *mut u8),
            Some(&mut bytes),
        )
    };
    unsafe { let _ = RegCloseKey(hkey); };
    if rc != ERROR_SUCCESS || vtype != REG_SZ {
        return Err(VpnError::Dns(format!(
            "RegQueryValueExW(NameServer #2) failed rc={}",
            rc.0
        )));
    }

    while buf.last() == Some(&0) {
        buf.pop();
    }
    let value = String::from_utf16_lossy(&buf);
    log::debug!("NameServer present ({}), len={}", family.tag(), value.len());
    Ok(Some(value))
}

/// Flush the OS resolver cache via the dynamically-loaded DNS flush entry
/// point. Best effort.
pub fn flush_resolver_cache() {
    type FlushFn = unsafe extern "system" fn() -> i32;

    let dnsapi = match unsafe { LoadLibraryW(PCWSTR(to_utf16("dnsapi.dll").as_ptr())) } {
        Ok(h) => h,
        Err(e) => {
            log::warn!("LoadLibraryW(dnsapi.dll) failed: {}", e);
            return;
        }
    };
    match unsafe { GetProcAddress(dnsapi, PCSTR(b"DnsFlushResolverCache\0".as_ptr())) } {
        Some(proc_addr) => {
            let flush: FlushFn = unsafe { std::mem::transmute(proc_addr) };
            unsafe { flush() };
            log::debug!("Resolver cache flushed");
        }
        None => log::warn!("DnsFlushResolverCache not found in dnsapi.dll"),
    }
    unsafe { let _ = FreeLibrary(dnsapi); };
}

/// Scoped DNS override for one interface. Reverted explicitly or on Drop.
pub struct DnsOverride {
    luid: u64,
    guid_str: Option<String>,
    applied: bool,
    touched_v4: bool,
    touched_v6: bool,
    prev_v4: Option<String>,
    prev_v6: Option<String>,
}

impl DnsOverride {
    pub fn new(luid: u64) -> Self {
        log::debug!("DNS override constructed (IfLuid={})", luid);
        Self {
            luid,
            guid_str: None,
            applied: false,
            touched_v4: false,
            touched_v6: false,
            prev_v4: None,
            prev_v6: None,
        }
    }

    fn guid_str(&mut self) -> VpnResult<String> {
        if let Some(s) = &self.guid_str {
            return Ok(s.clone());
        }
        let s = luid_to_guid_string(self.luid)?;
        self.guid_str = Some(s.clone());
        Ok(s)
    }

    fn set_for_family(guid_str: &str, family: DnsFamily, servers: &[String]) -> VpnResult<()> {
        let value = servers.join(",");
        log::debug!("Set {} DNS servers: '{}'", family.tag(), value);
        let hkey = open_interface_key(family, guid_str, true)?;
        let result = write_name_server(hkey, &value);
        unsafe { let _ = RegCloseKey(hkey); };
        result?;
        log::info!("NameServer set for {}", family.tag());
        Ok(())
    }

    fn restore_family(
        guid_str: &str,
        family: DnsFamily,
        prev: &Option<String>,
    ) -> VpnResult<()> {
        let hkey = open_interface_key(family, guid_str, true)?;
        let result = match prev {
            Some(value) => write_name_server(hkey, value),
            None => write_name_server(hkey, ""),
        };
        unsafe { let _ = RegCloseKey(hkey); };
        result?;
        match prev {
            Some(_) => log::debug!("Restored {} NameServer", family.tag()),
            None => log::debug!("Cleared {} NameServer", family.tag()),
        }
        Ok(())
    }

    /// Write the DNS server list. Only families with at least one address
    /// in the list are touched; the other family keeps its current value
    /// and will not be reverted.
    pub fn apply(&mut self, servers: &[String]) -> VpnResult<()> {
        log::info!("DNS apply: begin, servers={}", servers.len());
        self.touched_v4 = false;
        self.touched_v6 = false;
        self.prev_v4 = None;
        self.prev_v6 = None;

        if servers.is_empty() {
            return Err(VpnError::InvalidArgument("DNS server list is empty".into()));
        }

        let guid_str = self.guid_str()?;
        let (v4, v6) = partition_families(servers)?;
        log::debug!("DNS apply: parsed v4={} v6={}", v4.len(), v6.len());

        self.prev_v4 = read_name_server(DnsFamily::V4, &guid_str)?;
        self.prev_v6 = read_name_server(DnsFamily::V6, &guid_str)?;

        if !v4.is_empty() {
            Self::set_for_family(&guid_str, DnsFamily::V4, &v4)?;
            self.touched_v4 = true;
        }
        if !v6.is_empty() {
            Self::set_for_family(&guid_str, DnsFamily::V6, &v6)?;
            self.touched_v6 = true;
        }

        flush_resolver_cache();
        self.applied = true;
        log::info!(
            "DNS apply: done (touched v4={}, v6={})",
            self.touched_v4,
            self.touched_v6
        );
        Ok(())
    }

    /// Put the previous per-family values back. Aggregate-fails.
    pub fn revert(&mut self) -> VpnResult<()> {
        if !self.applied {
            log::trace!("DNS revert: nothing to do");
            return Ok(());
        }

        log::info!(
            "DNS revert: begin (touched v4={}, v6={})",
            self.touched_v4,
            self.touched_v6
        );
        let guid_str = match self.guid_str() {
            Ok(s) => s,
            Err(e) => {
                self.applied = false;
                return Err(e);
            }
        };
        let mut error = false;

        if self.touched_v4 {
            if let Err(e) = Self::restore_family(&guid_str, DnsFamily::V4, &self.prev_v4) {
                log::error!("DNS revert: IPv4 restore failed: {}", e);
                error = true;
            }
        }
        if self.touched_v6 {
            if let Err(e) = Self::restore_family(&guid_str, DnsFamily::V6, &self.prev_v6) {
                log::error!("DNS revert: IPv6 restore failed: {}", e);
                error = true;
            }
        }

        flush_resolver_cache();

        self.applied = false;
        self.touched_v4 = false;
        self.touched_v6 = false;
        self.prev_v4 = None;
        self.prev_v6 = None;

        if error {
            return Err(VpnError::Dns("revert: one or more operations failed".into()));
        }
        log::info!("DNS revert: done");
        Ok(())
    }
}

impl Drop for DnsOverride {
    fn drop(&mut self) {
        if self.applied {
            if let Err(e) = self.revert() {
                log::warn!("DNS revert on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_mixed_families() {
        let servers = vec![
            "10.200.0.1".to_string(),
            "fd00::53".to_string(),
            "1.1.1.1".to_string(),
        ];
        let (v4, v6) = partition_families(&servers).unwrap();
        assert_eq!(v4, vec!["10.200.0.1", "1.1.1.1"]);
        assert_eq!(v6, vec!["fd00::53"]);
    }

    #[test]
    fn test_partition_rejects_non_literal() {
        let servers = vec!["10.200.0.1".to_string(), "not.an.ip".to_string()];
        assert!(partition_families(&servers).is_err());
    }

    #[test]
    fn test_partition_single_family_leaves_other_empty() {
        let servers = vec!["10.200.0.1".to_string(), "1.1.1.1".to_string()];
        let (v4, v6) = partition_families(&servers).unwrap();
        assert_eq!(v4.len(), 2);
        assert!(v6.is_empty());
    }

    #[test]
    fn test_guid_format() {
        let guid = GUID::from_values(
            0x53bd_ed60,
            0xb6c8,
            0x49ab,
            [0x86, 0x12, 0x6f, 0xa5, 0x56, 0x8f, 0xc5, 0x4d],
        );
        assert_eq!(
            format_guid(&guid),
            "{53BDED60-B6C8-49AB-8612-6FA5568FC54D}"
        );
    }

    #[test]
    fn test_family_registry_paths() {
        assert!(DnsFamily::V4.base_path().contains(r"\Tcpip\"));
        assert!(DnsFamily::V6.base_path().contains(r"\Tcpip6\"));
    }
}
