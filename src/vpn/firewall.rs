//! Windows Firewall allow-rules for the transport
//!
//! Installs outbound allow-rules (application path + server addresses +
//! protocol/port) through the firewall COM surface and restores the exact
//! prior state on revert. A pre-existing rule under the same name is almost
//! certainly the user's own or a leftover from a dirty shutdown, so it is
//! snapshotted field-by-field and re-inserted verbatim instead of being
//! tagged or discarded.

use windows::core::BSTR;
use windows::Win32::Foundation::VARIANT_BOOL;
use windows::Win32::NetworkManagement::WindowsFirewall::{
    INetFwPolicy2, INetFwRule, INetFwRules, NetFwPolicy2, NetFwRule, NET_FW_ACTION,
    NET_FW_ACTION_ALLOW, NET_FW_IP_PROTOCOL_TCP, NET_FW_IP_PROTOCOL_UDP, NET_FW_PROFILE2_ALL,
    NET_FW_RULE_DIRECTION, NET_FW_RULE_DIR_OUT,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoUninitialize, CLSCTX_INPROC_SERVER,
    COINIT_APARTMENTTHREADED,
};

use super::{VpnError, VpnResult};

/// Transport protocol for a firewall rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn label(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }

    fn fw_value(self) -> i32 {
        match self {
            Protocol::Tcp => NET_FW_IP_PROTOCOL_TCP.0,
            Protocol::Udp => NET_FW_IP_PROTOCOL_UDP.0,
        }
    }
}

/// Exact copy of a firewall rule as found before we touched it.
#[derive(Debug, Clone, Default)]
pub struct RuleSnapshot {
    pub present: bool,
    pub name: String,
    pub description: String,
    pub direction: i32,
    pub action: i32,
    pub enabled: bool,
    pub profiles: i32,
    pub interface_types: String,
    pub protocol: i32,
    pub remote_addresses: String,
    pub remote_ports: String,
    pub application_name: String,
}

#[derive(Debug)]
struct Entry {
    proto: Protocol,
    port: u16,
    name: String,
    snapshot: RuleSnapshot,
    had_before: bool,
    touched: bool,
}

/// Scoped STA apartment for the firewall COM calls. One per operation, as
/// the calls may come from different threads over the object's lifetime.
struct ComApartment {
    initialized: bool,
}

impl ComApartment {
    fn new() -> VpnResult<Self> {
        let hr = unsafe { CoInitializeEx(None, COINIT_APARTMENTTHREADED) };
        if hr.is_err() {
            return Err(VpnError::Firewall(format!(
                "CoInitializeEx failed hr=0x{:08X}",
                hr.0 as u32
            )));
        }
        Ok(Self { initialized: true })
    }
}

impl Drop for ComApartment {
    fn drop(&mut self) {
        if self.initialized {
            unsafe { CoUninitialize() };
        }
    }
}

fn get_rules() -> VpnResult<INetFwRules> {
    let policy: INetFwPolicy2 =
        unsafe { CoCreateInstance(&NetFwPolicy2, None, CLSCTX_INPROC_SERVER) }.map_err(|e| {
            VpnError::Firewall(format!("CoCreateInstance(NetFwPolicy2) failed: {}", e))
        })?;
    unsafe { policy.Rules() }
        .map_err(|e| VpnError::Firewall(format!("INetFwPolicy2::Rules failed: {}", e)))
}

fn new_rule_object() -> VpnResult<INetFwRule> {
    unsafe { CoCreateInstance(&NetFwRule, None, CLSCTX_INPROC_SERVER) }
        .map_err(|e| VpnError::Firewall(format!("CoCreateInstance(NetFwRule) failed: {}", e)))
}

/// Firewall rule set for the client, reverted in reverse insertion order.
pub struct FirewallRules {
    rule_prefix: String,
    app_path: String,
    remote_addresses: String,
    entries: Vec<Entry>,
    applied: bool,
}

impl FirewallRules {
    pub fn new(rule_prefix: &str, app_path: &str, remote_addresses: &str) -> Self {
        log::debug!(
            "Firewall rules prepared: prefix={} app={} remote={}",
            rule_prefix,
            app_path,
            remote_addresses
        );
        Self {
            rule_prefix: rule_prefix.to_string(),
            app_path: app_path.to_string(),
            remote_addresses: remote_addresses.to_string(),
            entries: Vec::new(),
            applied: false,
        }
    }

    fn validate(&self) -> VpnResult<()> {
        if self.rule_prefix.is_empty() {
            return Err(VpnError::InvalidArgument("rule prefix is empty".into()));
        }
        if self.app_path.is_empty() {
            return Err(VpnError::InvalidArgument("application path is empty".into()));
        }
        if self.remote_addresses.is_empty() {
            return Err(VpnError::InvalidArgument("remote addresses are empty".into()));
        }
        Ok(())
    }

    /// Deterministic rule name; this is the identity used for read-before-
    /// write snapshotting.
    pub fn make_rule_name(&self, proto: Protocol, port: u16) -> String {
        format!(
            "{} Out {} to {}:{}",
            self.rule_prefix,
            proto.label(),
            self.remote_addresses,
            port
        )
    }

    pub fn has_entry(&self, proto: Protocol, port: u16) -> bool {
        self.entries.iter().any(|e| e.proto == proto && e.port == port)
    }

    fn read_snapshot(&self, name: &str) -> VpnResult<RuleSnapshot> {
        let rules = get_rules()?;
        let mut snap = RuleSnapshot::default();

        let rule = match unsafe { rules.Item(&BSTR::from(name)) } {
            Ok(rule) => rule,
            Err(_) => {
                log::trace!("No existing rule named '{}'", name);
                return Ok(snap);
            }
        };

        // Individual getter failures leave the field at its default, like a
        // partially-populated rule would.
        unsafe {
            if let Ok(v) = rule.Name() {
                snap.name = v.to_string();
            }
            if let Ok(v) = rule.Description() {
                snap.description = v.to_string();
            }
            if let Ok(v) = rule.Direction() {
                snap.direction = v.0;
            }
            if let Ok(v) = rule.Action() {
                snap.action = v.0;
            }
            if let Ok(v) = rule.Enabled() {
                snap.enabled = v.as_bool();
            }
            if let Ok(v) = rule.Profiles() {
                snap.profiles = v;
            }
            if let Ok(v) = rule.InterfaceTypes() {
                snap.interface_types = v.to_string();
            }
            if let Ok(v) = rule.Protocol() {
                snap.protocol = v;
            }
            if let Ok(v) = rule.RemoteAddresses() {
                snap.remote_addresses = v.to_string();
            }
            if let Ok(v) = rule.RemotePorts() {
                snap.remote_ports = v.to_string();
            }
            if let Ok(v) = rule.ApplicationName() {
                snap.application_name = v.to_string();
            }
        }
        snap.present = true;
        log::debug!("Snapshotted existing rule '{}'", snap.name);
        Ok(snap)
    }

    fn remove_if_exists(rules: &INetFwRules, name: &str) {
        let bname = BSTR::from(name);
        if unsafe { rules.Item(&bname) }.is_ok() {
            log::debug!("Removing rule '{}'", name);
            let _ = unsafe { rules.Remove(&bname) };
        }
    }

    fn upsert_outbound(&self, proto: Protocol, port: u16, name: &str) -> VpnResult<()> {
        log::debug!(
            "Upsert outbound rule: proto={} port={} name='{}'",
            proto.label(),
            port,
            name
        );
        let rules = get_rules()?;
        let rule = new_rule_object()?;

        unsafe {
            rule.SetName(&BSTR::from(name)).ok();
            rule.SetDescription(&BSTR::from("TunForge outbound allow")).ok();
            rule.SetDirection(NET_FW_RULE_DIR_OUT).ok();
            rule.SetAction(NET_FW_ACTION_ALLOW).ok();
            rule.SetEnabled(VARIANT_BOOL::from(true)).ok();
            rule.SetProfiles(NET_FW_PROFILE2_ALL.0).ok();
            rule.SetInterfaceTypes(&BSTR::from("All")).ok();
            rule.SetProtocol(proto.fw_value()).ok();
            rule.SetRemoteAddresses(&BSTR::from(self.remote_addresses.as_str())).ok();
            rule.SetRemotePorts(&BSTR::from(port.to_string())).ok();
            rule.SetApplicationName(&BSTR::from(self.app_path.as_str())).ok();
        }

        Self::remove_if_exists(&rules, name);
        unsafe { rules.Add(&rule) }
            .map_err(|e| VpnError::Firewall(format!("INetFwRules::Add failed: {}", e)))?;
        log::info!("Outbound rule added: '{}'", name);
        Ok(())
    }

    fn restore_from_snapshot(snap: &RuleSnapshot) -> VpnResult<()> {
        if !snap.present {
            return Ok(());
        }

        log::debug!("Restoring rule '{}'", snap.name);
        let rules = get_rules()?;
        let rule = new_rule_object()?;

        unsafe {
            rule.SetName(&BSTR::from(snap.name.as_str())).ok();
            rule.SetDescription(&BSTR::from(snap.description.as_str())).ok();
            rule.SetDirection(NET_FW_RULE_DIRECTION(snap.direction)).ok();
            rule.SetAction(NET_FW_ACTION(snap.action)).ok();
            rule.SetEnabled(VARIANT_BOOL::from(snap.enabled)).ok();
            rule.SetProfiles(snap.profiles).ok();
            rule.SetInterfaceTypes(&BSTR::from(snap.interface_types.as_str())).ok();
            rule.SetProtocol(snap.protocol).ok();
            rule.SetRemoteAddresses(&BSTR::from(snap.remote_addresses.as_str())).ok();
            rule.SetRemotePorts(&BSTR::from(snap.remote_ports.as_str())).ok();
            rule.SetApplicationName(&BSTR::from(snap.application_name.as_str())).ok();
        }

        Self::remove_if_exists(&rules, &snap.name);
        unsafe { rules.Add(&rule) }
            .map_err(|e| VpnError::Firewall(format!("INetFwRules::Add(restore) failed: {}", e)))?;
        log::info!("Rule restored: '{}'", snap.name);
        Ok(())
    }

    /// Install an outbound allow-rule for the transport. Idempotent per
    /// (protocol, port): a second call with the same key is a no-op.
    pub fn allow(&mut self, proto: Protocol, port: u16) -> VpnResult<()> {
        log::info!("Firewall allow: proto={} port={}", proto.label(), port);
        self.validate()?;
        if port == 0 {
            return Err(VpnError::InvalidArgument("port is zero".into()));
        }

        if self.has_entry(proto, port) {
            log::trace!("Rule for {}:{} already installed", proto.label(), port);
            return Ok(());
        }

        let name = self.make_rule_name(proto, port);

        let _com = ComApartment::new()?;

        let snapshot = self.read_snapshot(&name)?;
        let had_before = snapshot.present;

        self.upsert_outbound(proto, port, &name)?;

        self.entries.push(Entry {
            proto,
            port,
            name,
            snapshot,
            had_before,
            touched: true,
        });
        self.applied = true;
        Ok(())
    }

    /// Remove installed rules in reverse insertion order, restoring any
    /// pre-existing rule with the same name verbatim. Sub-step failures are
    /// recorded and reported as one aggregate error at the end.
    pub fn revert(&mut self) -> VpnResult<()> {
        if !self.applied {
            log::trace!("Firewall revert: nothing to do");
            return Ok(());
        }

        let _com = ComApartment::new()?;
        let mut error = false;

        log::info!("Firewall revert: begin, entries={}", self.entries.len());
        for entry in self.entries.iter().rev() {
            if entry.touched {
                match get_rules() {
                    Ok(rules) => Self::remove_if_exists(&rules, &entry.name),
                    Err(e) => {
                        log::error!("Firewall revert: remove '{}' failed: {}", entry.name, e);
                        error = true;
                    }
                }
            }

            if entry.had_before {
                if let Err(e) = Self::restore_from_snapshot(&entry.snapshot) {
                    log::error!("Firewall revert: restore '{}' failed: {}", entry.name, e);
                    error = true;
                }
            }
        }

        self.entries.clear();
        self.applied = false;

        if error {
            return Err(VpnError::Firewall(
                "revert: one or more operations failed".into(),
            ));
        }
        log::info!("Firewall revert: done");
        Ok(())
    }
}

impl Drop for FirewallRules {
    fn drop(&mut self) {
        if self.applied {
            if let Err(e) = self.revert() {
                log::warn!("Firewall revert on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> FirewallRules {
        FirewallRules::new(
            "TunForge",
            r"C:\Program Files\TunForge\tunforge.exe",
            "198.51.100.7",
        )
    }

    #[test]
    fn test_rule_name_format() {
        let fw = rules();
        assert_eq!(
            fw.make_rule_name(Protocol::Tcp, 5555),
            "TunForge Out TCP to 198.51.100.7:5555"
        );
        assert_eq!(
            fw.make_rule_name(Protocol::Udp, 443),
            "TunForge Out UDP to 198.51.100.7:443"
        );
    }

    #[test]
    fn test_rule_name_with_csv_addresses() {
        let fw = FirewallRules::new("TunForge", "app.exe", "198.51.100.7,2001:db8::7");
        assert_eq!(
            fw.make_rule_name(Protocol::Tcp, 5555),
            "TunForge Out TCP to 198.51.100.7,2001:db8::7:5555"
        );
    }

    #[test]
    fn test_validation_rejects_empty_fields() {
        assert!(FirewallRules::new("", "app.exe", "1.2.3.4").validate().is_err());
        assert!(FirewallRules::new("P", "", "1.2.3.4").validate().is_err());
        assert!(FirewallRules::new("P", "app.exe", "").validate().is_err());
        assert!(rules().validate().is_ok());
    }

    #[test]
    fn test_entry_key_lookup() {
        let mut fw = rules();
        assert!(!fw.has_entry(Protocol::Tcp, 5555));
        fw.entries.push(Entry {
            proto: Protocol::Tcp,
            port: 5555,
            name: fw.make_rule_name(Protocol::Tcp, 5555),
            snapshot: RuleSnapshot::default(),
            had_before: false,
            touched: true,
        });
        assert!(fw.has_entry(Protocol::Tcp, 5555));
        assert!(!fw.has_entry(Protocol::Udp, 5555));
        assert!(!fw.has_entry(Protocol::Tcp, 5556));
        // Drop must not attempt a COM revert for untouched state
        fw.entries.clear();
    }

    #[test]
    fn test_protocol_labels() {
        assert_eq!(Protocol::Tcp.label(), "TCP");
        assert_eq!(Protocol::Udp.label(), "UDP");
    }
}
