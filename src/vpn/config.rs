//! Client configuration
//!
//! Parses the JSON configuration handed to `Start` and validates it before
//! any host state is touched. Unknown keys are legal: the transport plugin
//! receives the original config text verbatim, so extra fields flow through
//! untouched.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Deserializer};

use super::{VpnError, VpnResult};
use crate::utils::strip_brackets;

/// Allowed MTU range for the tunnel interface.
pub const MTU_MIN: u32 = 576;
pub const MTU_MAX: u32 = 9200;

/// Client configuration as it appears in the JSON document.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Adapter name, e.g. "tunforge0"
    pub tun: String,
    /// Server hostname or address literal (brackets allowed for IPv6)
    pub server: String,
    pub port: u16,
    /// Filesystem path to the transport plugin DLL
    pub plugin: String,
    pub local4: String,
    pub peer4: String,
    pub local6: String,
    pub peer6: String,
    pub mtu: u32,
    /// DNS servers: JSON array of literals or a single CSV string
    #[serde(deserialize_with = "dns_servers")]
    pub dns: Vec<String>,
}

/// Immutable post-validation record of addresses and MTU.
///
/// Set once at worker entry and threaded through the configurator; nothing
/// mutates it after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPlan {
    pub local4: Ipv4Addr,
    pub peer4: Ipv4Addr,
    pub local6: Ipv6Addr,
    pub peer6: Ipv6Addr,
    pub mtu: u32,
}

fn dns_servers<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DnsField {
        List(Vec<String>),
        Csv(String),
    }

    let entries = match DnsField::deserialize(deserializer)? {
        DnsField::List(list) => list
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        DnsField::Csv(csv) => csv
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    };
    Ok(entries)
}

impl ClientConfig {
    /// Parse the JSON config text.
    pub fn parse(text: &str) -> VpnResult<Self> {
        serde_json::from_str(text).map_err(|e| VpnError::Config(e.to_string()))
    }

    /// Validate ranges and address literals; returns the normalized server
    /// string (brackets stripped) and the address plan.
    pub fn validate(&self) -> VpnResult<(String, AddressPlan)> {
        if self.tun.is_empty() {
            return Err(VpnError::Config("'tun' cannot be empty".into()));
        }
        if self.server.is_empty() {
            return Err(VpnError::Config("'server' cannot be empty".into()));
        }
        if self.port == 0 {
            return Err(VpnError::Config("'port' must be in [1..65535]".into()));
        }
        if self.plugin.is_empty() {
            return Err(VpnError::Config("'plugin' cannot be empty".into()));
        }
        if self.mtu < MTU_MIN || self.mtu > MTU_MAX {
            return Err(VpnError::Config(format!(
                "'mtu' must be in [{}..{}]",
                MTU_MIN, MTU_MAX
            )));
        }
        if self.dns.is_empty() {
            return Err(VpnError::Config("'dns' must contain at least one server".into()));
        }

        let plan = AddressPlan {
            local4: parse_v4("local4", &self.local4)?,
            peer4: parse_v4("peer4", &self.peer4)?,
            local6: parse_v6("local6", &self.local6)?,
            peer6: parse_v6("peer6", &self.peer6)?,
            mtu: self.mtu,
        };

        Ok((strip_brackets(&self.server).to_string(), plan))
    }

    /// Server address parsed as a literal, if it is one. Hostnames return
    /// None; the pinned route only exists for literal servers once resolved.
    pub fn server_literal(&self) -> Option<IpAddr> {
        strip_brackets(&self.server).parse().ok()
    }
}

fn parse_v4(field: &str, value: &str) -> VpnResult<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| VpnError::Config(format!("'{}' is not a valid IPv4 literal: {}", field, value)))
}

fn parse_v6(field: &str, value: &str) -> VpnResult<Ipv6Addr> {
    value
        .parse()
        .map_err(|_| VpnError::Config(format!("'{}' is not a valid IPv6 literal: {}", field, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> serde_json::Value {
        serde_json::json!({
            "tun": "tunforge0",
            "server": "198.51.100.7",
            "port": 5555,
            "plugin": "./transport.dll",
            "local4": "10.200.0.2",
            "peer4": "10.200.0.1",
            "local6": "fd00::2",
            "peer6": "fd00::1",
            "mtu": 1400,
            "dns": ["10.200.0.1", "1.1.1.1"]
        })
    }

    fn parse(value: serde_json::Value) -> VpnResult<ClientConfig> {
        ClientConfig::parse(&value.to_string())
    }

    #[test]
    fn test_parse_valid_config() {
        let cfg = parse(base_config()).unwrap();
        let (server, plan) = cfg.validate().unwrap();
        assert_eq!(server, "198.51.100.7");
        assert_eq!(plan.local4, Ipv4Addr::new(10, 200, 0, 2));
        assert_eq!(plan.peer4, Ipv4Addr::new(10, 200, 0, 1));
        assert_eq!(plan.mtu, 1400);
        assert_eq!(cfg.dns, vec!["10.200.0.1", "1.1.1.1"]);
    }

    #[test]
    fn test_missing_field_rejected() {
        let mut v = base_config();
        v.as_object_mut().unwrap().remove("peer4");
        assert!(parse(v).is_err());
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let mut v = base_config();
        v["transport_secret"] = serde_json::json!("opaque-plugin-data");
        assert!(parse(v).is_ok());
    }

    #[test]
    fn test_port_bounds() {
        let mut v = base_config();
        v["port"] = serde_json::json!(0);
        let cfg = parse(v).unwrap();
        assert!(cfg.validate().is_err());

        let mut v = base_config();
        v["port"] = serde_json::json!(65536);
        assert!(parse(v).is_err());
    }

    #[test]
    fn test_mtu_bounds() {
        for mtu in [575, 9201] {
            let mut v = base_config();
            v["mtu"] = serde_json::json!(mtu);
            let cfg = parse(v).unwrap();
            assert!(cfg.validate().is_err(), "mtu {} should be rejected", mtu);
        }
        for mtu in [576, 9200] {
            let mut v = base_config();
            v["mtu"] = serde_json::json!(mtu);
            let cfg = parse(v).unwrap();
            assert!(cfg.validate().is_ok(), "mtu {} should be accepted", mtu);
        }
    }

    #[test]
    fn test_dns_csv_form() {
        let mut v = base_config();
        v["dns"] = serde_json::json!("10.200.0.1, 1.1.1.1 ,,");
        let cfg = parse(v).unwrap();
        assert_eq!(cfg.dns, vec!["10.200.0.1", "1.1.1.1"]);
    }

    #[test]
    fn test_empty_dns_rejected() {
        let mut v = base_config();
        v["dns"] = serde_json::json!([]);
        let cfg = parse(v).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_address_literal_rejected() {
        let mut v = base_config();
        v["local4"] = serde_json::json!("not.an.ip");
        let cfg = parse(v).unwrap();
        assert!(cfg.validate().is_err());

        let mut v = base_config();
        v["peer6"] = serde_json::json!("10.0.0.1");
        let cfg = parse(v).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_server_brackets_stripped() {
        let mut v = base_config();
        v["server"] = serde_json::json!("[fd00::1]");
        let cfg = parse(v).unwrap();
        let (server, _) = cfg.validate().unwrap();
        assert_eq!(server, "fd00::1");
        assert_eq!(cfg.server_literal(), Some("fd00::1".parse().unwrap()));
    }

    #[test]
    fn test_hostname_server_is_not_literal() {
        let mut v = base_config();
        v["server"] = serde_json::json!("vpn.example.net");
        let cfg = parse(v).unwrap();
        assert!(cfg.server_literal().is_none());
    }
}
