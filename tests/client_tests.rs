//! Client integration tests
//!
//! Exercises the orchestrator's decision logic end to end where that is
//! possible without administrator rights, a wintun driver, COM, or a live
//! network: configuration handling, rule naming, packet-header parsing,
//! DNS list partitioning, and the lifecycle API's not-running paths.

use std::net::Ipv4Addr;

use tunforge::vpn::config::ClientConfig;
use tunforge::vpn::connection::{packet_info, PacketInfo};
use tunforge::vpn::dns::partition_families;
use tunforge::vpn::firewall::{FirewallRules, Protocol};
use tunforge::vpn::network::{IpFamily, SPLIT_DEFAULTS_V4, SPLIT_DEFAULTS_V6, TUNNEL_METRIC};
use tunforge::vpn::rollback::{is_pinned_server_route, is_split_default};
use tunforge::vpn::watcher::{is_suppressed, DEFAULT_DEBOUNCE};

fn sample_config() -> String {
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
    .to_string()
}

/// Tests for configuration parsing and validation
mod config_tests {
    use super::*;

    #[test]
    fn test_full_config_round_trip() {
        let cfg = ClientConfig::parse(&sample_config()).unwrap();
        let (server, plan) = cfg.validate().unwrap();

        assert_eq!(server, "198.51.100.7");
        assert_eq!(plan.local4.to_string(), "10.200.0.2");
        assert_eq!(plan.peer4.to_string(), "10.200.0.1");
        assert_eq!(plan.local6.to_string(), "fd00::2");
        assert_eq!(plan.peer6.to_string(), "fd00::1");
        assert_eq!(plan.mtu, 1400);
    }

    #[test]
    fn test_mtu_out_of_range_rejected() {
        for mtu in [575, 9201, 0] {
            let text = sample_config().replace("1400", &mtu.to_string());
            let cfg = ClientConfig::parse(&text).unwrap();
            assert!(cfg.validate().is_err(), "mtu {} accepted", mtu);
        }
    }

    #[test]
    fn test_port_out_of_range_rejected() {
        let text = sample_config().replace("5555", "0");
        let cfg = ClientConfig::parse(&text).unwrap();
        assert!(cfg.validate().is_err());

        let text = sample_config().replace("5555", "65536");
        assert!(ClientConfig::parse(&text).is_err());
    }

    #[test]
    fn test_empty_dns_rejected() {
        let text = sample_config().replace(r#"["10.200.0.1","1.1.1.1"]"#, "[]");
        let cfg = ClientConfig::parse(&text).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_dns_as_csv_string() {
        let text = sample_config().replace(
            r#"["10.200.0.1","1.1.1.1"]"#,
            r#""10.200.0.1,1.1.1.1""#,
        );
        let cfg = ClientConfig::parse(&text).unwrap();
        assert_eq!(cfg.dns, vec!["10.200.0.1", "1.1.1.1"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_unknown_keys_flow_to_plugin_text() {
        // Unknown keys must not break parsing; the plugin sees the raw text
        let text = sample_config().replace(
            r#""tun":"tunforge0""#,
            r#""tun":"tunforge0","wire_secret":"0xdead""#,
        );
        let cfg = ClientConfig::parse(&text).unwrap();
        assert!(cfg.validate().is_ok());
        assert!(text.contains("wire_secret"));
    }

    #[test]
    fn test_bracketed_v6_server() {
        let text = sample_config().replace("198.51.100.7", "[fd00:1::9]");
        let cfg = ClientConfig::parse(&text).unwrap();
        let (server, _) = cfg.validate().unwrap();
        assert_eq!(server, "fd00:1::9");
    }
}

/// Tests for firewall rule identity
mod firewall_tests {
    use super::*;

    #[test]
    fn test_rule_name_is_deterministic() {
        let fw = FirewallRules::new("TunForge", "tunforge.exe", "198.51.100.7");
        let a = fw.make_rule_name(Protocol::Udp, 5555);
        let b = fw.make_rule_name(Protocol::Udp, 5555);
        assert_eq!(a, b);
        assert_eq!(a, "TunForge Out UDP to 198.51.100.7:5555");
    }

    #[test]
    fn test_rule_names_differ_by_key() {
        let fw = FirewallRules::new("TunForge", "tunforge.exe", "198.51.100.7");
        assert_ne!(
            fw.make_rule_name(Protocol::Tcp, 5555),
            fw.make_rule_name(Protocol::Udp, 5555)
        );
        assert_ne!(
            fw.make_rule_name(Protocol::Tcp, 5555),
            fw.make_rule_name(Protocol::Tcp, 5556)
        );
    }

    #[test]
    fn test_unresolved_host_keeps_literal_in_rule() {
        // Server host with no records: the rule carries the literal
        let addresses = tunforge::utils::resolve_firewall_addresses("host.invalid");
        let fw = FirewallRules::new("TunForge", "tunforge.exe", &addresses);
        assert_eq!(
            fw.make_rule_name(Protocol::Tcp, 443),
            "TunForge Out TCP to host.invalid:443"
        );
    }
}

/// Tests for routing constants and rollback predicates
mod routing_tests {
    use super::*;

    #[test]
    fn test_split_defaults_cover_both_halves() {
        assert_eq!(SPLIT_DEFAULTS_V4.map(|a| a.to_string()), ["0.0.0.0", "128.0.0.0"]);
        assert_eq!(SPLIT_DEFAULTS_V6.map(|a| a.to_string()), ["::", "8000::"]);
        assert_eq!(TUNNEL_METRIC, 1);
    }

    #[test]
    fn test_host_prefix_lengths() {
        assert_eq!(IpFamily::V4.host_prefix(), 32);
        assert_eq!(IpFamily::V6.host_prefix(), 128);
    }

    #[test]
    fn test_rollback_only_matches_marked_footprint() {
        let our = 0x1122;
        let dest = "0.0.0.0".parse().unwrap();
        assert!(is_split_default(our, 1, Some(dest), our));
        // Another adapter's identical route is untouched
        assert!(!is_split_default(0x3344, 1, Some(dest), our));
    }

    #[test]
    fn test_pinned_route_identity() {
        let server = "198.51.100.7".parse().unwrap();
        assert!(is_pinned_server_route(32, Some(server), server));
        assert!(!is_pinned_server_route(
            32,
            Some("203.0.113.1".parse().unwrap()),
            server
        ));
    }
}

/// Tests for DNS list handling
mod dns_tests {
    use super::*;

    #[test]
    fn test_partition_writes_only_present_families() {
        // v4-only input: the v6 family must remain untouched
        let servers = vec!["10.200.0.1".to_string(), "1.1.1.1".to_string()];
        let (v4, v6) = partition_families(&servers).unwrap();
        assert_eq!(v4.len(), 2);
        assert!(v6.is_empty());
    }

    #[test]
    fn test_invalid_literal_aborts_whole_apply() {
        let servers = vec!["10.200.0.1".to_string(), "not.an.ip".to_string()];
        assert!(partition_families(&servers).is_err());
    }

    #[test]
    fn test_csv_value_shape() {
        let servers = vec!["10.200.0.1".to_string(), "1.1.1.1".to_string()];
        assert_eq!(servers.join(","), "10.200.0.1,1.1.1.1");
    }
}

/// Tests for the forwarding bridge's packet inspection
mod packet_tests {
    use super::*;

    #[test]
    fn test_v4_header_addresses() {
        let mut frame = vec![0u8; 28];
        frame[0] = 0x45;
        frame[12..16].copy_from_slice(&[10, 200, 0, 2]);
        frame[16..20].copy_from_slice(&[198, 51, 100, 7]);

        match packet_info(&frame) {
            Some(PacketInfo::V4 { src, dst }) => {
                assert_eq!(src, Ipv4Addr::new(10, 200, 0, 2));
                assert_eq!(dst, Ipv4Addr::new(198, 51, 100, 7));
            }
            other => panic!("unexpected packet info: {:?}", other),
        }
    }

    #[test]
    fn test_version_nibble_dispatch() {
        let mut frame = vec![0u8; 40];
        frame[0] = 0x60;
        assert_eq!(packet_info(&frame), Some(PacketInfo::V6));

        frame[0] = 0xF0;
        assert_eq!(packet_info(&frame), Some(PacketInfo::Unknown(15)));
    }

    #[test]
    fn test_undersized_frame_ignored() {
        assert_eq!(packet_info(&[0x45; 10]), None);
    }
}

/// Tests for watcher timing rules
mod watcher_tests {
    use super::*;

    #[test]
    fn test_debounce_default() {
        assert_eq!(DEFAULT_DEBOUNCE.as_millis(), 1500);
    }

    #[test]
    fn test_suppression_is_half_open() {
        // A kick exactly at the deadline passes through
        assert!(is_suppressed(999, 1000));
        assert!(!is_suppressed(1000, 1000));
    }
}

/// Tests for the lifecycle API without a running client
mod lifecycle_tests {
    #[test]
    fn test_stop_without_start_returns_minus_two() {
        assert_eq!(tunforge::vpn::is_client_running(), 0);
        assert_eq!(tunforge::vpn::client_stop(), -2);
    }

    #[test]
    fn test_c_abi_mirrors_rust_api() {
        assert_eq!(tunforge::IsRunning(), 0);
        assert_eq!(tunforge::Stop(), -2);
    }

    #[test]
    fn test_c_abi_start_rejects_null() {
        let rc = unsafe { tunforge::Start(std::ptr::null()) };
        assert_eq!(rc, -1);
        assert_eq!(tunforge::IsRunning(), 0);
    }
}
