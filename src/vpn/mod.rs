//! VPN orchestration core for TunForge.
//!
//! This module owns every piece of host network state the client touches:
//! - config.rs: JSON configuration and the immutable address plan
//! - adapter.rs: wintun virtual adapter and its packet ring
//! - network.rs: MTU/address/metric/route configuration
//! - rollback.rs: baseline snapshot and revert of routing state
//! - firewall.rs: outbound allow-rules with snapshot restore
//! - dns.rs: per-interface DNS registry override
//! - watcher.rs: debounced network-change watcher
//! - plugin.rs: dynamic transport plugin loading
//! - connection.rs: lifecycle controller and packet forwarding bridge

pub mod adapter;
pub mod config;
pub mod connection;
pub mod dns;
pub mod firewall;
pub mod network;
pub mod plugin;
pub mod rollback;
pub mod watcher;

pub use adapter::TunAdapter;
pub use config::{AddressPlan, ClientConfig};
pub use connection::{client_start, client_stop, is_client_running, last_exit_code};
pub use dns::DnsOverride;
pub use firewall::{FirewallRules, Protocol};
pub use network::{configure_network, IpFamily};
pub use plugin::TransportPlugin;
pub use rollback::NetworkRollback;
pub use watcher::NetWatcher;

/// VPN-related errors
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Network operation failed: {0}")]
    Network(String),

    #[error("Firewall error: {0}")]
    Firewall(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type VpnResult<T> = Result<T, VpnError>;
