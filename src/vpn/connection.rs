//! Client lifecycle and packet forwarding
//!
//! The lifecycle controller runs the whole orchestrator body on one worker
//! thread: firewall, plugin, adapter, rollback, DNS, watcher, then the
//! plugin's blocking serve loop. Scoped resources are declared in
//! construction order so that an early failure, or a normal return from
//! the serve loop, unwinds them in exact reverse order, which is what
//! makes shutdown a no-op from the OS's perspective.
//!
//! The forwarding bridge consists of two `extern "C"` trampolines over the
//! adapter's packet ring. The plugin ABI carries no context pointer, so the
//! active session lives in a process-wide slot while serving.

use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use wintun::Session;

use super::adapter::TunAdapter;
use super::config::{AddressPlan, ClientConfig};
use super::dns::DnsOverride;
use super::firewall::{FirewallRules, Protocol};
use super::network::{configure_network, IpFamily};
use super::plugin::TransportPlugin;
use super::rollback::NetworkRollback;
use super::watcher::NetWatcher;
use crate::utils::{is_administrator, module_path, resolve_firewall_addresses};

/// Prefix for the firewall rules this client installs.
const RULE_PREFIX: &str = "TunForge";

/// Debounce window used by the client's net watcher.
const CLIENT_DEBOUNCE: Duration = Duration::from_millis(1000);

static STARTED: AtomicBool = AtomicBool::new(false);
static WORKING: AtomicU8 = AtomicU8::new(0);
static LAST_EXIT_CODE: AtomicI32 = AtomicI32::new(0);
static WORKER: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);
static ACTIVE_SESSION: RwLock<Option<Arc<Session>>> = RwLock::new(None);

/// Header summary of an IP frame, for trace logging.
#[derive(Debug, PartialEq, Eq)]
pub enum PacketInfo {
    V4 { src: Ipv4Addr, dst: Ipv4Addr },
    V6,
    Unknown(u8),
}

/// Parse the version nibble and, for IPv4, the source/destination pair.
/// Frames shorter than a v4 header yield None.
pub fn packet_info(data: &[u8]) -> Option<PacketInfo> {
    if data.len() < 20 {
        return None;
    }
    let version = (data[0] >> 4) & 0x0f;
    match version {
        4 => {
            let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
            let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
            Some(PacketInfo::V4 { src, dst })
        }
        6 => Some(PacketInfo::V6),
        other => Some(PacketInfo::Unknown(other)),
    }
}

fn log_packet(data: &[u8], direction: &str) {
    match packet_info(data) {
        Some(PacketInfo::V4 { src, dst }) => {
            log::trace!("[{}] IPv4: {} -> {} (len={})", direction, src, dst, data.len());
        }
        Some(PacketInfo::V6) => {
            log::trace!("[{}] IPv6 packet (len={})", direction, data.len());
        }
        Some(PacketInfo::Unknown(version)) => {
            log::warn!(
                "[{}] Unknown packet version={} (len={})",
                direction,
                version,
                data.len()
            );
        }
        None => {}
    }
}

/// Bridge: plugin pulls the next IP frame captured from the adapter.
unsafe extern "C" fn receive_from_net(buf: *mut u8, len: usize) -> isize {
    let guard = ACTIVE_SESSION.read();
    let Some(session) = guard.as_ref() else {
        return 0;
    };
    match session.try_receive() {
        Ok(Some(packet)) => {
            let bytes = packet.bytes();
            log_packet(bytes, "FROM_NET");
            if bytes.len() > len {
                log::warn!("Oversized packet {} > buf {} (dropped)", bytes.len(), len);
                return -1;
            }
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, bytes.len());
            bytes.len() as isize
        }
        Ok(None) => 0,
        Err(e) => {
            log::trace!("Receive failed (treated as empty): {}", e);
            0
        }
    }
}

/// Bridge: plugin pushes a decoded IP frame back into the adapter.
unsafe extern "C" fn send_to_net(buf: *const u8, len: usize) -> isize {
    if buf.is_null() || len == 0 || len > u16::MAX as usize {
        return 0;
    }
    let data = std::slice::from_raw_parts(buf, len);
    log_packet(data, "TO_NET");

    let guard = ACTIVE_SESSION.read();
    let Some(session) = guard.as_ref() else {
        return 0;
    };
    match session.allocate_send_packet(len as u16) {
        Ok(mut packet) => {
            packet.bytes_mut().copy_from_slice(data);
            session.send_packet(packet);
            len as isize
        }
        Err(e) => {
            // Ring full: silent drop, the transport retransmits or the
            // upper protocol copes.
            log::debug!("allocate_send failed (drop): {}", e);
            0
        }
    }
}

/// Best-effort resolution of the server host to one routable address for
/// pinning. Literals short-circuit; hostnames take the first resolved
/// address.
fn resolve_server_addr(config: &ClientConfig, host: &str) -> Option<IpAddr> {
    if let Some(addr) = config.server_literal() {
        return Some(addr);
    }
    match (host, config.port).to_socket_addrs() {
        Ok(mut addrs) => addrs.next().map(|sa| sa.ip()),
        Err(e) => {
            log::warn!("Cannot resolve server '{}': {}", host, e);
            None
        }
    }
}

/// Configure both families, tolerating one-family failure. Returns the
/// per-family outcome.
fn configure_both(luid: u64, plan: &AddressPlan, server: Option<IpAddr>) -> (bool, bool) {
    let v4_ok = match configure_network(luid, plan, server, IpFamily::V4) {
        Ok(()) => {
            log::info!("IPv4 configured");
            true
        }
        Err(e) => {
            log::error!("IPv4 configure failed: {}", e);
            false
        }
    };
    let v6_ok = match configure_network(luid, plan, server, IpFamily::V6) {
        Ok(()) => {
            log::info!("IPv6 configured");
            true
        }
        Err(e) => {
            log::error!("IPv6 configure failed: {}", e);
            false
        }
    };
    (v4_ok, v6_ok)
}

/// The whole client body. Runs on the worker thread; the return value is
/// the plugin's serve exit code, or 1 for failed initialization.
///
/// Locals are declared in construction order; Rust drops them in reverse,
/// which is the rollback order the subsystems depend on: watcher stops
/// before DNS reverts, DNS before routes, routes before the firewall rule
/// disappears, and the adapter closes in between routes and the plugin.
fn client_main(config_text: &str) -> i32 {
    log::info!("Starting TunForge client");

    if !is_administrator() {
        log::error!("Administrator privileges are required");
        return 1;
    }

    let config = match ClientConfig::parse(config_text) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Config parse failed: {}", e);
            return 1;
        }
    };
    let (server_host, plan) = match config.validate() {
        Ok(v) => v,
        Err(e) => {
            log::error!("Config validation failed: {}", e);
            return 1;
        }
    };
    log::debug!(
        "Config: tun={} server={} port={} plugin={} mtu={}",
        config.tun,
        server_host,
        config.port,
        config.plugin,
        plan.mtu
    );

    let wintun = match super::adapter::load_driver() {
        Ok(wintun) => wintun,
        Err(e) => {
            log::error!("{}", e);
            return 1;
        }
    };

    let exe_path = match module_path() {
        Ok(path) => path,
        Err(e) => {
            log::error!("{}", e);
            return 1;
        }
    };
    let fw_addresses = resolve_firewall_addresses(&server_host);

    let mut firewall = FirewallRules::new(RULE_PREFIX, &exe_path, &fw_addresses);
    if let Err(e) = firewall.allow(Protocol::Tcp, config.port) {
        log::error!("Firewall allow failed: {}", e);
        return 1;
    }
    log::info!("Allow TCP port {}", config.port);

    let plugin = match TransportPlugin::load(&config.plugin) {
        Ok(plugin) => plugin,
        Err(e) => {
            log::error!("{}", e);
            return 1;
        }
    };

    let mut adapter = match TunAdapter::open_or_create(&wintun, &config.tun) {
        Ok(adapter) => adapter,
        Err(e) => {
            log::error!("{}", e);
            return 1;
        }
    };
    let luid = adapter.luid();
    log::debug!("Adapter LUID acquired: {}", luid);

    let server_addr = resolve_server_addr(&config, &server_host);

    let _rollback = match NetworkRollback::new(luid, server_addr) {
        Ok(rollback) => rollback,
        Err(e) => {
            log::error!("{}", e);
            return 1;
        }
    };
    log::info!("Baseline snapshot captured (rollback armed)");

    let mut dns = DnsOverride::new(luid);
    if let Err(e) = dns.apply(&config.dns) {
        log::error!("DNS apply failed: {}", e);
        return 1;
    }
    log::info!("Applying DNS: {}", config.dns.join(", "));

    let reapply_plan = plan;
    let watcher = match NetWatcher::new(
        Box::new(move || {
            log::debug!("Reconfiguring routes for server {:?}", server_addr);
            let (v4_ok, v6_ok) = configure_both(luid, &reapply_plan, server_addr);
            if !v4_ok && !v6_ok {
                log::error!("Neither IPv4 nor IPv6 configured");
            }
        }),
        CLIENT_DEBOUNCE,
    ) {
        Ok(watcher) => watcher,
        Err(e) => {
            log::error!("{}", e);
            return 1;
        }
    };

    // First configuration pass, before the serve loop. The watcher must not
    // react to our own writes.
    watcher.suppress(CLIENT_DEBOUNCE);
    let (v4_ok, v6_ok) = configure_both(luid, &plan, server_addr);
    if !v4_ok && !v6_ok {
        log::error!("Neither IPv4 nor IPv6 configured");
    }

    let session = match adapter.start_session() {
        Ok(session) => session,
        Err(e) => {
            log::error!("{}", e);
            return 1;
        }
    };
    *ACTIVE_SESSION.write() = Some(session);
    log::info!("Up: {}", config.tun);

    match plugin.client_connect(config_text) {
        Ok(true) => {}
        Ok(false) => {
            log::error!("Client_Connect failed");
            *ACTIVE_SESSION.write() = None;
            adapter.end_session();
            return 1;
        }
        Err(e) => {
            log::error!("Client_Connect failed: {}", e);
            *ACTIVE_SESSION.write() = None;
            adapter.end_session();
            return 1;
        }
    }
    log::info!("Connected to {}:{}", server_host, config.port);

    log::info!("Serve loop started");
    let rc = plugin.client_serve(
        receive_from_net,
        send_to_net,
        WORKING.as_ptr() as *const u8,
    );
    log::info!("Serve loop exited rc={}", rc);

    plugin.client_disconnect();
    *ACTIVE_SESSION.write() = None;
    adapter.end_session();

    log::info!("Shutdown complete");
    rc
}

/// Start the client on a background worker. Returns 0, or -1 when already
/// running. The started bit flips before this returns so an immediate
/// `IsRunning` observes 1.
pub fn client_start(config_text: &str) -> i32 {
    if STARTED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return -1;
    }

    WORKING.store(1, Ordering::Relaxed);
    let config = config_text.to_owned();

    let spawned = std::thread::Builder::new()
        .name("tunforge-client".into())
        .spawn(move || {
            // A panic still unwinds the scoped resources inside client_main
            // (restoring the baseline); only the flags need fixing up here.
            let rc = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                client_main(&config)
            }))
            .unwrap_or_else(|_| {
                log::error!("Client worker panicked");
                1
            });
            LAST_EXIT_CODE.store(rc, Ordering::SeqCst);
            STARTED.store(false, Ordering::SeqCst);
        });

    match spawned {
        Ok(handle) => {
            *WORKER.lock() = Some(handle);
            0
        }
        Err(e) => {
            log::error!("Failed to spawn client worker: {}", e);
            STARTED.store(false, Ordering::SeqCst);
            -1
        }
    }
}

/// Request a cooperative stop. Returns 0, or -2 when not running. The
/// caller is never blocked: a detached helper joins the worker.
pub fn client_stop() -> i32 {
    if !STARTED.load(Ordering::SeqCst) {
        return -2;
    }
    WORKING.store(0, Ordering::Relaxed);

    std::thread::spawn(|| {
        let handle = WORKER.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        STARTED.store(false, Ordering::SeqCst);
    });

    0
}

/// 1 while the worker is alive, 0 otherwise.
pub fn is_client_running() -> i32 {
    STARTED.load(Ordering::SeqCst) as i32
}

/// Exit code stored by the last worker run: the plugin's serve return
/// value, or 1 for failed initialization.
pub fn last_exit_code() -> i32 {
    LAST_EXIT_CODE.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_frame(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut frame = vec![0u8; 20];
        frame[0] = 0x45;
        frame[12..16].copy_from_slice(&src);
        frame[16..20].copy_from_slice(&dst);
        frame
    }

    #[test]
    fn test_packet_info_v4() {
        let frame = v4_frame([10, 200, 0, 2], [1, 1, 1, 1]);
        assert_eq!(
            packet_info(&frame),
            Some(PacketInfo::V4 {
                src: Ipv4Addr::new(10, 200, 0, 2),
                dst: Ipv4Addr::new(1, 1, 1, 1),
            })
        );
    }

    #[test]
    fn test_packet_info_v6() {
        let mut frame = vec![0u8; 40];
        frame[0] = 0x60;
        assert_eq!(packet_info(&frame), Some(PacketInfo::V6));
    }

    #[test]
    fn test_packet_info_unknown_version() {
        let mut frame = vec![0u8; 20];
        frame[0] = 0x25;
        assert_eq!(packet_info(&frame), Some(PacketInfo::Unknown(2)));
    }

    #[test]
    fn test_packet_info_short_frame() {
        assert_eq!(packet_info(&[0x45u8; 19]), None);
        assert_eq!(packet_info(&[]), None);
    }

    #[test]
    fn test_stop_before_start() {
        // Nothing has been started in this process
        assert_eq!(is_client_running(), 0);
        assert_eq!(client_stop(), -2);
        // And still nothing running afterwards
        assert_eq!(is_client_running(), 0);
    }

    #[test]
    fn test_client_debounce_is_shorter_than_default() {
        assert!(CLIENT_DEBOUNCE < super::super::watcher::DEFAULT_DEBOUNCE);
    }
}
