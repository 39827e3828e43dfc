//! Baseline snapshot and rollback of routing state
//!
//! Captures the tunnel interface's metric/MTU baseline at construction and
//! undoes everything the configurator wrote when reverted (or dropped):
//! split-default halves, the pinned server route, then the interface
//! baseline. Only entries carrying the `NETMGMT` marker protocol are
//! touched, so unrelated routes survive.

use std::net::IpAddr;

use windows::Win32::Foundation::{ERROR_INVALID_PARAMETER, NO_ERROR};
use windows::Win32::NetworkManagement::IpHelper::{
    DeleteIpForwardEntry2, GetIpInterfaceEntry, InitializeIpInterfaceEntry, SetIpInterfaceEntry,
    MIB_IPFORWARD_ROW2, MIB_IPINTERFACE_ROW,
};
use windows::Win32::Networking::WinSock::MIB_IPPROTO_NETMGMT;

use super::network::{
    luid_of, sockaddr_ip, IpFamily, SPLIT_DEFAULTS_V4, SPLIT_DEFAULTS_V6,
};
use super::{VpnError, VpnResult};

/// Per-family interface baseline captured before any modification.
#[derive(Debug, Clone, Copy)]
struct FamilyBaseline {
    auto_metric: bool,
    metric: u32,
    mtu: u32,
}

/// Scoped rollback of network state. Construct after the adapter exists and
/// before the configurator runs; `revert()` (or Drop) restores the
/// pre-start picture.
pub struct NetworkRollback {
    luid: u64,
    server: Option<IpAddr>,
    baseline_v4: Option<FamilyBaseline>,
    baseline_v6: Option<FamilyBaseline>,
    captured: bool,
}

fn save_family(luid: u64, family: IpFamily) -> Option<FamilyBaseline> {
    let mut row = MIB_IPINTERFACE_ROW::default();
    unsafe {
        InitializeIpInterfaceEntry(&mut row);
    }
    row.Family = family.af();
    row.InterfaceLuid = luid_of(luid);
    if unsafe { GetIpInterfaceEntry(&mut row) } != NO_ERROR {
        return None;
    }
    let baseline = FamilyBaseline {
        auto_metric: row.UseAutomaticMetric.as_bool(),
        metric: row.Metric,
        mtu: row.NlMtu,
    };
    log::debug!(
        "Baseline {}: auto_metric={} metric={} mtu={}",
        family.tag(),
        baseline.auto_metric,
        baseline.metric,
        baseline.mtu
    );
    Some(baseline)
}

/// Write a captured baseline back. rc=87 is tolerated, matching the
/// forward path where some adapters reject interface-row updates.
fn restore_family(luid: u64, family: IpFamily, baseline: &FamilyBaseline) -> bool {
    let mut row = MIB_IPINTERFACE_ROW::default();
    unsafe {
        InitializeIpInterfaceEntry(&mut row);
    }
    row.Family = family.af();
    row.InterfaceLuid = luid_of(luid);
    if unsafe { GetIpInterfaceEntry(&mut row) } != NO_ERROR {
        return false;
    }

    row.UseAutomaticMetric = baseline.auto_metric.into();
    row.Metric = baseline.metric;
    let rc1 = unsafe { SetIpInterfaceEntry(&mut row) };
    if rc1 != NO_ERROR && rc1 != ERROR_INVALID_PARAMETER {
        log::warn!("Restore metric {} rc={}", family.tag(), rc1.0);
    }

    let mut row = MIB_IPINTERFACE_ROW::default();
    unsafe {
        InitializeIpInterfaceEntry(&mut row);
    }
    row.Family = family.af();
    row.InterfaceLuid = luid_of(luid);
    if unsafe { GetIpInterfaceEntry(&mut row) } != NO_ERROR {
        return rc1 == NO_ERROR;
    }
    row.NlMtu = baseline.mtu;
    let rc2 = unsafe { SetIpInterfaceEntry(&mut row) };
    if rc2 != NO_ERROR && rc2 != ERROR_INVALID_PARAMETER {
        log::warn!("Restore MTU {} rc={}", family.tag(), rc2.0);
    }

    (rc1 == NO_ERROR || rc1 == ERROR_INVALID_PARAMETER)
        && (rc2 == NO_ERROR || rc2 == ERROR_INVALID_PARAMETER)
}

/// Delete every forwarding entry of the family matching the predicate.
/// Returns false when the scan or any delete failed.
fn delete_routes_where(
    family: IpFamily,
    pred: impl Fn(&MIB_IPFORWARD_ROW2) -> bool,
) -> bool {
    let to_delete = match super::network::collect_routes(family, &pred) {
        Ok(rows) => rows,
        Err(e) => {
            log::error!("Forward table scan failed ({}): {}", family.tag(), e);
            return false;
        }
    };

    let mut ok = true;
    for row in &to_delete {
        let rc = unsafe { DeleteIpForwardEntry2(row) };
        if rc != NO_ERROR {
            log::warn!("DeleteIpForwardEntry2 {} rc={}", family.tag(), rc.0);
            ok = false;
        }
    }
    log::debug!(
        "Route cleanup {}: removed={} ok={}",
        family.tag(),
        to_delete.len(),
        ok
    );
    ok
}

/// Whether a forwarding row is one of our split-default halves.
pub fn is_split_default(row_luid: u64, prefix_len: u8, dest: Option<IpAddr>, our_luid: u64) -> bool {
    if row_luid != our_luid || prefix_len != 1 {
        return false;
    }
    match dest {
        Some(IpAddr::V4(v4)) => SPLIT_DEFAULTS_V4.contains(&v4),
        Some(IpAddr::V6(v6)) => SPLIT_DEFAULTS_V6.contains(&v6),
        None => false,
    }
}

/// Whether a forwarding row is the pinned host route to `server`.
///
/// The interface is deliberately not constrained: the pin may sit on the
/// underlying NIC rather than the tunnel adapter.
pub fn is_pinned_server_route(prefix_len: u8, dest: Option<IpAddr>, server: IpAddr) -> bool {
    let host_prefix = IpFamily::of(server).host_prefix();
    prefix_len == host_prefix && dest == Some(server)
}

impl NetworkRollback {
    /// Capture the interface baseline. Fails only when neither family can
    /// be read.
    pub fn new(luid: u64, server: Option<IpAddr>) -> VpnResult<Self> {
        log::info!(
            "Capturing baseline (IfLuid={}) server={:?}",
            luid,
            server
        );
        let baseline_v4 = save_family(luid, IpFamily::V4);
        let baseline_v6 = save_family(luid, IpFamily::V6);
        if baseline_v4.is_none() && baseline_v6.is_none() {
            return Err(VpnError::Network(
                "failed to capture interface baseline (v4/v6)".into(),
            ));
        }
        Ok(Self {
            luid,
            server,
            baseline_v4,
            baseline_v6,
            captured: true,
        })
    }

    pub fn has_baseline(&self) -> bool {
        self.captured
    }

    fn remove_split_defaults(&self) -> VpnResult<()> {
        let our_luid = self.luid;
        let ok4 = delete_routes_where(IpFamily::V4, |row| {
            row.Protocol == MIB_IPPROTO_NETMGMT
                && is_split_default(
                    unsafe { row.InterfaceLuid.Value },
                    row.DestinationPrefix.PrefixLength,
                    sockaddr_ip(&row.DestinationPrefix.Prefix),
                    our_luid,
                )
        });
        let ok6 = delete_routes_where(IpFamily::V6, |row| {
            row.Protocol == MIB_IPPROTO_NETMGMT
                && is_split_default(
                    unsafe { row.InterfaceLuid.Value },
                    row.DestinationPrefix.PrefixLength,
                    sockaddr_ip(&row.DestinationPrefix.Prefix),
                    our_luid,
                )
        });
        if !ok4 && !ok6 {
            return Err(VpnError::Network(
                "failed to remove split-default routes".into(),
            ));
        }
        log::info!("Split-defaults removed: v4={} v6={}", ok4, ok6);
        Ok(())
    }

    fn remove_pinned_server_route(&self) -> VpnResult<()> {
        let server = match self.server {
            Some(server) => server,
            None => {
                log::trace!("No server address, pinned-route removal skipped");
                return Ok(());
            }
        };

        let family = IpFamily::of(server);
        let ok = delete_routes_where(family, |row| {
            row.Protocol == MIB_IPPROTO_NETMGMT
                && unsafe { row.DestinationPrefix.Prefix.si_family } == family.af()
                && is_pinned_server_route(
                    row.DestinationPrefix.PrefixLength,
                    sockaddr_ip(&row.DestinationPrefix.Prefix),
                    server,
                )
        });
        if !ok {
            return Err(VpnError::Network(format!(
                "failed to remove pinned {} route",
                family.tag()
            )));
        }
        log::info!("Pinned {} route removed", family.tag());
        Ok(())
    }

    fn restore_baseline(&self) -> VpnResult<()> {
        let mut ok = true;
        if let Some(b) = &self.baseline_v4 {
            ok &= restore_family(self.luid, IpFamily::V4, b);
        }
        if let Some(b) = &self.baseline_v6 {
            ok &= restore_family(self.luid, IpFamily::V6, b);
        }
        if !ok {
            return Err(VpnError::Network(
                "failed to restore interface metrics/mtu".into(),
            ));
        }
        log::info!("Interface baseline restored");
        Ok(())
    }

    /// Undo everything: split-defaults, pinned server route, baseline.
    ///
    /// The three steps run independently; a failure in one still attempts
    /// the rest, and the aggregate is reported at the end. Single-use.
    pub fn revert(&mut self) -> VpnResult<()> {
        if !self.captured {
            return Err(VpnError::InvalidArgument(
                "revert called without a captured baseline".into(),
            ));
        }

        log::info!("Rollback: begin");
        let mut error = false;

        if let Err(e) = self.remove_split_defaults() {
            log::error!("Rollback: split-default removal failed: {}", e);
            error = true;
        }
        if let Err(e) = self.remove_pinned_server_route() {
            log::error!("Rollback: pinned-route removal failed: {}", e);
            error = true;
        }
        if let Err(e) = self.restore_baseline() {
            log::error!("Rollback: baseline restore failed: {}", e);
            error = true;
        }

        self.captured = false;

        if error {
            return Err(VpnError::Network(
                "rollback: one or more operations failed".into(),
            ));
        }
        log::info!("Rollback: done");
        Ok(())
    }
}

impl Drop for NetworkRollback {
    fn drop(&mut self) {
        if self.captured {
            if let Err(e) = self.revert() {
                log::warn!("Rollback on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUR_LUID: u64 = 0xAA00;

    #[test]
    fn test_split_default_predicate_matches_halves() {
        for dest in ["0.0.0.0", "128.0.0.0", "::", "8000::"] {
            let dest: IpAddr = dest.parse().unwrap();
            assert!(is_split_default(OUR_LUID, 1, Some(dest), OUR_LUID), "{}", dest);
        }
    }

    #[test]
    fn test_split_default_predicate_rejects_other_rows() {
        let zero: IpAddr = "0.0.0.0".parse().unwrap();
        // Wrong interface
        assert!(!is_split_default(0xBB00, 1, Some(zero), OUR_LUID));
        // Wrong prefix length
        assert!(!is_split_default(OUR_LUID, 0, Some(zero), OUR_LUID));
        // Not a half-space destination
        let other: IpAddr = "10.0.0.0".parse().unwrap();
        assert!(!is_split_default(OUR_LUID, 1, Some(other), OUR_LUID));
    }

    #[test]
    fn test_pinned_route_predicate() {
        let server: IpAddr = "198.51.100.7".parse().unwrap();
        assert!(is_pinned_server_route(32, Some(server), server));
        assert!(!is_pinned_server_route(24, Some(server), server));
        assert!(!is_pinned_server_route(
            32,
            Some("198.51.100.8".parse().unwrap()),
            server
        ));

        let server6: IpAddr = "2001:db8::7".parse().unwrap();
        assert!(is_pinned_server_route(128, Some(server6), server6));
        assert!(!is_pinned_server_route(64, Some(server6), server6));
    }
}
