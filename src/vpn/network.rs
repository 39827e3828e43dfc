//! Network configuration for the tunnel interface
//!
//! Applies the per-family network state that routes traffic into the
//! adapter: MTU, unicast address with an on-link prefix, interface metric,
//! a pinned host route to the transport server over the underlying path,
//! and the split-default pair that overrides the system default route at a
//! more specific prefix without deleting it.
//!
//! Every route installed here carries protocol `MIB_IPPROTO_NETMGMT`, which
//! is the marker rollback later uses to find our footprint.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use windows::Win32::Foundation::{
    ERROR_INVALID_PARAMETER, ERROR_OBJECT_ALREADY_EXISTS, NO_ERROR, WIN32_ERROR,
};
use windows::Win32::NetworkManagement::IpHelper::{
    CreateIpForwardEntry, CreateIpForwardEntry2, CreateUnicastIpAddressEntry, FreeMibTable,
    GetBestRoute2, GetIpForwardTable2, GetIpInterfaceEntry, InitializeIpForwardEntry,
    InitializeIpInterfaceEntry, InitializeUnicastIpAddressEntry, SetIpForwardEntry2,
    SetIpInterfaceEntry, SetUnicastIpAddressEntry, MIB_IPFORWARDROW, MIB_IPFORWARD_PROTO,
    MIB_IPFORWARD_ROW2, MIB_IPFORWARD_TABLE2, MIB_IPINTERFACE_ROW, MIB_IPROUTE_TYPE_DIRECT,
    MIB_IPROUTE_TYPE_INDIRECT, MIB_UNICASTIPADDRESS_ROW,
};
use windows::Win32::NetworkManagement::Ndis::NET_LUID_LH;
use windows::Win32::Networking::WinSock::{
    IpDadStatePreferred, IpPrefixOriginManual, IpSuffixOriginOther, ADDRESS_FAMILY, AF_INET,
    AF_INET6, MIB_IPPROTO_NETMGMT, SOCKADDR_INET,
};

use super::config::AddressPlan;
use super::{VpnError, VpnResult};

/// Metric used for every route and interface this module writes.
pub const TUNNEL_METRIC: u32 = 1;

/// IPv4 split-default halves, routed via the v4 peer.
pub const SPLIT_DEFAULTS_V4: [Ipv4Addr; 2] =
    [Ipv4Addr::new(0, 0, 0, 0), Ipv4Addr::new(128, 0, 0, 0)];

/// IPv6 split-default halves, routed via the v6 peer.
pub const SPLIT_DEFAULTS_V6: [Ipv6Addr; 2] = [
    Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0),
    Ipv6Addr::new(0x8000, 0, 0, 0, 0, 0, 0, 0),
];

/// Address family selector for the one-family configure facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn af(self) -> ADDRESS_FAMILY {
        match self {
            IpFamily::V4 => AF_INET,
            IpFamily::V6 => AF_INET6,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            IpFamily::V4 => "v4",
            IpFamily::V6 => "v6",
        }
    }

    /// Host-route prefix length (/32 or /128).
    pub fn host_prefix(self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }

    /// On-link prefix advertised with the unicast address. Deliberately a
    /// subnet rather than a host prefix: peers become on-link without
    /// ARP/ND to a gateway, while the split-default supplies the routing.
    pub fn onlink_prefix(self) -> u8 {
        match self {
            IpFamily::V4 => 22,
            IpFamily::V6 => 64,
        }
    }

    pub fn of(addr: IpAddr) -> IpFamily {
        if addr.is_ipv6() {
            IpFamily::V6
        } else {
            IpFamily::V4
        }
    }
}

pub fn luid_of(value: u64) -> NET_LUID_LH {
    NET_LUID_LH { Value: value }
}

/// Build a SOCKADDR_INET for an address.
pub fn sockaddr_from(addr: IpAddr) -> SOCKADDR_INET {
    let mut sa = SOCKADDR_INET::default();
    unsafe {
        match addr {
            IpAddr::V4(v4) => {
                sa.Ipv4.sin_family = AF_INET;
                sa.Ipv4.sin_addr.S_un.S_addr = u32::from_ne_bytes(v4.octets());
            }
            IpAddr::V6(v6) => {
                sa.Ipv6.sin6_family = AF_INET6;
                sa.Ipv6.sin6_addr.u.Byte = v6.octets();
            }
        }
    }
    sa
}

/// Zero next-hop of the family, meaning on-link.
pub fn onlink_next_hop(family: IpFamily) -> SOCKADDR_INET {
    match family {
        IpFamily::V4 => sockaddr_from(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        IpFamily::V6 => sockaddr_from(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
    }
}

/// Read the address back out of a SOCKADDR_INET; None for other families.
pub fn sockaddr_ip(sa: &SOCKADDR_INET) -> Option<IpAddr> {
    unsafe {
        if sa.si_family == AF_INET {
            Some(IpAddr::V4(Ipv4Addr::from(
                sa.Ipv4.sin_addr.S_un.S_addr.to_ne_bytes(),
            )))
        } else if sa.si_family == AF_INET6 {
            Some(IpAddr::V6(Ipv6Addr::from(sa.Ipv6.sin6_addr.u.Byte)))
        } else {
            None
        }
    }
}

fn load_interface_row(luid: u64, family: IpFamily) -> VpnResult<MIB_IPINTERFACE_ROW> {
    let mut row = MIB_IPINTERFACE_ROW::default();
    unsafe {
        InitializeIpInterfaceEntry(&mut row);
    }
    row.Family = family.af();
    row.InterfaceLuid = luid_of(luid);
    let rc = unsafe { GetIpInterfaceEntry(&mut row) };
    if rc != NO_ERROR {
        return Err(VpnError::Network(format!(
            "GetIpInterfaceEntry({}) failed rc={}",
            family.tag(),
            rc.0
        )));
    }
    Ok(row)
}

/// Set the interface metric for one family.
///
/// Some adapter kinds reject interface-row updates with rc=87 and offer no
/// remediation, so that code is downgraded to a warning.
pub fn set_if_metric(luid: u64, metric: u32, family: IpFamily) -> VpnResult<()> {
    let mut row = load_interface_row(luid, family)?;
    row.UseAutomaticMetric = false.into();
    row.Metric = metric;

    let rc = unsafe { SetIpInterfaceEntry(&mut row) };
    if rc == ERROR_INVALID_PARAMETER {
        log::warn!(
            "SetIpInterfaceEntry({} metric={}) rc=87, ignored",
            family.tag(),
            metric
        );
        return Ok(());
    }
    if rc != NO_ERROR {
        return Err(VpnError::Network(format!(
            "SetIpInterfaceEntry({} metric) failed rc={}",
            family.tag(),
            rc.0
        )));
    }
    log::debug!("Interface metric set: {} metric={}", family.tag(), metric);
    Ok(())
}

/// Set the interface MTU for one family. rc=87 downgraded like the metric.
pub fn set_if_mtu(luid: u64, mtu: u32, family: IpFamily) -> VpnResult<()> {
    let mut row = load_interface_row(luid, family)?;
    row.NlMtu = mtu;

    let rc = unsafe { SetIpInterfaceEntry(&mut row) };
    if rc == ERROR_INVALID_PARAMETER {
        log::warn!("SetIpInterfaceEntry({} mtu={}) rc=87, ignored", family.tag(), mtu);
        return Ok(());
    }
    if rc != NO_ERROR {
        return Err(VpnError::Network(format!(
            "SetIpInterfaceEntry({} mtu) failed rc={}",
            family.tag(),
            rc.0
        )));
    }
    log::debug!("Interface MTU set: {} mtu={}", family.tag(), mtu);
    Ok(())
}

/// Add (or update in place) a unicast address on the interface.
pub fn add_ip_address_on_if(
    luid: u64,
    addr: IpAddr,
    prefix_len: u8,
    family: IpFamily,
) -> VpnResult<()> {
    if IpFamily::of(addr) != family {
        return Err(VpnError::InvalidArgument(format!(
            "address {} does not match family {}",
            addr,
            family.tag()
        )));
    }

    let mut row = MIB_UNICASTIPADDRESS_ROW::default();
    unsafe {
        InitializeUnicastIpAddressEntry(&mut row);
    }
    row.InterfaceLuid = luid_of(luid);
    row.Address = sockaddr_from(addr);
    row.PrefixOrigin = IpPrefixOriginManual;
    row.SuffixOrigin = IpSuffixOriginOther;
    row.ValidLifetime = 0xFFFF_FFFF;
    row.PreferredLifetime = 0xFFFF_FFFF;
    row.DadState = IpDadStatePreferred;
    row.OnLinkPrefixLength = prefix_len;

    let rc = unsafe { CreateUnicastIpAddressEntry(&row) };
    if rc == NO_ERROR {
        log::info!("Unicast IP added: {} {}/{}", family.tag(), addr, prefix_len);
        return Ok(());
    }
    if rc == ERROR_OBJECT_ALREADY_EXISTS {
        let rc2 = unsafe { SetUnicastIpAddressEntry(&row) };
        if rc2 == NO_ERROR {
            log::info!("Unicast IP updated: {} {}/{}", family.tag(), addr, prefix_len);
            return Ok(());
        }
    }
    Err(VpnError::Network(format!(
        "Create/SetUnicastIpAddressEntry({} {}/{}) rc={}",
        family.tag(),
        addr,
        prefix_len,
        rc.0
    )))
}

/// Current best route to a destination, if the OS has one.
pub fn get_best_route_to(dest: IpAddr) -> Option<MIB_IPFORWARD_ROW2> {
    let dst = sockaddr_from(dest);
    let mut route = MIB_IPFORWARD_ROW2::default();
    let mut best_source = SOCKADDR_INET::default();

    let rc = unsafe { GetBestRoute2(None, 0, None, &dst, 0, &mut route, &mut best_source) };
    if rc == NO_ERROR {
        log::debug!(
            "Best route to {}: IfLuid={}",
            dest,
            unsafe { route.InterfaceLuid.Value }
        );
        Some(route)
    } else {
        log::trace!("No best route to {} (rc={})", dest, rc.0);
        None
    }
}

/// Run `f` over every row of the forwarding table for a family.
fn with_forward_table<T>(
    family: IpFamily,
    f: impl FnOnce(&[MIB_IPFORWARD_ROW2]) -> T,
) -> VpnResult<T> {
    let mut table: *mut MIB_IPFORWARD_TABLE2 = std::ptr::null_mut();
    let rc = unsafe { GetIpForwardTable2(family.af(), &mut table) };
    if rc != NO_ERROR {
        return Err(VpnError::Network(format!(
            "GetIpForwardTable2({}) failed rc={}",
            family.tag(),
            rc.0
        )));
    }

    let result = unsafe {
        let rows =
            std::slice::from_raw_parts((*table).Table.as_ptr(), (*table).NumEntries as usize);
        let out = f(rows);
        FreeMibTable(table as *const _);
        out
    };
    Ok(result)
}

/// Collect the rows of a family's forwarding table matching a predicate.
pub fn collect_routes(
    family: IpFamily,
    pred: &impl Fn(&MIB_IPFORWARD_ROW2) -> bool,
) -> VpnResult<Vec<MIB_IPFORWARD_ROW2>> {
    with_forward_table(family, |rows| {
        rows.iter().filter(|row| pred(row)).copied().collect()
    })
}

/// Lowest-metric default route of the family, excluding our own adapter.
pub fn fallback_default_route_excluding(
    exclude_luid: u64,
    family: IpFamily,
) -> VpnResult<Option<MIB_IPFORWARD_ROW2>> {
    log::trace!(
        "Searching {} default route excluding IfLuid={}",
        family.tag(),
        exclude_luid
    );
    let best = with_forward_table(family, |rows| {
        let mut best: Option<MIB_IPFORWARD_ROW2> = None;
        for row in rows {
            if unsafe { row.InterfaceLuid.Value } == exclude_luid {
                continue;
            }
            if unsafe { row.DestinationPrefix.Prefix.si_family } != family.af() {
                continue;
            }
            if row.DestinationPrefix.PrefixLength != 0 {
                continue;
            }
            if best.map_or(true, |b| row.Metric < b.Metric) {
                best = Some(*row);
            }
        }
        best
    })?;

    match &best {
        Some(row) => log::debug!(
            "Fallback default route: IfLuid={} metric={}",
            unsafe { row.InterfaceLuid.Value },
            row.Metric
        ),
        None => log::trace!("No {} default route found", family.tag()),
    }
    Ok(best)
}

fn host_route_template(
    host: IpAddr,
    via: &MIB_IPFORWARD_ROW2,
    metric: u32,
    family: IpFamily,
) -> MIB_IPFORWARD_ROW2 {
    let mut desired = MIB_IPFORWARD_ROW2::default();
    unsafe {
        InitializeIpForwardEntry(&mut desired);
    }
    desired.InterfaceLuid = via.InterfaceLuid;
    desired.DestinationPrefix.Prefix = sockaddr_from(host);
    desired.DestinationPrefix.PrefixLength = family.host_prefix();

    // Next hop: the gateway from `via` when it matches the family, on-link
    // zero otherwise.
    if unsafe { via.NextHop.si_family } == family.af() {
        desired.NextHop = via.NextHop;
    } else {
        desired.NextHop = onlink_next_hop(family);
    }

    desired.Metric = metric;
    desired.Protocol = MIB_IPPROTO_NETMGMT;
    desired
}

/// Install or update the pinned host route to the server.
///
/// An existing host-prefix entry for the same destination is modified in
/// place (Set) rather than deleted and recreated, so no unreachability
/// window opens. IPv4 creation falls back to the legacy forward-row API
/// when the modern call rejects the /32; there is no legacy API for IPv6.
pub fn add_or_update_host_route_via(
    host: IpAddr,
    via: &MIB_IPFORWARD_ROW2,
    metric: u32,
) -> VpnResult<()> {
    let family = IpFamily::of(host);
    if unsafe { via.DestinationPrefix.Prefix.si_family } != family.af() {
        return Err(VpnError::InvalidArgument(
            "host route family mismatch".into(),
        ));
    }

    let desired = host_route_template(host, via, metric, family);

    // Update an existing /32 or /128 entry for this destination, if any.
    let existing = with_forward_table(family, |rows| {
        rows.iter()
            .find(|row| {
                unsafe { row.DestinationPrefix.Prefix.si_family } == family.af()
                    && row.DestinationPrefix.PrefixLength == family.host_prefix()
                    && sockaddr_ip(&row.DestinationPrefix.Prefix) == Some(host)
            })
            .copied()
    })?;

    if let Some(mut row) = existing {
        row.InterfaceLuid = desired.InterfaceLuid;
        row.NextHop = desired.NextHop;
        row.Metric = desired.Metric;
        row.Protocol = MIB_IPPROTO_NETMGMT;
        let rc = unsafe { SetIpForwardEntry2(&row) };
        if rc != NO_ERROR {
            return Err(VpnError::Network(format!(
                "SetIpForwardEntry2(host) failed rc={}",
                rc.0
            )));
        }
        log::info!("Host route updated: {} {} metric={}", family.tag(), host, metric);
        return Ok(());
    }

    let rc = unsafe { CreateIpForwardEntry2(&desired) };
    if rc == NO_ERROR || rc == ERROR_OBJECT_ALREADY_EXISTS {
        log::info!("Host route created: {} {} metric={}", family.tag(), host, metric);
        return Ok(());
    }

    if family == IpFamily::V6 {
        return Err(VpnError::Network(format!(
            "CreateIpForwardEntry2(v6 /128) rc={}",
            rc.0
        )));
    }

    log::warn!("CreateIpForwardEntry2(v4 /32) rc={}, trying legacy API", rc.0);
    legacy_create_v4_host_route(&desired, via.InterfaceIndex, metric)?;
    log::info!("Host route (legacy) created: v4 {} metric={}", host, metric);
    Ok(())
}

fn legacy_create_v4_host_route(
    desired: &MIB_IPFORWARD_ROW2,
    if_index: u32,
    metric: u32,
) -> VpnResult<()> {
    let dest = unsafe { desired.DestinationPrefix.Prefix.Ipv4.sin_addr.S_un.S_addr };
    let next_hop = unsafe { desired.NextHop.Ipv4.sin_addr.S_un.S_addr };

    let mut row = MIB_IPFORWARDROW::default();
    row.dwForwardDest = dest;
    row.dwForwardMask = 0xFFFF_FFFF;
    row.dwForwardPolicy = 0;
    row.dwForwardNextHop = next_hop;
    row.dwForwardIfIndex = if_index;
    row.Anonymous1 = windows::Win32::NetworkManagement::IpHelper::MIB_IPFORWARDROW_0 {
        ForwardType: if next_hop == 0 {
            MIB_IPROUTE_TYPE_DIRECT
        } else {
            MIB_IPROUTE_TYPE_INDIRECT
        },
    };
    row.Anonymous2 = windows::Win32::NetworkManagement::IpHelper::MIB_IPFORWARDROW_1 {
        ForwardProto: MIB_IPFORWARD_PROTO(MIB_IPPROTO_NETMGMT.0),
    };
    row.dwForwardMetric1 = metric;

    let rc = WIN32_ERROR(unsafe { CreateIpForwardEntry(&row) });
    if rc == NO_ERROR || rc == ERROR_OBJECT_ALREADY_EXISTS {
        Ok(())
    } else {
        Err(VpnError::Network(format!(
            "CreateIpForwardEntry(legacy v4 /32) rc={}",
            rc.0
        )))
    }
}

/// Add a route through an explicit gateway on our interface.
pub fn add_route_via_gateway(
    luid: u64,
    prefix: IpAddr,
    prefix_len: u8,
    gateway: IpAddr,
    metric: u32,
) -> VpnResult<()> {
    let family = IpFamily::of(prefix);
    if IpFamily::of(gateway) != family {
        return Err(VpnError::InvalidArgument(
            "route prefix and gateway family mismatch".into(),
        ));
    }

    let mut row = MIB_IPFORWARD_ROW2::default();
    unsafe {
        InitializeIpForwardEntry(&mut row);
    }
    row.InterfaceLuid = luid_of(luid);
    row.DestinationPrefix.Prefix = sockaddr_from(prefix);
    row.DestinationPrefix.PrefixLength = prefix_len;
    row.NextHop = sockaddr_from(gateway);
    row.Metric = metric;
    row.Protocol = MIB_IPPROTO_NETMGMT;

    let rc = unsafe { CreateIpForwardEntry2(&row) };
    if rc == NO_ERROR || rc == ERROR_OBJECT_ALREADY_EXISTS {
        log::info!(
            "Route ensured: {} {}/{} via {} metric={}",
            family.tag(),
            prefix,
            prefix_len,
            gateway,
            metric
        );
        return Ok(());
    }
    Err(VpnError::Network(format!(
        "CreateIpForwardEntry2({} {}/{} via {}) rc={}",
        family.tag(),
        prefix,
        prefix_len,
        gateway,
        rc.0
    )))
}

/// Apply one family's configuration to the tunnel interface, idempotently.
///
/// Order matters: MTU, unicast address, metric, then the pinned host route
/// to the server over the pre-existing path, and only after a successful
/// pin the split-default pair via the peer. Activating the split-default
/// without the pin would route transport traffic into the tunnel itself.
/// `server == None` (unresolvable host) skips both the pin and the
/// split-defaults for every family.
pub fn configure_network(
    luid: u64,
    plan: &AddressPlan,
    server: Option<IpAddr>,
    family: IpFamily,
) -> VpnResult<()> {
    log::info!(
        "Configure network: begin family={} server={:?}",
        family.tag(),
        server
    );

    set_if_mtu(luid, plan.mtu, family)?;
    match family {
        IpFamily::V4 => {
            add_ip_address_on_if(
                luid,
                IpAddr::V4(plan.local4),
                IpFamily::V4.onlink_prefix(),
                IpFamily::V4,
            )?;
            set_if_metric(luid, TUNNEL_METRIC, IpFamily::V4)?;
        }
        IpFamily::V6 => {
            add_ip_address_on_if(
                luid,
                IpAddr::V6(plan.local6),
                IpFamily::V6.onlink_prefix(),
                IpFamily::V6,
            )?;
            set_if_metric(luid, TUNNEL_METRIC, IpFamily::V6)?;
        }
    }

    // Pin only when the server's family matches the one being configured;
    // the other family needs no pin and may activate directly.
    let mut pinned = false;
    match server {
        Some(server) if IpFamily::of(server) == family => {
            let best = match get_best_route_to(server) {
                Some(route) => Some(route),
                None => fallback_default_route_excluding(luid, family)?,
            };

            match best {
                Some(via) => {
                    add_or_update_host_route_via(server, &via, TUNNEL_METRIC)?;
                    log::info!(
                        "Pinned {} host route to {} via IfLuid={}",
                        family.tag(),
                        server,
                        unsafe { via.InterfaceLuid.Value }
                    );
                    pinned = true;
                }
                None => {
                    log::warn!("No {} route to server before switch", family.tag());
                }
            }
        }
        Some(_) => {
            log::trace!("Pin not needed: server family differs");
            pinned = true;
        }
        None => {
            log::warn!("Server address unknown, leaving defaults untouched");
        }
    }

    if pinned {
        match family {
            IpFamily::V4 => {
                for half in SPLIT_DEFAULTS_V4 {
                    add_route_via_gateway(
                        luid,
                        IpAddr::V4(half),
                        1,
                        IpAddr::V4(plan.peer4),
                        TUNNEL_METRIC,
                    )?;
                }
            }
            IpFamily::V6 => {
                for half in SPLIT_DEFAULTS_V6 {
                    add_route_via_gateway(
                        luid,
                        IpAddr::V6(half),
                        1,
                        IpAddr::V6(plan.peer6),
                        TUNNEL_METRIC,
                    )?;
                }
            }
        }
        log::info!("Defaults activated via tunnel peer ({})", family.tag());
    }

    log::info!("Configure network: done family={}", family.tag());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_prefixes() {
        assert_eq!(IpFamily::V4.host_prefix(), 32);
        assert_eq!(IpFamily::V6.host_prefix(), 128);
        assert_eq!(IpFamily::V4.onlink_prefix(), 22);
        assert_eq!(IpFamily::V6.onlink_prefix(), 64);
    }

    #[test]
    fn test_family_of_addr() {
        assert_eq!(IpFamily::of("10.0.0.1".parse().unwrap()), IpFamily::V4);
        assert_eq!(IpFamily::of("fd00::1".parse().unwrap()), IpFamily::V6);
    }

    #[test]
    fn test_split_default_halves() {
        assert_eq!(SPLIT_DEFAULTS_V4[0].to_string(), "0.0.0.0");
        assert_eq!(SPLIT_DEFAULTS_V4[1].to_string(), "128.0.0.0");
        assert_eq!(SPLIT_DEFAULTS_V6[0].to_string(), "::");
        assert_eq!(SPLIT_DEFAULTS_V6[1].to_string(), "8000::");
    }

    #[test]
    fn test_sockaddr_round_trip_v4() {
        let addr: IpAddr = "192.0.2.33".parse().unwrap();
        let sa = sockaddr_from(addr);
        assert_eq!(sockaddr_ip(&sa), Some(addr));
    }

    #[test]
    fn test_sockaddr_round_trip_v6() {
        let addr: IpAddr = "2001:db8::beef".parse().unwrap();
        let sa = sockaddr_from(addr);
        assert_eq!(sockaddr_ip(&sa), Some(addr));
    }

    #[test]
    fn test_onlink_next_hop_is_zero() {
        assert_eq!(
            sockaddr_ip(&onlink_next_hop(IpFamily::V4)),
            Some("0.0.0.0".parse().unwrap())
        );
        assert_eq!(
            sockaddr_ip(&onlink_next_hop(IpFamily::V6)),
            Some("::".parse().unwrap())
        );
    }
}
