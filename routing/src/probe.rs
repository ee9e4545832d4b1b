// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Routing-table and neighbour-table probing.
//!
//! The kernel decides how packets reach the metadata service; we dump its
//! IPv4 routing table, pick the most specific route covering the metadata
//! address, and resolve from it the outgoing interface, the source address,
//! and the two MAC addresses needed to hand-build Ethernet frames.

use crate::errors::RouteProbeError;
use futures::TryStreamExt;
use net::eth::Mac;
use net::interface::InterfaceName;
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::LinkAttribute;
use rtnetlink::packet_route::neighbour::{NeighbourAddress, NeighbourAttribute};
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute};
use rtnetlink::{Handle, IpVersion, RouteMessageBuilder};
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// Everything the packet classifier needs to know about the path to the
/// metadata service. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    /// The local address upstream connections originate from.
    pub src_ip: Ipv4Addr,
    /// The next-hop gateway toward the metadata service.
    pub gw_ip: Ipv4Addr,
    /// Kernel index of the outgoing interface.
    pub if_index: u32,
    /// Name of the outgoing interface.
    pub if_name: InterfaceName,
    /// MAC address of the outgoing interface.
    pub src_mac: Mac,
    /// MAC address of the gateway.
    pub gw_mac: Mac,
}

/// One route out of the kernel dump, reduced to the fields we select on.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RouteCandidate {
    dst: Ipv4Addr,
    prefix_len: u8,
    gateway: Option<IpAddr>,
    prefsrc: Option<IpAddr>,
    oif: Option<u32>,
}

impl RouteCandidate {
    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix_len))
        }
    }

    fn covers(&self, target: Ipv4Addr) -> bool {
        (u32::from(self.dst) ^ u32::from(target)) & self.mask() == 0
    }
}

/// Find the route used for sending packets to `target` and resolve the
/// interface, source address, gateway, and both MAC addresses.
///
/// # Errors
///
/// Returns a [`RouteProbeError`] if no route covers `target`, the best route
/// has no gateway or carries non-IPv4 addresses, the interface has no IPv4
/// address, or either MAC address cannot be resolved.
pub async fn probe(handle: &Handle, target: Ipv4Addr) -> Result<RouteDecision, RouteProbeError> {
    let candidates = dump_routes(handle).await?;
    let best = select_best(&candidates, target)?;
    debug!("best route to {target}: {best:?}");

    let oif = best.oif.ok_or(RouteProbeError::NoRoute(target))?;
    let gw_ip = match best.gateway {
        None => return Err(RouteProbeError::NoGateway(target)),
        Some(IpAddr::V4(ip)) => ip,
        Some(IpAddr::V6(_)) => return Err(RouteProbeError::AddressFamilyMismatch),
    };
    let src_ip = match best.prefsrc {
        Some(IpAddr::V4(ip)) => ip,
        Some(IpAddr::V6(_)) => return Err(RouteProbeError::AddressFamilyMismatch),
        None => interface_addr(handle, oif).await?,
    };

    let (if_name, src_mac) = link_info(handle, oif).await?;
    let gw_mac = neighbour_mac(handle, oif, gw_ip).await?;
    Ok(RouteDecision {
        src_ip,
        gw_ip,
        if_index: oif,
        if_name,
        src_mac,
        gw_mac,
    })
}

/// Dump the IPv4 routing table into [`RouteCandidate`]s.
async fn dump_routes(handle: &Handle) -> Result<Vec<RouteCandidate>, RouteProbeError> {
    let mut routes = handle
        .route()
        .get(RouteMessageBuilder::<Ipv4Addr>::new().build())
        .execute();
    let mut candidates = Vec::new();
    while let Some(route) = routes.try_next().await? {
        let mut candidate = RouteCandidate {
            dst: Ipv4Addr::UNSPECIFIED,
            prefix_len: route.header.destination_prefix_length,
            gateway: None,
            prefsrc: None,
            oif: None,
        };
        let mut v4_dst = route.header.destination_prefix_length == 0;
        for attr in &route.attributes {
            match attr {
                RouteAttribute::Destination(RouteAddress::Inet(ip)) => {
                    candidate.dst = *ip;
                    v4_dst = true;
                }
                RouteAttribute::Gateway(addr) => candidate.gateway = route_addr_ip(addr),
                RouteAttribute::PrefSource(addr) => candidate.prefsrc = route_addr_ip(addr),
                RouteAttribute::Oif(oif) => candidate.oif = Some(*oif),
                _ => {}
            }
        }
        // Routes keyed on something other than an IPv4 destination cannot
        // carry packets to the metadata address.
        if v4_dst {
            candidates.push(candidate);
        }
    }
    Ok(candidates)
}

fn route_addr_ip(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(ip) => Some(IpAddr::V4(*ip)),
        RouteAddress::Inet6(ip) => Some(IpAddr::V6(*ip)),
        _ => None,
    }
}

/// Pick the most specific candidate covering `target`; ties go to the
/// candidate seen last.
fn select_best(
    candidates: &[RouteCandidate],
    target: Ipv4Addr,
) -> Result<&RouteCandidate, RouteProbeError> {
    let mut best: Option<&RouteCandidate> = None;
    for candidate in candidates.iter().filter(|c| c.covers(target)) {
        match best {
            Some(b) if candidate.mask() < b.mask() => {}
            _ => best = Some(candidate),
        }
    }
    best.ok_or(RouteProbeError::NoRoute(target))
}

/// Name and MAC address of the interface with index `oif`.
async fn link_info(handle: &Handle, oif: u32) -> Result<(InterfaceName, Mac), RouteProbeError> {
    let mut links = handle.link().get().match_index(oif).execute();
    let link = links
        .try_next()
        .await?
        .ok_or(RouteProbeError::NoInterfaceName(oif))?;
    let mut name = None;
    let mut mac = None;
    for attr in &link.attributes {
        match attr {
            LinkAttribute::IfName(n) => name = Some(InterfaceName::try_from(n.as_str())?),
            LinkAttribute::Address(bytes) => mac = Some(Mac::try_from(bytes.as_slice())?),
            _ => {}
        }
    }
    let name = name.ok_or(RouteProbeError::NoInterfaceName(oif))?;
    let mac = mac.ok_or(RouteProbeError::NoInterfaceMac(oif))?;
    Ok((name, mac))
}

/// First IPv4 address configured on the interface with index `oif`, for
/// routes which carry no preferred source address.
async fn interface_addr(handle: &Handle, oif: u32) -> Result<Ipv4Addr, RouteProbeError> {
    let mut addrs = handle
        .address()
        .get()
        .set_link_index_filter(oif)
        .execute();
    while let Some(msg) = addrs.try_next().await? {
        for attr in &msg.attributes {
            if let AddressAttribute::Address(IpAddr::V4(ip)) = attr {
                return Ok(*ip);
            }
        }
    }
    Err(RouteProbeError::NoSourceAddress(oif))
}

/// Look up the MAC address the neighbour (ARP) table holds for `ip` on the
/// interface with index `oif`. Fails if the kernel has no cached entry.
async fn neighbour_mac(handle: &Handle, oif: u32, ip: Ipv4Addr) -> Result<Mac, RouteProbeError> {
    let mut neighbours = handle
        .neighbours()
        .get()
        .set_family(IpVersion::V4)
        .execute();
    while let Some(entry) = neighbours.try_next().await? {
        if entry.header.ifindex != oif {
            continue;
        }
        let mut matches = false;
        let mut lladdr = None;
        for attr in &entry.attributes {
            match attr {
                NeighbourAttribute::Destination(NeighbourAddress::Inet(dst)) => {
                    matches = *dst == ip;
                }
                NeighbourAttribute::LinkLocalAddress(bytes) => {
                    lladdr = Some(bytes.clone());
                }
                _ => {}
            }
        }
        if matches {
            if let Some(bytes) = lladdr {
                return Ok(Mac::try_from(bytes.as_slice())?);
            }
        }
    }
    Err(RouteProbeError::MacNotFound(ip))
}

#[cfg(test)]
mod test {
    use super::{RouteCandidate, select_best};
    use crate::errors::RouteProbeError;
    use std::net::{IpAddr, Ipv4Addr};

    const TARGET: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

    fn candidate(dst: [u8; 4], prefix_len: u8, oif: u32) -> RouteCandidate {
        RouteCandidate {
            dst: Ipv4Addr::from(dst),
            prefix_len,
            gateway: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            prefsrc: None,
            oif: Some(oif),
        }
    }

    #[test]
    fn empty_table_has_no_route() {
        assert!(matches!(
            select_best(&[], TARGET),
            Err(RouteProbeError::NoRoute(_))
        ));
    }

    #[test]
    fn non_covering_routes_are_ignored() {
        let candidates = vec![candidate([10, 0, 0, 0], 8, 1), candidate([192, 168, 0, 0], 16, 2)];
        assert!(matches!(
            select_best(&candidates, TARGET),
            Err(RouteProbeError::NoRoute(_))
        ));
    }

    #[test]
    fn most_specific_route_wins() {
        let candidates = vec![
            candidate([0, 0, 0, 0], 0, 1),
            candidate([169, 254, 169, 254], 32, 3),
            candidate([169, 254, 0, 0], 16, 2),
        ];
        assert_eq!(select_best(&candidates, TARGET).unwrap().oif, Some(3));
    }

    #[test]
    fn default_route_matches_when_nothing_better() {
        let candidates = vec![candidate([10, 0, 0, 0], 8, 1), candidate([0, 0, 0, 0], 0, 7)];
        assert_eq!(select_best(&candidates, TARGET).unwrap().oif, Some(7));
    }

    #[test]
    fn equal_masks_prefer_the_last_seen() {
        let candidates = vec![
            candidate([169, 254, 0, 0], 16, 1),
            candidate([169, 254, 0, 0], 16, 2),
        ];
        assert_eq!(select_best(&candidates, TARGET).unwrap().oif, Some(2));
    }
}
