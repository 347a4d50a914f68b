//! CIDR matching for address and network targets

use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// True if `net` and `other` share at least one address
///
/// CIDR blocks are either nested or disjoint, so checking each network
/// address against the other block is enough.
pub fn overlaps(net: &IpNetwork, other: &IpNetwork) -> bool {
    net.contains(other.network()) || other.contains(net.network())
}

/// True if every address of `inner` lies inside `outer`
pub fn covers(outer: &IpNetwork, inner: &IpNetwork) -> bool {
    outer.contains(inner.network()) && outer.prefix() <= inner.prefix()
}

pub fn address_denied(addr: IpAddr, deny: &[IpNetwork]) -> Option<IpNetwork> {
    deny.iter().find(|d| d.contains(addr)).copied()
}

pub fn network_denied(net: &IpNetwork, deny: &[IpNetwork]) -> Option<IpNetwork> {
    deny.iter().find(|d| overlaps(d, net)).copied()
}

pub fn address_allowed(addr: IpAddr, allow: &[IpNetwork]) -> bool {
    allow.iter().any(|a| a.contains(addr))
}

pub fn network_allowed(net: &IpNetwork, allow: &[IpNetwork]) -> bool {
    allow.iter().any(|a| covers(a, net))
}
