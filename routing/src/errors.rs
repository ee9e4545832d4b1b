// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The error results used by this library.

use net::interface::IllegalInterfaceName;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouteProbeError {
    #[error("no route to {0}")]
    NoRoute(Ipv4Addr),

    #[error("best route to {0} has no gateway")]
    NoGateway(Ipv4Addr),

    #[error("IPv4 route carries a non-IPv4 address")]
    AddressFamilyMismatch,

    #[error("no link-layer address known for {0}")]
    MacNotFound(Ipv4Addr),

    #[error("interface {0} has no link-layer address")]
    NoInterfaceMac(u32),

    #[error("interface {0} has no IPv4 address")]
    NoSourceAddress(u32),

    #[error("interface {0} has no name")]
    NoInterfaceName(u32),

    #[error("interface name rejected: {0}")]
    BadInterfaceName(#[from] IllegalInterfaceName),

    #[error("malformed link-layer address: {0}")]
    BadMac(#[from] net::eth::InvalidMac),

    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),
}
