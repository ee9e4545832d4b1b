// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Shared network types for the metadata filtering daemons: validated MAC and
//! interface-name newtypes, IPv4/TCP flow extraction, Ethernet frame header
//! construction, and the connection-ownership wire format.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

pub mod eth;
pub mod flow;
pub mod ident;
pub mod interface;

use std::net::{Ipv4Addr, SocketAddrV4};

/// The fixed link-local address of the Instance Metadata Service.
pub const METADATA_ADDR: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

/// The TCP port the Instance Metadata Service listens on.
pub const METADATA_PORT: u16 = 80;

/// The full metadata endpoint as a socket address.
#[must_use]
pub fn metadata_endpoint() -> SocketAddrV4 {
    SocketAddrV4::new(METADATA_ADDR, METADATA_PORT)
}
