// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The isolated network compartment and the tunnel pair bridging it to the
//! host: a named network namespace, two point-to-point tun devices, and the
//! opposing addresses assigned on each side.

#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

pub mod netns;
mod tun;

pub use tun::TunDevice;

use futures::TryStreamExt;
use net::interface::{IllegalInterfaceName, InterfaceName};
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::{Handle, LinkUnspec};
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the host-side tunnel interface.
pub const HOST_TUN: &str = "imds-tun";

/// Name of the compartment-side tunnel interface.
pub const JAIL_TUN: &str = "imds-tunout";

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("interface {0} already exists")]
    AlreadyExists(InterfaceName),

    #[error("interface {0} not found")]
    NotFound(InterfaceName),

    #[error("illegal interface name: {0}")]
    BadName(#[from] IllegalInterfaceName),

    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("namespace error: {0}")]
    Namespace(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The two tunnel devices wiring the compartment to the host.
///
/// The tun file descriptors are owned here and live for the daemon's
/// lifetime; since the devices are not persisted, closing the descriptors
/// (on drop) destroys them.
#[derive(Debug)]
pub struct TunnelPair {
    /// Host-side device, addressed `src_ip -> metadata_ip`.
    pub host: TunDevice,
    /// Compartment-side device, addressed `metadata_ip -> src_ip`.
    pub jail: TunDevice,
    netns: String,
}

impl TunnelPair {
    /// Create the tunnel pair: `imds-tun` stays on the host and `imds-tunout`
    /// is moved into the named compartment; each side gets its point-to-point
    /// addresses and is brought up.
    ///
    /// # Errors
    ///
    /// Fails if either interface name is already taken, or on any netlink or
    /// tun ioctl failure. Partial setup is unwound by dropping the devices.
    pub async fn setup(
        handle: &Handle,
        netns_name: &str,
        src_ip: Ipv4Addr,
        metadata_ip: Ipv4Addr,
    ) -> Result<TunnelPair, TunnelError> {
        let host_name = InterfaceName::try_from(HOST_TUN)?;
        let jail_name = InterfaceName::try_from(JAIL_TUN)?;

        for name in [&host_name, &jail_name] {
            if link_index(handle, name).await?.is_some() {
                return Err(TunnelError::AlreadyExists(name.clone()));
            }
        }

        let host = TunDevice::create(host_name.clone())?;
        let jail = TunDevice::create(jail_name.clone())?;

        // Move the compartment-side device before addressing anything; its fd
        // keeps working across the namespace change.
        let jail_index = link_index(handle, &jail_name)
            .await?
            .ok_or_else(|| TunnelError::NotFound(jail_name.clone()))?;
        let ns_file = std::fs::File::open(netns::path(netns_name))?;
        handle
            .link()
            .set(
                LinkUnspec::new_with_index(jail_index)
                    .setns_by_fd(ns_file.as_raw_fd())
                    .build(),
            )
            .execute()
            .await?;
        debug!("moved {jail_name} into compartment {netns_name}");

        let host_index = link_index(handle, &host_name)
            .await?
            .ok_or_else(|| TunnelError::NotFound(host_name.clone()))?;
        add_ptp_addr(handle, host_index, src_ip, metadata_ip).await?;
        link_up(handle, host_index).await?;

        // The compartment's interfaces are only visible to a netlink socket
        // opened inside it; a short-lived worker thread joins the namespace
        // and performs the assignment there.
        let ns_path = netns::path(netns_name);
        let jail_name_for_worker = jail_name.clone();
        netns::in_netns(&ns_path, move || async move {
            let (connection, handle, _) =
                rtnetlink::new_connection().map_err(TunnelError::from)?;
            tokio::spawn(connection);
            let index = link_index(&handle, &jail_name_for_worker)
                .await?
                .ok_or_else(|| TunnelError::NotFound(jail_name_for_worker.clone()))?;
            add_ptp_addr(&handle, index, metadata_ip, src_ip).await?;
            link_up(&handle, index).await
        })?;

        info!("tunnel pair up: {host_name} (host) <-> {jail_name} ({netns_name})");
        Ok(TunnelPair {
            host,
            jail,
            netns: netns_name.to_string(),
        })
    }

    /// Tear the pair down, best-effort: close both devices (destroying them)
    /// and remove the compartment. Failures are reported, not propagated.
    pub async fn teardown(self) {
        let TunnelPair { host, jail, netns } = self;
        drop(jail);
        drop(host);
        if let Err(err) = netns::remove(&netns).await {
            warn!("could not remove compartment {netns}: {err}");
        }
    }
}

/// Kernel interface index for `name`, or `None` if no such link exists.
async fn link_index(handle: &Handle, name: &InterfaceName) -> Result<Option<u32>, TunnelError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(link)) => Ok(Some(link.header.index)),
        Ok(None) => Ok(None),
        // The kernel answers a dump for an unknown name with an error rather
        // than an empty dump.
        Err(rtnetlink::Error::NetlinkError(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Assign `local` with point-to-point peer `peer` on the link with `index`.
async fn add_ptp_addr(
    handle: &Handle,
    index: u32,
    local: Ipv4Addr,
    peer: Ipv4Addr,
) -> Result<(), TunnelError> {
    let mut request = handle.address().add(index, IpAddr::V4(local), 32);
    let message = request.message_mut();
    // `add` mirrors the local address into IFA_ADDRESS; on a point-to-point
    // link that attribute names the peer instead.
    message
        .attributes
        .retain(|attr| !matches!(attr, AddressAttribute::Address(_)));
    message
        .attributes
        .push(AddressAttribute::Address(IpAddr::V4(peer)));
    request.execute().await?;
    Ok(())
}

async fn link_up(handle: &Handle, index: u32) -> Result<(), TunnelError> {
    handle
        .link()
        .set(LinkUnspec::new_with_index(index).up().build())
        .execute()
        .await?;
    Ok(())
}
