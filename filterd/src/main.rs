// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The privileged packet-steering daemon.
//!
//! Discovers the route to the metadata service, builds the network
//! compartment and tunnel pair, and then steers every packet bound for the
//! metadata address: the proxy's own upstream flows go out the real
//! interface, everything else is diverted into the compartment. Also serves
//! the connection forwarder and the connection-ownership service used by
//! the HTTP proxy.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::similar_names)]

mod conns;
mod daemon;
mod errors;
mod ident;
mod packets;

use crate::daemon::Daemon;
use crate::errors::FilterdError;
use net::{METADATA_ADDR, metadata_endpoint};
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tunnel::TunnelPair;

/// Name of the network compartment the proxy runs in.
const JAIL_NAME: &str = "imds";

/// Where the connection forwarder listens.
const FORWARD_SOCK: &str = "/var/run/imds.sock";

/// Where the connection-ownership service listens.
const IDENT_SOCK: &str = "/var/run/imds-ident.sock";

const PIDFILE: &str = "/var/run/imds-filterd.pid";

fn init_logging() {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn main() {
    init_logging();
    if let Err(err) = run() {
        error!("{err}");
        std::process::exit(1);
    }
}

#[allow(clippy::expect_used)] // runtime construction failure is fatal at startup
fn run() -> Result<(), FilterdError> {
    // Netlink work (route probe, compartment, tunnels) is async; everything
    // steady-state runs on the mio loop. One scoped runtime covers setup
    // and teardown.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("failed to build tokio runtime");

    let decision = runtime.block_on(async {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok::<_, FilterdError>(routing::probe(&handle, METADATA_ADDR).await?)
    })?;
    info!(
        "route to metadata service: {src} dev {ifname} via {gw} ({src_mac} -> {gw_mac})",
        src = decision.src_ip,
        ifname = decision.if_name,
        gw = decision.gw_ip,
        src_mac = decision.src_mac,
        gw_mac = decision.gw_mac,
    );

    runtime.block_on(tunnel::netns::create(JAIL_NAME))?;
    let tunnels = match runtime.block_on(async {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok::<_, FilterdError>(
            TunnelPair::setup(&handle, JAIL_NAME, decision.src_ip, METADATA_ADDR).await?,
        )
    }) {
        Ok(tunnels) => tunnels,
        Err(err) => {
            if let Err(nserr) = runtime.block_on(tunnel::netns::remove(JAIL_NAME)) {
                warn!("could not remove compartment {JAIL_NAME}: {nserr}");
            }
            return Err(err);
        }
    };

    let (mut daemon, waker) = match Daemon::new(
        &decision,
        tunnels,
        metadata_endpoint(),
        FORWARD_SOCK,
        IDENT_SOCK,
    ) {
        Ok(built) => built,
        Err(err) => {
            cleanup(&runtime, None);
            return Err(err);
        }
    };

    let shutdown = daemon.shutdown_flag();
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
        let _ = waker.wake();
    })
    .expect("failed to set termination handler");

    if let Err(err) = std::fs::write(PIDFILE, format!("{}\n", std::process::id())) {
        warn!("could not write {PIDFILE}: {err}");
    }

    let result = daemon.run();

    /* Clean up the pidfile, sockets, tunnels and jail. */
    cleanup(&runtime, Some(daemon.into_tunnels()));
    result
}

/// Deterministic teardown, in reverse order of acquisition; each step is
/// best-effort.
fn cleanup(runtime: &tokio::runtime::Runtime, tunnels: Option<TunnelPair>) {
    for path in [PIDFILE, IDENT_SOCK, FORWARD_SOCK] {
        if let Err(err) = std::fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove {path}: {err}");
            }
        }
    }
    match tunnels {
        Some(tunnels) => runtime.block_on(tunnels.teardown()),
        None => {
            if let Err(err) = runtime.block_on(tunnel::netns::remove(JAIL_NAME)) {
                warn!("could not remove compartment {JAIL_NAME}: {err}");
            }
        }
    }
}
