// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The error results used by the packet-steering daemon.
//!
//! Everything here is fatal: per-connection and per-query failures are
//! handled (and logged) where they occur and never surface as a
//! [`FilterdError`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterdError {
    #[error("could not find route to the metadata service: {0}")]
    Probe(#[from] routing::RouteProbeError),

    #[error("failed to set up tunnel devices: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("unexpected EOF from tunnel device")]
    TunnelEof,

    #[error("error reading packet from tunnel device: {0}")]
    TunnelRead(std::io::Error),

    #[error("error writing packet into tunnel: {0}")]
    TunnelWrite(std::io::Error),

    #[error("error writing ethernet frame: {0}")]
    ExternalWrite(std::io::Error),

    #[error("could not listen on {0}: {1}")]
    Listen(&'static str, std::io::Error),

    #[error("error accepting connection: {0}")]
    Accept(std::io::Error),

    #[error("event loop error: {0}")]
    Poll(std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
