// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The metadata filtering HTTP proxy.
//!
//! Runs inside the network compartment, listening where clients believe the
//! metadata service lives. Each accepted connection is identified through
//! the ownership service, its request parsed and rebuilt, and the ruleset
//! consulted before anything is relayed upstream.

#![deny(clippy::all, clippy::pedantic)]

mod conf;
mod http;
mod ident;
mod privs;
mod request;
mod uripath;

use crate::conf::{ConfError, Ruleset};
use crate::privs::{PrivError, UidGid, drop_privileges};
use clap::Parser;
use nix::sys::socket::sockopt::ReuseAddr;
use nix::sys::socket::{
    AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, bind, listen, setsockopt, socket,
};
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const FORWARD_SOCK: &str = "/var/run/imds.sock";
const IDENT_SOCK: &str = "/var/run/imds-ident.sock";

/// The port clients expect the metadata service on.
const LISTEN_PORT: u16 = 80;

#[derive(Parser)]
#[command(name = "imds-proxy")]
#[command(about = "Filtering proxy for the EC2 Instance Metadata Service", long_about = None)]
struct CmdArgs {
    /// Access rule configuration file
    #[arg(short = 'f', long = "conffile", default_value = "/usr/local/etc/imds.conf")]
    conffile: PathBuf,

    /// Pidfile path
    #[arg(short = 'p', long = "pidfile", default_value = "/var/run/imds-proxy.pid")]
    pidfile: PathBuf,

    /// Drop privileges to <user | :group | user:group> after binding
    #[arg(short = 'u', long = "uidgid", value_parser = clap::value_parser!(UidGid))]
    uidgid: Option<UidGid>,
}

#[derive(Error, Debug)]
enum ProxyError {
    #[error(transparent)]
    Conf(#[from] ConfError),

    #[error("could not listen on port {LISTEN_PORT}: {0}")]
    Listen(nix::Error),

    #[error("failed to drop privileges: {0}")]
    Privs(#[from] PrivError),

    #[error("error accepting connection: {0}")]
    Accept(std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

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
    let args = CmdArgs::parse();
    if let Err(err) = run(&args) {
        error!("{err}");
        std::process::exit(1);
    }
}

fn run(args: &CmdArgs) -> Result<(), ProxyError> {
    /* Read the configuration file before doing anything else. */
    let conf = Arc::new(Ruleset::load(&args.conffile)?);

    /* Bind to 0.0.0.0:80 and accept connections. */
    let listener = bind_listener()?;

    std::fs::write(&args.pidfile, format!("{}\n", std::process::id()))?;
    let pidfile = args.pidfile.clone();
    ctrlc::set_handler(move || {
        let _ = std::fs::remove_file(&pidfile);
        std::process::exit(0);
    })
    .map_err(|err| {
        ProxyError::Io(std::io::Error::other(format!(
            "failed to set termination handler: {err}"
        )))
    })?;

    /* Drop privileges (if applicable). */
    if let Some(spec) = &args.uidgid {
        drop_privileges(spec)?;
    }

    info!("proxy listening on port {LISTEN_PORT}");

    /* Accept connections until an error occurs. */
    loop {
        let client = match listener.accept() {
            Ok((client, _)) => client,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                /*
                 * Spawned threads may still be running against sockets and
                 * the ruleset, so exit without tearing anything down rather
                 * than freeing state out from underneath them.
                 */
                let _ = std::fs::remove_file(&args.pidfile);
                return Err(ProxyError::Accept(err));
            }
        };
        let conf = conf.clone();
        std::thread::spawn(move || {
            http::proxy(
                &client,
                &conf,
                Path::new(FORWARD_SOCK),
                Path::new(IDENT_SOCK),
            );
        });
    }
}

/// Bind the listening socket with `SO_REUSEADDR` set.
fn bind_listener() -> Result<TcpListener, ProxyError> {
    let sock = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(ProxyError::Listen)?;
    setsockopt(&sock, ReuseAddr, &true).map_err(ProxyError::Listen)?;
    bind(
        sock.as_raw_fd(),
        &SockaddrIn::new(0, 0, 0, 0, LISTEN_PORT),
    )
    .map_err(ProxyError::Listen)?;
    listen(&sock, Backlog::new(10).map_err(ProxyError::Listen)?).map_err(ProxyError::Listen)?;
    Ok(TcpListener::from(sock))
}
