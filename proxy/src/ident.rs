// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Client side of the connection-ownership service.

use net::ident::{Owner, OwnerQuery};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::Path;

fn require_v4(addr: SocketAddr) -> io::Result<SocketAddrV4> {
    match addr {
        SocketAddr::V4(addr) => Ok(addr),
        SocketAddr::V6(_) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "HTTP connection is not IPv4",
        )),
    }
}

/// Ask the ownership service who holds the far end of `client`.
///
/// The query carries the *remote* address first: what we see as remote is
/// what the answering daemon sees as the queried connection's local end.
///
/// # Errors
///
/// Any I/O failure or malformed reply; the caller drops the client.
pub fn lookup(client: &TcpStream, ident_path: &Path) -> io::Result<Owner> {
    let local = require_v4(client.local_addr()?)?;
    let remote = require_v4(client.peer_addr()?)?;
    let query = OwnerQuery {
        src: remote,
        dst: local,
    };

    let mut sock = UnixStream::connect(ident_path)?;
    sock.write_all(&query.encode())?;

    // The service writes its two lines and closes.
    let mut reply = String::new();
    sock.read_to_string(&mut reply)?;
    Owner::from_reply(&reply).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}
