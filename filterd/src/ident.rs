// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The connection-ownership service.
//!
//! Answers "which local user owns this TCP connection?" queries from the
//! HTTP proxy. A query names the connection's 4-tuple as the proxy's peer
//! sees it, which from this side of the compartment boundary is exactly the
//! client socket's own (local, remote) pair in the host's TCP table.

use mio::net::UnixStream;
use mio::{Interest, Registry, Token};
use net::ident::{Owner, OwnerQuery, QUERY_LEN};
use std::ffi::CString;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum IdentError {
    #[error("no TCP connection matches the queried tuple")]
    NotFound,

    #[error("uid {0} is not in the user database")]
    UnknownUid(u32),

    #[error("cannot read the kernel TCP table: {0}")]
    Proc(#[from] procfs::ProcError),

    #[error("user database lookup failed: {0}")]
    Nix(#[from] nix::Error),

    #[error("user name is not a legal C string")]
    BadUserName,
}

/// Ask the kernel which credential owns the TCP connection with local end
/// `query.src` and remote end `query.dst`, then expand the owning uid to
/// its full group list.
pub fn lookup_owner(query: &OwnerQuery) -> Result<Owner, IdentError> {
    let uid = connection_uid(query)?;
    let user = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))?
        .ok_or(IdentError::UnknownUid(uid))?;
    let name = CString::new(user.name.as_str()).map_err(|_| IdentError::BadUserName)?;
    let gids = nix::unistd::getgrouplist(&name, user.gid)?;

    /* Sanity-check. */
    #[allow(clippy::cast_sign_loss)]
    if let Some(max) = nix::unistd::sysconf(nix::unistd::SysconfVar::NGROUPS_MAX)? {
        assert!(gids.len() <= max as usize);
    }

    Ok(Owner {
        uid,
        gids: gids.iter().map(|gid| gid.as_raw()).collect(),
    })
}

/// Scan the kernel's IPv4 TCP table for the queried 4-tuple and return the
/// owning uid.
fn connection_uid(query: &OwnerQuery) -> Result<u32, IdentError> {
    let local = SocketAddr::V4(query.src);
    let remote = SocketAddr::V4(query.dst);
    procfs::net::tcp()?
        .into_iter()
        .find(|entry| entry.local_address == local && entry.remote_address == remote)
        .map(|entry| entry.uid)
        .ok_or(IdentError::NotFound)
}

/// What the event loop should do with an identity connection after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentVerdict {
    Keep,
    Close,
}

/// State for a single identity query connection: a 12-byte read, one kernel
/// lookup, one small write, close.
#[derive(Debug)]
pub struct IdentConn {
    sock: UnixStream,
    token: Token,
    inbuf: [u8; QUERY_LEN],
    filled: usize,
    reply: Option<Vec<u8>>,
    written: usize,
}

impl IdentConn {
    pub fn new(sock: UnixStream, token: Token) -> IdentConn {
        IdentConn {
            sock,
            token,
            inbuf: [0u8; QUERY_LEN],
            filled: 0,
            reply: None,
            written: 0,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.sock, self.token, Interest::READABLE)
    }

    pub fn deregister(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.sock);
    }

    /// Drive the connection as far as current readiness allows.
    ///
    /// Any malformed query, kernel lookup failure, or I/O error closes the
    /// connection without a reply.
    pub fn ready(&mut self, registry: &Registry) -> IdentVerdict {
        if self.reply.is_none() {
            match self.fill_query() {
                Ok(true) => {}
                Ok(false) => return IdentVerdict::Keep,
                Err(()) => return IdentVerdict::Close,
            }
            let query = OwnerQuery::decode(&self.inbuf);
            let owner = match lookup_owner(&query) {
                Ok(owner) => owner,
                Err(err) => {
                    /* Not fatal; we might have lost a race against a close. */
                    debug!("ownership lookup failed: {err}");
                    return IdentVerdict::Close;
                }
            };
            self.reply = Some(owner.to_reply().into_bytes());
            if let Err(err) = registry.reregister(&mut self.sock, self.token, Interest::WRITABLE) {
                debug!("cannot re-register identity connection: {err}");
                return IdentVerdict::Close;
            }
        }
        self.flush_reply()
    }

    /// Read query bytes until the buffer is full or reading would block.
    /// `Ok(true)` means the full query has arrived.
    fn fill_query(&mut self) -> Result<bool, ()> {
        while self.filled < QUERY_LEN {
            match self.sock.read(&mut self.inbuf[self.filled..]) {
                Ok(0) => return Err(()),
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return Err(()),
            }
        }
        Ok(true)
    }

    /// Write out the reply; the connection closes once it is fully sent.
    /// Write failures are not interesting, the peer just loses its answer.
    fn flush_reply(&mut self) -> IdentVerdict {
        let Some(reply) = &self.reply else {
            return IdentVerdict::Close;
        };
        while self.written < reply.len() {
            match self.sock.write(&reply[self.written..]) {
                Ok(0) => return IdentVerdict::Close,
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IdentVerdict::Keep,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return IdentVerdict::Close,
            }
        }
        IdentVerdict::Close
    }
}

#[cfg(test)]
mod test {
    use super::{IdentError, connection_uid, lookup_owner};
    use net::ident::OwnerQuery;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};

    fn v4(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => panic!("loopback socket is not IPv4"),
        }
    }

    #[test]
    fn finds_own_loopback_connection() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let query = OwnerQuery {
            src: v4(stream.local_addr().unwrap()),
            dst: v4(stream.peer_addr().unwrap()),
        };
        let uid = connection_uid(&query).unwrap();
        assert_eq!(uid, nix::unistd::getuid().as_raw());

        let owner = lookup_owner(&query).unwrap();
        assert_eq!(owner.uid, uid);
        assert!(!owner.gids.is_empty());
    }

    #[test]
    fn unknown_tuple_is_not_found() {
        let query = OwnerQuery {
            src: SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 1), 1),
            dst: SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 2), 2),
        };
        assert!(matches!(connection_uid(&query), Err(IdentError::NotFound)));
    }
}
