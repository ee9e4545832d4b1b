// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Outbound connection tracking and the Unix-domain connection forwarder.
//!
//! Every TCP connection this daemon opens toward the metadata service is
//! entered into the [`ConnTable`] *before* its `connect(2)` is issued. The
//! event loop is single threaded, so by the time the connection's first SYN
//! surfaces on the host tunnel the classifier can already recognize it as
//! ours and let it out the external interface.

use mio::net::{TcpStream, UnixStream};
use mio::{Interest, Registry, Token};
use nix::sys::socket::{
    AddressFamily, SockFlag, SockType, SockaddrIn, connect, getsockname, socket,
};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddrV4};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use tracing::{debug, trace, warn};

/* Buffer up to 4kB at once. */
const BUFLEN: usize = 4096;

/// The set of upstream sockets this daemon currently holds toward the
/// metadata service.
///
/// The table keeps a dup of each socket's descriptor, so entries stay
/// queryable even while the owning connection is being torn down. All
/// callers run on the single-threaded event loop; no locking is needed.
#[derive(Debug, Default)]
pub struct ConnTable {
    socks: HashMap<RawFd, OwnedFd>,
}

impl ConnTable {
    pub fn new() -> ConnTable {
        ConnTable::default()
    }

    /// Add a socket to the table. Must be called before the socket's
    /// `connect` so its first packet is already classifiable.
    pub fn insert<F: AsFd>(&mut self, sock: &F) -> io::Result<()> {
        let dup = sock.as_fd().try_clone_to_owned()?;
        self.socks.insert(sock.as_fd().as_raw_fd(), dup);
        Ok(())
    }

    /// Remove the socket keyed by `fd` from the table.
    pub fn remove(&mut self, fd: RawFd) {
        let removed = self.socks.remove(&fd);
        // We should have found it.
        assert!(removed.is_some(), "socket {fd} was not in the table");
    }

    /// Return true if one of our connections to the target has local
    /// address `src`.
    ///
    /// Each entry is checked against the kernel's current idea of its local
    /// endpoint.
    #[must_use]
    pub fn owns(&self, src: SocketAddrV4) -> bool {
        self.socks.values().any(|sock| {
            match getsockname::<SockaddrIn>(sock.as_raw_fd()) {
                Ok(sin) => sin.ip() == *src.ip() && sin.port() == src.port(),
                /*
                 * Not fatal; we can get this if a RST arrives at an
                 * inconvenient moment, for example.
                 */
                Err(_) => false,
            }
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.socks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.socks.is_empty()
    }
}

/// One direction of one connection: reads up to [`BUFLEN`] bytes from its
/// source, writes them through to its destination, then reads again.
#[derive(Debug)]
struct Pump {
    buf: Box<[u8; BUFLEN]>,
    start: usize,
    end: usize,
    /// Armed for readability on the source.
    reading: bool,
    /// Holding unwritten bytes for the destination.
    writing: bool,
    /// The source has reached EOF; never read again.
    eof: bool,
}

enum PumpStatus {
    /// Ran until it would block (or has nothing left to do).
    Stalled,
    /// The source returned EOF; the destination wants a half-close.
    SourceEof,
    /// A read or write failed.
    Failed,
}

impl Pump {
    fn new() -> Pump {
        Pump {
            buf: Box::new([0u8; BUFLEN]),
            start: 0,
            end: 0,
            reading: false,
            writing: false,
            eof: false,
        }
    }

    /// True when no I/O is in flight in this direction.
    fn idle(&self) -> bool {
        !self.reading && !self.writing
    }

    fn cycle<R: Read, W: Write>(&mut self, src: &mut R, dst: &mut W) -> PumpStatus {
        loop {
            if self.writing {
                while self.start < self.end {
                    match dst.write(&self.buf[self.start..self.end]) {
                        Ok(0) => return PumpStatus::Failed,
                        Ok(n) => self.start += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return PumpStatus::Stalled;
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(_) => return PumpStatus::Failed,
                    }
                }
                self.writing = false;
            }
            if self.eof {
                return PumpStatus::Stalled;
            }
            match src.read(&mut self.buf[..]) {
                Ok(0) => {
                    self.eof = true;
                    self.reading = false;
                    return PumpStatus::SourceEof;
                }
                Ok(n) => {
                    self.start = 0;
                    self.end = n;
                    self.reading = false;
                    self.writing = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.reading = true;
                    return PumpStatus::Stalled;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return PumpStatus::Failed,
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    /// Waiting for the upstream connect to complete (writable readiness).
    Connecting,
    /// Both pumps running.
    Active,
}

/// Which of a connection's two sockets an event fired on.
#[derive(Debug, Clone, Copy)]
pub enum SpliceSide {
    Client,
    Upstream,
}

/// What the event loop should do with the connection after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceVerdict {
    Keep,
    Drop,
}

/// State for one forwarded connection: the accepted client socket, the
/// upstream TCP socket, and a pump per direction.
#[derive(Debug)]
pub struct Splice {
    client: UnixStream,
    upstream: TcpStream,
    client_token: Token,
    upstream_token: Token,
    phase: Phase,
    /// `pumps[0]` pushes client bytes upstream; `pumps[1]` the reverse.
    pumps: [Pump; 2],
    client_interest: Option<Interest>,
    upstream_interest: Option<Interest>,
}

impl Splice {
    /// Open an upstream connection to `target` for the accepted `client`.
    ///
    /// The new socket is entered into `conns` strictly before the
    /// non-blocking `connect` is issued.
    pub fn open(
        client: UnixStream,
        client_token: Token,
        upstream_token: Token,
        target: SocketAddrV4,
        conns: &mut ConnTable,
    ) -> io::Result<Splice> {
        let sock = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        conns.insert(&sock)?;
        if let Err(errno) = connect(sock.as_raw_fd(), &SockaddrIn::from(target)) {
            if errno != nix::errno::Errno::EINPROGRESS {
                conns.remove(sock.as_raw_fd());
                return Err(errno.into());
            }
        }
        let upstream = TcpStream::from_std(std::net::TcpStream::from(sock));
        Ok(Splice {
            client,
            upstream,
            client_token,
            upstream_token,
            phase: Phase::Connecting,
            pumps: [Pump::new(), Pump::new()],
            client_interest: None,
            upstream_interest: None,
        })
    }

    pub fn client_token(&self) -> Token {
        self.client_token
    }

    pub fn upstream_token(&self) -> Token {
        self.upstream_token
    }

    /// Register the freshly opened connection with the poller: writability
    /// on the upstream socket signals connect completion.
    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.upstream, self.upstream_token, Interest::WRITABLE)?;
        self.upstream_interest = Some(Interest::WRITABLE);
        Ok(())
    }

    /// Handle readiness on one of the connection's sockets.
    pub fn ready(&mut self, side: SpliceSide, registry: &Registry) -> SpliceVerdict {
        if self.phase == Phase::Connecting {
            match side {
                SpliceSide::Client => return SpliceVerdict::Keep,
                SpliceSide::Upstream => match self.upstream.take_error() {
                    Ok(None) => {
                        trace!("upstream connect complete");
                        self.phase = Phase::Active;
                        // Kick both directions; the sockets may already hold data.
                        if !self.run_pump(0) || !self.run_pump(1) {
                            return SpliceVerdict::Drop;
                        }
                    }
                    Ok(Some(err)) => {
                        debug!("upstream connect failed: {err}");
                        return SpliceVerdict::Drop;
                    }
                    Err(err) => {
                        debug!("upstream connect failed: {err}");
                        return SpliceVerdict::Drop;
                    }
                },
            }
        } else {
            // The pump writing toward this socket first: flushing its
            // backlog may let the pump reading from this socket progress.
            let (writer, reader) = match side {
                SpliceSide::Client => (1, 0),
                SpliceSide::Upstream => (0, 1),
            };
            if !self.run_pump(writer) || !self.run_pump(reader) {
                return SpliceVerdict::Drop;
            }
        }

        // If both directions have drained and nothing is in flight, the
        // connection is finished.
        if self.pumps.iter().all(Pump::idle) {
            return SpliceVerdict::Drop;
        }
        match self.update_interest(registry) {
            Ok(()) => SpliceVerdict::Keep,
            Err(err) => {
                warn!("cannot re-register connection: {err}");
                SpliceVerdict::Drop
            }
        }
    }

    /// Run pump `i` until it stalls. Returns false if the connection must
    /// be dropped.
    fn run_pump(&mut self, i: usize) -> bool {
        let Splice {
            client,
            upstream,
            pumps,
            ..
        } = self;
        let status = if i == 0 {
            pumps[0].cycle(&mut &*client, &mut &*upstream)
        } else {
            pumps[1].cycle(&mut &*upstream, &mut &*client)
        };
        match status {
            PumpStatus::Stalled => true,
            PumpStatus::SourceEof => {
                /* Close the write side (aka send a FIN). */
                let _ = if i == 0 {
                    upstream.shutdown(Shutdown::Write)
                } else {
                    client.shutdown(Shutdown::Write)
                };
                true
            }
            PumpStatus::Failed => false,
        }
    }

    /// Re-register both sockets for exactly the readiness the pumps are
    /// waiting on.
    fn update_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let client_wanted = interest_union(
            self.pumps[0].reading.then_some(Interest::READABLE),
            self.pumps[1].writing.then_some(Interest::WRITABLE),
        );
        let upstream_wanted = interest_union(
            self.pumps[1].reading.then_some(Interest::READABLE),
            self.pumps[0].writing.then_some(Interest::WRITABLE),
        );
        reregister(
            registry,
            &mut self.client,
            self.client_token,
            &mut self.client_interest,
            client_wanted,
        )?;
        reregister(
            registry,
            &mut self.upstream,
            self.upstream_token,
            &mut self.upstream_interest,
            upstream_wanted,
        )?;
        Ok(())
    }

    /// Cancel the poller registrations and remove the upstream socket from
    /// the connection table. The sockets close when `self` drops.
    pub fn cancel(mut self, registry: &Registry, conns: &mut ConnTable) {
        if self.client_interest.is_some() {
            let _ = registry.deregister(&mut self.client);
        }
        if self.upstream_interest.is_some() {
            let _ = registry.deregister(&mut self.upstream);
        }
        conns.remove(self.upstream.as_raw_fd());
    }
}

fn interest_union(a: Option<Interest>, b: Option<Interest>) -> Option<Interest> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.add(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

fn reregister<S: mio::event::Source>(
    registry: &Registry,
    source: &mut S,
    token: Token,
    current: &mut Option<Interest>,
    wanted: Option<Interest>,
) -> io::Result<()> {
    if *current == wanted {
        return Ok(());
    }
    match (*current, wanted) {
        (None, Some(interest)) => registry.register(source, token, interest)?,
        (Some(_), Some(interest)) => registry.reregister(source, token, interest)?,
        (Some(_), None) => registry.deregister(source)?,
        (None, None) => {}
    }
    *current = wanted;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::ConnTable;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};

    fn local_v4(stream: &TcpStream) -> SocketAddrV4 {
        match stream.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => panic!("loopback socket is not IPv4"),
        }
    }

    #[test]
    fn owns_tracks_socket_lifetime() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let local = local_v4(&stream);

        let mut conns = ConnTable::new();
        assert!(!conns.owns(local));

        conns.insert(&stream).unwrap();
        assert!(conns.owns(local));
        assert_eq!(conns.len(), 1);

        // A different port on the same address is not ours.
        let other = SocketAddrV4::new(*local.ip(), local.port().wrapping_add(1));
        assert!(!conns.owns(other));

        use std::os::fd::AsRawFd;
        conns.remove(stream.as_raw_fd());
        assert!(!conns.owns(local));
        assert_eq!(conns.len(), 0);
    }

    #[test]
    fn owns_survives_entries_closed_under_it() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let alive = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let doomed = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let alive_local = local_v4(&alive);

        let mut conns = ConnTable::new();
        conns.insert(&doomed).unwrap();
        conns.insert(&alive).unwrap();

        // The table holds dups, so a peer-driven close of one entry must
        // not stop lookups from finding the others.
        drop(doomed);
        assert!(conns.owns(alive_local));
    }

    #[test]
    #[should_panic(expected = "was not in the table")]
    fn remove_of_untracked_socket_panics() {
        let mut conns = ConnTable::new();
        conns.remove(7);
    }
}
