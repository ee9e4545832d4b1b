// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The packet daemon's event loop.
//!
//! Everything runs single threaded on one poller: the two tunnel
//! descriptors, the forwarder and identity listeners, and every live
//! connection. Each readiness event makes as much progress as it can
//! without blocking and then re-arms; there are no other suspension points,
//! which is what lets the connection table go lockless.

use crate::conns::{ConnTable, Splice, SpliceSide, SpliceVerdict};
use crate::errors::FilterdError;
use crate::ident::{IdentConn, IdentVerdict};
use crate::packets::{InPath, OutPath};
use mio::net::UnixListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use routing::RouteDecision;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use tunnel::TunnelPair;

const TOKEN_TUN_HOST: Token = Token(0);
const TOKEN_TUN_JAIL: Token = Token(1);
const TOKEN_FORWARD_LISTENER: Token = Token(2);
const TOKEN_IDENT_LISTENER: Token = Token(3);
const TOKEN_WAKER: Token = Token(4);
const TOKEN_DYN_BASE: usize = 5;

/// What a dynamically allocated token points at.
#[derive(Debug, Clone, Copy)]
enum Slot {
    SpliceClient(usize),
    SpliceUpstream(usize),
    Ident(usize),
}

pub struct Daemon {
    poll: Poll,
    tunnels: TunnelPair,
    outpath: OutPath,
    inpath: InPath,
    conns: ConnTable,
    forward_listener: UnixListener,
    ident_listener: UnixListener,
    target: SocketAddrV4,
    splices: HashMap<usize, Splice>,
    idents: HashMap<usize, IdentConn>,
    slots: HashMap<Token, Slot>,
    next_token: usize,
    next_id: usize,
    shutdown: Arc<AtomicBool>,
}

impl Daemon {
    /// Stand up the poller: tunnel descriptors, both Unix-domain listeners,
    /// and the shutdown waker.
    ///
    /// # Errors
    ///
    /// Any listener or registration failure is a startup error.
    pub fn new(
        decision: &RouteDecision,
        tunnels: TunnelPair,
        target: SocketAddrV4,
        forward_path: &'static str,
        ident_path: &'static str,
    ) -> Result<(Daemon, Arc<Waker>), FilterdError> {
        let poll = Poll::new().map_err(FilterdError::Poll)?;
        let outpath = OutPath::new(decision, target)?;
        let inpath = InPath::new();

        let mut forward_listener = UnixListener::bind(forward_path)
            .map_err(|e| FilterdError::Listen(forward_path, e))?;
        let mut ident_listener =
            UnixListener::bind(ident_path).map_err(|e| FilterdError::Listen(ident_path, e))?;

        let registry = poll.registry();
        registry
            .register(
                &mut SourceFd(&tunnels.host.as_raw_fd()),
                TOKEN_TUN_HOST,
                Interest::READABLE,
            )
            .map_err(FilterdError::Poll)?;
        registry
            .register(
                &mut SourceFd(&tunnels.jail.as_raw_fd()),
                TOKEN_TUN_JAIL,
                Interest::READABLE,
            )
            .map_err(FilterdError::Poll)?;
        registry
            .register(
                &mut forward_listener,
                TOKEN_FORWARD_LISTENER,
                Interest::READABLE,
            )
            .map_err(FilterdError::Poll)?;
        registry
            .register(&mut ident_listener, TOKEN_IDENT_LISTENER, Interest::READABLE)
            .map_err(FilterdError::Poll)?;
        let waker = Arc::new(Waker::new(registry, TOKEN_WAKER).map_err(FilterdError::Poll)?);

        Ok((
            Daemon {
                poll,
                tunnels,
                outpath,
                inpath,
                conns: ConnTable::new(),
                forward_listener,
                ident_listener,
                target,
                splices: HashMap::new(),
                idents: HashMap::new(),
                slots: HashMap::new(),
                next_token: TOKEN_DYN_BASE,
                next_id: 0,
                shutdown: Arc::new(AtomicBool::new(false)),
            },
            waker,
        ))
    }

    /// The flag a signal handler sets (and wakes the poller) to stop the loop.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Reclaim the tunnel pair for teardown once the loop has exited.
    pub fn into_tunnels(self) -> TunnelPair {
        self.tunnels
    }

    /// Run until a fatal error or a shutdown signal.
    ///
    /// # Errors
    ///
    /// Classifier faults and poller failures are fatal and propagate; the
    /// caller is responsible for teardown.
    pub fn run(&mut self) -> Result<(), FilterdError> {
        let mut events = Events::with_capacity(256);
        info!("packet daemon running");
        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(FilterdError::Poll(e));
            }
            for event in &events {
                self.dispatch(event)?;
            }
        }
        info!("packet daemon stopping");
        Ok(())
    }

    fn dispatch(&mut self, event: &mio::event::Event) -> Result<(), FilterdError> {
        match event.token() {
            TOKEN_TUN_HOST => self
                .outpath
                .ready(&self.tunnels.host, &self.tunnels.jail, &self.conns),
            TOKEN_TUN_JAIL => self.inpath.ready(&self.tunnels.host, &self.tunnels.jail),
            TOKEN_FORWARD_LISTENER => self.accept_forward(),
            TOKEN_IDENT_LISTENER => self.accept_ident(),
            TOKEN_WAKER => Ok(()),
            token => {
                self.dynamic_event(token, event);
                Ok(())
            }
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Accept forwarder clients and open their upstream connections.
    fn accept_forward(&mut self) -> Result<(), FilterdError> {
        loop {
            let client = match self.forward_listener.accept() {
                Ok((client, _)) => client,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(FilterdError::Accept(e)),
            };
            let client_token = self.alloc_token();
            let upstream_token = self.alloc_token();
            let mut splice = match Splice::open(
                client,
                client_token,
                upstream_token,
                self.target,
                &mut self.conns,
            ) {
                Ok(splice) => splice,
                Err(err) => {
                    // Isolated to this client; it just never gets a byte.
                    warn!("cannot open upstream connection: {err}");
                    continue;
                }
            };
            if let Err(err) = splice.register(self.poll.registry()) {
                warn!("cannot register connection: {err}");
                splice.cancel(self.poll.registry(), &mut self.conns);
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.slots.insert(client_token, Slot::SpliceClient(id));
            self.slots.insert(upstream_token, Slot::SpliceUpstream(id));
            self.splices.insert(id, splice);
            debug!("forwarding connection {id} opened ({} tracked)", self.conns.len());
        }
    }

    /// Accept identity query connections.
    fn accept_ident(&mut self) -> Result<(), FilterdError> {
        loop {
            let sock = match self.ident_listener.accept() {
                Ok((sock, _)) => sock,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(FilterdError::Accept(e)),
            };
            let token = self.alloc_token();
            let mut conn = IdentConn::new(sock, token);
            if let Err(err) = conn.register(self.poll.registry()) {
                warn!("cannot register identity connection: {err}");
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.slots.insert(token, Slot::Ident(id));
            self.idents.insert(id, conn);
        }
    }

    fn dynamic_event(&mut self, token: Token, _event: &mio::event::Event) {
        match self.slots.get(&token).copied() {
            Some(Slot::SpliceClient(id)) => self.splice_event(id, SpliceSide::Client),
            Some(Slot::SpliceUpstream(id)) => self.splice_event(id, SpliceSide::Upstream),
            Some(Slot::Ident(id)) => self.ident_event(id),
            // Stale token: the owner was dropped earlier in this batch.
            None => {}
        }
    }

    fn splice_event(&mut self, id: usize, side: SpliceSide) {
        let Some(splice) = self.splices.get_mut(&id) else {
            return;
        };
        if splice.ready(side, self.poll.registry()) == SpliceVerdict::Drop {
            self.drop_splice(id);
        }
    }

    /// Cancel a connection: deregister, forget the upstream socket, close.
    fn drop_splice(&mut self, id: usize) {
        if let Some(splice) = self.splices.remove(&id) {
            self.slots.remove(&splice.client_token());
            self.slots.remove(&splice.upstream_token());
            splice.cancel(self.poll.registry(), &mut self.conns);
            debug!("forwarding connection {id} dropped ({} tracked)", self.conns.len());
        }
    }

    fn ident_event(&mut self, id: usize) {
        let Some(conn) = self.idents.get_mut(&id) else {
            return;
        };
        if conn.ready(self.poll.registry()) == IdentVerdict::Close {
            if let Some(mut conn) = self.idents.remove(&id) {
                conn.deregister(self.poll.registry());
                self.slots.remove(&conn.token());
            }
        }
    }
}
