// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The per-connection proxy flow: identify the caller, normalize the
//! request, consult the ruleset, and either relay to the metadata service
//! or answer 403.

use crate::conf::Ruleset;
use crate::ident;
use crate::request::HttpRequest;
use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::Path;
use tracing::{debug, info};

const BUFLEN: usize = 1024;

/// Serve one accepted client connection to completion.
///
/// Identity lookup and parse failures drop the connection without a
/// response; only a policy denial earns a 403.
pub fn proxy(client: &TcpStream, conf: &Ruleset, forward_path: &Path, ident_path: &Path) {
    /* Look up the owner of this connection. */
    let owner = match ident::lookup(client, ident_path) {
        Ok(owner) => owner,
        Err(err) => {
            debug!("ownership lookup failed: {err}");
            return;
        }
    };

    /* Read and parse the request. */
    let mut reader = BufReader::new(client);
    let request = match HttpRequest::read(&mut reader) {
        Ok(request) => request,
        Err(err) => {
            debug!("HTTP request read failed: {err}");
            return;
        }
    };

    /* Check whether this user is allowed to make this request. */
    let allowed = conf.check(request.path(), owner.uid, &owner.gids);
    info!(
        "{} uid {} {}",
        if allowed { "ALLOW" } else { "DENY" },
        owner.uid,
        request.path()
    );

    let mut writer = client;
    if !allowed {
        let _ = writer.write_all(b"HTTP/1.0 403 Forbidden\r\n\r\n");
        return;
    }

    /* Open a connection to the metadata service and send the request. */
    let mut upstream = match UnixStream::connect(forward_path) {
        Ok(upstream) => upstream,
        Err(err) => {
            debug!("cannot reach the connection forwarder: {err}");
            return;
        }
    };
    if upstream.write_all(request.to_wire().as_bytes()).is_err() {
        return;
    }

    /* Forward the server's response back. */
    let mut buf = [0u8; BUFLEN];
    loop {
        match upstream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(len) => {
                if writer.write_all(&buf[..len]).is_err() {
                    break;
                }
            }
        }
    }
}
