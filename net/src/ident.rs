// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Wire format of the connection-ownership service.
//!
//! A query is exactly 12 bytes, all in network byte order:
//! `[src_ip:4][src_port:2][dst_ip:4][dst_port:2]`. The caller fills in the
//! tuple of the connection whose owner it wants to know, remote end first,
//! because what the caller sees as remote is what the answering host sees as
//! the connection's local end. The reply is ASCII text: the owning uid on
//! one line, then the comma-separated gids on a second line.

use std::fmt::Write;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Length in bytes of an encoded [`OwnerQuery`].
pub const QUERY_LEN: usize = 12;

/// A connection-ownership query: which local credential owns the TCP
/// endpoint with local end `src` and remote end `dst`?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerQuery {
    /// Local end of the queried connection.
    pub src: SocketAddrV4,
    /// Remote end of the queried connection.
    pub dst: SocketAddrV4,
}

impl OwnerQuery {
    /// Encode the query into its 12-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; QUERY_LEN] {
        let mut buf = [0u8; QUERY_LEN];
        buf[0..4].copy_from_slice(&self.src.ip().octets());
        buf[4..6].copy_from_slice(&self.src.port().to_be_bytes());
        buf[6..10].copy_from_slice(&self.dst.ip().octets());
        buf[10..12].copy_from_slice(&self.dst.port().to_be_bytes());
        buf
    }

    /// Decode a query from its 12-byte wire form.
    #[must_use]
    pub fn decode(buf: &[u8; QUERY_LEN]) -> Self {
        let ip = |b: &[u8]| Ipv4Addr::new(b[0], b[1], b[2], b[3]);
        let port = |b: &[u8]| u16::from_be_bytes([b[0], b[1]]);
        OwnerQuery {
            src: SocketAddrV4::new(ip(&buf[0..4]), port(&buf[4..6])),
            dst: SocketAddrV4::new(ip(&buf[6..10]), port(&buf[10..12])),
        }
    }
}

/// The credential owning a connection: a uid and at least one gid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    /// The owning user id.
    pub uid: u32,
    /// The owner's group ids (primary first); never empty.
    pub gids: Vec<u32>,
}

/// Errors decoding an ownership reply.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReplyError {
    /// The reply did not contain the two expected lines.
    #[error("truncated ownership reply")]
    Truncated,
    /// A uid or gid field was not a decimal number.
    #[error("malformed id in ownership reply")]
    BadId,
    /// The reply carried no group ids.
    #[error("ownership reply carries no gids")]
    NoGids,
}

impl Owner {
    /// Render the reply text: `"<uid>\n<gid>(,<gid>)*\n"`.
    #[must_use]
    pub fn to_reply(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.uid);
        for (i, gid) in self.gids.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{gid}");
        }
        out.push('\n');
        out
    }

    /// Parse a reply previously rendered by [`Owner::to_reply`].
    ///
    /// # Errors
    ///
    /// Returns a [`ReplyError`] when the text is not two lines of decimal
    /// ids with at least one gid.
    pub fn from_reply(text: &str) -> Result<Self, ReplyError> {
        let mut lines = text.lines();
        let uid_line = lines.next().ok_or(ReplyError::Truncated)?;
        let gid_line = lines.next().ok_or(ReplyError::Truncated)?;
        let uid = uid_line.parse::<u32>().map_err(|_| ReplyError::BadId)?;
        let gids = gid_line
            .split(',')
            .map(|g| g.parse::<u32>().map_err(|_| ReplyError::BadId))
            .collect::<Result<Vec<u32>, ReplyError>>()?;
        if gids.is_empty() {
            return Err(ReplyError::NoGids);
        }
        Ok(Owner { uid, gids })
    }
}

#[cfg(test)]
mod test {
    use super::{Owner, OwnerQuery, QUERY_LEN, ReplyError};
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn query_layout() {
        let query = OwnerQuery {
            src: SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 1234),
            dst: SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 2), 80),
        };
        assert_eq!(
            query.encode(),
            [0xc0, 0xa8, 0x00, 0x01, 0x04, 0xd2, 0xc0, 0xa8, 0x00, 0x02, 0x00, 0x50]
        );
        assert_eq!(OwnerQuery::decode(&query.encode()), query);
    }

    #[test]
    fn query_roundtrip() {
        bolero::check!()
            .with_type()
            .for_each(|raw: &[u8; QUERY_LEN]| {
                assert_eq!(OwnerQuery::decode(raw).encode(), *raw);
            });
    }

    #[test]
    fn reply_text() {
        let owner = Owner {
            uid: 1000,
            gids: vec![1000, 20],
        };
        assert_eq!(owner.to_reply(), "1000\n1000,20\n");
        assert_eq!(Owner::from_reply("1000\n1000,20\n").unwrap(), owner);
    }

    #[test]
    fn reply_rejects_garbage() {
        assert_eq!(Owner::from_reply(""), Err(ReplyError::Truncated));
        assert_eq!(Owner::from_reply("1000\n"), Err(ReplyError::Truncated));
        assert_eq!(Owner::from_reply("x\n0\n"), Err(ReplyError::BadId));
        assert_eq!(Owner::from_reply("1000\n1,x\n"), Err(ReplyError::BadId));
        assert_eq!(Owner::from_reply("1000\n\n"), Err(ReplyError::BadId));
    }

    #[test]
    fn reply_roundtrip() {
        bolero::check!()
            .with_type()
            .for_each(|(uid, gids): &(u32, Vec<u32>)| {
                if gids.is_empty() {
                    return;
                }
                let owner = Owner {
                    uid: *uid,
                    gids: gids.clone(),
                };
                assert_eq!(Owner::from_reply(&owner.to_reply()).unwrap(), owner);
            });
    }
}
