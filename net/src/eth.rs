// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Mac address type and Ethernet frame header construction.

use arrayvec::ArrayVec;
use etherparse::{EtherType, Ethernet2Header};
use std::fmt::{Display, Formatter};

/// A [MAC Address] type.
///
/// `Mac` is a transparent wrapper around `[u8; 6]` which provides a
/// small collection of methods and type safety.
///
/// [MAC Address]: https://en.wikipedia.org/wiki/MAC_address
#[repr(transparent)]
#[cfg_attr(test, derive(bolero::TypeGenerator))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mac(pub [u8; 6]);

impl From<[u8; 6]> for Mac {
    fn from(value: [u8; 6]) -> Self {
        Mac(value)
    }
}

impl From<Mac> for [u8; 6] {
    fn from(value: Mac) -> Self {
        value.0
    }
}

impl AsRef<[u8; 6]> for Mac {
    fn as_ref(&self) -> &[u8; 6] {
        &self.0
    }
}

impl Display for Mac {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Errors which can occur while converting raw bytes or strings to a [`Mac`]
#[derive(Debug, thiserror::Error)]
pub enum InvalidMac {
    /// Invalid string representation of mac address
    #[error("invalid string representation of mac address: {0}")]
    BadString(String),
    /// A link-layer address of a length other than six octets
    #[error("link-layer address has {0} octets, expected 6")]
    BadLength(usize),
}

impl TryFrom<&[u8]> for Mac {
    type Error = InvalidMac;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let octets: [u8; 6] = value
            .try_into()
            .map_err(|_| InvalidMac::BadLength(value.len()))?;
        Ok(Mac(octets))
    }
}

impl TryFrom<&str> for Mac {
    type Error = InvalidMac;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        const MAX_OCTETS: usize = 6;
        let octets_strs = value.split(':');
        let octets_parsed = octets_strs
            .into_iter()
            .try_fold(ArrayVec::<_, MAX_OCTETS>::new(), |mut acc, octet_str| {
                if octet_str.len() != 2 || octet_str.chars().any(|c| !c.is_ascii_hexdigit()) {
                    return Err(InvalidMac::BadString(value.to_string()));
                }
                let parsed = u8::from_str_radix(octet_str, 16)
                    .map_err(|_| InvalidMac::BadString(value.to_string()))?;
                acc.try_push(parsed)
                    .map_err(|_| InvalidMac::BadString(value.to_string()))?;
                Ok(acc)
            })?;

        let octets = match octets_parsed.as_slice() {
            [o0, o1, o2, o3, o4, o5] => [*o0, *o1, *o2, *o3, *o4, *o5],
            _ => return Err(InvalidMac::BadString(value.to_string())),
        };

        Ok(Mac(octets))
    }
}

impl Mac {
    /// The zero `Mac`.
    ///
    /// `ZERO` is illegal as a source or destination `Mac` in most contexts.
    pub const ZERO: Mac = Mac([0; 6]);

    /// Returns true iff the binary representation of the [`Mac`] is exclusively zeros.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self == &Mac::ZERO
    }

    /// Returns true iff the least significant bit of the first octet of the `[Mac]` is one.
    #[must_use]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 == 0x01
    }
}

/// Build the 14-byte Ethernet II header used to dispatch an IPv4 packet to
/// the gateway: destination `dst`, source `src`, EtherType 0x0800.
#[must_use]
pub fn frame_header(dst: Mac, src: Mac) -> [u8; 14] {
    Ethernet2Header {
        destination: dst.0,
        source: src.0,
        ether_type: EtherType::IPV4,
    }
    .to_bytes()
}

#[cfg(test)]
mod test {
    use super::{Mac, frame_header};

    #[test]
    fn mac_from_str() {
        let mac = Mac::try_from("02:00:0a:01:02:03").unwrap();
        assert_eq!(mac, Mac([0x02, 0x00, 0x0a, 0x01, 0x02, 0x03]));
        assert!(Mac::try_from("02:00:0a:01:02").is_err());
        assert!(Mac::try_from("02:00:0a:01:02:0g").is_err());
        assert!(Mac::try_from("0200.0a01.0203").is_err());
    }

    #[test]
    fn mac_from_bytes() {
        assert!(Mac::try_from([0u8; 5].as_slice()).is_err());
        assert!(Mac::try_from([0u8; 7].as_slice()).is_err());
        let mac = Mac::try_from([1u8, 2, 3, 4, 5, 6].as_slice()).unwrap();
        assert_eq!(mac.to_string(), "01:02:03:04:05:06");
    }

    #[test]
    fn mac_display_parses_back() {
        bolero::check!().with_type().for_each(|mac: &Mac| {
            let parsed = Mac::try_from(mac.to_string().as_str()).unwrap();
            assert_eq!(*mac, parsed);
        });
    }

    #[test]
    fn frame_header_layout() {
        let gw = Mac([0xaa; 6]);
        let us = Mac([0x02, 0, 0, 0, 0, 1]);
        let hdr = frame_header(gw, us);
        assert_eq!(&hdr[0..6], gw.as_ref());
        assert_eq!(&hdr[6..12], us.as_ref());
        assert_eq!(&hdr[12..14], &[0x08, 0x00]);
    }
}
