// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use net::interface::InterfaceName;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use tracing::{info, trace, warn};

/// An open tun device.
///
/// The device exists as long as the descriptor is held; dropping the
/// [`TunDevice`] destroys the interface.
#[derive(Debug)]
pub struct TunDevice {
    name: InterfaceName,
    file: std::fs::File,
}

mod helper {
    /// This is a validated type around a value which is regrettably fragile.
    ///
    /// 1. Passed directly to the kernel.
    /// 2. By a privileged thread.
    /// 3. In an ioctl.
    /// 4. By an implicitly null terminated pointer.
    ///
    /// As a result, strict checks are in place to ensure memory integrity.
    ///
    /// <div class=warning>
    ///
    /// It is essential that this type remains transparent.
    /// Only zero-sized types may be added to this structure as we don't control the ABI.
    /// We are subject to a contract with the kernel.
    /// </div>
    #[repr(transparent)]
    #[derive(Debug)]
    pub(super) struct TunRequestInner(pub(super) libc::ifreq);

    use net::interface::InterfaceName;
    use std::pin::Pin;

    nix::ioctl_write_ptr_bad!(
        /// Attach a queue to (creating, if needed) a tun device
        tun_set_iff,
        libc::TUNSETIFF,
        TunRequestInner
    );

    /// A pinned [`TunRequestInner`] plus the validated name it carries.
    #[derive(Debug)]
    #[non_exhaustive]
    pub(super) struct TunRequest {
        pub(super) name: InterfaceName,
        pub(super) request: Pin<Box<TunRequestInner>>,
    }

    impl TunRequestInner {
        pub(super) fn new(name: &InterfaceName) -> Self {
            // we cannot support any platform for which this condition does not hold
            static_assertions::const_assert_eq!(libc::IF_NAMESIZE, InterfaceName::MAX_LEN);
            let mut ifreq = libc::ifreq {
                ifr_name: [0; libc::IF_NAMESIZE],
                ifr_ifru: libc::__c_anonymous_ifr_ifru {
                    ifru_ifindex: libc::IFF_TUN | libc::IFF_NO_PI,
                },
            };
            for (i, byte) in name.as_ref().as_bytes().iter().enumerate() {
                // already confirmed that we are ASCII in the InterfaceName contract
                #[allow(clippy::cast_possible_wrap)]
                {
                    ifreq.ifr_name[i] = *byte as libc::c_char;
                }
            }
            TunRequestInner(ifreq)
        }
    }

    impl TunRequest {
        pub(super) fn new(name: InterfaceName) -> Self {
            let request = Box::pin(TunRequestInner::new(&name));
            Self { name, request }
        }
    }

    #[cfg(test)]
    mod test {
        use super::TunRequestInner;
        use net::interface::InterfaceName;
        use std::ffi::CStr;

        #[test]
        fn tun_request_preserves_name() {
            bolero::check!().with_type().for_each(|name: &String| {
                let Ok(name) = InterfaceName::try_from(name.as_str()) else {
                    return;
                };
                let ifreq = TunRequestInner::new(&name);
                assert_eq!(ifreq.0.ifr_name[ifreq.0.ifr_name.len() - 1], 0);
                assert_eq!(ifreq.0.ifr_name[name.as_ref().len()], 0);
                #[allow(unsafe_code)] // test code
                let as_cstr = unsafe { CStr::from_ptr(ifreq.0.ifr_name.as_ptr()) };
                assert_eq!(as_cstr.to_bytes(), name.as_ref().as_bytes());
            });
        }
    }
}

impl TunDevice {
    /// Create the tun device `name` and keep it open.
    ///
    /// The descriptor is opened non-blocking, ready to be driven from a
    /// readiness loop.
    ///
    /// # Errors
    ///
    /// If `/dev/net/tun` cannot be opened or the device cannot be created,
    /// an `io::Error` is returned.
    pub fn create(name: InterfaceName) -> Result<TunDevice, std::io::Error> {
        let request = helper::TunRequest::new(name);
        trace!("opening /dev/net/tun");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;
        let name = request.name;
        trace!("attempting to create tun device {name}");
        #[allow(unsafe_code, clippy::borrow_as_ptr)] // well-checked constraints
        let ret = unsafe { tun_set_iff(file.as_raw_fd(), &*request.request)? };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            warn!("failed to create tun device {name}: {err}");
            return Err(err);
        }
        info!("created tun device {name}");
        Ok(TunDevice { name, file })
    }

    /// The interface name this device was created with.
    #[must_use]
    pub fn name(&self) -> &InterfaceName {
        &self.name
    }

    /// Read one packet from the device into `buf`.
    ///
    /// # Errors
    ///
    /// Propagates the underlying read error; `WouldBlock` means no packet is
    /// queued right now.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        (&self.file).read(buf)
    }

    /// Inject one packet into the device.
    ///
    /// # Errors
    ///
    /// Propagates the underlying write error.
    pub fn write_all(&self, buf: &[u8]) -> Result<(), std::io::Error> {
        (&self.file).write_all(buf)
    }
}

use helper::tun_set_iff;

impl AsRawFd for TunDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl AsFd for TunDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}
