// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Network namespace manipulation

use crate::TunnelError;
use nix::fcntl::OFlag;
use nix::sched::CloneFlags;
use nix::sys::stat::Mode;
use std::future::Future;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use tracing::error;

/// Filesystem path of the named network namespace `name`.
#[must_use]
pub fn path(name: &str) -> PathBuf {
    PathBuf::from(format!("/run/netns/{name}"))
}

/// Create the persistent named network namespace `name`.
///
/// # Errors
///
/// Returns a [`TunnelError`] if the namespace cannot be created (it may
/// already exist, or the caller may lack `CAP_SYS_ADMIN`).
pub async fn create(name: &str) -> Result<(), TunnelError> {
    rtnetlink::NetworkNamespace::add(name.to_string())
        .await
        .map_err(TunnelError::from)
}

/// Remove the persistent named network namespace `name`.
///
/// # Errors
///
/// Returns a [`TunnelError`] if the namespace cannot be removed.
pub async fn remove(name: &str) -> Result<(), TunnelError> {
    rtnetlink::NetworkNamespace::del(name.to_string())
        .await
        .map_err(TunnelError::from)
}

/// Run an (async) function or closure in another network namespace.
///
/// This method will spawn a new thread and create a thread local tokio runtime to execute the
/// provided method. The thread is joined before this method returns.
///
/// # Panics
///
/// * If we are unable to spawn a new thread
/// * If we are unable to create a tokio runtime
/// * If the provided function / closure panics
/// * If the provided netns path is not legal Unicode
pub fn in_netns<
    Exec: (FnOnce() -> Fut) + Send + 'static,
    Fut: Future<Output = Out> + Send,
    Out: Send + 'static,
>(
    netns: &Path,
    exec: Exec,
) -> Out {
    #[allow(clippy::expect_used)] // documented error case
    let netns_str = netns
        .to_str()
        .expect("netns path not legal unicode")
        .to_string();
    let thread_name = format!("netns-{netns_str}");
    #[allow(clippy::expect_used)]
    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            #[allow(clippy::expect_used)] // the inability to swap to the other netns is fatal
            swap_thread_to_netns(&netns_str).expect("failed to swap to netns");
            #[allow(clippy::expect_used)] // the inability to start tokio is fatal
            let tokio_runtime = tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()
                .expect("failed to build tokio runtime");
            tokio_runtime.block_on(exec())
        })
        .expect("failed to spawn netns thread")
        .join()
        .expect("failed to join netns thread")
}

/// Move the current thread to the (extant) network namespace located at `netns_path`.
///
/// # Errors
///
/// Returns a [`TunnelError`] in an `Err` variant in the event that
///
/// 1. `open` fails on the `netns_path`
/// 2. the call to `setns` fails
///
/// Note that the current thread needs the `CAP_SYS_ADMIN` capability in order
/// to run this method successfully.
fn swap_thread_to_netns(netns_path: &String) -> Result<(), TunnelError> {
    let file_descriptor = match nix::fcntl::open(
        Path::new(netns_path),
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    ) {
        Ok(raw_fd) => raw_fd,
        Err(e) => {
            error!("open error: {e}");
            return Err(TunnelError::Namespace(format!("open error: {e}")));
        }
    };

    if let Err(e) = nix::sched::setns(
        #[allow(unsafe_code)] // the fd is open and outlives the call
        unsafe {
            BorrowedFd::borrow_raw(file_descriptor.as_raw_fd())
        },
        CloneFlags::CLONE_NEWNET,
    ) {
        error!("setns error: {e}");
        return Err(TunnelError::Namespace(format!("setns error: {e}")));
    }
    Ok(())
}
