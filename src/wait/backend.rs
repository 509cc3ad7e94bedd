//! The common interface every wait backend implements (§4.E).

use crate::error::Result;
use crate::wait::Mask;
use std::time::Duration;

/// A raw OS handle identifying a pollable descriptor: a fd on Unix, a
/// `SOCKET` on Windows. Kept as a plain integer rather than `std::os::fd`
/// (unix-only) or `std::os::windows::io` (socket-only, wrong width) so the
/// wait service's public surface compiles on both families.
#[cfg(unix)]
pub type Handle = std::os::fd::RawFd;
#[cfg(windows)]
pub type Handle = usize;

/// One fd's readiness as reported by a `wait()` call.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub fd: Handle,
    pub readable: bool,
    pub writable: bool,
}

/// A pluggable OS polling facility. Implementations are not required to be
/// `Sync` themselves — [`crate::wait::WaitService`] only ever calls through
/// an [`crate::sync::MprMutex`] guard.
pub trait WaitBackend: Send {
    fn register(&self, fd: Handle, mask: Mask) -> Result<()>;
    fn reregister(&self, fd: Handle, mask: Mask) -> Result<()>;
    fn deregister(&self, fd: Handle) -> Result<()>;
    /// Blocks up to `timeout` (or forever if `None`) for readiness.
    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Readiness>>;
    /// The raw fd a [`crate::wait::Waker`] should target to interrupt a
    /// blocked `wait()` from another thread.
    fn waker_target(&self) -> Handle;
}
