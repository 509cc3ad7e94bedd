//! MPR: a portable runtime substrate for embedded network services.
//!
//! The crate is organized the way the spec's own module table lays it out:
//! a hierarchical memory manager ([`memory`]), an event dispatcher
//! ([`dispatcher`]), a pluggable wait service ([`wait`]), a worker-thread
//! pool ([`worker`]), non-blocking sockets ([`socket`]), a filesystem
//! abstraction ([`fs`]), and an optional HTTP/1.1 client ([`http`]). Every
//! subsystem speaks the same [`error::MprError`]/[`error::Result`] pair and
//! shares [`time`]'s monotonic/wall-clock helpers and [`sync`]'s
//! re-entrant mutex for the `dispatcher → waitService → heap` lock order.

pub mod argv;
pub mod dispatcher;
pub mod error;
pub mod fs;
#[cfg(feature = "http-client")]
pub mod http;
pub mod memory;
pub mod runtime;
mod slab;
pub mod socket;
pub mod sync;
pub mod time;
pub mod wait;
pub mod worker;

pub use error::{ErrorKind, MprError, Result};
pub use memory::Mpr;
pub use runtime::Runtime;

/// Logs at debug level when the `log` feature is enabled; a silent no-op
/// otherwise, so call sites never need their own `#[cfg]` guard.
#[cfg(feature = "log")]
macro_rules! mpr_debug {
    ($($arg:tt)*) => { log::debug!($($arg)*) };
}
#[cfg(not(feature = "log"))]
macro_rules! mpr_debug {
    ($($arg:tt)*) => {{}};
}

#[cfg(feature = "log")]
macro_rules! mpr_warn {
    ($($arg:tt)*) => { log::warn!($($arg)*) };
}
#[cfg(not(feature = "log"))]
macro_rules! mpr_warn {
    ($($arg:tt)*) => {{}};
}

#[cfg(feature = "log")]
macro_rules! mpr_trace {
    ($($arg:tt)*) => { log::trace!($($arg)*) };
}
#[cfg(not(feature = "log"))]
macro_rules! mpr_trace {
    ($($arg:tt)*) => {{}};
}

pub(crate) use mpr_debug;
pub(crate) use mpr_trace;
pub(crate) use mpr_warn;
