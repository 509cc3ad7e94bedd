//! The wait service (§4.E): a pluggable poll backend behind one interface,
//! plus the registered-handler table it multiplexes over.
//!
//! Grounded on the selector split in `tokio-rs-mio`'s `sys/unix/selector/*`:
//! one `Selector`-shaped type per OS facility, all exposing the same
//! `register`/`reregister`/`deregister`/`select` surface, so the dispatcher
//! never branches on platform.

mod backend;
#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
mod kqueue;
#[cfg(unix)]
mod poll;
#[cfg(unix)]
mod select;
mod waker;
#[cfg(windows)]
mod windows;

pub use backend::{Handle, Readiness, WaitBackend};
pub use waker::Waker;

use crate::error::{ErrorKind, MprError, Result};
use crate::slab::{Slab, SlabKey};
use crate::sync::{MprCondvar, MprMutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type HandlerId = SlabKey;

/// Which I/O conditions a handler is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mask {
    pub readable: bool,
    pub writable: bool,
}

impl Mask {
    pub const NONE: Mask = Mask { readable: false, writable: false };
    pub const READ: Mask = Mask { readable: true, writable: false };
    pub const WRITE: Mask = Mask { readable: false, writable: true };

    pub fn union(self, other: Mask) -> Mask {
        Mask { readable: self.readable || other.readable, writable: self.writable || other.writable }
    }

    pub fn is_none(self) -> bool {
        !self.readable && !self.writable
    }
}

/// A registered handler's bookkeeping: its desired interest, any mask it is
/// currently disabled for, and the generation the service is allowed to
/// honor a `recall()` against (§4.E).
struct Handler {
    fd: Handle,
    desired_mask: Mask,
    disable_mask: Mask,
    present_mask: Mask,
    mask_generation: u64,
    running: Arc<AtomicBool>,
    /// The caller's own "this fd became ready" callback, if any was
    /// registered via [`WaitService::set_callback`]. `wait()` looks this up
    /// by id and `dispatch_ready` runs it outside the handler-table lock.
    callback: MprMutex<Option<Box<dyn FnMut(Mask) + Send>>>,
    /// Count of callbacks currently executing for this handler; `disconnect`
    /// blocks on `idle` until this reaches zero before deregistering.
    in_flight: Arc<AtomicUsize>,
    idle: Arc<MprCondvar>,
}

/// Selects the compile-time backend. On Linux this is epoll; on the BSD
/// family (including macOS) kqueue; everywhere else (and whenever
/// `poll-backend`/`select-backend` force it) the portable fallbacks.
fn make_backend() -> Result<Box<dyn WaitBackend>> {
    #[cfg(all(target_os = "linux", not(feature = "poll-backend"), not(feature = "select-backend")))]
    {
        return epoll::EpollBackend::new().map(|b| Box::new(b) as Box<dyn WaitBackend>);
    }
    #[cfg(all(
        any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"),
        not(feature = "poll-backend"),
        not(feature = "select-backend")
    ))]
    {
        return kqueue::KqueueBackend::new().map(|b| Box::new(b) as Box<dyn WaitBackend>);
    }
    #[cfg(all(unix, feature = "select-backend"))]
    {
        return select::SelectBackend::new().map(|b| Box::new(b) as Box<dyn WaitBackend>);
    }
    #[cfg(unix)]
    #[allow(unreachable_code)]
    {
        return poll::PollBackend::new().map(|b| Box::new(b) as Box<dyn WaitBackend>);
    }
    #[cfg(windows)]
    #[allow(unreachable_code)]
    {
        return windows::WindowsPollBackend::new().map(|b| Box::new(b) as Box<dyn WaitBackend>);
    }
}

/// The wait service: owns the handler table and the chosen backend, and
/// drives one `wait()` call per service-thread turn.
pub struct WaitService {
    backend: MprMutex<Box<dyn WaitBackend>>,
    handlers: MprMutex<Slab<Handler>>,
    waker: Waker,
    /// Handlers `recall()` has re-armed since the last `wait()`, drained at
    /// the top of the next call to synthesize readiness with no kernel
    /// evidence (§4.E).
    needs_recall: MprMutex<Vec<HandlerId>>,
}

impl WaitService {
    pub fn new() -> Result<Self> {
        let mut backend = make_backend()?;
        let waker = Waker::new(backend.as_mut())?;
        Ok(WaitService {
            backend: MprMutex::new(backend),
            handlers: MprMutex::new(Slab::new()),
            waker,
            needs_recall: MprMutex::new(Vec::new()),
        })
    }

    /// Registers `fd` with an initial interest mask. Returns a handle used
    /// for later `modify`/`recall`/`deregister` calls.
    pub fn add(&self, fd: Handle, mask: Mask) -> Result<HandlerId> {
        let running = Arc::new(AtomicBool::new(true));
        let id = self.handlers.lock().map(|slab| {
            slab.insert(Handler {
                fd,
                desired_mask: mask,
                disable_mask: Mask::NONE,
                present_mask: Mask::NONE,
                mask_generation: 0,
                running: running.clone(),
                callback: MprMutex::new(None),
                in_flight: Arc::new(AtomicUsize::new(0)),
                idle: Arc::new(MprCondvar::new()),
            })
        });
        self.backend.lock().map(|backend| backend.register(fd, mask))?;
        Ok(id)
    }

    /// Registers (or replaces) the callback `wait`'s caller wants run
    /// whenever this handler is reported ready, via [`Self::dispatch_ready`].
    pub fn set_callback(&self, id: HandlerId, cb: impl FnMut(Mask) + Send + 'static) -> Result<()> {
        self.handlers.lock().map(|slab| {
            let h = slab.get(id).ok_or_else(bad_handle)?;
            h.callback.lock().map(|slot| *slot = Some(Box::new(cb)));
            Ok(())
        })
    }

    /// Changes a handler's desired interest mask.
    pub fn modify(&self, id: HandlerId, mask: Mask) -> Result<()> {
        let fd = self.handlers.lock().map(|slab| {
            let h = slab.get_mut(id).ok_or_else(bad_handle)?;
            h.desired_mask = mask;
            h.mask_generation += 1;
            Ok::<_, MprError>(h.fd)
        })?;
        self.backend.lock().map(|backend| backend.reregister(fd, mask))
    }

    /// Disables interest in `mask` until the next `recall()` re-arms it, the
    /// one-shot-disable idiom the spec's wait handlers use to avoid being
    /// re-notified while a callback is still being serviced (§4.E).
    pub fn disable(&self, id: HandlerId, mask: Mask) -> Result<()> {
        self.handlers.lock().map(|slab| {
            let h = slab.get_mut(id).ok_or_else(bad_handle)?;
            h.disable_mask = h.disable_mask.union(mask);
            Ok(())
        })
    }

    /// Re-arms any previously-disabled interest, provided the handler's mask
    /// has not been changed since (guarded by `mask_generation` so a stale
    /// recall from a superseded registration is a no-op). Also queues the
    /// handler onto `needs_recall` so the next `wait()` reports it ready
    /// even if nothing new actually arrived at the fd (§4.E).
    pub fn recall(&self, id: HandlerId, generation: u64) -> Result<()> {
        let recalled = self.handlers.lock().map(|slab| -> Result<bool> {
            let h = slab.get_mut(id).ok_or_else(bad_handle)?;
            if h.mask_generation == generation {
                h.disable_mask = Mask::NONE;
                Ok(true)
            } else {
                Ok(false)
            }
        })?;
        if recalled {
            self.needs_recall.lock().map(|q| q.push(id));
        }
        Ok(())
    }

    pub fn current_generation(&self, id: HandlerId) -> Result<u64> {
        self.handlers.lock().map(|slab| slab.get(id).map(|h| h.mask_generation).ok_or_else(bad_handle))
    }

    /// Stops delivering events for `id` without removing its registration;
    /// mirrors the handler-level `running` flag from Design Notes §9 rather
    /// than a generation bump, since a worker may already be mid-callback.
    pub fn stop(&self, id: HandlerId) {
        self.handlers.lock().map(|slab| {
            if let Some(h) = slab.get(id) {
                h.running.store(false, Ordering::Release);
            }
        });
    }

    pub fn remove(&self, id: HandlerId) -> Result<()> {
        let fd = self.handlers.lock().map(|slab| slab.remove(id).map(|h| h.fd));
        if let Some(fd) = fd {
            self.backend.lock().map(|backend| backend.deregister(fd))?;
        }
        Ok(())
    }

    /// Stops the handler and blocks the calling thread until any callback
    /// already dispatched for it (via [`Self::dispatch_ready`]) has returned,
    /// then deregisters it (§4.E's `disconnect`). A handler with no callback
    /// in flight returns immediately.
    pub fn disconnect(&self, id: HandlerId) -> Result<()> {
        self.stop(id);
        let (in_flight, idle) = self.handlers.lock().map(|slab| {
            slab.get(id).map(|h| (h.in_flight.clone(), h.idle.clone())).ok_or_else(bad_handle)
        })?;
        while in_flight.load(Ordering::Acquire) > 0 {
            idle.wait(Duration::from_millis(50));
        }
        self.remove(id)
    }

    /// Blocks up to `timeout` for readiness, then returns the handlers that
    /// became ready: handlers `recall()` queued since the last call (no
    /// kernel evidence needed) plus whatever the backend's own `wait()`
    /// reports (after subtracting each handler's `disable_mask` and
    /// filtering out any whose `running` flag was cleared mid-wait).
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<(HandlerId, Mask)>> {
        let mut ready: Vec<(HandlerId, Mask)> = Vec::new();
        let recalled: Vec<HandlerId> = self.needs_recall.lock().map(std::mem::take);
        self.handlers.lock().map(|slab| {
            for id in recalled {
                let Some(h) = slab.get(id) else { continue };
                if !h.running.load(Ordering::Acquire) {
                    continue;
                }
                let effective = Mask {
                    readable: h.desired_mask.readable && !h.disable_mask.readable,
                    writable: h.desired_mask.writable && !h.disable_mask.writable,
                };
                if !effective.is_none() {
                    push_or_merge(&mut ready, id, effective);
                }
            }
        });

        let readiness = self.backend.lock().map(|backend| backend.wait(timeout))?;
        self.handlers.lock().map(|slab| {
            for event in readiness {
                for (id, h) in slab.iter_mut() {
                    if h.fd != event.fd {
                        continue;
                    }
                    if !h.running.load(Ordering::Acquire) {
                        continue;
                    }
                    let effective = Mask {
                        readable: event.readable && h.desired_mask.readable && !h.disable_mask.readable,
                        writable: event.writable && h.desired_mask.writable && !h.disable_mask.writable,
                    };
                    h.present_mask = h.present_mask.union(effective);
                    if !effective.is_none() {
                        push_or_merge(&mut ready, id, effective);
                    }
                }
            }
        });
        Ok(ready)
    }

    /// Runs whatever callback each ready handler has registered via
    /// [`Self::set_callback`], tracking `in_flight` so a concurrent
    /// `disconnect()` can wait for it to finish rather than racing it.
    pub fn dispatch_ready(&self, ready: &[(HandlerId, Mask)]) {
        for (id, mask) in ready {
            let tracking = self.handlers.lock().map(|slab| slab.get(*id).map(|h| (h.in_flight.clone(), h.idle.clone())));
            let Some((in_flight, idle)) = tracking else { continue };
            in_flight.fetch_add(1, Ordering::AcqRel);
            self.handlers.lock().map(|slab| {
                if let Some(h) = slab.get(*id) {
                    h.callback.lock().map(|slot| {
                        if let Some(cb) = slot {
                            cb(*mask);
                        }
                    });
                }
            });
            in_flight.fetch_sub(1, Ordering::AcqRel);
            idle.signal();
        }
    }

    /// Interrupts a blocked `wait()` from another thread, e.g. after a new
    /// handler is registered or the running flag changes.
    pub fn wake(&self) {
        self.waker.wake();
    }
}

fn push_or_merge(ready: &mut Vec<(HandlerId, Mask)>, id: HandlerId, mask: Mask) {
    if let Some(entry) = ready.iter_mut().find(|(existing, _)| *existing == id) {
        entry.1 = entry.1.union(mask);
    } else {
        ready.push((id, mask));
    }
}

fn bad_handle() -> MprError {
    MprError::new(ErrorKind::BadHandle, "invalid wait handler")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn readable_socket_is_reported() {
        let service = WaitService::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let id = service.add(a.as_raw_fd(), Mask::READ).unwrap();
        b.write_all(b"x").unwrap();
        let ready = service.wait(Some(Duration::from_secs(2))).unwrap();
        assert!(ready.iter().any(|(got, mask)| *got == id && mask.readable));
    }

    #[test]
    fn disable_then_recall_round_trip() {
        let service = WaitService::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let id = service.add(a.as_raw_fd(), Mask::READ).unwrap();
        service.disable(id, Mask::READ).unwrap();
        b.write_all(b"x").unwrap();
        let ready = service.wait(Some(Duration::from_millis(200))).unwrap();
        assert!(!ready.iter().any(|(got, _)| *got == id));
        let generation = service.current_generation(id).unwrap();
        service.recall(id, generation).unwrap();
        let ready = service.wait(Some(Duration::from_secs(2))).unwrap();
        assert!(ready.iter().any(|(got, _)| *got == id));
    }

    #[test]
    fn recall_synthesizes_readiness_with_no_kernel_evidence() {
        use std::io::Read;

        let service = WaitService::new().unwrap();
        let (mut a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let id = service.add(a.as_raw_fd(), Mask::READ).unwrap();

        service.disable(id, Mask::READ).unwrap();
        b.write_all(b"x").unwrap();
        let ready = service.wait(Some(Duration::from_millis(200))).unwrap();
        assert!(!ready.iter().any(|(got, _)| *got == id));

        // Drain the byte so the fd is genuinely not kernel-readable anymore —
        // any readiness reported from here on can only come from `recall`'s
        // synthetic queue, never from the backend's own `wait()`.
        let mut buf = [0u8; 1];
        a.read_exact(&mut buf).unwrap();

        let generation = service.current_generation(id).unwrap();
        service.recall(id, generation).unwrap();
        let ready = service.wait(Some(Duration::from_millis(200))).unwrap();
        assert!(ready.iter().any(|(got, _)| *got == id), "recall should synthesize readiness even with an empty socket");
    }

    #[test]
    fn dispatch_ready_runs_the_registered_callback_and_disconnect_waits_for_it() {
        let service = Arc::new(WaitService::new().unwrap());
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let id = service.add(a.as_raw_fd(), Mask::READ).unwrap();

        let seen = Arc::new(AtomicBool::new(false));
        let seen_cb = seen.clone();
        service.set_callback(id, move |mask| {
            assert!(mask.readable);
            seen_cb.store(true, Ordering::Release);
        }).unwrap();

        b.write_all(b"x").unwrap();
        let ready = service.wait(Some(Duration::from_secs(2))).unwrap();
        service.dispatch_ready(&ready);
        assert!(seen.load(Ordering::Acquire));

        service.disconnect(id).unwrap();
        assert!(service.current_generation(id).is_err(), "disconnect should have removed the handler");
    }
}
