//! A simplified Windows backend built on `WSAPoll`. Unlike the Unix
//! backends it polls synchronously over the registered socket list rather
//! than maintaining a kernel-side interest set (no IOCP), which is adequate
//! for the bounded handler counts this runtime targets but not a full
//! high-concurrency replacement for mio's AFD-based poller.

use crate::error::{ErrorKind, MprError, Result};
use crate::wait::backend::{Readiness, WaitBackend};
use crate::wait::Mask;
use crate::wait::backend::Handle;
use std::sync::Mutex;
use std::time::Duration;
use windows_sys::Win32::Networking::WinSock::{
    WSAPoll, POLLERR, POLLHUP, POLLIN, POLLOUT, WSAPOLLFD,
};

struct Registration {
    fd: Handle,
    mask: Mask,
}

pub struct WindowsPollBackend {
    registered: Mutex<Vec<Registration>>,
}

impl WindowsPollBackend {
    pub fn new() -> Result<Self> {
        Ok(WindowsPollBackend { registered: Mutex::new(Vec::new()) })
    }
}

impl WaitBackend for WindowsPollBackend {
    fn register(&self, fd: Handle, mask: Mask) -> Result<()> {
        self.registered.lock().unwrap_or_else(|e| e.into_inner()).push(Registration { fd, mask });
        Ok(())
    }

    fn reregister(&self, fd: Handle, mask: Mask) -> Result<()> {
        let mut regs = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(r) = regs.iter_mut().find(|r| r.fd == fd) {
            r.mask = mask;
        }
        Ok(())
    }

    fn deregister(&self, fd: Handle) -> Result<()> {
        self.registered.lock().unwrap_or_else(|e| e.into_inner()).retain(|r| r.fd != fd);
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Readiness>> {
        let regs: Vec<Registration> = {
            let guard = self.registered.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter().map(|r| Registration { fd: r.fd, mask: r.mask }).collect()
        };
        let mut fds: Vec<WSAPOLLFD> = regs
            .iter()
            .map(|r| {
                let mut events = 0;
                if r.mask.readable {
                    events |= POLLIN;
                }
                if r.mask.writable {
                    events |= POLLOUT;
                }
                WSAPOLLFD { fd: r.fd as usize, events: events as i16, revents: 0 }
            })
            .collect();
        let millis = timeout.map(|d| d.as_millis() as i32).unwrap_or(-1);
        let n = unsafe { WSAPoll(fds.as_mut_ptr(), fds.len() as u32, millis) };
        if n < 0 {
            return Err(MprError::new(ErrorKind::Io, "WSAPoll failed"));
        }
        let mut out = Vec::new();
        for fd in &fds {
            if fd.revents == 0 {
                continue;
            }
            out.push(Readiness {
                fd: fd.fd as Handle,
                readable: fd.revents & (POLLIN | POLLHUP | POLLERR) as i16 != 0,
                writable: fd.revents & (POLLOUT | POLLERR) as i16 != 0,
            });
        }
        Ok(out)
    }

    fn waker_target(&self) -> Handle {
        // The Windows backend re-polls its registration list every call
        // rather than blocking a kernel fd set, so a waker is unnecessary:
        // `wake()` is a no-op (see `Waker` in `wait/mod.rs`).
        0
    }
}
