//! Process-wide signal delivery through per-reactor self-pipes.
//!
//! Signal dispositions are global to the process and are owned by
//! `signal-hook`. Each reactor with signal watchers opens one nonblocking
//! pipe; for every signal it subscribes to, it registers an atomic flag and
//! the pipe's write end with `signal-hook`. The pipe only wakes `poll`; the
//! flags tell the reactor which of its signals actually arrived.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::c_int;
use signal_hook::SigId;
use signal_hook::consts::FORBIDDEN;
use signal_hook::low_level;

use super::event;

/// False for signals no handler may be installed for (`SIGKILL`, `SIGSEGV`, ...).
pub(crate) fn is_catchable(signum: c_int) -> bool {
    !FORBIDDEN.contains(&signum)
}

struct Subscription {
    users: usize,
    raised: Arc<AtomicBool>,
    /// Flag action first, pipe action second; `signal-hook` runs them in
    /// registration order, so the flag is set before `poll` wakes.
    actions: [SigId; 2],
}

impl Subscription {
    fn register(signum: c_int, write_fd: RawFd) -> io::Result<Self> {
        let raised = Arc::new(AtomicBool::new(false));
        let flag = signal_hook::flag::register(signum, Arc::clone(&raised))?;
        let wake = match low_level::pipe::register_raw(signum, write_fd) {
            Ok(id) => id,
            Err(e) => {
                low_level::unregister(flag);
                return Err(e);
            }
        };

        tracing::debug!(signum, "registered signal actions");
        Ok(Self {
            users: 0,
            raised,
            actions: [flag, wake],
        })
    }

    fn unregister(self, signum: c_int) {
        for id in self.actions {
            low_level::unregister(id);
        }
        tracing::debug!(signum, "unregistered signal actions");
    }
}

/// One reactor's self-pipe and the signals it is subscribed to.
pub(crate) struct SignalPipe {
    read_fd: RawFd,
    write_fd: RawFd,
    subscriptions: HashMap<c_int, Subscription>,
}

impl SignalPipe {
    pub(crate) fn open() -> io::Result<Self> {
        let mut fds = [0 as c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);

        // A full pipe must never block the signal handler.
        let setup = || -> io::Result<()> {
            for fd in fds {
                event::set_nonblocking(fd)?;
                event::set_cloexec(fd)?;
            }
            Ok(())
        };
        if let Err(e) = setup() {
            close_pair(read_fd, write_fd);
            return Err(e);
        }

        Ok(Self {
            read_fd,
            write_fd,
            subscriptions: HashMap::new(),
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub(crate) fn subscribe(&mut self, signum: c_int) -> io::Result<()> {
        if !is_catchable(signum) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("signal {signum} cannot be caught"),
            ));
        }

        if !self.subscriptions.contains_key(&signum) {
            let subscription = Subscription::register(signum, self.write_fd)?;
            self.subscriptions.insert(signum, subscription);
        }
        if let Some(subscription) = self.subscriptions.get_mut(&signum) {
            subscription.users += 1;
        }
        Ok(())
    }

    pub(crate) fn unsubscribe(&mut self, signum: c_int) {
        let Some(subscription) = self.subscriptions.get_mut(&signum) else {
            return;
        };

        subscription.users -= 1;
        if subscription.users == 0 {
            if let Some(subscription) = self.subscriptions.remove(&signum) {
                subscription.unregister(signum);
            }
        }
    }

    pub(crate) fn has_subscriptions(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    /// Empties the pipe, returning the subscribed signals that were delivered.
    pub(crate) fn drain(&self) -> Vec<c_int> {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }

        let mut delivered: Vec<c_int> = self
            .subscriptions
            .iter()
            .filter(|(_, subscription)| subscription.raised.swap(false, Ordering::AcqRel))
            .map(|(&signum, _)| signum)
            .collect();
        delivered.sort_unstable();
        delivered
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        for (signum, subscription) in self.subscriptions.drain() {
            subscription.unregister(signum);
        }
        close_pair(self.read_fd, self.write_fd);
    }
}

fn close_pair(read_fd: RawFd, write_fd: RawFd) {
    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}
