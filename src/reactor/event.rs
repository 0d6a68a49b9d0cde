//! `poll(2)` wrapper used by the reactor loop.
//!
//! Every iteration builds a fresh [`PollSet`] from the connection, the signal
//! pipe and the active fd watchers, so the set handed to the kernel is always
//! exactly the current interest set.

use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, poll, pollfd};
use std::io;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::watcher::WatcherId;

/// Readiness mask for fd watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0x1);
    pub const WRITABLE: Interest = Interest(0x2);
    pub const ERROR: Interest = Interest(0x4);

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn to_poll(self) -> i16 {
        let mut events = 0;
        if self.contains(Interest::READABLE) {
            events |= POLLIN;
        }
        if self.contains(Interest::WRITABLE) {
            events |= POLLOUT;
        }
        events
    }

    fn from_poll(revents: i16) -> Self {
        let mut interest = Interest::NONE;
        if revents & (POLLIN | POLLHUP) != 0 {
            interest = interest | Interest::READABLE;
        }
        if revents & POLLOUT != 0 {
            interest = interest | Interest::WRITABLE;
        }
        if revents & (POLLERR | POLLNVAL) != 0 {
            interest = interest | Interest::ERROR;
        }
        interest
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Self) -> Self {
        Interest(self.0 | rhs.0)
    }
}

/// What a polled descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Connection,
    Signals,
    Watcher(WatcherId),
}

pub(crate) struct PollSet {
    fds: Vec<pollfd>,
    sources: Vec<(Source, Interest)>,
}

impl PollSet {
    pub(crate) fn new() -> Self {
        Self {
            fds: Vec::new(),
            sources: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, fd: RawFd, interest: Interest, source: Source) {
        self.fds.push(pollfd {
            fd,
            events: interest.to_poll(),
            revents: 0,
        });
        self.sources.push((source, interest));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Blocks until a descriptor is ready or `timeout` elapses (`None` waits forever).
    ///
    /// An interrupted wait (`EINTR`) reports zero ready descriptors; the
    /// signal handler has already queued the signal on the self-pipe.
    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(duration) => {
                // Round up so a sub-millisecond deadline does not spin.
                let ms = duration.as_micros().div_ceil(1000);
                ms.min(i32::MAX as u128) as i32
            }
        };

        let n = unsafe { poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms) };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                for fd in &mut self.fds {
                    fd.revents = 0;
                }
                return Ok(0);
            }
            return Err(err);
        }

        Ok(n as usize)
    }

    /// Descriptors that became ready, with the readiness they reported.
    pub(crate) fn ready(&self) -> impl Iterator<Item = (Source, Interest)> + '_ {
        self.fds
            .iter()
            .zip(self.sources.iter())
            .filter(|(fd, _)| fd.revents != 0)
            .map(|(fd, (source, _))| (*source, Interest::from_poll(fd.revents)))
    }
}

/// Polls a single descriptor for readability.
pub(crate) fn wait_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let mut set = PollSet::new();
    set.add(fd, Interest::READABLE, Source::Connection);
    Ok(set.wait(timeout)? > 0)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
