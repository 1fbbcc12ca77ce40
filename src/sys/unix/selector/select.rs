use std::cell::RefCell;
use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{io, ptr};

use crate::interest::Interest;

/// Fallback selector built on `select(2)`.
///
/// The kernel keeps no registration state for `select`, so the interest
/// table lives here and the fd sets are rebuilt on every call. The runtime
/// is single-threaded, which is what makes the `RefCell` sufficient.
#[derive(Debug)]
pub(crate) struct Selector {
    entries: RefCell<HashMap<RawFd, Interest>>,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        Ok(Selector {
            entries: RefCell::new(HashMap::new()),
        })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let entries = self.entries.borrow();
        let mut read_set = unsafe { empty_fd_set() };
        let mut write_set = unsafe { empty_fd_set() };
        let mut max_fd: RawFd = -1;
        for (&fd, interests) in entries.iter() {
            if fd as usize >= libc::FD_SETSIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "file descriptor above FD_SETSIZE",
                ));
            }
            if interests.is_readable() {
                unsafe { libc::FD_SET(fd, &mut read_set) };
            }
            if interests.is_writable() {
                unsafe { libc::FD_SET(fd, &mut write_set) };
            }
            max_fd = std::cmp::max(max_fd, fd);
        }

        let mut timeval = timeout.map(|to| libc::timeval {
            tv_sec: to.as_secs() as libc::time_t,
            tv_usec: libc::suseconds_t::from(to.subsec_micros() as i32),
        });
        let timeout = timeval
            .as_mut()
            .map(|tv| tv as *mut _)
            .unwrap_or(ptr::null_mut());

        syscall!(select(
            max_fd + 1,
            &mut read_set,
            &mut write_set,
            ptr::null_mut(),
            timeout,
        ))?;

        for (&fd, interests) in entries.iter() {
            let readable = interests.is_readable() && unsafe { libc::FD_ISSET(fd, &read_set) };
            let writable = interests.is_writable() && unsafe { libc::FD_ISSET(fd, &write_set) };
            if readable || writable {
                events.push(Event {
                    fd,
                    readable,
                    writable,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn register(&self, fd: RawFd, interests: Interest) -> io::Result<()> {
        let previous = self.entries.borrow_mut().insert(fd, interests);
        debug_assert!(previous.is_none(), "fd {} registered twice", fd);
        Ok(())
    }

    pub(crate) fn reregister(&self, fd: RawFd, interests: Interest) -> io::Result<()> {
        self.entries.borrow_mut().insert(fd, interests);
        Ok(())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.entries.borrow_mut().remove(&fd);
        Ok(())
    }
}

unsafe fn empty_fd_set() -> libc::fd_set {
    let mut set = MaybeUninit::<libc::fd_set>::uninit();
    libc::FD_ZERO(set.as_mut_ptr());
    set.assume_init()
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    fd: RawFd,
    readable: bool,
    writable: bool,
}

pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use std::os::unix::io::RawFd;

    use super::Event;

    pub(crate) fn fd(event: &Event) -> RawFd {
        event.fd
    }

    pub(crate) fn is_readable(event: &Event) -> bool {
        event.readable
    }

    pub(crate) fn is_writable(event: &Event) -> bool {
        event.writable
    }

    pub(crate) fn is_eof(_: &Event) -> bool {
        // `select` has no hangup reporting; end-of-file is discovered by the
        // zero-byte read.
        false
    }

    pub(crate) fn is_error(_: &Event) -> bool {
        false
    }

    pub(crate) fn bytes_ready(_: &Event) -> Option<usize> {
        None
    }
}
