use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use log::trace;

use crate::interest::Interest;
use crate::runtime::{notifier_failure, Runtime, Work};
use crate::sys::{self, event, Selector};

/// Fallback per-event byte budget when the notifier reports readiness
/// without an amount (epoll and select; kqueue supplies a real count).
const READY_BUDGET: usize = 32 * 1024;

/// Capacity of the reusable kernel event buffer.
const EVENTS_CAPACITY: usize = 1024;

/// What an I/O callback wants done with its registration.
///
/// `ReArm` keeps the same callback installed for the next readiness event of
/// the same direction ("I still have work to do"); `Disarm` drops the
/// interest.
pub(crate) enum Arming {
    ReArm,
    Disarm,
}

/// A readiness callback, invoked with `(bytes_ready, eof)`.
pub(crate) type Callback = Box<dyn FnMut(usize, bool) -> Arming>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) enum Direction {
    Read,
    Write,
}

impl Direction {
    fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }
}

/// Callback table and readiness pump over the platform [`Selector`].
///
/// Interests are keyed by `(fd, direction)` with at most one callback per
/// key. The per-fd [`Interest`] mask mirrors what the selector has
/// registered so adding and removing one direction can be expressed as a
/// modify instead of a churn of add/remove pairs.
pub(crate) struct Driver {
    selector: Selector,
    callbacks: RefCell<HashMap<(RawFd, Direction), Callback>>,
    masks: RefCell<HashMap<RawFd, Interest>>,
    events: RefCell<sys::Events>,
    active: Cell<bool>,
}

impl Driver {
    pub(crate) fn new() -> io::Result<Driver> {
        Ok(Driver {
            selector: Selector::new()?,
            callbacks: RefCell::new(HashMap::new()),
            masks: RefCell::new(HashMap::new()),
            events: RefCell::new(sys::Events::with_capacity(EVENTS_CAPACITY)),
            active: Cell::new(false),
        })
    }

    /// Installs `cb` for `(fd, direction)` and schedules the pump.
    ///
    /// There must not be a callback already armed under the same key.
    pub(crate) fn arm(&self, rt: &Runtime, fd: RawFd, direction: Direction, cb: Callback) {
        let previous = self.callbacks.borrow_mut().insert((fd, direction), cb);
        assert!(
            previous.is_none(),
            "fd {} already armed for {:?}",
            fd,
            direction
        );

        let mut masks = self.masks.borrow_mut();
        let result = match masks.get(&fd) {
            None => {
                masks.insert(fd, direction.interest());
                self.selector.register(fd, direction.interest())
            }
            Some(&mask) => {
                let mask = mask | direction.interest();
                masks.insert(fd, mask);
                self.selector.reregister(fd, mask)
            }
        };
        drop(masks);
        if let Err(err) = result {
            notifier_failure("arming a file descriptor", &err);
        }
        trace!("armed fd {} for {:?}", fd, direction);

        self.activate(rt);
    }

    /// Purges all notifier state for `fd`: both callbacks and the interest
    /// mask. Must run before the descriptor is closed, the kernel reuses fd
    /// numbers immediately.
    pub(crate) fn close(&self, fd: RawFd) {
        let mut callbacks = self.callbacks.borrow_mut();
        callbacks.remove(&(fd, Direction::Read));
        callbacks.remove(&(fd, Direction::Write));
        if self.masks.borrow_mut().remove(&fd).is_some() {
            if let Err(err) = self.selector.deregister(fd) {
                trace!("deregistering closed fd {}: {}", fd, err);
            }
        }
    }

    fn activate(&self, rt: &Runtime) {
        if !self.active.get() {
            self.active.set(true);
            rt.enqueue(Work::Pump);
        }
    }

    /// Runs one pump round: polls the selector and dispatches callbacks.
    ///
    /// Blocks indefinitely when the ready queue holds no other work,
    /// otherwise polls with a zero timeout so task work and I/O dispatch
    /// interleave. Re-enqueues itself while any interest remains armed.
    pub(crate) fn pump(&self, rt: &Runtime) {
        if self.callbacks.borrow().is_empty() {
            self.active.set(false);
            return;
        }

        let timeout = if rt.ready_is_empty() {
            None
        } else {
            Some(Duration::ZERO)
        };

        let mut events = self.events.borrow_mut();
        match self.selector.select(&mut events, timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => events.clear(),
            Err(err) => notifier_failure("polling for readiness", &err),
        }
        trace!("pump dispatching {} events", events.len());

        for ev in events.iter() {
            let fd = event::fd(ev);
            assert!(!event::is_error(ev), "notifier error event on fd {}", fd);

            let bytes_ready = event::bytes_ready(ev).unwrap_or(READY_BUDGET);
            let eof = event::is_eof(ev);

            let mut disarm = None::<Interest>;
            for direction in [Direction::Read, Direction::Write] {
                let ready = match direction {
                    Direction::Read => event::is_readable(ev),
                    Direction::Write => event::is_writable(ev),
                };
                if !ready {
                    continue;
                }
                // A callback that closed this fd earlier in the batch has
                // already purged the key; skip the stale event.
                let Some(mut cb) = self.callbacks.borrow_mut().remove(&(fd, direction)) else {
                    continue;
                };
                match cb(bytes_ready, eof) {
                    Arming::ReArm => {
                        let previous = self.callbacks.borrow_mut().insert((fd, direction), cb);
                        debug_assert!(previous.is_none());
                    }
                    Arming::Disarm => {
                        trace!("disarmed fd {} for {:?}", fd, direction);
                        disarm = Some(match disarm {
                            None => direction.interest(),
                            Some(mask) => mask | direction.interest(),
                        });
                    }
                }
            }

            if let Some(dropped) = disarm {
                self.downgrade(fd, dropped);
            }
        }
        drop(events);

        if self.callbacks.borrow().is_empty() {
            self.active.set(false);
        } else {
            rt.enqueue(Work::Pump);
        }
    }

    /// Removes `dropped` from the fd's registration mask, deregistering the
    /// fd entirely once nothing is armed on it.
    fn downgrade(&self, fd: RawFd, dropped: Interest) {
        let mut masks = self.masks.borrow_mut();
        let Some(&mask) = masks.get(&fd) else {
            // Purged by a close within the same batch.
            return;
        };
        let result = match mask.remove(dropped) {
            Some(remaining) => {
                masks.insert(fd, remaining);
                self.selector.reregister(fd, remaining)
            }
            None => {
                masks.remove(&fd);
                self.selector.deregister(fd)
            }
        };
        drop(masks);
        if let Err(err) = result {
            notifier_failure("updating a file descriptor's interests", &err);
        }
    }
}
