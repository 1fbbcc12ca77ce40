use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// An unbounded FIFO of values with suspending readers.
///
/// Writers never block. A reader suspends only while the FIFO is empty and
/// is resumed by the next write; values are observed in write order. This is
/// the one suspension point of the runtime: every I/O primitive completes by
/// writing into a channel the caller is reading.
///
/// `Channel` is a cheap handle; clones share the same FIFO. Reads must be
/// awaited from inside a task (or anything driven by
/// [`run_until_idle`](crate::run_until_idle)), writes are plain calls usable
/// from anywhere on the runtime's thread.
pub struct Channel<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

struct Inner<T> {
    q: VecDeque<T>,
    waiting: Vec<Waker>,
}

impl<T> Channel<T> {
    pub fn new() -> Channel<T> {
        Channel {
            inner: Rc::new(RefCell::new(Inner {
                q: VecDeque::new(),
                waiting: Vec::new(),
            })),
        }
    }

    /// Appends `msg` and resumes every suspended reader.
    pub fn write(&self, msg: T) {
        let waiting = {
            let mut inner = self.inner.borrow_mut();
            inner.q.push_back(msg);
            mem::take(&mut inner.waiting)
        };
        for waker in waiting {
            waker.wake();
        }
    }

    /// Reads the front value, suspending while the channel is empty.
    pub fn read(&self) -> Read<'_, T> {
        Read { channel: self }
    }

    /// Drains every pending value at once. When `block` is set and the
    /// channel is empty, waits for the next write first.
    pub fn read_waiting(&self, block: bool) -> ReadWaiting<'_, T> {
        ReadWaiting {
            channel: self,
            block,
        }
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Channel<T> {
        Channel {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Channel<T> {
        Channel::new()
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Channel")
            .field("pending", &inner.q.len())
            .field("waiting", &inner.waiting.len())
            .finish()
    }
}

/// Future returned by [`Channel::read`].
pub struct Read<'a, T> {
    channel: &'a Channel<T>,
}

impl<T> fmt::Debug for Read<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Read").field("channel", self.channel).finish()
    }
}

impl<T> Future for Read<'_, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut inner = self.channel.inner.borrow_mut();
        match inner.q.pop_front() {
            Some(value) => Poll::Ready(value),
            None => {
                // Re-registers on every empty poll: another reader may have
                // drained the value that woke us.
                inner.waiting.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Future returned by [`Channel::read_waiting`].
pub struct ReadWaiting<'a, T> {
    channel: &'a Channel<T>,
    block: bool,
}

impl<T> fmt::Debug for ReadWaiting<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadWaiting")
            .field("channel", self.channel)
            .field("block", &self.block)
            .finish()
    }
}

impl<T> Future for ReadWaiting<'_, T> {
    type Output = Vec<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Vec<T>> {
        let mut inner = self.channel.inner.borrow_mut();
        if inner.q.is_empty() && self.block {
            inner.waiting.push(cx.waker().clone());
            return Poll::Pending;
        }
        Poll::Ready(inner.q.drain(..).collect())
    }
}
