//! Scheduled non-blocking descriptor operations.
//!
//! Each primitive arms a readiness callback and immediately returns a
//! [`Channel`] that receives the result once the operation finishes. The
//! calling task parks on `channel.read()` while the pump drives progress, so
//! no native thread ever blocks on the descriptor.

use std::cmp;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use log::trace;

use crate::channel::Channel;
use crate::driver::{Arming, Direction};
use crate::runtime::Runtime;
use crate::sys;

/// Reads from `fd`, delivering the bytes on the returned channel.
///
/// With `n = None` the next chunk the kernel makes available is delivered as
/// is. With a byte count, chunks accumulate until `n` bytes were read or the
/// stream hit end-of-file; a ready event carrying fewer bytes than remain
/// re-arms rather than delivering short. End-of-file is surfaced as a buffer
/// shorter than `n` (possibly empty).
pub fn go_read(fd: RawFd, n: Option<usize>) -> Channel<Vec<u8>> {
    let channel = Channel::new();
    let completion = channel.clone();
    let mut buffer = Vec::new();

    Runtime::with(|rt| {
        rt.driver().arm(
            rt,
            fd,
            Direction::Read,
            Box::new(move |bytes_ready, mut eof| {
                if bytes_ready > 0 {
                    let want = match n {
                        Some(n) => cmp::min(bytes_ready, n - buffer.len()),
                        None => bytes_ready,
                    };
                    let start = buffer.len();
                    buffer.resize(start + want, 0);
                    match sys::read(fd, &mut buffer[start..]) {
                        Ok(count) => {
                            buffer.truncate(start + count);
                            eof = count == 0;
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                            // Raced with another consumer of the readiness.
                            buffer.truncate(start);
                            return Arming::ReArm;
                        }
                        Err(err) => {
                            trace!("read on fd {} failed: {}", fd, err);
                            buffer.truncate(start);
                            eof = true;
                        }
                    }
                    if !eof && n.map_or(false, |n| buffer.len() < n) {
                        return Arming::ReArm;
                    }
                }
                completion.write(mem::take(&mut buffer));
                Arming::Disarm
            }),
        );
    });
    channel
}

/// Writes `data` to `fd`, delivering the number of bytes written.
///
/// Each readiness event writes the next slice, sized by the notifier's
/// budget. A would-block result re-arms without touching the offset; any
/// other error, or an end-of-file event, short-circuits with the bytes
/// written so far. An empty `data` completes on the first writability
/// event, which makes it usable as a connect probe.
pub fn go_write(fd: RawFd, data: Vec<u8>) -> Channel<usize> {
    let channel = Channel::new();
    let completion = channel.clone();
    let mut offset = 0;

    Runtime::with(|rt| {
        rt.driver().arm(
            rt,
            fd,
            Direction::Write,
            Box::new(move |bytes_ready, eof| {
                if !eof {
                    let end = cmp::min(offset + bytes_ready, data.len());
                    match sys::write(fd, &data[offset..end]) {
                        Ok(count) => offset += count,
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                            return Arming::ReArm;
                        }
                        Err(err) => {
                            trace!("write on fd {} failed: {}", fd, err);
                            completion.write(offset);
                            return Arming::Disarm;
                        }
                    }
                    if offset < data.len() {
                        return Arming::ReArm;
                    }
                }
                completion.write(offset);
                Arming::Disarm
            }),
        );
    });
    channel
}

/// Transfers up to `nbytes` bytes from the regular file `src` into the
/// socket `dst` with the kernel's zero-copy primitive, delivering the total
/// transferred.
pub fn go_sendfile(src: RawFd, dst: RawFd, offset: u64, nbytes: usize) -> Channel<usize> {
    assert!(nbytes > 0);
    let channel = Channel::new();
    let completion = channel.clone();
    let start = offset;
    let mut offset = offset;
    let mut remaining = nbytes;

    Runtime::with(|rt| {
        rt.driver().arm(
            rt,
            dst,
            Direction::Write,
            Box::new(move |bytes_ready, eof| {
                if bytes_ready > 0 && !eof {
                    match sys::zero_copy_send(src, dst, offset, cmp::min(bytes_ready, remaining)) {
                        Ok(count) => {
                            offset += count as u64;
                            remaining -= count;
                            if count > 0 && remaining > 0 {
                                return Arming::ReArm;
                            }
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                            return Arming::ReArm;
                        }
                        Err(err) => {
                            trace!("sendfile to fd {} failed: {}", dst, err);
                        }
                    }
                }
                completion.write((offset - start) as usize);
                Arming::Disarm
            }),
        );
    });
    channel
}

/// Purges notifier state for `fd`, then closes it.
///
/// The purge must come first: descriptor numbers are recycled the moment
/// `close(2)` returns, and a late callback for the old fd would fire against
/// its successor.
pub fn go_close(fd: RawFd) -> io::Result<()> {
    assert!(fd >= 0);
    Runtime::with(|rt| rt.driver().close(fd));
    sys::close(fd)
}
