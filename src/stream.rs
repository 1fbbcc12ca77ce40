use std::cell::RefCell;
use std::cmp;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use log::trace;

use crate::channel::Channel;
use crate::nonblock::{go_close, go_read, go_sendfile, go_write};
use crate::runtime::spawn;
use crate::sys;

/// Default flush threshold for buffered writes.
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream closed")
}

/// A buffered byte stream over one file descriptor, scheduled instead of
/// blocking.
///
/// Reads and writes go through the runtime's non-blocking primitives: a
/// caller that has to wait parks on a channel and other tasks keep running.
/// Writes gather in an outgoing buffer drained by a single background
/// flusher task; reads gather in an incoming buffer consumed by the exact,
/// line and delimiter operations.
///
/// `ScheduledFile` is a cheap handle; clones share the descriptor and both
/// buffers. The descriptor is owned: [`close`](ScheduledFile::close) (or
/// constructing from a duplicated fd in the first place) keeps its lifetime
/// independent of any other handle to the same socket.
pub struct ScheduledFile {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    fd: Option<RawFd>,
    autoflush: bool,
    buffer_size: usize,
    incoming: Vec<u8>,
    outgoing: Vec<u8>,
    // Set when the flusher sees the peer refuse further bytes; writes fail
    // from then on.
    write_closed: bool,
    // `Some` while a background flusher task is running; holds the channels
    // of blocked `flush` callers.
    flushers: Option<Vec<Channel<()>>>,
    nread: u64,
    nwrite: u64,
}

impl ScheduledFile {
    fn new(fd: RawFd, autoflush: bool) -> ScheduledFile {
        ScheduledFile {
            inner: Rc::new(RefCell::new(Inner {
                fd: Some(fd),
                autoflush,
                buffer_size: DEFAULT_BUFFER_SIZE,
                incoming: Vec::new(),
                outgoing: Vec::new(),
                write_closed: false,
                flushers: None,
                nread: 0,
                nwrite: 0,
            })),
        }
    }

    /// Wraps an existing socket-like handle.
    ///
    /// The descriptor is duplicated and the duplicate switched to
    /// non-blocking mode, so dropping or closing `socket` later does not
    /// invalidate this stream.
    pub fn from_socket<S: AsRawFd>(socket: &S) -> io::Result<ScheduledFile> {
        let fd = sys::dup(socket.as_raw_fd())?;
        sys::set_nonblocking(fd)?;
        Ok(ScheduledFile::new(fd, false))
    }

    /// Opens a TCP connection to `addr`.
    ///
    /// The connect is issued non-blocking; an in-progress result is turned
    /// into a wait for writability, suspending the calling task rather than
    /// the thread. The returned stream has autoflush enabled.
    pub async fn connect_tcp(addr: SocketAddr) -> io::Result<ScheduledFile> {
        let fd = sys::new_tcp_socket(&addr)?;
        match sys::connect(fd, &addr) {
            Ok(()) => {}
            Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) => {
                let _ = sys::close(fd);
                return Err(err);
            }
        }
        // Make sure the socket is writable before handing it out; an empty
        // write completes on the first writability event.
        go_write(fd, Vec::new()).read().await;
        Ok(ScheduledFile::new(fd, true))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().fd.is_none()
    }

    /// Flush on every write (the default for connected streams).
    pub fn set_autoflush(&self, autoflush: bool) {
        self.inner.borrow_mut().autoflush = autoflush;
    }

    /// Total bytes consumed from the descriptor so far.
    pub fn bytes_read(&self) -> u64 {
        self.inner.borrow().nread
    }

    /// Total bytes the flusher has pushed into the descriptor so far.
    pub fn bytes_written(&self) -> u64 {
        self.inner.borrow().nwrite
    }

    /// Appends `data` to the outgoing buffer.
    ///
    /// With autoflush a flush is started on every write and the call blocks
    /// once more than `buffer_size` bytes are pending; without it the write
    /// only triggers a non-blocking flush when the threshold is crossed.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        let (autoflush, over) = {
            let mut inner = self.inner.borrow_mut();
            if inner.fd.is_none() || inner.write_closed {
                return Err(closed());
            }
            inner.outgoing.extend_from_slice(data);
            (inner.autoflush, inner.outgoing.len() > inner.buffer_size)
        };
        if autoflush {
            self.flush(over).await;
        } else if over {
            self.flush(false).await;
        }
        Ok(())
    }

    /// Starts draining the outgoing buffer, spawning the background flusher
    /// if none is running. With `block`, waits until the buffer is empty.
    pub async fn flush(&self, block: bool) {
        let waiter = {
            let mut inner = self.inner.borrow_mut();
            let started = inner.flushers.is_none();
            if started {
                inner.flushers = Some(Vec::new());
            }
            let waiter = if block {
                let waiter = Channel::new();
                if let Some(flushers) = inner.flushers.as_mut() {
                    flushers.push(waiter.clone());
                }
                Some(waiter)
            } else {
                None
            };
            drop(inner);
            if started {
                spawn(flusher(Rc::clone(&self.inner)));
            }
            waiter
        };
        if let Some(waiter) = waiter {
            waiter.read().await;
        }
    }

    /// One scheduled read off the descriptor; `None` asks for whatever chunk
    /// the kernel has.
    async fn read_chunk(&self, n: Option<usize>) -> io::Result<Vec<u8>> {
        let fd = self.inner.borrow().fd.ok_or_else(closed)?;
        let chunk = go_read(fd, n).read().await;
        self.inner.borrow_mut().nread += chunk.len() as u64;
        Ok(chunk)
    }

    /// Reads exactly `n` bytes, or everything available if end-of-file comes
    /// first.
    pub async fn read(&self, n: usize) -> io::Result<Vec<u8>> {
        while self.inner.borrow().incoming.len() < n {
            let chunk = self.read_chunk(None).await?;
            let eof = chunk.is_empty();
            self.inner.borrow_mut().incoming.extend_from_slice(&chunk);
            if eof {
                break;
            }
        }
        let mut inner = self.inner.borrow_mut();
        let take = cmp::min(n, inner.incoming.len());
        Ok(inner.incoming.drain(..take).collect())
    }

    /// Reads until end-of-file.
    pub async fn read_to_end(&self) -> io::Result<Vec<u8>> {
        loop {
            let chunk = self.read_chunk(None).await?;
            let eof = chunk.is_empty();
            self.inner.borrow_mut().incoming.extend_from_slice(&chunk);
            if eof {
                break;
            }
        }
        let mut inner = self.inner.borrow_mut();
        Ok(inner.incoming.drain(..).collect())
    }

    /// Reads one `\n`-terminated line, separator included when present.
    pub async fn read_line(&self) -> io::Result<Vec<u8>> {
        self.read_line_with(None, b"\n").await
    }

    /// General form of [`read_line`](ScheduledFile::read_line): a byte limit
    /// and a custom separator. A line longer than `limit` is cut there and
    /// the excess stays buffered for the next read.
    pub async fn read_line_with(
        &self,
        limit: Option<usize>,
        separator: &[u8],
    ) -> io::Result<Vec<u8>> {
        let mut line = Vec::new();
        {
            let mut chunks = self.read_until(separator, true);
            while let Some(chunk) = chunks.next().await? {
                line.extend_from_slice(&chunk);
                if limit.map_or(false, |n| line.len() >= n) {
                    break;
                }
            }
            // Dropping `chunks` pushes its unemitted tail back into the
            // incoming buffer.
        }
        if let Some(n) = limit {
            if line.len() > n {
                let excess = line.split_off(n);
                self.inner.borrow_mut().incoming.splice(0..0, excess);
            }
        }
        Ok(line)
    }

    /// Streams chunks up to (and optionally including) `separator`.
    ///
    /// Chunks are emitted eagerly while scanning, so an arbitrarily distant
    /// separator never forces unbounded buffering: only the last
    /// `separator.len() - 1` bytes are held back between reads. Bytes after
    /// the separator stay in the incoming buffer for the next operation.
    /// With `including_sep`, the separator itself is consumed and emitted as
    /// the final chunk; otherwise it is left buffered.
    pub fn read_until<'a>(&'a self, separator: &[u8], including_sep: bool) -> ReadUntil<'a> {
        ReadUntil {
            file: self,
            separator: separator.to_vec(),
            including_sep,
            buf: Vec::new(),
            drained_incoming: false,
            state: ScanState::Scanning,
        }
    }

    /// Lazy sequence of lines; ends at end-of-file.
    pub fn lines(&self) -> Lines<'_> {
        Lines { file: self }
    }

    /// Transfers `nbytes` bytes from the regular file `src` into this
    /// stream with the kernel's zero-copy primitive. Buffered output is
    /// flushed first so ordering is preserved.
    pub async fn sendfile(&self, src: RawFd, offset: u64, nbytes: usize) -> io::Result<usize> {
        self.flush(true).await;
        let fd = self.inner.borrow().fd.ok_or_else(closed)?;
        Ok(go_sendfile(src, fd, offset, nbytes).read().await)
    }

    /// Closes the stream, flushing pending output first when `flush` is
    /// set. Idempotent.
    pub async fn close(&self, flush: bool) -> io::Result<()> {
        if self.inner.borrow().fd.is_none() {
            return Ok(());
        }
        if flush && !self.inner.borrow().outgoing.is_empty() {
            self.flush(true).await;
        }
        let fd = self.inner.borrow_mut().fd.take();
        match fd {
            Some(fd) => {
                trace!("closing scheduled stream on fd {}", fd);
                go_close(fd)
            }
            // Another handle closed the stream while we flushed.
            None => Ok(()),
        }
    }
}

impl Clone for ScheduledFile {
    fn clone(&self) -> ScheduledFile {
        ScheduledFile {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for ScheduledFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ScheduledFile")
            .field("fd", &inner.fd)
            .field("incoming", &inner.incoming.len())
            .field("outgoing", &inner.outgoing.len())
            .field("autoflush", &inner.autoflush)
            .finish()
    }
}

/// Background task draining `outgoing`. The single writer for the stream
/// while it runs; user writes may still append between rounds.
async fn flusher(inner: Rc<RefCell<Inner>>) {
    loop {
        let (fd, data) = {
            let inner = inner.borrow();
            match inner.fd {
                Some(fd) if !inner.outgoing.is_empty() && !inner.write_closed => {
                    (fd, inner.outgoing.clone())
                }
                _ => break,
            }
        };
        let written = go_write(fd, data).read().await;
        let mut inner = inner.borrow_mut();
        if written == 0 {
            // The peer takes no more bytes; poison the write side.
            inner.write_closed = true;
            inner.outgoing.clear();
        } else {
            inner.outgoing.drain(..written);
            inner.nwrite += written as u64;
        }
    }
    let waiters = inner.borrow_mut().flushers.take().unwrap_or_default();
    for waiter in waiters {
        waiter.write(());
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

enum ScanState {
    Scanning,
    EmitSeparator,
    Done,
}

/// Chunk sequence returned by [`ScheduledFile::read_until`].
pub struct ReadUntil<'a> {
    file: &'a ScheduledFile,
    separator: Vec<u8>,
    including_sep: bool,
    buf: Vec<u8>,
    drained_incoming: bool,
    state: ScanState,
}

impl ReadUntil<'_> {
    /// Next chunk, or `None` once the separator (or end-of-file) was
    /// reached.
    pub async fn next(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.separator.is_empty() {
            return Ok(None);
        }
        loop {
            match self.state {
                ScanState::Done => return Ok(None),
                ScanState::EmitSeparator => {
                    self.state = ScanState::Done;
                    let mut inner = self.file.inner.borrow_mut();
                    debug_assert!(inner.incoming.starts_with(&self.separator));
                    let len = cmp::min(self.separator.len(), inner.incoming.len());
                    inner.incoming.drain(..len);
                    return Ok(Some(self.separator.clone()));
                }
                ScanState::Scanning => {
                    if let Some(pos) = find(&self.buf, &self.separator) {
                        // Everything from the separator on goes back to the
                        // incoming buffer; the prefix is the final payload
                        // chunk.
                        let rest = self.buf.split_off(pos);
                        self.file.inner.borrow_mut().incoming.splice(0..0, rest);
                        self.state = if self.including_sep {
                            ScanState::EmitSeparator
                        } else {
                            ScanState::Done
                        };
                        let prefix = std::mem::take(&mut self.buf);
                        if !prefix.is_empty() {
                            return Ok(Some(prefix));
                        }
                        continue;
                    }

                    if self.buf.len() > self.separator.len() {
                        // No match yet; emit all but a potential partial
                        // separator at the tail.
                        let keep = self.separator.len() - 1;
                        let head_len = self.buf.len() - keep;
                        let tail = self.buf.split_off(head_len);
                        let head = std::mem::replace(&mut self.buf, tail);
                        return Ok(Some(head));
                    }

                    let chunk = self.next_input().await?;
                    if chunk.is_empty() {
                        self.state = ScanState::Done;
                        let rest = std::mem::take(&mut self.buf);
                        if !rest.is_empty() {
                            return Ok(Some(rest));
                        }
                        return Ok(None);
                    }
                    self.buf.extend_from_slice(&chunk);
                }
            }
        }
    }

    async fn next_input(&mut self) -> io::Result<Vec<u8>> {
        if !self.drained_incoming {
            self.drained_incoming = true;
            let pending = std::mem::take(&mut self.file.inner.borrow_mut().incoming);
            if !pending.is_empty() {
                return Ok(pending);
            }
        }
        self.file.read_chunk(None).await
    }
}

impl fmt::Debug for ReadUntil<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadUntil")
            .field("file", self.file)
            .field("separator", &self.separator)
            .field("including_sep", &self.including_sep)
            .finish()
    }
}

impl Drop for ReadUntil<'_> {
    fn drop(&mut self) {
        // Abandoned mid-scan: return the unemitted tail to the stream.
        if !self.buf.is_empty() {
            let buf = std::mem::take(&mut self.buf);
            self.file.inner.borrow_mut().incoming.splice(0..0, buf);
        }
    }
}

/// Line sequence returned by [`ScheduledFile::lines`].
#[derive(Debug)]
pub struct Lines<'a> {
    file: &'a ScheduledFile,
}

impl Lines<'_> {
    pub async fn next(&mut self) -> io::Result<Option<Vec<u8>>> {
        let line = self.file.read_line().await?;
        Ok(if line.is_empty() { None } else { Some(line) })
    }
}

#[cfg(test)]
mod tests {
    use super::find;

    #[test]
    fn find_locates_first_occurrence() {
        assert_eq!(find(b"aafoobar", b"foobar"), Some(2));
        assert_eq!(find(b"aafoobar", b"baz"), None);
        assert_eq!(find(b"abcabc", b"abc"), Some(0));
    }
}
