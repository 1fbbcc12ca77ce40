/// Helper macro to execute a system call that returns an `io::Result`.
//
// Macro must be defined before any modules that uses them.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) mod net;

mod selector;
pub(crate) use self::selector::{event, Events, Selector};

mod sendfile;
pub(crate) use self::sendfile::zero_copy_send;

use std::io;
use std::os::unix::io::RawFd;

/// Reads at most `buf.len()` bytes from `fd`.
pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())).map(|n| n as usize)
}

/// Writes at most `buf.len()` bytes to `fd`.
pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())).map(|n| n as usize)
}

/// Closes the descriptor. Notifier state must have been purged first; the
/// kernel may hand the same fd number right back on the next open.
pub(crate) fn close(fd: RawFd) -> io::Result<()> {
    syscall!(close(fd)).map(|_| ())
}

/// Duplicates `fd` so the copy can be closed independently of the source
/// handle's lifetime.
pub(crate) fn dup(fd: RawFd) -> io::Result<RawFd> {
    let duped = syscall!(fcntl(fd, libc::F_DUPFD_CLOEXEC, 0))?;
    Ok(duped)
}
