//! Thin binding for the kernel zero-copy file transmission primitive.
//!
//! Every variant has the same contract: transfer up to `nbytes` bytes from
//! `src` (a regular file) starting at `offset` into `dst` (a socket) and
//! report how many bytes actually moved. A would-block result with a partial
//! transfer is reported as a success for the bytes that made it; the caller
//! re-arms for the rest.

use std::io;
use std::os::unix::io::RawFd;

#[cfg(any(target_os = "android", target_os = "linux"))]
pub(crate) fn zero_copy_send(
    src: RawFd,
    dst: RawFd,
    offset: u64,
    nbytes: usize,
) -> io::Result<usize> {
    let mut off = offset as libc::off_t;
    syscall!(sendfile(dst, src, &mut off, nbytes)).map(|n| n as usize)
}

#[cfg(any(target_os = "ios", target_os = "macos", target_os = "tvos", target_os = "watchos"))]
pub(crate) fn zero_copy_send(
    src: RawFd,
    dst: RawFd,
    offset: u64,
    nbytes: usize,
) -> io::Result<usize> {
    let mut len = nbytes as libc::off_t;
    let res = unsafe {
        libc::sendfile(src, dst, offset as libc::off_t, &mut len, std::ptr::null_mut(), 0)
    };
    if res == -1 {
        let err = io::Error::last_os_error();
        // Darwin reports EAGAIN even when part of the range was written.
        if err.kind() == io::ErrorKind::WouldBlock && len > 0 {
            return Ok(len as usize);
        }
        return Err(err);
    }
    Ok(len as usize)
}

#[cfg(any(target_os = "dragonfly", target_os = "freebsd"))]
pub(crate) fn zero_copy_send(
    src: RawFd,
    dst: RawFd,
    offset: u64,
    nbytes: usize,
) -> io::Result<usize> {
    let mut sbytes: libc::off_t = 0;
    let res = unsafe {
        libc::sendfile(
            src,
            dst,
            offset as libc::off_t,
            nbytes,
            std::ptr::null_mut(),
            &mut sbytes,
            0,
        )
    };
    if res == -1 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock && sbytes > 0 {
            return Ok(sbytes as usize);
        }
        return Err(err);
    }
    Ok(sbytes as usize)
}

#[cfg(not(any(
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "linux",
    target_os = "macos",
    target_os = "tvos",
    target_os = "watchos",
)))]
pub(crate) fn zero_copy_send(
    _src: RawFd,
    _dst: RawFd,
    _offset: u64,
    _nbytes: usize,
) -> io::Result<usize> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "no zero-copy transfer primitive on this platform",
    ))
}
