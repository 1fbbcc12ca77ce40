//! Platform specific code.
//!
//! Everything that touches a raw syscall lives below this module. The rest
//! of the crate only sees the uniform [`Selector`] surface and a handful of
//! fd helpers; callers never branch on platform.

#[cfg(unix)]
pub(crate) mod unix;
#[cfg(unix)]
pub(crate) use self::unix::net::{connect, new_tcp_socket, set_nonblocking};
#[cfg(unix)]
pub(crate) use self::unix::{
    close, dup, event, read, write, zero_copy_send, Events, Selector,
};

#[cfg(not(unix))]
compile_error!("sio requires a Unix platform providing epoll, kqueue or select");
