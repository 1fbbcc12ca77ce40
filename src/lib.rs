//! Cooperative single-threaded scheduling and non-blocking I/O.
//!
//! Sio runs lightweight tasks on one thread with run-to-completion
//! semantics: a task keeps the CPU until it awaits an empty [`Channel`],
//! and everything that can wait — socket reads, writes, connects, flushes —
//! waits by reading a channel. Readiness is multiplexed by the platform
//! notifier (epoll on Linux, kqueue on the BSDs and Darwin, `select(2)`
//! elsewhere) and dispatched by an I/O pump that shares the ready queue
//! with ordinary tasks.
//!
//! [`ScheduledFile`] layers a buffered, line- and delimiter-aware stream on
//! top, and [`objects`] adds a self-describing binary codec with identifier
//! interning so shared subvalues survive a round trip.
//!
//! # Example
//!
//! ```no_run
//! use std::os::unix::net::UnixStream;
//! use sio::{run_until_idle, spawn, ScheduledFile};
//!
//! let (a, b) = UnixStream::pair().unwrap();
//! let server = ScheduledFile::from_socket(&a).unwrap();
//! let client = ScheduledFile::from_socket(&b).unwrap();
//! server.set_autoflush(true);
//! client.set_autoflush(true);
//!
//! spawn(async move {
//!     let line = server.read_line().await.unwrap();
//!     server.write(b"echo: ").await.unwrap();
//!     server.write(&line).await.unwrap();
//! });
//! spawn(async move {
//!     client.write(b"hello world\n").await.unwrap();
//!     let reply = client.read_line().await.unwrap();
//!     assert_eq!(reply, b"echo: hello world\n");
//! });
//! run_until_idle();
//! ```

#![deny(missing_debug_implementations)]

mod channel;
mod driver;
mod interest;
mod nonblock;
pub mod objects;
mod runtime;
mod stream;
mod sys;

pub use crate::channel::{Channel, Read, ReadWaiting};
pub use crate::nonblock::{go_close, go_read, go_sendfile, go_write};
pub use crate::objects::ObjectFile;
pub use crate::runtime::{run_until_idle, spawn};
pub use crate::stream::{Lines, ReadUntil, ScheduledFile};
