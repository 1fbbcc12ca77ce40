// Not all functions are used by all tests.
#![allow(dead_code)]

use std::cell::Cell;
use std::future::Future;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::Once;

use sio::{run_until_idle, spawn, ScheduledFile};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    });
}

/// A connected pair of autoflushing streams over a Unix socket pair.
pub fn pair() -> (ScheduledFile, ScheduledFile) {
    init();

    let (a, b) = UnixStream::pair().expect("unable to create socket pair");
    let a = ScheduledFile::from_socket(&a).expect("unable to wrap socket");
    let b = ScheduledFile::from_socket(&b).expect("unable to wrap socket");
    a.set_autoflush(true);
    b.set_autoflush(true);
    (a, b)
}

/// Runs `future` as a task and drives the runtime until idle, asserting the
/// task actually finished instead of stalling on a channel.
pub fn block_on<F: Future<Output = ()> + 'static>(future: F) {
    init();

    let done = Rc::new(Cell::new(false));
    let flag = Rc::clone(&done);
    spawn(async move {
        future.await;
        flag.set(true);
    });
    run_until_idle();
    assert!(done.get(), "runtime went idle before the task completed");
}
