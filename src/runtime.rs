use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::process;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use log::{error, trace};

use crate::driver::Driver;

/// Exit status used when the readiness notifier fails; task failures unwind
/// as panics and take the ordinary panic status.
const NOTIFIER_FAILURE_STATUS: i32 = 2;

pub(crate) type TaskId = u64;

/// One entry in the ready queue: either a suspended task's resume handle or
/// the I/O pump, which competes for CPU like any other work item.
pub(crate) enum Work {
    Task(TaskId),
    Pump,
}

/// Per-thread cooperative runtime: the ready queue, the task table and the
/// I/O driver. Initialised on first use and never torn down; all public
/// functions reach it through [`Runtime::with`].
pub(crate) struct Runtime {
    ready: RefCell<VecDeque<Work>>,
    tasks: RefCell<HashMap<TaskId, Pin<Box<dyn Future<Output = ()>>>>>,
    next_task: Cell<TaskId>,
    driver: Driver,
}

thread_local! {
    static RUNTIME: Runtime = Runtime::new();
}

impl Runtime {
    fn new() -> Runtime {
        let driver = match Driver::new() {
            Ok(driver) => driver,
            Err(err) => notifier_failure("creating readiness notifier", &err),
        };
        Runtime {
            ready: RefCell::new(VecDeque::new()),
            tasks: RefCell::new(HashMap::new()),
            next_task: Cell::new(0),
            driver,
        }
    }

    pub(crate) fn with<R>(f: impl FnOnce(&Runtime) -> R) -> R {
        RUNTIME.with(f)
    }

    pub(crate) fn driver(&self) -> &Driver {
        &self.driver
    }

    pub(crate) fn enqueue(&self, work: Work) {
        self.ready.borrow_mut().push_back(work);
    }

    pub(crate) fn ready_is_empty(&self) -> bool {
        self.ready.borrow().is_empty()
    }
}

/// Logs an unrecoverable notifier error and terminates the process.
pub(crate) fn notifier_failure(context: &str, err: &std::io::Error) -> ! {
    error!("notifier failure while {}: {}", context, err);
    process::exit(NOTIFIER_FAILURE_STATUS);
}

/// A task's resume handle. Waking pushes the id back onto the ready queue;
/// the completed-task check in [`run_until_idle`] makes spurious and
/// duplicate wakes harmless.
struct TaskWaker {
    id: TaskId,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        Runtime::with(|rt| rt.enqueue(Work::Task(self.id)));
    }
}

/// Spawns a new task running `future` to completion.
///
/// The task is appended to the ready queue and starts only once
/// [`run_until_idle`] reaches it; tasks spawned earlier run first. A task's
/// completion does not deliver a value, callers synchronise through
/// [`Channel`](crate::Channel)s.
pub fn spawn(future: impl Future<Output = ()> + 'static) {
    Runtime::with(|rt| {
        let id = rt.next_task.get();
        rt.next_task.set(id + 1);
        rt.tasks.borrow_mut().insert(id, Box::pin(future));
        rt.enqueue(Work::Task(id));
        trace!("spawned task {}", id);
    });
}

/// Drains the ready queue until it is empty, running tasks and the I/O pump
/// in strict FIFO order.
///
/// Each item runs until it voluntarily suspends (awaiting an empty channel)
/// or completes. The pump blocks on the kernel notifier whenever it is the
/// only remaining work, so a call with outstanding I/O does not spin. A
/// panicking task propagates out of this call and terminates the process
/// with a nonzero status; no task-level recovery is attempted.
pub fn run_until_idle() {
    loop {
        let work = Runtime::with(|rt| rt.ready.borrow_mut().pop_front());
        match work {
            None => break,
            Some(Work::Task(id)) => poll_task(id),
            Some(Work::Pump) => Runtime::with(|rt| rt.driver.pump(rt)),
        }
    }
}

fn poll_task(id: TaskId) {
    // The future is moved out while polled so task code can spawn and wake
    // without hitting the task table.
    let future = Runtime::with(|rt| rt.tasks.borrow_mut().remove(&id));
    let Some(mut future) = future else {
        // Woken again after completing.
        return;
    };

    let waker = Waker::from(Arc::new(TaskWaker { id }));
    let mut cx = Context::from_waker(&waker);
    match future.as_mut().poll(&mut cx) {
        Poll::Ready(()) => trace!("task {} finished", id),
        Poll::Pending => {
            Runtime::with(|rt| rt.tasks.borrow_mut().insert(id, future));
        }
    }
}
