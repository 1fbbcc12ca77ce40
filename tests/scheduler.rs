use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use sio::{run_until_idle, spawn, Channel};

mod util;

#[test]
fn spawned_tasks_run_in_fifo_order() {
    util::init();

    let log = Rc::new(RefCell::new(Vec::new()));
    for name in ["a", "b", "c"] {
        let log = Rc::clone(&log);
        spawn(async move {
            log.borrow_mut().push(name);
        });
    }
    run_until_idle();
    assert_eq!(*log.borrow(), ["a", "b", "c"]);
}

#[test]
fn a_task_runs_to_completion_before_the_next_starts() {
    util::init();

    let log = Rc::new(RefCell::new(Vec::new()));
    let first = Rc::clone(&log);
    spawn(async move {
        first.borrow_mut().push("a1");
        first.borrow_mut().push("a2");
    });
    let second = Rc::clone(&log);
    spawn(async move {
        second.borrow_mut().push("b");
    });
    run_until_idle();
    assert_eq!(*log.borrow(), ["a1", "a2", "b"]);
}

#[test]
fn channel_values_arrive_in_write_order() {
    let channel = Channel::new();
    for i in 0..5 {
        channel.write(i);
    }
    util::block_on(async move {
        for i in 0..5 {
            assert_eq!(channel.read().await, i);
        }
    });
}

#[test]
fn a_reader_suspends_until_the_write() {
    util::init();

    let channel = Channel::new();
    let log = Rc::new(RefCell::new(Vec::new()));

    let reader_channel = channel.clone();
    let reader_log = Rc::clone(&log);
    spawn(async move {
        let value = reader_channel.read().await;
        reader_log.borrow_mut().push(value);
    });
    let writer_log = Rc::clone(&log);
    spawn(async move {
        writer_log.borrow_mut().push(1);
        channel.write(2);
    });
    run_until_idle();
    // The reader was spawned first but could only finish after the write.
    assert_eq!(*log.borrow(), [1, 2]);
}

#[test]
fn read_waiting_drains_everything_at_once() {
    let channel = Channel::new();
    channel.write(1);
    channel.write(2);
    channel.write(3);
    util::block_on(async move {
        assert_eq!(channel.read_waiting(false).await, [1, 2, 3]);
        assert_eq!(channel.read_waiting(false).await, Vec::<i32>::new());

        let blocked = channel.clone();
        spawn(async move {
            blocked.write(4);
            blocked.write(5);
        });
        assert_eq!(channel.read_waiting(true).await, [4, 5]);
    });
}

#[test]
fn a_thousand_writers_fill_one_channel() {
    util::init();

    const N: i64 = 1000;
    let channel = Channel::new();
    for i in 0..N {
        let channel = channel.clone();
        spawn(async move {
            channel.write(i);
        });
    }
    util::block_on(async move {
        let mut seen = HashSet::new();
        for _ in 0..N {
            seen.insert(channel.read().await);
        }
        assert_eq!(seen.len(), N as usize);
        assert!((0..N).all(|i| seen.contains(&i)));
    });
}

#[test]
fn a_value_travels_a_long_channel_chain() {
    util::init();

    const N: usize = 100_000;
    let channels: Vec<Channel<usize>> = (0..=N).map(|_| Channel::new()).collect();
    for i in 0..N {
        let from = channels[i].clone();
        let to = channels[i + 1].clone();
        spawn(async move {
            let value = from.read().await;
            to.write(value + 1);
        });
    }

    let first = channels[0].clone();
    let last = channels[N].clone();
    let result = Rc::new(Cell::new(0));
    let out = Rc::clone(&result);
    spawn(async move {
        first.write(0);
        out.set(last.read().await);
    });
    run_until_idle();
    assert_eq!(result.get(), N);
}
