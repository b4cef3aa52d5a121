#![cfg(unix)]

use std::{
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::Duration,
};

use devio_dispatch::{Context, Event, Wake, WaitObject};

fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

fn write_byte(fd: &OwnedFd) {
    let byte = 0u8;
    let n = unsafe { libc::write(fd.as_raw_fd(), &byte as *const u8 as *const _, 1) };
    assert_eq!(n, 1);
}

#[test]
fn entry_fires_exactly_once() {
    let ctx = Context::new().unwrap();
    let (rx, tx) = pipe();
    let done = Event::new(&ctx).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    ctx.prepare_add().unwrap();
    let signal = done.clone();
    let count = fired.clone();
    ctx.add(WaitObject::readable(rx.as_raw_fd()), move |wake| {
        assert_eq!(wake, Wake::Ready);
        count.fetch_add(1, Ordering::SeqCst);
        signal.set();
    });

    // Readiness established before the driver enters the wait is still
    // observed.
    write_byte(&tx);
    done.wait().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn removal_without_driver_runs_inline() {
    let ctx = Context::new().unwrap();
    let (rx, _tx) = pipe();
    let removed = Arc::new(AtomicUsize::new(0));

    ctx.prepare_add().unwrap();
    let count = removed.clone();
    let obj = WaitObject::readable(rx.as_raw_fd());
    ctx.add(obj, move |wake| {
        assert_eq!(wake, Wake::Removed);
        count.fetch_add(1, Ordering::SeqCst);
    });
    ctx.remove(obj);
    assert_eq!(removed.load(Ordering::SeqCst), 1);
    // Idempotent once the entries are gone.
    ctx.remove(obj);
    assert_eq!(removed.load(Ordering::SeqCst), 1);
}

#[test]
fn removal_blocks_until_the_driver_sheds_the_entry() {
    let ctx = Context::with_worker().unwrap();
    let (rx, _tx) = pipe();
    let (tx_removed, rx_removed) = mpsc::channel();

    ctx.prepare_add().unwrap();
    let obj = WaitObject::readable(rx.as_raw_fd());
    ctx.add(obj, move |wake| {
        tx_removed.send(wake).unwrap();
    });
    // Give the worker a chance to arm the entry.
    thread::sleep(Duration::from_millis(20));
    ctx.remove(obj);
    // After remove() returns the driver no longer references the entry
    // and the fd may be closed; the callback arrives with Removed.
    assert_eq!(
        rx_removed.recv_timeout(Duration::from_secs(1)).unwrap(),
        Wake::Removed
    );
}

#[test]
fn tasks_run_in_fifo_order_on_the_driving_thread() {
    let ctx = Context::new().unwrap();
    let done = Event::new(&ctx).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let main_thread = thread::current().id();

    for i in 0..10 {
        let order = order.clone();
        ctx.submit_task(move || {
            assert_eq!(thread::current().id(), main_thread);
            order.lock().unwrap().push(i);
        })
        .unwrap();
    }
    let signal = done.clone();
    ctx.submit_task(move || signal.set()).unwrap();

    done.wait().unwrap();
    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn tasks_submitted_from_other_threads_reach_the_driver() {
    let ctx = Context::new().unwrap();
    let done = Event::new(&ctx).unwrap();

    let submitter = {
        let ctx = ctx.clone();
        let done = done.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            ctx.submit_task(move || done.set()).unwrap();
        })
    };
    done.wait().unwrap();
    submitter.join().unwrap();
}

#[test]
fn callback_may_wait_reentrantly() {
    let ctx = Context::new().unwrap();
    let (rx, tx) = pipe();
    let done = Event::new(&ctx).unwrap();
    let inner_done = Event::new(&ctx).unwrap();

    ctx.prepare_add().unwrap();
    let signal = done.clone();
    let inner = inner_done.clone();
    let task_ctx = ctx.clone();
    ctx.add(WaitObject::readable(rx.as_raw_fd()), move |wake| {
        assert_eq!(wake, Wake::Ready);
        // Waiting from the driving thread must enter the inner dispatch
        // loop instead of deadlocking on the loop token.
        let setter = inner.clone();
        task_ctx.submit_task(move || setter.set()).unwrap();
        inner.wait().unwrap();
        signal.set();
    });

    write_byte(&tx);
    done.wait().unwrap();
}

#[test]
fn reservations_can_be_cancelled() {
    let ctx = Context::new().unwrap();
    ctx.prepare_add().unwrap();
    ctx.prepare_add().unwrap();
    ctx.cancel_add();
    ctx.cancel_add();
    // A context with balanced reservations tears down cleanly.
}

#[test]
fn stop_event_loop_releases_the_driver() {
    let ctx = Context::new().unwrap();
    let runner = {
        let ctx = ctx.clone();
        thread::spawn(move || ctx.run_event_loop())
    };
    thread::sleep(Duration::from_millis(30));
    ctx.stop_event_loop();
    runner.join().unwrap().unwrap();

    // The loop can be rearmed and driven again.
    ctx.restart_event_loop();
    let runner = {
        let ctx = ctx.clone();
        thread::spawn(move || ctx.run_event_loop())
    };
    thread::sleep(Duration::from_millis(30));
    ctx.stop_event_loop();
    runner.join().unwrap().unwrap();
}

#[test]
fn entries_fire_while_a_worker_drives() {
    let ctx = Context::with_worker().unwrap();
    let (rx, tx) = pipe();
    let done = Event::new(&ctx).unwrap();

    ctx.prepare_add().unwrap();
    let signal = done.clone();
    ctx.add(WaitObject::readable(rx.as_raw_fd()), move |_| signal.set());

    thread::sleep(Duration::from_millis(20));
    write_byte(&tx);
    done.wait().unwrap();
}
