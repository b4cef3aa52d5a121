use std::{thread, time::Duration};

use devio_dispatch::{Context, Event};

#[test]
fn wait_returns_when_already_set() {
    let ctx = Context::new().unwrap();
    let event = Event::new(&ctx).unwrap();
    event.set();
    event.wait().unwrap();
    assert!(event.is_set());
}

#[test]
fn set_wakes_a_driving_waiter() {
    let ctx = Context::new().unwrap();
    let event = Event::new(&ctx).unwrap();
    let handle = event.clone();
    let setter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.set();
    });
    event.wait().unwrap();
    setter.join().unwrap();
}

#[test]
fn set_and_reset_are_idempotent() {
    let ctx = Context::new().unwrap();
    let event = Event::new(&ctx).unwrap();
    assert!(!event.is_set());
    event.set();
    event.set();
    assert!(event.is_set());
    event.reset();
    event.reset();
    assert!(!event.is_set());
    event.set();
    event.wait().unwrap();
}

#[test]
fn many_waiters_all_complete() {
    let ctx = Context::new().unwrap();
    let events: Vec<Event> = (0..4).map(|_| Event::new(&ctx).unwrap()).collect();

    let waiters: Vec<_> = events
        .iter()
        .map(|event| {
            let event = event.clone();
            thread::spawn(move || event.wait().unwrap())
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    for event in &events {
        event.set();
    }
    for waiter in waiters {
        waiter.join().unwrap();
    }
}

#[test]
fn worker_thread_drives_waiters() {
    let ctx = Context::with_worker().unwrap();
    let event = Event::new(&ctx).unwrap();
    let handle = event.clone();
    let setter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        handle.set();
    });
    event.wait().unwrap();
    setter.join().unwrap();
}
