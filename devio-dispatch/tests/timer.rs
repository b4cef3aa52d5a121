use std::{
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use devio_dispatch::{Context, Error, Timer, TimerOutcome};

#[test]
fn deadline_wins_over_late_cancel() {
    let ctx = Context::with_worker().unwrap();
    let timer = Timer::new(&ctx).unwrap();
    let (tx, rx) = mpsc::channel();

    timer
        .set(Duration::from_millis(50), move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();
    thread::sleep(Duration::from_millis(150));
    timer.cancel();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        TimerOutcome::Completed
    );
    // The late cancel must not produce a second delivery.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn cancel_wins_over_deadline() {
    let ctx = Context::with_worker().unwrap();
    let timer = Timer::new(&ctx).unwrap();
    let (tx, rx) = mpsc::channel();

    let armed_at = Instant::now();
    timer
        .set(Duration::from_millis(1000), move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();
    thread::sleep(Duration::from_millis(10));
    timer.cancel();

    assert_eq!(
        rx.recv_timeout(Duration::from_millis(500)).unwrap(),
        TimerOutcome::Cancelled
    );
    assert!(armed_at.elapsed() < Duration::from_millis(900));
    // The deadline must not deliver afterwards.
    assert!(rx.recv_timeout(Duration::from_millis(1100)).is_err());
}

#[test]
fn timer_can_be_rearmed_after_firing() {
    let ctx = Context::with_worker().unwrap();
    let timer = Timer::new(&ctx).unwrap();

    for _ in 0..3 {
        let (tx, rx) = mpsc::channel();
        timer
            .set(Duration::from_millis(10), move |outcome| {
                tx.send(outcome).unwrap();
            })
            .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            TimerOutcome::Completed
        );
    }
}

#[test]
fn arming_twice_is_rejected() {
    let ctx = Context::with_worker().unwrap();
    let timer = Timer::new(&ctx).unwrap();
    let (tx, rx) = mpsc::channel();

    timer
        .set(Duration::from_millis(200), move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();
    assert!(matches!(
        timer.set(Duration::from_millis(200), |_| {}),
        Err(Error::Busy)
    ));
    timer.cancel();
    rx.recv_timeout(Duration::from_secs(1)).unwrap();
}

#[test]
fn disarm_delivers_cancelled_without_a_driver() {
    let ctx = Context::new().unwrap();
    let timer = Timer::new(&ctx).unwrap();
    let (tx, rx) = mpsc::channel();

    timer
        .set(Duration::from_secs(10), move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();
    timer.disarm();
    assert_eq!(rx.try_recv().unwrap(), TimerOutcome::Cancelled);
}
