#![cfg(unix)]

use std::{
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use devio_serial::{Context, Error, SerialPort, Transfer, TransferStatus};

/// A pipe stands in for the device: the read end behaves like a port fd
/// (non-blocking, poll-able), the write end is the remote side.
fn pipe_port() -> (SerialPort, OwnedFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL) };
    assert_eq!(
        unsafe { libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) },
        0
    );
    let port = unsafe { SerialPort::from_raw_fd(fds[0]) };
    let remote = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    (port, remote)
}

fn feed(remote: &OwnedFd, data: &[u8]) {
    let n = unsafe { libc::write(remote.as_raw_fd(), data.as_ptr() as *const _, data.len()) };
    assert_eq!(n, data.len() as isize);
}

#[test]
fn single_read_delivers_data() {
    let ctx = Context::new().unwrap();
    let (port, remote) = pipe_port();
    let transfer = Transfer::new(&ctx).unwrap();
    let (tx, rx) = mpsc::channel();

    transfer
        .submit_read(&port, 16, move |t, status| {
            let mut buf = [0u8; 16];
            let n = t.copy_data(&mut buf);
            tx.send((status, buf[..n].to_vec())).unwrap();
        })
        .unwrap();

    feed(&remote, b"hello");
    transfer.wait().unwrap();

    let (status, data) = rx.try_recv().unwrap();
    assert_eq!(status, TransferStatus::Completed);
    assert_eq!(data, b"hello");
    assert_eq!(transfer.status(), TransferStatus::Completed);
    assert_eq!(transfer.actual_length(), 5);
}

#[test]
fn cancel_before_data_delivers_cancelled() {
    let ctx = Context::with_worker().unwrap();
    let (port, _remote) = pipe_port();
    let transfer = Transfer::new(&ctx).unwrap();
    let (tx, rx) = mpsc::channel();

    transfer
        .submit_read(&port, 64, move |_, status| {
            tx.send(status).unwrap();
        })
        .unwrap();

    let started = Instant::now();
    transfer.cancel();
    transfer.wait().unwrap();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        TransferStatus::Cancelled
    );
    assert_eq!(transfer.status(), TransferStatus::Cancelled);
    assert_eq!(transfer.actual_length(), 0);
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn cancel_is_idempotent() {
    let ctx = Context::with_worker().unwrap();
    let (port, _remote) = pipe_port();
    let transfer = Transfer::new(&ctx).unwrap();
    let (tx, rx) = mpsc::channel();

    transfer
        .submit_read(&port, 8, move |_, status| tx.send(status).unwrap())
        .unwrap();
    transfer.cancel();
    transfer.cancel();
    transfer.cancel();
    transfer.wait().unwrap();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        TransferStatus::Cancelled
    );
    // Exactly one delivery despite repeated cancels.
    assert!(rx.try_recv().is_err());
}

#[test]
fn continuous_read_rearms_without_resubmitting() {
    let ctx = Context::with_worker().unwrap();
    let (port, remote) = pipe_port();
    let transfer = Transfer::new(&ctx).unwrap();
    let (tx, rx) = mpsc::channel();

    transfer
        .submit_read_continuous(&port, 8, move |t, status| {
            tx.send((status, t.actual_length())).unwrap();
        })
        .unwrap();

    for chunk in [b"01234567", b"89abcdef", b"ghijklmn"] {
        feed(&remote, chunk);
        thread::sleep(Duration::from_millis(10));
    }

    for _ in 0..3 {
        let (status, actual) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(status, TransferStatus::Completed);
        assert_eq!(actual, 8);
    }

    transfer.cancel();
    transfer.wait().unwrap();
    // Cancellation normally delivers `Cancelled`, but a delivery already in
    // flight is allowed to win the race and close the cycle as `Completed`.
    assert!(matches!(
        transfer.status(),
        TransferStatus::Cancelled | TransferStatus::Completed
    ));
}

#[test]
fn submit_while_active_is_busy() {
    let ctx = Context::with_worker().unwrap();
    let (port, _remote) = pipe_port();
    let transfer = Transfer::new(&ctx).unwrap();

    transfer.submit_read(&port, 8, |_, _| {}).unwrap();
    assert!(matches!(
        transfer.submit_read(&port, 8, |_, _| {}),
        Err(Error::Busy)
    ));
    transfer.cancel();
    transfer.wait().unwrap();
}

#[test]
fn wait_on_idle_transfer_returns_immediately() {
    let ctx = Context::new().unwrap();
    let transfer = Transfer::new(&ctx).unwrap();
    transfer.wait().unwrap();
}

#[test]
fn write_reaches_the_remote_side() {
    // Wrap the write end of a pipe as the port.
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let reader = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let writer = unsafe { SerialPort::from_raw_fd(fds[1]) };

    assert_eq!(writer.write(b"ping").unwrap(), 4);
    let mut buf = [0u8; 8];
    let n = unsafe { libc::read(reader.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len()) };
    assert_eq!(&buf[..n as usize], b"ping");
}

#[test]
fn blocking_read_convenience() {
    let ctx = Context::new().unwrap();
    let (port, remote) = pipe_port();

    let feeder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        feed(&remote, b"abc");
    });

    let mut buf = [0u8; 8];
    let n = port.read(&ctx, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"abc");
    feeder.join().unwrap();
}

#[test]
fn user_data_round_trips() {
    let ctx = Context::new().unwrap();
    let transfer = Transfer::new(&ctx).unwrap();
    transfer.set_user_data(Box::new(42usize));
    let data = transfer.take_user_data().unwrap();
    assert_eq!(*data.downcast::<usize>().unwrap(), 42);
    assert!(transfer.take_user_data().is_none());
}

#[test]
fn port_enumeration_does_not_fail() {
    // The list may be empty in a container; the walk itself must succeed.
    devio_serial::devices().unwrap();
}
