//! `poll`-based wait-set driver.
//!
//! There is no portable "wait for N kernel objects" primitive on Unix, so
//! the wait vector is a `pollfd` array rebuilt from the entry arena on
//! every cycle, plus a control pipe that carries single-byte commands
//! (`u` for set-updated, `s` for loop-stop).

#[allow(unused_imports)]
pub use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::{
    collections::VecDeque,
    io,
    os::fd::FromRawFd,
    sync::{Condvar, Mutex},
    thread::{self, ThreadId},
    time::Duration,
};

use slab::Slab;
use tracing::trace;

use crate::{syscall, Error, Result, Wake};

/// The readiness an fd is waited for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Wake when the fd becomes readable.
    Readable,
    /// Wake when the fd becomes writable.
    Writable,
}

impl Interest {
    fn events(self) -> libc::c_short {
        match self {
            Self::Readable => libc::POLLIN,
            Self::Writable => libc::POLLOUT,
        }
    }
}

/// One fd/readiness pair the dispatcher waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitObject {
    fd: RawFd,
    interest: Interest,
}

impl WaitObject {
    /// Wait for `fd` to become readable.
    pub fn readable(fd: RawFd) -> Self {
        Self {
            fd,
            interest: Interest::Readable,
        }
    }

    /// Wait for `fd` to become writable.
    pub fn writable(fd: RawFd) -> Self {
        Self {
            fd,
            interest: Interest::Writable,
        }
    }

    fn pollfd(&self) -> libc::pollfd {
        libc::pollfd {
            fd: self.fd,
            events: self.interest.events(),
            revents: 0,
        }
    }
}

pub(crate) type EntryCallback = Box<dyn FnOnce(Wake) + Send>;
pub(crate) type TaskFn = Box<dyn FnOnce() + Send>;

struct Entry {
    obj: WaitObject,
    serial: u64,
    removed: bool,
    callback: EntryCallback,
}

struct State {
    entries: Slab<Entry>,
    reserve: usize,
    next_serial: u64,
    removal_gen: u64,
    tasks: VecDeque<TaskFn>,
    driver: Option<ThreadId>,
    // Rebuilt wait vector, handed back and forth between growers and the
    // current driver so the entry list is never locked across `poll`.
    pollfds: Option<Vec<libc::pollfd>>,
}

pub(crate) struct Driver {
    state: Mutex<State>,
    cond: Condvar,
    wake_rx: OwnedFd,
    wake_tx: OwnedFd,
    stop: EventObject,
}

impl Driver {
    pub fn new() -> Result<Self> {
        let (wake_rx, wake_tx) = make_pipe()?;
        let stop = EventObject::new()?;
        Ok(Self {
            state: Mutex::new(State {
                entries: Slab::new(),
                reserve: 0,
                next_serial: 0,
                removal_gen: 0,
                tasks: VecDeque::new(),
                driver: None,
                pollfds: Some(Vec::new()),
            }),
            cond: Condvar::new(),
            wake_rx,
            wake_tx,
            stop,
        })
    }

    /// Reserve room for one wait-set entry, so that committing it after the
    /// OS primitive has been issued cannot fail.
    pub fn prepare_add(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let needed = st.entries.len() + st.reserve + 1;
        if st.entries.capacity() < needed {
            let additional = needed - st.entries.len();
            st.entries.reserve(additional);
        }
        // Room for every entry plus the target and control-pipe slots.
        let cap_needed = needed + 2;
        match &mut st.pollfds {
            Some(cache) => {
                if cache.capacity() < cap_needed {
                    cache
                        .try_reserve(cap_needed.saturating_sub(cache.len()))
                        .map_err(|_| Error::NoMem)?;
                }
            }
            None => {
                // The cache is out with the current driver. Leave a larger
                // replacement; the driver grabs it on its next cycle and
                // frees the one it holds.
                let mut fresh = Vec::new();
                fresh.try_reserve(cap_needed).map_err(|_| Error::NoMem)?;
                st.pollfds = Some(fresh);
            }
        }
        st.reserve += 1;
        Ok(())
    }

    /// Release an unused reservation.
    pub fn cancel_add(&self) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.reserve > 0);
        st.reserve = st.reserve.saturating_sub(1);
    }

    /// Commit a reserved entry. Consumed once: the callback runs exactly
    /// once, with [`Wake::Ready`] on readiness or [`Wake::Removed`] if the
    /// entry is withdrawn first.
    pub fn add(&self, obj: WaitObject, callback: EntryCallback) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.reserve > 0);
        let serial = st.next_serial;
        st.next_serial += 1;
        st.entries.insert(Entry {
            obj,
            serial,
            removed: false,
            callback,
        });
        st.reserve = st.reserve.saturating_sub(1);
        drop(st);
        trace!(fd = obj.fd, "wait-set entry added");
        self.wake(b'u');
    }

    /// Withdraw every entry waiting on `obj`.
    ///
    /// Blocks until the current driver has rebuilt its view of the set, so
    /// the caller may close the underlying fd as soon as this returns.
    /// Withdrawn callbacks are delivered [`Wake::Removed`].
    pub fn remove(&self, obj: WaitObject) {
        let me = thread::current().id();
        let mut st = self.state.lock().unwrap();
        let mut marked = false;
        loop {
            if st.driver.is_none() || st.driver == Some(me) {
                let shed = Self::extract(&mut st, obj);
                drop(st);
                if !shed.is_empty() {
                    for cb in shed {
                        cb(Wake::Removed);
                    }
                    self.cond.notify_all();
                }
                return;
            }
            if !st.entries.iter().any(|(_, e)| e.obj == obj) {
                return;
            }
            if !marked {
                for (_, e) in st.entries.iter_mut() {
                    if e.obj == obj {
                        e.removed = true;
                    }
                }
                marked = true;
                self.wake(b'u');
            }
            st = self.cond.wait(st).unwrap();
        }
    }

    fn extract(st: &mut State, obj: WaitObject) -> Vec<EntryCallback> {
        let keys: Vec<usize> = st
            .entries
            .iter()
            .filter(|(_, e)| e.obj == obj)
            .map(|(k, _)| k)
            .collect();
        if keys.is_empty() {
            return Vec::new();
        }
        st.removal_gen += 1;
        keys.into_iter()
            .map(|k| st.entries.remove(k).callback)
            .collect()
    }

    fn extract_marked(st: &mut State) -> Vec<EntryCallback> {
        let keys: Vec<usize> = st
            .entries
            .iter()
            .filter(|(_, e)| e.removed)
            .map(|(k, _)| k)
            .collect();
        if keys.is_empty() {
            return Vec::new();
        }
        st.removal_gen += 1;
        keys.into_iter()
            .map(|k| st.entries.remove(k).callback)
            .collect()
    }

    pub fn reserve_task(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.tasks.try_reserve(1).map_err(|_| Error::NoMem)
    }

    pub fn submit_task(&self, task: TaskFn) {
        let mut st = self.state.lock().unwrap();
        st.tasks.push_back(task);
        drop(st);
        self.wake(b'u');
    }

    /// Block the calling thread until `target` is signalled, driving the
    /// wait-set if no other thread currently does.
    pub fn wait_on(&self, target: WaitObject) -> Result<()> {
        let me = thread::current().id();
        let mut st = self.state.lock().unwrap();
        loop {
            if st.driver == Some(me) {
                // Re-entered from a callback on the driving thread; run the
                // inner dispatch directly instead of deadlocking on the
                // loop token.
                drop(st);
                return self.run_until(target);
            }
            if poll_now(target)? {
                return Ok(());
            }
            if st.driver.is_none() {
                st.driver = Some(me);
                drop(st);
                let res = self.run_until(target);
                let mut st = self.state.lock().unwrap();
                st.driver = None;
                drop(st);
                self.cond.notify_all();
                return res;
            }
            st = self.cond.wait(st).unwrap();
        }
    }

    pub fn run_event_loop(&self) -> Result<()> {
        self.wait_on(self.stop.wait_object())
    }

    pub fn stop_event_loop(&self) {
        self.stop.set();
        self.wake(b's');
        self.notify_waiters();
    }

    pub fn restart_event_loop(&self) {
        self.stop.reset();
    }

    /// Wake parked waiters so they re-examine their wait condition.
    pub fn notify_waiters(&self) {
        // Taking the lock orders the notification after any waiter that has
        // checked its condition but not yet gone to sleep.
        drop(self.state.lock().unwrap());
        self.cond.notify_all();
    }

    fn wake(&self, cmd: u8) {
        // A full pipe already guarantees a wakeup; EAGAIN is fine.
        let _ = syscall!(libc::write(
            self.wake_tx.as_raw_fd(),
            &cmd as *const u8 as *const _,
            1,
        ));
    }

    fn drain_wakeups(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_rx.as_raw_fd(),
                    buf.as_mut_ptr() as *mut _,
                    buf.len(),
                )
            };
            if n < buf.len() as isize {
                break;
            }
        }
    }

    /// The dispatch loop. The caller must hold the loop token.
    fn run_until(&self, target: WaitObject) -> Result<()> {
        let mut local: Vec<libc::pollfd> = Vec::new();
        let mut keys: Vec<(usize, u64)> = Vec::new();
        let result = 'dispatch: loop {
            let mut st = self.state.lock().unwrap();

            // Deferred work first; tasks run to completion outside the lock
            // and may themselves submit work.
            while let Some(task) = st.tasks.pop_front() {
                drop(st);
                task();
                st = self.state.lock().unwrap();
            }

            // Shed entries flagged for removal before they can be selected.
            let shed = Self::extract_marked(&mut st);
            if !shed.is_empty() {
                drop(st);
                for cb in shed {
                    cb(Wake::Removed);
                }
                self.cond.notify_all();
                continue;
            }

            // A grower may have left a larger wait vector for us.
            if let Some(cache) = st.pollfds.take() {
                local = cache;
            }

            local.clear();
            keys.clear();
            local.push(target.pollfd());
            local.push(libc::pollfd {
                fd: self.wake_rx.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            // Entries on the target object would double-arm it; keep one
            // aside so a wakeup on the target can be attributed to it.
            let mut filtered: Option<(usize, u64)> = None;
            for (key, entry) in st.entries.iter() {
                if entry.obj == target {
                    if filtered.is_none() {
                        filtered = Some((key, entry.serial));
                    }
                    continue;
                }
                keys.push((key, entry.serial));
                local.push(entry.obj.pollfd());
            }
            let gen = st.removal_gen;
            drop(st);

            trace!(entries = keys.len(), "entering wait");
            loop {
                match syscall!(libc::poll(local.as_mut_ptr(), local.len() as _, -1)) {
                    Ok(_) => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => break 'dispatch Err(Error::from(e)),
                }
            }

            if local[1].revents != 0 {
                self.drain_wakeups();
                continue;
            }

            let target_fired = local[0].revents != 0;
            let selected = if target_fired {
                match filtered {
                    // No entry was folded into the target slot; the caller's
                    // own object fired and nothing is consumed.
                    None => break Ok(()),
                    Some(sel) => sel,
                }
            } else {
                match local[2..].iter().position(|p| p.revents != 0) {
                    Some(pos) => keys[pos],
                    None => continue,
                }
            };

            let mut st = self.state.lock().unwrap();
            if st.removal_gen != gen {
                // The arena changed under us; the selection may name a
                // different entry now. Start over.
                continue;
            }
            let live = st
                .entries
                .get(selected.0)
                .map_or(false, |e| e.serial == selected.1 && !e.removed);
            if !live {
                continue;
            }
            let entry = st.entries.remove(selected.0);
            drop(st);
            trace!(fd = entry.obj.fd, "dispatching wait-set entry");
            (entry.callback)(Wake::Ready);
            if target_fired {
                break Ok(());
            }
        };

        // Hand the wait vector back for the next driver.
        local.clear();
        let mut st = self.state.lock().unwrap();
        if st.pollfds.is_none() {
            st.pollfds = Some(local);
        }
        drop(st);
        result
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap();
        debug_assert!(st.entries.is_empty(), "wait-set entries outlive the context");
        debug_assert!(st.tasks.is_empty(), "queued tasks outlive the context");
        debug_assert_eq!(st.reserve, 0, "unbalanced wait-set reservation");
    }
}

fn poll_now(obj: WaitObject) -> Result<bool> {
    let mut fds = [obj.pollfd()];
    loop {
        match syscall!(libc::poll(fds.as_mut_ptr(), 1, 0)) {
            Ok(n) => return Ok(n > 0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(libc::fcntl(fd, libc::F_GETFL))?;
    syscall!(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    syscall!(libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
    Ok(())
}

fn make_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    syscall!(libc::pipe(fds.as_mut_ptr()))?;
    let rx = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let tx = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    set_nonblocking_cloexec(rx.as_raw_fd())?;
    set_nonblocking_cloexec(tx.as_raw_fd())?;
    Ok((rx, tx))
}

/// Manual-reset event primitive: an `eventfd` that stays readable from
/// `set` until `reset` drains the counter.
pub(crate) struct EventObject {
    fd: OwnedFd,
}

impl EventObject {
    pub fn new() -> Result<Self> {
        let fd = syscall!(libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn set(&self) {
        let v = 1u64;
        let _ = syscall!(libc::write(
            self.fd.as_raw_fd(),
            &v as *const u64 as *const _,
            std::mem::size_of::<u64>(),
        ));
    }

    pub fn reset(&self) {
        let mut v = 0u64;
        let _ = syscall!(libc::read(
            self.fd.as_raw_fd(),
            &mut v as *mut u64 as *mut _,
            std::mem::size_of::<u64>(),
        ));
    }

    pub fn is_set(&self) -> bool {
        poll_now(self.wait_object()).unwrap_or(false)
    }

    pub fn wait_object(&self) -> WaitObject {
        WaitObject::readable(self.fd.as_raw_fd())
    }
}

/// One-shot deadline primitive backed by a `timerfd`.
pub(crate) struct TimerObject {
    fd: OwnedFd,
}

impl TimerObject {
    pub fn new() -> Result<Self> {
        let fd = syscall!(libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
        ))?;
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn arm(&self, timeout: Duration) -> Result<()> {
        let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        spec.it_value.tv_sec = timeout.as_secs() as libc::time_t;
        spec.it_value.tv_nsec = timeout.subsec_nanos() as _;
        if spec.it_value.tv_sec == 0 && spec.it_value.tv_nsec == 0 {
            // An all-zero value would disarm instead of firing immediately.
            spec.it_value.tv_nsec = 1;
        }
        syscall!(libc::timerfd_settime(
            self.fd.as_raw_fd(),
            0,
            &spec,
            std::ptr::null_mut(),
        ))?;
        Ok(())
    }

    pub fn disarm(&self) {
        let spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        let _ = syscall!(libc::timerfd_settime(
            self.fd.as_raw_fd(),
            0,
            &spec,
            std::ptr::null_mut(),
        ));
    }

    pub fn wait_object(&self) -> WaitObject {
        WaitObject::readable(self.fd.as_raw_fd())
    }
}
