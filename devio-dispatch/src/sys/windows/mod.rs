//! Handle-based wait-set driver.
//!
//! The wait vector is an array of kernel handles passed to
//! `WaitForMultipleObjects`: the caller's target first, the set-updated
//! event second, then one slot per live entry. Entries waiting on the
//! target handle itself are folded into the first slot so the object is
//! never armed twice.

use std::{
    collections::VecDeque,
    io,
    sync::{Condvar, Mutex},
    thread::{self, ThreadId},
    time::Duration,
};

use slab::Slab;
use tracing::trace;
use windows_sys::Win32::{
    Foundation::{CloseHandle, HANDLE, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT},
    System::Threading::{
        CancelWaitableTimer, CreateEventW, CreateWaitableTimerW, ResetEvent, SetEvent,
        SetWaitableTimer, WaitForMultipleObjects, WaitForSingleObject, INFINITE,
    },
};

use crate::{syscall, Error, Result, Wake};

/// The raw kernel handle type used by the wait set.
pub type RawHandle = HANDLE;

/// One waitable kernel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitObject {
    handle: RawHandle,
}

impl WaitObject {
    /// Wait for `handle` to become signalled.
    pub fn handle(handle: RawHandle) -> Self {
        Self { handle }
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
    handles: Option<Vec<RawHandle>>,
}

pub(crate) struct Driver {
    state: Mutex<State>,
    cond: Condvar,
    set_updated: EventObject,
    stop: EventObject,
}

impl Driver {
    pub fn new() -> Result<Self> {
        let set_updated = EventObject::new()?;
        let stop = EventObject::new()?;
        Ok(Self {
            state: Mutex::new(State {
                entries: Slab::new(),
                reserve: 0,
                next_serial: 0,
                removal_gen: 0,
                tasks: VecDeque::new(),
                driver: None,
                handles: Some(Vec::new()),
            }),
            cond: Condvar::new(),
            set_updated,
            stop,
        })
    }

    pub fn prepare_add(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let needed = st.entries.len() + st.reserve + 1;
        if st.entries.capacity() < needed {
            let additional = needed - st.entries.len();
            st.entries.reserve(additional);
        }
        let cap_needed = needed + 2;
        match &mut st.handles {
            Some(cache) => {
                if cache.capacity() < cap_needed {
                    cache
                        .try_reserve(cap_needed.saturating_sub(cache.len()))
                        .map_err(|_| Error::NoMem)?;
                }
            }
            None => {
                let mut fresh = Vec::new();
                fresh.try_reserve(cap_needed).map_err(|_| Error::NoMem)?;
                st.handles = Some(fresh);
            }
        }
        st.reserve += 1;
        Ok(())
    }

    pub fn cancel_add(&self) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.reserve > 0);
        st.reserve = st.reserve.saturating_sub(1);
    }

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
        trace!(handle = obj.handle, "wait-set entry added");
        self.set_updated.set();
    }

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
                self.set_updated.set();
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
        self.set_updated.set();
    }

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
        self.set_updated.set();
        self.notify_waiters();
    }

    pub fn restart_event_loop(&self) {
        self.stop.reset();
    }

    pub fn notify_waiters(&self) {
        drop(self.state.lock().unwrap());
        self.cond.notify_all();
    }

    fn run_until(&self, target: WaitObject) -> Result<()> {
        let mut local: Vec<RawHandle> = Vec::new();
        let mut keys: Vec<(usize, u64)> = Vec::new();
        let result = 'dispatch: loop {
            let mut st = self.state.lock().unwrap();

            while let Some(task) = st.tasks.pop_front() {
                drop(st);
                task();
                st = self.state.lock().unwrap();
            }

            let shed = Self::extract_marked(&mut st);
            if !shed.is_empty() {
                drop(st);
                for cb in shed {
                    cb(Wake::Removed);
                }
                self.cond.notify_all();
                continue;
            }

            if let Some(cache) = st.handles.take() {
                local = cache;
            }

            local.clear();
            keys.clear();
            local.push(target.handle);
            local.push(self.set_updated.raw());
            let mut filtered: Option<(usize, u64)> = None;
            for (key, entry) in st.entries.iter() {
                if entry.obj == target {
                    if filtered.is_none() {
                        filtered = Some((key, entry.serial));
                    }
                    continue;
                }
                keys.push((key, entry.serial));
                local.push(entry.obj.handle);
            }
            let gen = st.removal_gen;
            self.set_updated.reset();
            drop(st);

            trace!(entries = keys.len(), "entering wait");
            let res =
                unsafe { WaitForMultipleObjects(local.len() as u32, local.as_ptr(), 0, INFINITE) };
            if res == WAIT_FAILED || res >= WAIT_OBJECT_0 + local.len() as u32 {
                break 'dispatch Err(Error::from(io::Error::last_os_error()));
            }
            let index = (res - WAIT_OBJECT_0) as usize;

            if index == 1 {
                continue;
            }

            let target_fired = index == 0;
            let selected = if target_fired {
                match filtered {
                    // No entry was folded into the target slot; the caller's
                    // own object fired and nothing is consumed.
                    None => break Ok(()),
                    Some(sel) => sel,
                }
            } else {
                keys[index - 2]
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
            trace!(handle = entry.obj.handle, "dispatching wait-set entry");
            (entry.callback)(Wake::Ready);
            if target_fired {
                break Ok(());
            }
        };

        local.clear();
        let mut st = self.state.lock().unwrap();
        if st.handles.is_none() {
            st.handles = Some(local);
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
    match unsafe { WaitForSingleObject(obj.handle, 0) } {
        WAIT_OBJECT_0 => Ok(true),
        WAIT_TIMEOUT => Ok(false),
        _ => Err(Error::from(io::Error::last_os_error())),
    }
}

/// Owned kernel handle, closed on drop.
struct OwnedHandle(RawHandle);

unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

/// Manual-reset kernel event object.
pub(crate) struct EventObject {
    handle: OwnedHandle,
}

impl EventObject {
    pub fn new() -> Result<Self> {
        let handle = syscall!(
            HANDLE,
            CreateEventW(std::ptr::null(), 1, 0, std::ptr::null())
        )?;
        Ok(Self {
            handle: OwnedHandle(handle),
        })
    }

    fn raw(&self) -> RawHandle {
        self.handle.0
    }

    pub fn set(&self) {
        unsafe { SetEvent(self.raw()) };
    }

    pub fn reset(&self) {
        unsafe { ResetEvent(self.raw()) };
    }

    pub fn is_set(&self) -> bool {
        poll_now(self.wait_object()).unwrap_or(false)
    }

    pub fn wait_object(&self) -> WaitObject {
        WaitObject::handle(self.raw())
    }
}

/// One-shot deadline primitive backed by a waitable timer.
pub(crate) struct TimerObject {
    handle: OwnedHandle,
}

impl TimerObject {
    pub fn new() -> Result<Self> {
        let handle = syscall!(
            HANDLE,
            CreateWaitableTimerW(std::ptr::null(), 1, std::ptr::null())
        )?;
        Ok(Self {
            handle: OwnedHandle(handle),
        })
    }

    pub fn arm(&self, timeout: Duration) -> Result<()> {
        // Relative due time in 100 ns ticks.
        let due = -((timeout.as_nanos() / 100) as i64);
        syscall!(
            BOOL,
            SetWaitableTimer(self.handle.0, &due, 0, None, std::ptr::null(), 0)
        )?;
        Ok(())
    }

    pub fn disarm(&self) {
        unsafe { CancelWaitableTimer(self.handle.0) };
    }

    pub fn wait_object(&self) -> WaitObject {
        WaitObject::handle(self.handle.0)
    }
}
