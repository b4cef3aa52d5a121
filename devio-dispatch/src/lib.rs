//! Completion dispatch for device I/O backends.
//!
//! The heart of the crate is a wait-set dispatcher: a bounded set of
//! kernel wait objects (fds on Unix, handles on Windows) with a one-shot
//! callback per object, driven by at most one thread at a time. Threads
//! that need a specific wake condition either take the loop token and
//! drive the set themselves, or park until the current driver hands the
//! token off. Cross-thread work is funnelled through a FIFO task queue
//! that runs on the driving thread before each wait cycle.
//!
//! [`Event`] and [`Timer`] are built on the same primitives, so a single
//! thread can wake uniformly on events, deadlines and I/O completions.
//!
//! Some types differ by compilation target.

#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{
    sync::{Arc, Mutex},
    thread,
};

use tracing::{debug, error};

mod error;
pub use error::{Error, Result};

mod event;
pub use event::Event;

mod task;
pub use task::PreparedTask;

mod timer;
pub use timer::{Timer, TimerOutcome};

mod sys;
pub use sys::*;

/// Helper macro to execute a system call that returns `-1` on failure.
#[cfg(unix)]
#[macro_export]
#[doc(hidden)]
macro_rules! syscall {
    ($e:expr) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { $e };
        if res == -1 {
            Err(::std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// Helper macro to execute a Win32 call and map its failure convention.
#[cfg(windows)]
#[macro_export]
#[doc(hidden)]
macro_rules! syscall {
    (BOOL, $e:expr) => {
        $crate::syscall!($e, == 0)
    };
    (HANDLE, $e:expr) => {
        $crate::syscall!($e, == 0)
    };
    (FILE, $e:expr) => {
        $crate::syscall!($e, == ::windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE)
    };
    ($e:expr, $op:tt $rhs:expr) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { $e };
        if res $op $rhs {
            Err(::std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// Why a wait-set callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The registered wait object became ready.
    Ready,
    /// The entry was withdrawn before the object became ready.
    Removed,
}

/// Outcome of one asynchronous transfer submission cycle.
///
/// Carried to the transfer callback and queried afterwards; submission
/// errors are reported through [`Error`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// The transfer finished; `actual_length` is meaningful.
    Completed,
    /// The transfer was cancelled before it finished.
    Cancelled,
    /// Unspecified I/O failure.
    Error,
    /// The endpoint stalled.
    Stall,
    /// The device is gone.
    NoDevice,
    /// A timer-driven cancellation fired first.
    Timeout,
    /// The device returned more data than the buffer could hold.
    Overflow,
}

struct Worker {
    driver: Arc<sys::Driver>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.driver.stop_event_loop();
        if let Some(handle) = self.thread.get_mut().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Process-scoped dispatcher root.
///
/// Cheap to clone; the underlying dispatcher is destroyed when the last
/// clone is dropped, at which point the wait set and the task queue must
/// both be empty. All registered callbacks and parked waiters share one
/// context.
#[derive(Clone)]
pub struct Context {
    pub(crate) driver: Arc<sys::Driver>,
    worker: Option<Arc<Worker>>,
}

impl Context {
    /// Create a context. No thread drives the dispatcher until someone
    /// waits on it or calls [`Context::run_event_loop`].
    pub fn new() -> Result<Self> {
        Ok(Self {
            driver: Arc::new(sys::Driver::new()?),
            worker: None,
        })
    }

    /// Create a context with a dedicated thread driving the dispatcher.
    ///
    /// The worker exits when the last context clone is dropped (or when
    /// [`Context::stop_event_loop`] is called).
    pub fn with_worker() -> Result<Self> {
        let ctx = Self::new()?;
        let driver = ctx.driver.clone();
        let thread = thread::Builder::new()
            .name("devio-dispatch".into())
            .spawn(move || {
                if let Err(e) = driver.run_event_loop() {
                    error!("event loop terminated: {e}");
                }
            })
            .map_err(Error::Io)?;
        debug!("dispatcher worker started");
        Ok(Self {
            worker: Some(Arc::new(Worker {
                driver: ctx.driver.clone(),
                thread: Mutex::new(Some(thread)),
            })),
            ..ctx
        })
    }

    /// Drive the dispatcher on the calling thread until
    /// [`Context::stop_event_loop`] is called.
    ///
    /// If another thread already drives the loop, the call parks until the
    /// stop signal instead.
    pub fn run_event_loop(&self) -> Result<()> {
        self.driver.run_event_loop()
    }

    /// Signal every [`Context::run_event_loop`] driver to return.
    ///
    /// Threads waiting for a specific condition (a transfer, an event, a
    /// timer) are not affected.
    pub fn stop_event_loop(&self) {
        self.driver.stop_event_loop()
    }

    /// Rearm the loop after [`Context::stop_event_loop`].
    pub fn restart_event_loop(&self) {
        self.driver.restart_event_loop()
    }

    /// Reserve a task-queue slot for later submission.
    pub fn prepare_task(&self) -> Result<PreparedTask> {
        PreparedTask::new(self)
    }

    /// Enqueue `f` to run on the dispatching thread.
    ///
    /// Tasks run in FIFO order before the next wait cycle. They must not
    /// assume any particular thread and must not block on this context
    /// except through the re-entrant wait path.
    pub fn submit_task(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        self.driver.reserve_task()?;
        self.driver.submit_task(Box::new(f));
        Ok(())
    }

    /// Reserve capacity for one wait-set entry.
    ///
    /// Backends reserve before issuing the OS I/O primitive so that
    /// committing the entry afterwards cannot fail; an unused reservation
    /// is returned with [`Context::cancel_add`].
    pub fn prepare_add(&self) -> Result<()> {
        self.driver.prepare_add()
    }

    /// Release a reservation made by [`Context::prepare_add`].
    pub fn cancel_add(&self) {
        self.driver.cancel_add()
    }

    /// Commit a reserved wait-set entry.
    ///
    /// The callback is invoked exactly once, on the dispatching thread:
    /// with [`Wake::Ready`] when the object signals, or [`Wake::Removed`]
    /// if the entry is withdrawn first. The wait object must stay valid
    /// until then.
    pub fn add(&self, obj: sys::WaitObject, callback: impl FnOnce(Wake) + Send + 'static) {
        self.driver.add(obj, Box::new(callback))
    }

    /// Withdraw every entry registered on `obj`, delivering
    /// [`Wake::Removed`] to each.
    ///
    /// Blocks until the current driver no longer references the entries;
    /// afterwards the underlying object may be destroyed.
    pub fn remove(&self, obj: sys::WaitObject) {
        self.driver.remove(obj)
    }
}
