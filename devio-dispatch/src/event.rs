use std::sync::Arc;

use crate::{sys, Context, Result};

/// A manual-reset event with waiters.
///
/// The event is backed by a kernel waitable, so a thread driving the
/// dispatcher wakes on it the same way it wakes on an I/O completion.
/// `set` and `reset` are idempotent and may be called from any thread,
/// including from inside a dispatcher callback.
#[derive(Clone)]
pub struct Event {
    ctx: Context,
    obj: Arc<sys::EventObject>,
}

impl Event {
    /// Create an event in the reset state.
    pub fn new(ctx: &Context) -> Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            obj: Arc::new(sys::EventObject::new()?),
        })
    }

    /// Signal the event, waking every waiter.
    pub fn set(&self) {
        self.obj.set();
        self.ctx.driver.notify_waiters();
    }

    /// Return the event to the unsignalled state.
    pub fn reset(&self) {
        self.obj.reset();
    }

    /// Whether the event is currently signalled.
    pub fn is_set(&self) -> bool {
        self.obj.is_set()
    }

    /// Block until the event is signalled.
    ///
    /// Either drives the dispatcher with this event as the wait target, or
    /// parks until the current driver signals it. Safe to call from a
    /// dispatcher callback: the driving thread is recognised and enters the
    /// inner dispatch loop directly.
    pub fn wait(&self) -> Result<()> {
        self.ctx.driver.wait_on(self.obj.wait_object())
    }
}
