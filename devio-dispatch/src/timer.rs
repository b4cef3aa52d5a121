use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::debug;

use crate::{sys, Context, Error, Result, Wake};

/// How an armed timer was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// The deadline elapsed.
    Completed,
    /// [`Timer::cancel`] won the race.
    Cancelled,
}

struct TimerState {
    active: bool,
    callback: Option<Box<dyn FnOnce(TimerOutcome) + Send>>,
}

struct TimerShared {
    ctx: Context,
    deadline: sys::TimerObject,
    cancel: sys::EventObject,
    state: Mutex<TimerState>,
}

/// A one-shot timer dispatched through the context's wait set.
///
/// Arming registers two wait-set entries, one for the deadline primitive
/// and one for the cancel signal. Whichever fires first deregisters the
/// other, so exactly one of [`TimerOutcome::Completed`] and
/// [`TimerOutcome::Cancelled`] is delivered per arming. After delivery the
/// timer is idle and may be armed again.
pub struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Create an idle timer on `ctx`.
    pub fn new(ctx: &Context) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(TimerShared {
                ctx: ctx.clone(),
                deadline: sys::TimerObject::new()?,
                cancel: sys::EventObject::new()?,
                state: Mutex::new(TimerState {
                    active: false,
                    callback: None,
                }),
            }),
        })
    }

    /// Arm the timer. Fails with [`Error::Busy`] while a previous arming is
    /// still outstanding.
    pub fn set(
        &self,
        timeout: Duration,
        callback: impl FnOnce(TimerOutcome) + Send + 'static,
    ) -> Result<()> {
        let shared = &self.shared;
        let mut st = shared.state.lock().unwrap();
        if st.active {
            return Err(Error::Busy);
        }

        shared.cancel.reset();
        shared.deadline.arm(timeout)?;

        if let Err(e) = shared.ctx.prepare_add() {
            shared.deadline.disarm();
            return Err(e);
        }
        if let Err(e) = shared.ctx.prepare_add() {
            shared.ctx.cancel_add();
            shared.deadline.disarm();
            return Err(e);
        }

        let on_deadline = self.shared.clone();
        shared.ctx.driver.add(
            shared.deadline.wait_object(),
            Box::new(move |wake| TimerShared::fire(&on_deadline, wake, TimerOutcome::Completed)),
        );
        let on_cancel = self.shared.clone();
        shared.ctx.driver.add(
            shared.cancel.wait_object(),
            Box::new(move |wake| TimerShared::fire(&on_cancel, wake, TimerOutcome::Cancelled)),
        );

        st.active = true;
        st.callback = Some(Box::new(callback));
        debug!(?timeout, "timer armed");
        Ok(())
    }

    /// Request cancellation. A no-op if the timer is idle or the deadline
    /// already won; otherwise the callback is delivered
    /// [`TimerOutcome::Cancelled`] from the dispatching thread.
    pub fn cancel(&self) {
        self.shared.cancel.set();
    }

    /// Cancel synchronously: withdraw both wait-set entries and deliver
    /// [`TimerOutcome::Cancelled`] on the calling thread if the timer was
    /// still armed. Unlike [`Timer::cancel`] this needs no dispatching
    /// thread, so it is safe to call right before dropping the context.
    pub fn disarm(&self) {
        let shared = &self.shared;
        let won = {
            let mut st = shared.state.lock().unwrap();
            if !st.active {
                return;
            }
            st.active = false;
            st.callback.take()
        };
        // The entry callbacks observe `Wake::Removed` (or a cleared
        // `active`) and back off; the outcome is delivered here.
        shared.ctx.driver.remove(shared.deadline.wait_object());
        shared.ctx.driver.remove(shared.cancel.wait_object());
        shared.deadline.disarm();
        if let Some(callback) = won {
            callback(TimerOutcome::Cancelled);
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl TimerShared {
    fn fire(shared: &Arc<TimerShared>, wake: Wake, outcome: TimerOutcome) {
        if wake == Wake::Removed {
            // The other entry won and deregistered us.
            return;
        }
        let mut st = shared.state.lock().unwrap();
        if !st.active {
            return;
        }
        st.active = false;
        let callback = st.callback.take();
        // Deregister the losing entry before anything can re-arm; its
        // callback observes `Wake::Removed` and backs off.
        let loser = match outcome {
            TimerOutcome::Completed => shared.cancel.wait_object(),
            TimerOutcome::Cancelled => shared.deadline.wait_object(),
        };
        shared.ctx.driver.remove(loser);
        shared.deadline.disarm();
        drop(st);

        debug!(?outcome, "timer fired");
        if let Some(callback) = callback {
            callback(outcome);
        }
    }
}
