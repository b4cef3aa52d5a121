use crate::{Context, Result};

/// A pre-reserved slot in the context's task queue.
///
/// Reserving up front lets paths that must not fail at delivery time (for
/// example a cancellation handler) allocate while errors can still be
/// reported. Dropping an unsubmitted task releases the reservation.
pub struct PreparedTask {
    ctx: Context,
}

impl PreparedTask {
    pub(crate) fn new(ctx: &Context) -> Result<Self> {
        ctx.driver.reserve_task()?;
        Ok(Self { ctx: ctx.clone() })
    }

    /// Enqueue `f` on the context's task queue.
    ///
    /// The callback runs on whichever thread drives the dispatcher, in
    /// strict submission order relative to other tasks.
    pub fn submit(self, f: impl FnOnce() + Send + 'static) {
        self.ctx.driver.submit_task(Box::new(f));
    }
}
