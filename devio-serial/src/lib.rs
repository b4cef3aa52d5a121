//! Serial/COM port backend.
//!
//! Ports are opened with explicit line settings and read asynchronously
//! through the shared dispatcher: a read transfer registers the port with
//! the wait set, the dispatching thread performs the read on readiness and
//! invokes the user callback, and an optional continuous mode re-arms the
//! read after each delivery. Writes are synchronous.
//!
//! Cancellation is cooperative. There is no OS-level cancel for plain fd
//! reads, so on Unix a cancellation handler is queued to the dispatching
//! thread which withdraws the wait-set entry; on Windows the overlapped
//! read is cancelled with `CancelIoEx`. Either way the `Cancelled` status
//! is delivered through the normal completion path.

#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{
    any::Any,
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::trace;

pub use devio_dispatch::{Context, Error, Result, TransferStatus};
use devio_dispatch::{Event, PreparedTask, Wake};

mod sys;

/// Parity setting of a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    /// No parity bit.
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
    /// Parity bit always set. Not supported on all platforms.
    Mark,
    /// Parity bit always clear. Not supported on all platforms.
    Space,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    /// One stop bit.
    One,
    /// One and a half stop bits. Not supported on all platforms.
    OnePointFive,
    /// Two stop bits.
    Two,
}

/// Line settings applied when opening a port.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Baud rate in bits per second.
    pub baud_rate: u32,
    /// Data bits per character, 5 to 8.
    pub data_bits: u8,
    /// Parity mode.
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
    /// Total read timeout used by platforms that time out reads in the
    /// driver. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout: None,
        }
    }
}

/// A serial port discovered by [`devices`].
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Short port name, e.g. `ttyUSB0` or `COM3`.
    pub name: String,
    /// Path to pass to [`SerialPort::open`].
    pub path: String,
}

/// Enumerate the serial ports present on the system.
pub fn devices() -> Result<Vec<DeviceInfo>> {
    sys::devices()
}

/// An open serial port.
///
/// Clones share the same OS handle; the port closes when the last clone
/// and the last transfer using it are dropped.
#[derive(Clone)]
pub struct SerialPort {
    pub(crate) inner: Arc<sys::PortInner>,
}

impl SerialPort {
    /// Open `path` and apply `settings`.
    pub fn open(path: &str, settings: &Settings) -> Result<Self> {
        let port = begin_open(path, settings)?.wait()?;
        trace!(path, "serial port opened");
        Ok(port)
    }

    /// Write `buf`, blocking until the port accepts it.
    ///
    /// Returns the number of bytes written; 0 signals a hangup.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        sys::write(&self.inner, buf)
    }

    /// Read into `buf`, blocking until at least one delivery.
    ///
    /// Convenience wrapper over a transfer submit + wait; returns the
    /// number of bytes read.
    pub fn read(&self, ctx: &Context, buf: &mut [u8]) -> Result<usize> {
        let transfer = Transfer::new(ctx)?;
        transfer.submit_read(self, buf.len(), |_, _| {})?;
        transfer.wait()?;
        match transfer.status() {
            TransferStatus::Completed => Ok(transfer.copy_data(buf)),
            _ => Err(Error::Io(std::io::Error::other("read failed"))),
        }
    }
}

/// An in-progress port open.
///
/// Opening goes through a worker thread on platforms where the open call
/// itself can block on driver timeouts; [`OpenFuture::wait`] joins it.
pub struct OpenFuture {
    pub(crate) state: sys::OpenState,
}

impl OpenFuture {
    /// Block until the open finishes and return the port.
    pub fn wait(self) -> Result<SerialPort> {
        self.state.wait()
    }

    /// Best-effort cancellation of a pending open.
    pub fn cancel(&self) {
        self.state.cancel()
    }
}

/// Start opening `path` without blocking the caller.
pub fn begin_open(path: &str, settings: &Settings) -> Result<OpenFuture> {
    Ok(OpenFuture {
        state: sys::begin_open(path, settings)?,
    })
}

pub(crate) struct TransferState {
    pub(crate) port: Option<SerialPort>,
    pub(crate) buf: Vec<u8>,
    pub(crate) actual: usize,
    pub(crate) status: TransferStatus,
    pub(crate) resubmit: bool,
    pub(crate) active: bool,
    pub(crate) cancel_task: Option<PreparedTask>,
    pub(crate) callback: Option<Box<dyn FnMut(&Transfer, TransferStatus) + Send>>,
    user_data: Option<Box<dyn Any + Send>>,
}

pub(crate) struct TransferInner {
    pub(crate) ctx: Context,
    pub(crate) completed: Event,
    pub(crate) state: Mutex<TransferState>,
    #[allow(dead_code)]
    pub(crate) io: sys::TransferIo,
}

/// One asynchronous serial read.
///
/// A transfer may be reused for consecutive submissions; at most one
/// submission is in flight at a time. The buffer lives inside the transfer
/// and stays valid for the whole submission cycle.
#[derive(Clone)]
pub struct Transfer {
    pub(crate) inner: Arc<TransferInner>,
}

impl Transfer {
    /// Allocate an idle transfer on `ctx`.
    pub fn new(ctx: &Context) -> Result<Self> {
        let completed = Event::new(ctx)?;
        // An idle transfer counts as complete, so `wait` does not hang.
        completed.set();
        Ok(Self {
            inner: Arc::new(TransferInner {
                ctx: ctx.clone(),
                completed,
                state: Mutex::new(TransferState {
                    port: None,
                    buf: Vec::new(),
                    actual: 0,
                    status: TransferStatus::Completed,
                    resubmit: false,
                    active: false,
                    cancel_task: None,
                    callback: None,
                    user_data: None,
                }),
                io: sys::TransferIo::new()?,
            }),
        })
    }

    /// Submit a single read of up to `len` bytes.
    ///
    /// The callback runs on the dispatching thread exactly once per
    /// submission cycle, before [`Transfer::wait`] returns.
    pub fn submit_read(
        &self,
        port: &SerialPort,
        len: usize,
        callback: impl FnMut(&Transfer, TransferStatus) + Send + 'static,
    ) -> Result<()> {
        self.submit(port, len, false, Box::new(callback))
    }

    /// Submit a read that re-arms itself after every delivery.
    ///
    /// The callback is invoked once per completed read; the completion
    /// event is only signalled once the transfer stops re-arming, i.e.
    /// after [`Transfer::cancel`] or a read failure.
    pub fn submit_read_continuous(
        &self,
        port: &SerialPort,
        len: usize,
        callback: impl FnMut(&Transfer, TransferStatus) + Send + 'static,
    ) -> Result<()> {
        self.submit(port, len, true, Box::new(callback))
    }

    fn submit(
        &self,
        port: &SerialPort,
        len: usize,
        resubmit: bool,
        callback: Box<dyn FnMut(&Transfer, TransferStatus) + Send>,
    ) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock().unwrap();
        if st.active {
            return Err(Error::Busy);
        }
        st.port = Some(port.clone());
        st.buf.clear();
        st.buf.resize(len, 0);
        st.actual = 0;
        st.status = TransferStatus::Completed;
        st.resubmit = resubmit;
        st.callback = Some(callback);
        st.cancel_task = Some(inner.ctx.prepare_task()?);
        inner.completed.reset();
        if let Err(e) = sys::start_read(&self.inner, &mut st) {
            st.cancel_task = None;
            st.port = None;
            drop(st);
            inner.completed.set();
            return Err(e);
        }
        st.active = true;
        trace!(len, resubmit, "serial read submitted");
        Ok(())
    }

    /// Request cancellation of the in-flight submission.
    ///
    /// Idempotent and non-blocking; the `Cancelled` status arrives through
    /// the callback unless a completion raced first. Clears the continuous
    /// flag, so a repeating read is eventually stopped even if a data
    /// delivery wins the race.
    pub fn cancel(&self) {
        let mut st = self.inner.state.lock().unwrap();
        st.resubmit = false;
        if !st.active {
            return;
        }
        sys::cancel(&self.inner, &mut st);
    }

    /// Block until the current submission cycle signals completion.
    pub fn wait(&self) -> Result<()> {
        self.inner.completed.wait()
    }

    /// Status recorded by the most recent delivery.
    pub fn status(&self) -> TransferStatus {
        self.inner.state.lock().unwrap().status
    }

    /// Bytes transferred by the most recent delivery. Only meaningful when
    /// [`Transfer::status`] is [`TransferStatus::Completed`].
    pub fn actual_length(&self) -> usize {
        self.inner.state.lock().unwrap().actual
    }

    /// Run `f` over the bytes of the most recent delivery.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let st = self.inner.state.lock().unwrap();
        f(&st.buf[..st.actual])
    }

    /// Copy the most recent delivery into `out`, returning the length.
    pub fn copy_data(&self, out: &mut [u8]) -> usize {
        self.with_data(|data| {
            let n = data.len().min(out.len());
            out[..n].copy_from_slice(&data[..n]);
            n
        })
    }

    /// Attach an opaque payload to the transfer.
    pub fn set_user_data(&self, data: Box<dyn Any + Send>) {
        self.inner.state.lock().unwrap().user_data = Some(data);
    }

    /// Detach the payload attached with [`Transfer::set_user_data`].
    pub fn take_user_data(&self) -> Option<Box<dyn Any + Send>> {
        self.inner.state.lock().unwrap().user_data.take()
    }
}

impl TransferInner {
    /// Record the delivery and run the user callback with no lock held.
    pub(crate) fn deliver(self: &Arc<Self>, status: TransferStatus, actual: usize) {
        let transfer = Transfer {
            inner: self.clone(),
        };
        let mut cb = {
            let mut st = self.state.lock().unwrap();
            st.status = status;
            st.actual = actual;
            st.callback.take()
        };
        if let Some(cb) = &mut cb {
            cb(&transfer, status);
        }
        let mut st = self.state.lock().unwrap();
        if st.callback.is_none() {
            st.callback = cb;
        }
    }

    /// Close out the submission cycle and signal waiters.
    pub(crate) fn finish(self: &Arc<Self>) {
        let mut st = self.state.lock().unwrap();
        st.active = false;
        st.cancel_task = None;
        st.port = None;
        drop(st);
        self.completed.set();
    }
}

pub(crate) fn reap(inner: &Arc<TransferInner>, wake: Wake) {
    if wake == Wake::Removed {
        // Withdrawn by the cancellation handler.
        inner.deliver(TransferStatus::Cancelled, 0);
        inner.finish();
        return;
    }
    let (status, actual) = sys::complete_read(inner);
    inner.deliver(status, actual);

    let mut st = inner.state.lock().unwrap();
    if st.resubmit && status == TransferStatus::Completed {
        // Re-arm inside the transfer mutex so cancellation cannot slip
        // between the delivery and the next registration.
        match sys::start_read(inner, &mut st) {
            Ok(()) => return,
            Err(_) => {
                drop(st);
                inner.deliver(TransferStatus::Error, 0);
                inner.finish();
                return;
            }
        }
    }
    drop(st);
    inner.finish();
}
