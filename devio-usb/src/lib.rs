//! USB device backend.
//!
//! Devices are enumerated into a registry keyed by their stable bus
//! identity, so repeated enumeration hands back the same record while it
//! is alive. Transfers are asynchronous: submission issues the kernel
//! primitive (a usbfs URB or an overlapped ioctl against the libusb0
//! driver) and registers a wait-set entry; the dispatching thread reaps
//! the completion, maps it to a [`TransferStatus`], and runs the user
//! callback. Synchronous helpers (`bulk_transfer`, `control_transfer`,
//! descriptor queries) are built on top of submit + wait, with timeouts
//! implemented by a [`Timer`] that cancels the transfer.

#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use tracing::trace;

pub use devio_dispatch::{Context, Error, Result, TransferStatus};
use devio_dispatch::{Event, Timer, TimerOutcome};

pub mod descriptor;
pub use descriptor::{ConfigDescriptor, DeviceDescriptor};

mod setup;
pub use setup::{SetupPacket, SETUP_PACKET_LENGTH};

mod sys;

/// Direction bit of an endpoint address.
pub const ENDPOINT_IN: u8 = 0x80;

const GET_DESCRIPTOR: u8 = 0x06;
const GET_CONFIGURATION: u8 = 0x08;
const SET_CONFIGURATION: u8 = 0x09;

/// The kind of a USB transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Control transfer on endpoint zero; the buffer starts with the
    /// 8-byte setup packet.
    Control,
    /// Bulk transfer.
    Bulk,
    /// Interrupt transfer.
    Interrupt,
    /// Isochronous transfer. Not supported by the current backends.
    Isochronous,
}

pub(crate) type DeviceId = (u32, u32);

pub(crate) struct CtxInner {
    ctx: Context,
    registry: Mutex<HashMap<DeviceId, Weak<DeviceInner>>>,
}

/// Per-backend USB context, sharing one dispatcher [`Context`].
#[derive(Clone)]
pub struct UsbContext {
    inner: Arc<CtxInner>,
}

impl UsbContext {
    /// Create a USB context on top of `ctx`.
    pub fn new(ctx: &Context) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(CtxInner {
                ctx: ctx.clone(),
                registry: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// The dispatcher context this backend runs on.
    pub fn dispatch(&self) -> &Context {
        &self.inner.ctx
    }

    /// Snapshot the devices currently present.
    ///
    /// Devices already known from an earlier enumeration are handed back
    /// as the same record, matched by their stable bus identity.
    pub fn devices(&self) -> Result<Vec<Device>> {
        sys::enumerate(&self.inner)
    }

    /// Open the first device matching `id_vendor`/`id_product`.
    pub fn open_device_with_vid_pid(&self, id_vendor: u16, id_product: u16) -> Result<DeviceHandle> {
        for dev in self.devices()? {
            let desc = dev.descriptor();
            if desc.id_vendor == id_vendor && desc.id_product == id_product {
                return dev.open();
            }
        }
        Err(Error::NotFound)
    }
}

pub(crate) struct DeviceInner {
    ctx: Context,
    registry: Weak<CtxInner>,
    id: DeviceId,
    desc: DeviceDescriptor,
    pub(crate) io: sys::DeviceIo,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        if let Some(owner) = self.registry.upgrade() {
            let mut reg = owner.registry.lock().unwrap();
            let dead = reg
                .get(&self.id)
                .map_or(false, |weak| weak.strong_count() == 0);
            if dead {
                reg.remove(&self.id);
            }
        }
    }
}

/// An enumerated USB device.
///
/// Clones share the same record. The record (and its enumeration handle)
/// is released when the last clone drops.
#[derive(Clone)]
pub struct Device {
    pub(crate) inner: Arc<DeviceInner>,
}

impl Device {
    pub(crate) fn create(
        owner: &Arc<CtxInner>,
        id: DeviceId,
        desc: DeviceDescriptor,
        io: sys::DeviceIo,
    ) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                ctx: owner.ctx.clone(),
                registry: Arc::downgrade(owner),
                id,
                desc,
                io,
            }),
        }
    }

    /// Look up `id` in the registry, reusing a live record.
    pub(crate) fn lookup(owner: &Arc<CtxInner>, id: DeviceId) -> Option<Self> {
        let reg = owner.registry.lock().unwrap();
        reg.get(&id)
            .and_then(|weak| weak.upgrade())
            .map(|inner| Self { inner })
    }

    pub(crate) fn register(owner: &Arc<CtxInner>, dev: &Self) {
        let mut reg = owner.registry.lock().unwrap();
        reg.insert(dev.inner.id, Arc::downgrade(&dev.inner));
    }

    /// The device descriptor captured at enumeration time.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.inner.desc
    }

    /// Configuration descriptor from the enumeration-time cache, without
    /// touching the device.
    pub fn config_descriptor_cached(&self, index: u8) -> Result<ConfigDescriptor> {
        let mut header = [0u8; 6];
        sys::get_descriptor_cached(&self.inner, descriptor::DT_CONFIG, index, 0, &mut header)?;
        let total = u16::from_le_bytes([header[2], header[3]]) as usize;
        let mut raw = vec![0u8; total];
        let n = sys::get_descriptor_cached(&self.inner, descriptor::DT_CONFIG, index, 0, &mut raw)?;
        ConfigDescriptor::parse(&raw[..n])
    }

    /// Open the device for I/O.
    pub fn open(&self) -> Result<DeviceHandle> {
        let io = sys::open(&self.inner)?;
        trace!(id = ?self.inner.id, "device opened");
        Ok(DeviceHandle {
            inner: Arc::new(HandleInner {
                dev: self.clone(),
                io,
            }),
        })
    }
}

pub(crate) struct HandleInner {
    pub(crate) dev: Device,
    pub(crate) io: sys::HandleIo,
}

/// An open USB device.
///
/// Clones share the same OS handle; it closes when the last clone and the
/// last in-flight transfer drop.
#[derive(Clone)]
pub struct DeviceHandle {
    pub(crate) inner: Arc<HandleInner>,
}

impl DeviceHandle {
    /// The device this handle was opened from.
    pub fn device(&self) -> &Device {
        &self.inner.dev
    }

    fn ctx(&self) -> &Context {
        &self.inner.dev.inner.ctx
    }

    /// Claim an interface for exclusive use.
    pub fn claim_interface(&self, interface_number: u8) -> Result<()> {
        sys::claim_interface(&self.inner, interface_number)
    }

    /// Release a claimed interface.
    pub fn release_interface(&self, interface_number: u8) -> Result<()> {
        sys::release_interface(&self.inner, interface_number)
    }

    /// The active configuration value.
    pub fn get_configuration(&self) -> Result<u8> {
        match sys::get_configuration(&self.inner) {
            Err(Error::NotSupported) => {
                let mut data = [0u8; 1];
                let n = self.control_transfer(
                    ENDPOINT_IN,
                    GET_CONFIGURATION,
                    0,
                    0,
                    &mut data,
                    None,
                )?;
                if n != 1 {
                    return Err(Error::Io(std::io::Error::other("short configuration read")));
                }
                Ok(data[0])
            }
            other => other,
        }
    }

    /// Select a configuration by value.
    pub fn set_configuration(&self, value: u8) -> Result<()> {
        match sys::set_configuration(&self.inner, value) {
            Err(Error::NotSupported) => {
                self.control_transfer(0, SET_CONFIGURATION, value as u16, 0, &mut [], None)?;
                Ok(())
            }
            other => other,
        }
    }

    /// Fetch a descriptor, preferring the backend's dedicated path over a
    /// standard `GET_DESCRIPTOR` control request.
    pub fn get_descriptor(
        &self,
        desc_type: u8,
        desc_index: u8,
        data: &mut [u8],
    ) -> Result<usize> {
        match sys::get_descriptor(&self.inner, desc_type, desc_index, 0, data) {
            Err(Error::NotSupported) => self.control_transfer(
                ENDPOINT_IN,
                GET_DESCRIPTOR,
                (desc_type as u16) << 8 | desc_index as u16,
                0,
                data,
                None,
            ),
            other => other,
        }
    }

    /// Fetch a string descriptor in the given language.
    pub fn get_string_descriptor(
        &self,
        desc_index: u8,
        langid: u16,
        data: &mut [u8],
    ) -> Result<usize> {
        match sys::get_descriptor(&self.inner, descriptor::DT_STRING, desc_index, langid, data) {
            Err(Error::NotSupported) => self.control_transfer(
                ENDPOINT_IN,
                GET_DESCRIPTOR,
                0x0300 | desc_index as u16,
                langid,
                data,
                None,
            ),
            other => other,
        }
    }

    /// Fetch a string descriptor and decode it to UTF-8.
    pub fn get_string_descriptor_utf8(&self, desc_index: u8, langid: u16) -> Result<String> {
        let mut raw = [0u8; 256];
        let n = self.get_string_descriptor(desc_index, langid, &mut raw)?;
        descriptor::string_descriptor_to_utf8(&raw[..n])
    }

    /// The device descriptor.
    pub fn device_descriptor(&self) -> DeviceDescriptor {
        self.inner.dev.descriptor().clone()
    }

    /// Fetch and parse the configuration descriptor at `index`.
    pub fn config_descriptor(&self, index: u8) -> Result<ConfigDescriptor> {
        let mut header = [0u8; 6];
        self.get_descriptor(descriptor::DT_CONFIG, index, &mut header)?;
        let total = u16::from_le_bytes([header[2], header[3]]) as usize;
        let mut raw = vec![0u8; total];
        let n = self.get_descriptor(descriptor::DT_CONFIG, index, &mut raw)?;
        ConfigDescriptor::parse(&raw[..n])
    }

    /// The configuration descriptor selected by `value`.
    pub fn config_descriptor_by_value(&self, value: u8) -> Result<ConfigDescriptor> {
        let desc = self.device_descriptor();
        for index in 0..desc.num_configurations {
            let config = self.config_descriptor(index)?;
            if config.configuration_value == value {
                return Ok(config);
            }
        }
        Err(Error::NotFound)
    }

    /// The configuration descriptor of the active configuration.
    pub fn active_config_descriptor(&self) -> Result<ConfigDescriptor> {
        let value = self.get_configuration()?;
        self.config_descriptor_by_value(value)
    }

    /// Synchronous bulk transfer; the endpoint's direction bit selects
    /// read or write. Returns the number of data bytes moved.
    pub fn bulk_transfer(
        &self,
        endpoint: u8,
        data: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let transfer = Transfer::new_on(self.ctx())?;
        transfer.fill_bulk(self, endpoint, data.to_vec())?;
        run_sync(&transfer, timeout)?;
        status_to_result(&transfer)?;
        if endpoint & ENDPOINT_IN != 0 {
            Ok(transfer.copy_data(data))
        } else {
            Ok(transfer.actual_length())
        }
    }

    /// Synchronous control transfer. `data` carries the payload in the
    /// direction selected by `request_type`; the setup packet is built
    /// here. Returns the number of data bytes moved (setup excluded).
    pub fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let setup = SetupPacket {
            request_type,
            request,
            value,
            index,
            length: data.len() as u16,
        };
        let mut buffer = vec![0u8; data.len() + setup::SETUP_PACKET_LENGTH];
        setup.write(&mut buffer);
        if request_type & ENDPOINT_IN == 0 {
            buffer[setup::SETUP_PACKET_LENGTH..].copy_from_slice(data);
        }

        let transfer = Transfer::new_on(self.ctx())?;
        transfer.fill_control(self, buffer)?;
        run_sync(&transfer, timeout)?;
        status_to_result(&transfer)?;

        let n = transfer
            .actual_length()
            .saturating_sub(setup::SETUP_PACKET_LENGTH);
        if request_type & ENDPOINT_IN != 0 {
            transfer.with_data(|raw| {
                let data_bytes = &raw[setup::SETUP_PACKET_LENGTH..];
                data[..data_bytes.len()].copy_from_slice(data_bytes);
            });
        }
        Ok(n)
    }
}

/// Drive a filled transfer to completion, optionally bounding it with a
/// timer that cancels the transfer when it fires.
fn run_sync(transfer: &Transfer, timeout: Option<Duration>) -> Result<()> {
    match timeout {
        None => transfer.perform(),
        Some(timeout) => {
            let timer = Timer::new(&transfer.inner.ctx)?;
            let pending = transfer.clone();
            timer.set(timeout, move |outcome| {
                if outcome == TimerOutcome::Completed {
                    let _ = pending.cancel();
                }
            })?;
            transfer.submit()?;
            let res = transfer.wait();
            timer.disarm();
            res?;
            // A cancellation here can only have come from the timer.
            if transfer.status() == TransferStatus::Cancelled {
                let mut st = transfer.inner.state.lock().unwrap();
                st.status = TransferStatus::Timeout;
            }
            Ok(())
        }
    }
}

fn status_to_result(transfer: &Transfer) -> Result<()> {
    match transfer.status() {
        TransferStatus::Completed => Ok(()),
        TransferStatus::Timeout => Err(Error::Timeout),
        TransferStatus::Stall => Err(Error::Pipe),
        TransferStatus::NoDevice => Err(Error::NoDevice),
        TransferStatus::Overflow => Err(Error::Overflow),
        TransferStatus::Cancelled | TransferStatus::Error => {
            Err(Error::Io(std::io::Error::other("transfer failed")))
        }
    }
}

pub(crate) struct TransferState {
    pub(crate) handle: Option<DeviceHandle>,
    pub(crate) kind: TransferKind,
    pub(crate) endpoint: u8,
    pub(crate) buf: Vec<u8>,
    pub(crate) actual: usize,
    pub(crate) status: TransferStatus,
    pub(crate) submitted: bool,
    pub(crate) callback: Option<Box<dyn FnMut(&Transfer, TransferStatus) + Send>>,
    user_data: Option<Box<dyn Any + Send>>,
}

pub(crate) struct TransferInner {
    pub(crate) ctx: Context,
    pub(crate) completed: Event,
    pub(crate) state: Mutex<TransferState>,
    pub(crate) io: sys::TransferIo,
}

/// One asynchronous USB transfer.
///
/// Fill it, submit it, then either wait for the completion event or let
/// the callback observe the result. The transfer owns its buffer for the
/// whole submission cycle, so neither it nor the buffer can be freed from
/// under an in-flight operation.
#[derive(Clone)]
pub struct Transfer {
    pub(crate) inner: Arc<TransferInner>,
}

impl Transfer {
    /// Allocate an idle transfer on the backend's context.
    pub fn new(ctx: &UsbContext) -> Result<Self> {
        Self::new_on(&ctx.inner.ctx)
    }

    fn new_on(ctx: &Context) -> Result<Self> {
        let completed = Event::new(ctx)?;
        // An idle transfer counts as complete, so `wait` does not hang.
        completed.set();
        Ok(Self {
            inner: Arc::new(TransferInner {
                ctx: ctx.clone(),
                completed,
                state: Mutex::new(TransferState {
                    handle: None,
                    kind: TransferKind::Bulk,
                    endpoint: 0,
                    buf: Vec::new(),
                    actual: 0,
                    status: TransferStatus::Completed,
                    submitted: false,
                    callback: None,
                    user_data: None,
                }),
                io: sys::TransferIo::new()?,
            }),
        })
    }

    fn fill(
        &self,
        handle: &DeviceHandle,
        kind: TransferKind,
        endpoint: u8,
        buffer: Vec<u8>,
    ) -> Result<()> {
        let mut st = self.inner.state.lock().unwrap();
        if st.submitted {
            return Err(Error::Busy);
        }
        st.handle = Some(handle.clone());
        st.kind = kind;
        st.endpoint = endpoint;
        st.buf = buffer;
        st.actual = 0;
        st.status = TransferStatus::Completed;
        Ok(())
    }

    /// Prepare a bulk transfer. For IN endpoints the buffer length is the
    /// amount requested; for OUT endpoints the buffer is the payload.
    pub fn fill_bulk(&self, handle: &DeviceHandle, endpoint: u8, buffer: Vec<u8>) -> Result<()> {
        self.fill(handle, TransferKind::Bulk, endpoint, buffer)
    }

    /// Prepare an interrupt transfer.
    pub fn fill_interrupt(
        &self,
        handle: &DeviceHandle,
        endpoint: u8,
        buffer: Vec<u8>,
    ) -> Result<()> {
        self.fill(handle, TransferKind::Interrupt, endpoint, buffer)
    }

    /// Prepare a control transfer. The buffer must start with the 8-byte
    /// setup packet, followed by `wLength` bytes of payload space.
    pub fn fill_control(&self, handle: &DeviceHandle, buffer: Vec<u8>) -> Result<()> {
        self.fill(handle, TransferKind::Control, 0, buffer)
    }

    /// Set the completion callback, invoked on the dispatching thread once
    /// per submission cycle. Resubmitting from inside the callback is
    /// allowed and postpones the completion event to the next cycle.
    pub fn set_callback(&self, callback: impl FnMut(&Transfer, TransferStatus) + Send + 'static) {
        self.inner.state.lock().unwrap().callback = Some(Box::new(callback));
    }

    /// Submit the transfer.
    ///
    /// Validates the request, reserves dispatcher capacity, issues the
    /// kernel primitive and commits the wait-set entry. The buffer and the
    /// transfer stay alive until the completion callback has run, even if
    /// every user clone is dropped.
    pub fn submit(&self) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock().unwrap();
        if st.submitted {
            return Err(Error::Busy);
        }
        let handle = st.handle.clone().ok_or(Error::InvalidParam)?;
        match st.kind {
            TransferKind::Control => {
                let setup = SetupPacket::parse(&st.buf)?;
                if setup.length as usize > st.buf.len() - setup::SETUP_PACKET_LENGTH {
                    return Err(Error::InvalidParam);
                }
            }
            TransferKind::Bulk | TransferKind::Interrupt => {}
            TransferKind::Isochronous => return Err(Error::NotSupported),
        }
        inner.completed.reset();
        if let Err(e) = sys::submit(inner, &mut st, &handle) {
            drop(st);
            inner.completed.set();
            return Err(e);
        }
        st.submitted = true;
        trace!(endpoint = st.endpoint, len = st.buf.len(), "transfer submitted");
        Ok(())
    }

    /// Request cancellation of an in-flight submission.
    ///
    /// Idempotent and non-blocking. The transition to
    /// [`TransferStatus::Cancelled`] happens when the completion is
    /// reaped, with no wall-clock bound.
    pub fn cancel(&self) -> Result<()> {
        let st = self.inner.state.lock().unwrap();
        if !st.submitted {
            return Ok(());
        }
        sys::cancel(&self.inner, &st)
    }

    /// Block until the current submission cycle completes.
    pub fn wait(&self) -> Result<()> {
        self.inner.completed.wait()
    }

    /// Synchronous fast path: performs the transfer inline where the
    /// backend supports it, falling back to submit + wait otherwise. The
    /// completion callback is not invoked on the fast path; inspect
    /// [`Transfer::status`] instead.
    pub fn perform(&self) -> Result<()> {
        match sys::perform(&self.inner) {
            Err(Error::NotSupported) => {
                self.submit()?;
                self.wait()
            }
            other => other,
        }
    }

    /// Status recorded by the most recent completion.
    pub fn status(&self) -> TransferStatus {
        self.inner.state.lock().unwrap().status
    }

    /// Bytes transferred by the most recent completion. For control
    /// transfers this includes the 8 setup bytes. Only meaningful when
    /// [`Transfer::status`] is [`TransferStatus::Completed`].
    pub fn actual_length(&self) -> usize {
        self.inner.state.lock().unwrap().actual
    }

    /// Run `f` over the transferred bytes (for control transfers the
    /// setup packet is included, as reflected in `actual_length`).
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let st = self.inner.state.lock().unwrap();
        f(&st.buf[..st.actual.min(st.buf.len())])
    }

    /// Copy the transferred bytes into `out`, returning the length.
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
    /// Completion step shared by the backends: record the outcome, run the
    /// user callback with no lock held, and signal the completion event
    /// unless the callback resubmitted.
    pub(crate) fn finish_reap(self: &Arc<Self>, status: TransferStatus, actual: usize) {
        let transfer = Transfer {
            inner: self.clone(),
        };
        let mut cb = {
            let mut st = self.state.lock().unwrap();
            st.submitted = false;
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
        let resubmitted = st.submitted;
        drop(st);
        if !resubmitted {
            self.completed.set();
        }
        trace!(?status, actual, resubmitted, "transfer reaped");
    }
}
