//! Windows backend over the libusb0 filter driver.
//!
//! Devices are probed by name (`\\.\libusb0-0001` onward) and spoken to
//! with the driver's ioctl set through overlapped `DeviceIoControl`. The
//! request block is copied by the kernel at submission, so only the
//! overlapped record and the data buffer must stay pinned; completions
//! are reaped through the wait set even when the ioctl finishes
//! synchronously.

use std::{
    cell::UnsafeCell,
    io, mem,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
};

use devio_dispatch::{syscall, Error, Result, TransferStatus, Wake, WaitObject};
use tracing::trace;
use windows_sys::Win32::{
    Foundation::{
        CloseHandle, ERROR_IO_PENDING, ERROR_OPERATION_ABORTED, GENERIC_READ, GENERIC_WRITE,
        HANDLE,
    },
    Storage::FileSystem::{
        CreateFileW, FILE_FLAG_OVERLAPPED, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
    },
    System::{
        Threading::CreateEventW,
        IO::{CancelIoEx, DeviceIoControl, GetOverlappedResult, OVERLAPPED},
    },
};

use crate::{
    descriptor::{DeviceDescriptor, DEVICE_DESCRIPTOR_LENGTH},
    setup::{SetupPacket, SETUP_PACKET_LENGTH},
    CtxInner, Device, DeviceHandle, DeviceId, DeviceInner, HandleInner, TransferInner,
    TransferKind, TransferState,
};

const MAX_DEVICE_NUMBER: u32 = 256;

const FILE_DEVICE_UNKNOWN: u32 = 0x22;
const METHOD_BUFFERED: u32 = 0;
const METHOD_IN_DIRECT: u32 = 1;
const METHOD_OUT_DIRECT: u32 = 2;

const fn ctl_code(function: u32, method: u32) -> u32 {
    (FILE_DEVICE_UNKNOWN << 16) | (function << 2) | method
}

const IOCTL_SET_CONFIGURATION: u32 = ctl_code(0x801, METHOD_BUFFERED);
const IOCTL_GET_CONFIGURATION: u32 = ctl_code(0x802, METHOD_BUFFERED);
const IOCTL_GET_DESCRIPTOR: u32 = ctl_code(0x809, METHOD_BUFFERED);
const IOCTL_INTERRUPT_OR_BULK_WRITE: u32 = ctl_code(0x80A, METHOD_IN_DIRECT);
const IOCTL_INTERRUPT_OR_BULK_READ: u32 = ctl_code(0x80B, METHOD_OUT_DIRECT);
const IOCTL_CLAIM_INTERFACE: u32 = ctl_code(0x815, METHOD_BUFFERED);
const IOCTL_RELEASE_INTERFACE: u32 = ctl_code(0x816, METHOD_BUFFERED);
const IOCTL_GET_CACHED_CONFIGURATION: u32 = ctl_code(0x902, METHOD_BUFFERED);
const IOCTL_CONTROL_WRITE: u32 = ctl_code(0x90A, METHOD_IN_DIRECT);
const IOCTL_CONTROL_READ: u32 = ctl_code(0x90B, METHOD_OUT_DIRECT);

#[repr(C)]
#[derive(Clone, Copy)]
struct EndpointRequest {
    endpoint: u32,
    packet_size: u32,
    max_transfer_size: u32,
    transfer_flags: u32,
    iso_start_frame_latency: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ControlRequest {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DescriptorRequest {
    desc_type: u32,
    index: u32,
    language_id: u32,
    recipient: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
union RequestData {
    raw: [u8; 20],
    endpoint: EndpointRequest,
    control: ControlRequest,
    descriptor: DescriptorRequest,
    configuration: u32,
    interface_number: u32,
}

/// The driver's request block; the kernel copies it at submission time.
#[repr(C)]
#[derive(Clone, Copy)]
struct Request {
    timeout: u32,
    data: RequestData,
}

impl Request {
    fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

struct OwnedHandle(HANDLE);

unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

/// The device file is opened once at enumeration and shared by every
/// handle.
pub(crate) struct DeviceIo {
    file: OwnedHandle,
}

/// Opening is a no-op on this backend.
pub(crate) struct HandleIo {
    active_config: AtomicI32,
}

/// Overlapped record plus its completion event; address-stable inside the
/// transfer allocation while the kernel owns it.
pub(crate) struct TransferIo {
    overlapped: UnsafeCell<OVERLAPPED>,
    event: OwnedHandle,
}

unsafe impl Send for TransferIo {}
unsafe impl Sync for TransferIo {}

impl TransferIo {
    pub fn new() -> Result<Self> {
        let event = syscall!(
            HANDLE,
            CreateEventW(std::ptr::null(), 1, 1, std::ptr::null())
        )?;
        Ok(Self {
            overlapped: UnsafeCell::new(unsafe { mem::zeroed() }),
            event: OwnedHandle(event),
        })
    }
}

fn device_path(devno: u32) -> Vec<u16> {
    format!("\\\\.\\libusb0-{devno:04}")
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect()
}

/// Blocking ioctl used for the short management requests.
fn sync_ioctl(
    file: HANDLE,
    code: u32,
    req: &Request,
    out: Option<&mut [u8]>,
) -> Result<usize> {
    let event = syscall!(
        HANDLE,
        CreateEventW(std::ptr::null(), 1, 0, std::ptr::null())
    )?;
    let event = OwnedHandle(event);
    let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
    overlapped.hEvent = event.0;

    let (out_ptr, out_len) = match out {
        Some(buf) => (buf.as_mut_ptr() as *mut _, buf.len() as u32),
        None => (std::ptr::null_mut(), 0),
    };
    let mut transferred = 0u32;
    let res = unsafe {
        DeviceIoControl(
            file,
            code,
            req as *const Request as *const _,
            mem::size_of::<Request>() as u32,
            out_ptr,
            out_len,
            &mut transferred,
            &mut overlapped,
        )
    };
    if res == 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(ERROR_IO_PENDING as i32) {
            return Err(err.into());
        }
        syscall!(
            BOOL,
            GetOverlappedResult(file, &overlapped, &mut transferred, 1)
        )?;
    }
    Ok(transferred as usize)
}

fn fetch_device_descriptor(file: HANDLE) -> Result<DeviceDescriptor> {
    let mut req = Request::zeroed();
    req.data.descriptor = DescriptorRequest {
        desc_type: 1,
        index: 0,
        language_id: 0,
        recipient: 0,
    };
    let mut raw = [0u8; DEVICE_DESCRIPTOR_LENGTH];
    let n = sync_ioctl(file, IOCTL_GET_DESCRIPTOR, &req, Some(&mut raw))?;
    DeviceDescriptor::parse(&raw[..n])
}

pub(crate) fn enumerate(owner: &Arc<CtxInner>) -> Result<Vec<Device>> {
    let mut out = Vec::new();
    for devno in 1..MAX_DEVICE_NUMBER {
        let id: DeviceId = (0, devno);
        let path = device_path(devno);
        let file = unsafe {
            CreateFileW(
                path.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                std::ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_OVERLAPPED,
                0,
            )
        };
        if file == windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE {
            continue;
        }
        let file = OwnedHandle(file);

        if let Some(dev) = Device::lookup(owner, id) {
            out.push(dev);
            continue;
        }

        let Ok(desc) = fetch_device_descriptor(file.0) else {
            continue;
        };
        let dev = Device::create(owner, id, desc, DeviceIo { file });
        Device::register(owner, &dev);
        out.push(dev);
    }
    trace!(count = out.len(), "libusb0 enumeration");
    Ok(out)
}

pub(crate) fn open(_dev: &Arc<DeviceInner>) -> Result<HandleIo> {
    Ok(HandleIo {
        active_config: AtomicI32::new(-1),
    })
}

pub(crate) fn get_descriptor_cached(
    dev: &Arc<DeviceInner>,
    desc_type: u8,
    desc_index: u8,
    langid: u16,
    data: &mut [u8],
) -> Result<usize> {
    let mut req = Request::zeroed();
    req.data.descriptor = DescriptorRequest {
        desc_type: desc_type as u32,
        index: desc_index as u32,
        language_id: langid as u32,
        recipient: 0,
    };
    sync_ioctl(dev.io.file.0, IOCTL_GET_DESCRIPTOR, &req, Some(data))
}

pub(crate) fn get_descriptor(
    handle: &Arc<HandleInner>,
    desc_type: u8,
    desc_index: u8,
    langid: u16,
    data: &mut [u8],
) -> Result<usize> {
    get_descriptor_cached(&handle.dev.inner, desc_type, desc_index, langid, data)
}

pub(crate) fn claim_interface(handle: &Arc<HandleInner>, interface_number: u8) -> Result<()> {
    let mut req = Request::zeroed();
    req.data.interface_number = interface_number as u32;
    sync_ioctl(handle.dev.inner.io.file.0, IOCTL_CLAIM_INTERFACE, &req, None)?;
    Ok(())
}

pub(crate) fn release_interface(handle: &Arc<HandleInner>, interface_number: u8) -> Result<()> {
    let mut req = Request::zeroed();
    req.data.interface_number = interface_number as u32;
    sync_ioctl(
        handle.dev.inner.io.file.0,
        IOCTL_RELEASE_INTERFACE,
        &req,
        None,
    )?;
    Ok(())
}

pub(crate) fn get_configuration(handle: &Arc<HandleInner>) -> Result<u8> {
    let cached = handle.io.active_config.load(Ordering::Relaxed);
    if cached >= 0 {
        return Ok(cached as u8);
    }
    let req = Request::zeroed();
    let mut out = [0u8; 1];
    let file = handle.dev.inner.io.file.0;
    let n = match sync_ioctl(file, IOCTL_GET_CACHED_CONFIGURATION, &req, Some(&mut out)) {
        Ok(1) => 1,
        _ => sync_ioctl(file, IOCTL_GET_CONFIGURATION, &req, Some(&mut out))?,
    };
    if n != 1 {
        return Err(Error::Io(io::Error::other("short configuration read")));
    }
    handle
        .io
        .active_config
        .store(out[0] as i32, Ordering::Relaxed);
    Ok(out[0])
}

pub(crate) fn set_configuration(handle: &Arc<HandleInner>, value: u8) -> Result<()> {
    let mut req = Request::zeroed();
    req.data.configuration = value as u32;
    sync_ioctl(
        handle.dev.inner.io.file.0,
        IOCTL_SET_CONFIGURATION,
        &req,
        None,
    )?;
    handle.io.active_config.store(value as i32, Ordering::Relaxed);
    Ok(())
}

/// Build the request block and pick the control code for a submission.
fn prepare_request(st: &mut TransferState) -> Result<(u32, Request, *mut u8, u32)> {
    let mut req = Request::zeroed();
    match st.kind {
        TransferKind::Bulk | TransferKind::Interrupt => {
            req.data.endpoint = EndpointRequest {
                endpoint: st.endpoint as u32,
                packet_size: 0,
                max_transfer_size: 0,
                transfer_flags: 0,
                iso_start_frame_latency: 0,
            };
            let code = if st.endpoint & 0x80 != 0 {
                IOCTL_INTERRUPT_OR_BULK_READ
            } else {
                IOCTL_INTERRUPT_OR_BULK_WRITE
            };
            Ok((code, req, st.buf.as_mut_ptr(), st.buf.len() as u32))
        }
        TransferKind::Control => {
            let setup = SetupPacket::parse(&st.buf)?;
            if setup.length as usize > st.buf.len() - SETUP_PACKET_LENGTH {
                return Err(Error::InvalidParam);
            }
            req.data.control = ControlRequest {
                request_type: setup.request_type,
                request: setup.request,
                value: setup.value,
                index: setup.index,
                length: setup.length,
            };
            let code = if setup.is_in() {
                IOCTL_CONTROL_READ
            } else {
                IOCTL_CONTROL_WRITE
            };
            let data = &mut st.buf[SETUP_PACKET_LENGTH..];
            Ok((code, req, data.as_mut_ptr(), data.len() as u32))
        }
        TransferKind::Isochronous => Err(Error::NotSupported),
    }
}

/// Issue the overlapped ioctl and commit the wait-set entry. Called with
/// the transfer mutex held.
pub(crate) fn submit(
    inner: &Arc<TransferInner>,
    st: &mut TransferState,
    handle: &DeviceHandle,
) -> Result<()> {
    let (code, req, data_ptr, data_len) = prepare_request(st)?;
    let file = handle.dev_file();

    inner.ctx.prepare_add()?;

    let overlapped = inner.io.overlapped.get();
    unsafe {
        *overlapped = mem::zeroed();
        (*overlapped).hEvent = inner.io.event.0;
    }
    let mut transferred = 0u32;
    let res = unsafe {
        DeviceIoControl(
            file,
            code,
            &req as *const Request as *const _,
            mem::size_of::<Request>() as u32,
            data_ptr as *mut _,
            data_len,
            &mut transferred,
            overlapped,
        )
    };
    // A synchronous completion still signals the overlapped event and is
    // reaped through the dispatcher.
    if res == 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(ERROR_IO_PENDING as i32) {
            inner.ctx.cancel_add();
            return Err(err.into());
        }
    }

    let arc = inner.clone();
    let h = handle.clone();
    inner
        .ctx
        .add(WaitObject::handle(inner.io.event.0), move |wake| {
            reap_ready(arc, h, wake)
        });
    Ok(())
}

fn reap_ready(inner: Arc<TransferInner>, handle: DeviceHandle, wake: Wake) {
    if wake == Wake::Removed {
        return;
    }
    let mut transferred = 0u32;
    let res = unsafe {
        GetOverlappedResult(
            handle.dev_file(),
            inner.io.overlapped.get(),
            &mut transferred,
            1,
        )
    };
    let status = if res != 0 {
        TransferStatus::Completed
    } else if io::Error::last_os_error().raw_os_error() == Some(ERROR_OPERATION_ABORTED as i32) {
        TransferStatus::Cancelled
    } else {
        TransferStatus::Error
    };
    let is_control = inner.state.lock().unwrap().kind == TransferKind::Control;
    let actual = match status {
        // The setup bytes count toward the transferred length.
        TransferStatus::Completed if is_control => transferred as usize + SETUP_PACKET_LENGTH,
        TransferStatus::Completed => transferred as usize,
        _ => 0,
    };
    inner.finish_reap(status, actual);
}

/// Cancel the in-flight ioctl. Called with the transfer mutex held.
pub(crate) fn cancel(inner: &Arc<TransferInner>, st: &TransferState) -> Result<()> {
    let Some(handle) = st.handle.as_ref() else {
        return Ok(());
    };
    unsafe { CancelIoEx(handle.dev_file(), inner.io.overlapped.get()) };
    Ok(())
}

/// Synchronous fast path: run the ioctl inline and block on its result.
pub(crate) fn perform(inner: &Arc<TransferInner>) -> Result<()> {
    let mut st = inner.state.lock().unwrap();
    if st.submitted {
        return Err(Error::Busy);
    }
    let handle = st.handle.clone().ok_or(Error::InvalidParam)?;
    let is_control = st.kind == TransferKind::Control;
    let (code, req, data_ptr, data_len) = prepare_request(&mut st)?;

    let file = handle.dev_file();
    // The blocking helper keeps its own overlapped record, so the
    // transfer's event stays untouched.
    let target = unsafe { std::slice::from_raw_parts_mut(data_ptr, data_len as usize) };
    match sync_ioctl(file, code, &req, Some(target)) {
        Ok(n) => {
            st.status = TransferStatus::Completed;
            st.actual = if is_control {
                n + SETUP_PACKET_LENGTH
            } else {
                n
            };
        }
        Err(_) => {
            st.actual = 0;
            st.status = TransferStatus::Error;
        }
    }
    Ok(())
}

impl DeviceHandle {
    pub(crate) fn dev_file(&self) -> HANDLE {
        self.inner.dev.inner.io.file.0
    }
}
