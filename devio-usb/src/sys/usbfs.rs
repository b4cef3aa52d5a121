//! Linux usbfs backend.
//!
//! Device nodes live under `/dev/bus/usb/<bus>/<dev>`; descriptors are
//! read straight off the node at enumeration time. Asynchronous I/O goes
//! through URB ioctls: `SUBMITURB` queues a request, the device fd polls
//! writable when completed URBs are waiting, and `REAPURBNDELAY` collects
//! them on the dispatching thread. `DISCARDURB` is the cancellation
//! mechanism; a discarded URB is still reaped, with a cancellation status.

use std::{
    cell::UnsafeCell,
    ffi::c_void,
    fs,
    io::Read,
    mem,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    path::Path,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, Mutex, Weak,
    },
};

use devio_dispatch::{syscall, Context, Error, Result, TransferStatus, Wake, WaitObject};
use tracing::{error, trace};

use crate::{
    descriptor::{DeviceDescriptor, DEVICE_DESCRIPTOR_LENGTH, DT_CONFIG},
    setup::{SetupPacket, SETUP_PACKET_LENGTH},
    CtxInner, Device, DeviceHandle, DeviceId, DeviceInner, HandleInner, TransferInner,
    TransferKind, TransferState,
};

const URB_TYPE_INTERRUPT: u8 = 1;
const URB_TYPE_CONTROL: u8 = 2;
const URB_TYPE_BULK: u8 = 3;

#[repr(C)]
struct Urb {
    urb_type: u8,
    endpoint: u8,
    status: libc::c_int,
    flags: libc::c_uint,
    buffer: *mut c_void,
    buffer_length: libc::c_int,
    actual_length: libc::c_int,
    start_frame: libc::c_int,
    stream_id: libc::c_uint,
    error_count: libc::c_int,
    signr: libc::c_uint,
    usercontext: *mut c_void,
}

#[repr(C)]
struct CtrlTransfer {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
    timeout: u32,
    data: *mut c_void,
}

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: usize) -> libc::c_ulong {
    ((dir << 30) | ((size as u32) << 16) | ((b'U' as u32) << 8) | nr) as libc::c_ulong
}

const USBDEVFS_CONTROL: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, 0, mem::size_of::<CtrlTransfer>());
const USBDEVFS_SETCONFIGURATION: libc::c_ulong = ioc(IOC_READ, 5, 4);
const USBDEVFS_SUBMITURB: libc::c_ulong = ioc(IOC_READ, 10, mem::size_of::<Urb>());
const USBDEVFS_DISCARDURB: libc::c_ulong = ioc(IOC_NONE, 11, 0);
const USBDEVFS_REAPURBNDELAY: libc::c_ulong = ioc(IOC_WRITE, 13, mem::size_of::<*mut c_void>());
const USBDEVFS_CLAIMINTERFACE: libc::c_ulong = ioc(IOC_READ, 15, 4);
const USBDEVFS_RELEASEINTERFACE: libc::c_ulong = ioc(IOC_READ, 16, 4);

/// Enumeration-time state: the read-only node fd and the configuration
/// descriptor chains cached from it.
pub(crate) struct DeviceIo {
    fd: OwnedFd,
    config_cache: Vec<u8>,
}

/// Per-open state: the node re-opened read-write, plus the transfers
/// whose URBs the kernel currently owns. The list is what lets a failed
/// reap unblock the fd's in-flight transfers instead of stranding them.
pub(crate) struct HandleIo {
    wrfd: OwnedFd,
    active_config: AtomicI32,
    pending: Mutex<Vec<Weak<TransferInner>>>,
}

/// Per-transfer kernel request. The URB address must stay stable while
/// the kernel owns it, which the enclosing `Arc` guarantees.
pub(crate) struct TransferIo {
    urb: UnsafeCell<Urb>,
}

// The URB's raw pointers reference the transfer's own pinned buffer.
unsafe impl Send for TransferIo {}
unsafe impl Sync for TransferIo {}

impl TransferIo {
    pub fn new() -> Result<Self> {
        Ok(Self {
            urb: UnsafeCell::new(unsafe { mem::zeroed() }),
        })
    }
}

fn numeric_name(entry: &fs::DirEntry) -> Option<u32> {
    entry.file_name().to_str()?.parse().ok()
}

fn read_device(owner: &Arc<CtxInner>, id: DeviceId, path: &Path) -> Result<Device> {
    let mut file = fs::File::open(path).map_err(Error::from)?;

    // usbfs serves the descriptor chain as a plain byte stream; the
    // device descriptor comes first, already in host endianness.
    let mut raw = [0u8; DEVICE_DESCRIPTOR_LENGTH];
    file.read_exact(&mut raw).map_err(Error::from)?;
    let desc = DeviceDescriptor::parse(&raw)?;

    let mut config_cache = Vec::new();
    for _ in 0..desc.num_configurations {
        let mut header = [0u8; 4];
        file.read_exact(&mut header).map_err(Error::from)?;
        let total = u16::from_le_bytes([header[2], header[3]]) as usize;
        if total < header.len() {
            return Err(Error::Io(std::io::Error::other("bad descriptor chain")));
        }
        let start = config_cache.len();
        config_cache.extend_from_slice(&header);
        config_cache.resize(start + total, 0);
        file.read_exact(&mut config_cache[start + header.len()..])
            .map_err(Error::from)?;
    }

    Ok(Device::create(
        owner,
        id,
        desc,
        DeviceIo {
            fd: file.into(),
            config_cache,
        },
    ))
}

pub(crate) fn enumerate(owner: &Arc<CtxInner>) -> Result<Vec<Device>> {
    let mut out = Vec::new();
    let Ok(buses) = fs::read_dir("/dev/bus/usb") else {
        return Ok(out);
    };
    for bus in buses.flatten() {
        let Some(busno) = numeric_name(&bus) else {
            continue;
        };
        let Ok(nodes) = fs::read_dir(bus.path()) else {
            continue;
        };
        for node in nodes.flatten() {
            let Some(devno) = numeric_name(&node) else {
                continue;
            };
            let id = (busno, devno);
            if let Some(dev) = Device::lookup(owner, id) {
                out.push(dev);
                continue;
            }
            match read_device(owner, id, &node.path()) {
                Ok(dev) => {
                    Device::register(owner, &dev);
                    out.push(dev);
                }
                // Unreadable or half-gone node; skip it like any other
                // device that vanished mid-enumeration.
                Err(_) => continue,
            }
        }
    }
    trace!(count = out.len(), "usbfs enumeration");
    Ok(out)
}

pub(crate) fn open(dev: &Arc<DeviceInner>) -> Result<HandleIo> {
    // Re-open the enumeration fd read-write; the node path may already be
    // gone even though the device is still usable.
    let path = format!("/proc/self/fd/{}", dev.io.fd.as_raw_fd());
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|_| Error::Access)?;
    Ok(HandleIo {
        wrfd: file.into(),
        active_config: AtomicI32::new(-1),
        pending: Mutex::new(Vec::new()),
    })
}

pub(crate) fn get_descriptor_cached(
    dev: &Arc<DeviceInner>,
    desc_type: u8,
    desc_index: u8,
    _langid: u16,
    data: &mut [u8],
) -> Result<usize> {
    if desc_type != DT_CONFIG {
        return Err(Error::NotSupported);
    }
    let cache = &dev.io.config_cache;
    let mut offset = 0usize;
    for i in 0..dev.desc.num_configurations {
        if offset + 4 > cache.len() {
            return Err(Error::Io(std::io::Error::other("bad descriptor cache")));
        }
        let total = u16::from_le_bytes([cache[offset + 2], cache[offset + 3]]) as usize;
        if i == desc_index {
            let n = data.len().min(total).min(cache.len() - offset);
            data[..n].copy_from_slice(&cache[offset..offset + n]);
            return Ok(n);
        }
        offset += total;
    }
    Err(Error::InvalidParam)
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
    let arg = interface_number as libc::c_uint;
    syscall!(libc::ioctl(
        handle.io.wrfd.as_raw_fd(),
        USBDEVFS_CLAIMINTERFACE,
        &arg,
    ))?;
    Ok(())
}

pub(crate) fn release_interface(handle: &Arc<HandleInner>, interface_number: u8) -> Result<()> {
    let arg = interface_number as libc::c_uint;
    syscall!(libc::ioctl(
        handle.io.wrfd.as_raw_fd(),
        USBDEVFS_RELEASEINTERFACE,
        &arg,
    ))?;
    Ok(())
}

pub(crate) fn get_configuration(handle: &Arc<HandleInner>) -> Result<u8> {
    match handle.io.active_config.load(Ordering::Relaxed) {
        value if value >= 0 => Ok(value as u8),
        _ => Err(Error::NotSupported),
    }
}

pub(crate) fn set_configuration(handle: &Arc<HandleInner>, value: u8) -> Result<()> {
    let arg = value as libc::c_uint;
    syscall!(libc::ioctl(
        handle.io.wrfd.as_raw_fd(),
        USBDEVFS_SETCONFIGURATION,
        &arg,
    ))?;
    handle.io.active_config.store(value as i32, Ordering::Relaxed);
    Ok(())
}

fn map_urb_status(status: libc::c_int) -> TransferStatus {
    match -status {
        0 => TransferStatus::Completed,
        libc::ENOENT | libc::ECONNRESET => TransferStatus::Cancelled,
        libc::EPIPE => TransferStatus::Stall,
        libc::ENODEV | libc::ESHUTDOWN => TransferStatus::NoDevice,
        libc::EOVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

/// Issue the URB and commit the wait-set entry. Called with the transfer
/// mutex held; the entry watches the device fd for reapable completions.
pub(crate) fn submit(
    inner: &Arc<TransferInner>,
    st: &mut TransferState,
    handle: &DeviceHandle,
) -> Result<()> {
    let fd = handle.inner.io.wrfd.as_raw_fd();
    let urb = inner.io.urb.get();
    unsafe {
        *urb = mem::zeroed();
        (*urb).urb_type = match st.kind {
            TransferKind::Control => URB_TYPE_CONTROL,
            TransferKind::Bulk => URB_TYPE_BULK,
            TransferKind::Interrupt => URB_TYPE_INTERRUPT,
            TransferKind::Isochronous => return Err(Error::NotSupported),
        };
        (*urb).endpoint = st.endpoint;
        (*urb).buffer = st.buf.as_mut_ptr() as *mut c_void;
        (*urb).buffer_length = st.buf.len() as libc::c_int;
    }

    inner.ctx.prepare_add()?;

    // The kernel holds a reference through `usercontext` until the URB is
    // reaped.
    let raw = Arc::into_raw(inner.clone());
    unsafe {
        (*urb).usercontext = raw as *mut c_void;
    }
    if let Err(e) = syscall!(libc::ioctl(fd, USBDEVFS_SUBMITURB, urb)) {
        inner.ctx.cancel_add();
        unsafe {
            drop(Arc::from_raw(raw));
        }
        return Err(e.into());
    }

    let ctx = inner.ctx.clone();
    let h = handle.clone();
    inner
        .ctx
        .add(WaitObject::writable(fd), move |wake| reap_ready(ctx, h, wake));

    // Record the in-flight transfer on its handle. Taking the pending lock
    // after the transfer mutex keeps the lock order consistent with the
    // failure path, which never holds both at once.
    let weak = Arc::downgrade(inner);
    let mut pending = handle.inner.io.pending.lock().unwrap();
    pending.retain(|w| w.strong_count() != 0 && !w.ptr_eq(&weak));
    pending.push(weak);
    Ok(())
}

/// The device fd polled writable: one completed URB is waiting. Reap it
/// and complete whichever transfer it belongs to.
fn reap_ready(ctx: Context, handle: DeviceHandle, wake: Wake) {
    if wake == Wake::Removed {
        return;
    }
    let fd = handle.inner.io.wrfd.as_raw_fd();
    let mut urbp: *mut Urb = std::ptr::null_mut();
    let reaped = loop {
        match syscall!(libc::ioctl(fd, USBDEVFS_REAPURBNDELAY, &mut urbp)) {
            Ok(_) => break Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e),
        }
    };
    match reaped {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            // Spurious readiness (another entry on this fd reaped first);
            // put the watch back.
            if ctx.prepare_add().is_ok() {
                let c = ctx.clone();
                ctx.add(WaitObject::writable(fd), move |wake| {
                    reap_ready(c, handle, wake)
                });
            } else {
                error!("failed to re-arm usbfs watch");
            }
            return;
        }
        Err(e) => {
            // The wake can no longer be matched to a completion; this is
            // the device-gone case. Nothing is reapable from this fd any
            // more, so keeping one-shot watches armed would only spin on
            // error readiness: drain them and deliver a terminal status to
            // every transfer still in flight on this handle.
            error!("urb reap failed: {e}");
            let status = match e.raw_os_error() {
                Some(libc::ENODEV) | Some(libc::ESHUTDOWN) => TransferStatus::NoDevice,
                _ => TransferStatus::Error,
            };
            fail_pending(&ctx, &handle, fd, status);
            return;
        }
    }

    let inner = unsafe { Arc::from_raw((*urbp).usercontext as *const TransferInner) };
    let (status, transferred) = unsafe { (map_urb_status((*urbp).status), (*urbp).actual_length) };
    let is_control = inner.state.lock().unwrap().kind == TransferKind::Control;
    let actual = match status {
        // The setup bytes count toward the transferred length.
        TransferStatus::Completed if is_control => transferred as usize + SETUP_PACKET_LENGTH,
        TransferStatus::Completed => transferred as usize,
        _ => 0,
    };
    inner.finish_reap(status, actual);
}

/// Reaping broke down for good on this fd: withdraw its remaining
/// watches and complete whatever is still marked submitted, so waiters
/// are released with `NoDevice`/`Error` instead of blocking forever.
fn fail_pending(ctx: &Context, handle: &DeviceHandle, fd: RawFd, status: TransferStatus) {
    // Runs on the dispatching thread, so the removal is inline and the
    // withdrawn callbacks observe `Wake::Removed` and back off.
    ctx.remove(WaitObject::writable(fd));

    let stranded = std::mem::take(&mut *handle.inner.io.pending.lock().unwrap());
    for weak in stranded {
        let Some(tran) = weak.upgrade() else {
            continue;
        };
        let submitted = tran.state.lock().unwrap().submitted;
        if submitted {
            // The kernel-side URB reference cannot be reclaimed without a
            // successful reap; leaking it keeps the record valid if the
            // kernel still touches it.
            tran.finish_reap(status, 0);
        }
    }
}

/// Cancel the in-flight URB. Called with the transfer mutex held; the
/// discarded URB is still delivered through the reap path.
pub(crate) fn cancel(inner: &Arc<TransferInner>, st: &TransferState) -> Result<()> {
    let Some(handle) = st.handle.as_ref() else {
        return Ok(());
    };
    let fd = handle.inner.io.wrfd.as_raw_fd();
    match syscall!(libc::ioctl(fd, USBDEVFS_DISCARDURB, inner.io.urb.get())) {
        Ok(_) => Ok(()),
        // Already completed or already discarded.
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Synchronous fast path: only control transfers have one on usbfs.
pub(crate) fn perform(inner: &Arc<TransferInner>) -> Result<()> {
    let mut st = inner.state.lock().unwrap();
    if st.submitted {
        return Err(Error::Busy);
    }
    if st.kind != TransferKind::Control {
        return Err(Error::NotSupported);
    }
    let handle = st.handle.clone().ok_or(Error::InvalidParam)?;
    let setup = SetupPacket::parse(&st.buf)?;
    if setup.length as usize > st.buf.len() - SETUP_PACKET_LENGTH {
        return Err(Error::InvalidParam);
    }

    let mut req = CtrlTransfer {
        request_type: setup.request_type,
        request: setup.request,
        value: setup.value,
        index: setup.index,
        length: setup.length,
        timeout: 0,
        data: st.buf[SETUP_PACKET_LENGTH..].as_mut_ptr() as *mut c_void,
    };
    let fd = handle.inner.io.wrfd.as_raw_fd();
    match syscall!(libc::ioctl(fd, USBDEVFS_CONTROL, &mut req)) {
        Ok(n) => {
            st.status = TransferStatus::Completed;
            st.actual = n as usize + SETUP_PACKET_LENGTH;
        }
        Err(e) => {
            st.actual = 0;
            st.status = match e.raw_os_error() {
                Some(libc::ENODEV) => TransferStatus::NoDevice,
                Some(libc::EPIPE) => TransferStatus::Stall,
                _ => TransferStatus::Error,
            };
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn ioctl_codes_match_the_kernel_abi() {
        // Pinning these also pins the request struct layouts.
        assert_eq!(USBDEVFS_CONTROL, 0xC018_5500);
        assert_eq!(USBDEVFS_SETCONFIGURATION, 0x8004_5505);
        assert_eq!(USBDEVFS_SUBMITURB, 0x8038_550A);
        assert_eq!(USBDEVFS_DISCARDURB, 0x0000_550B);
        assert_eq!(USBDEVFS_REAPURBNDELAY, 0x4008_550D);
        assert_eq!(USBDEVFS_CLAIMINTERFACE, 0x8004_550F);
        assert_eq!(USBDEVFS_RELEASEINTERFACE, 0x8004_5510);
    }

    #[test]
    fn urb_status_maps_to_transfer_status() {
        assert_eq!(map_urb_status(0), TransferStatus::Completed);
        assert_eq!(map_urb_status(-libc::ENOENT), TransferStatus::Cancelled);
        assert_eq!(map_urb_status(-libc::ECONNRESET), TransferStatus::Cancelled);
        assert_eq!(map_urb_status(-libc::EPIPE), TransferStatus::Stall);
        assert_eq!(map_urb_status(-libc::ENODEV), TransferStatus::NoDevice);
        assert_eq!(map_urb_status(-libc::EOVERFLOW), TransferStatus::Overflow);
        assert_eq!(map_urb_status(-libc::EPROTO), TransferStatus::Error);
    }
}
