//! Overlapped COM-port I/O reaped through the handle wait set.
//!
//! Opening a COM port can block inside the driver, so opens run on a
//! dedicated thread. Reads are issued from the dispatching thread and the
//! overlapped event is registered with the wait set; even a synchronously
//! satisfied `ReadFile` is reaped through the dispatcher so completion
//! ordering stays observable.

use std::{
    cell::UnsafeCell,
    io, mem,
    os::windows::io::AsRawHandle,
    sync::{Arc, Mutex},
    thread,
};

use devio_dispatch::{syscall, Error, Result, TransferStatus, WaitObject};
use tracing::trace;
use windows_sys::Win32::{
    Devices::Communication::{
        SetCommState, SetCommTimeouts, COMMTIMEOUTS, DCB, EVENPARITY, MARKPARITY, NOPARITY,
        ODDPARITY, ONE5STOPBITS, ONESTOPBIT, SPACEPARITY, TWOSTOPBITS,
    },
    Foundation::{
        CloseHandle, ERROR_IO_PENDING, ERROR_OPERATION_ABORTED, GENERIC_READ, GENERIC_WRITE,
        HANDLE,
    },
    Storage::FileSystem::{CreateFileW, ReadFile, WriteFile, FILE_FLAG_OVERLAPPED, OPEN_EXISTING},
    System::{
        Threading::CreateEventW,
        IO::{CancelIoEx, CancelSynchronousIo, GetOverlappedResult, OVERLAPPED},
    },
};

use crate::{DeviceInfo, Parity, SerialPort, Settings, StopBits, TransferInner, TransferState};

const MAXDWORD: u32 = u32::MAX;

struct OwnedHandle(HANDLE);

unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

pub(crate) struct PortInner {
    handle: OwnedHandle,
}

impl AsRawHandle for SerialPort {
    fn as_raw_handle(&self) -> std::os::windows::io::RawHandle {
        self.inner.handle.0 as _
    }
}

fn to_utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn fill_dcb(settings: &Settings) -> Result<DCB> {
    let mut dcb: DCB = unsafe { mem::zeroed() };
    dcb.DCBlength = mem::size_of::<DCB>() as u32;
    dcb.BaudRate = settings.baud_rate;
    dcb._bitfield = 1; // fBinary
    if settings.parity != Parity::None {
        dcb._bitfield |= 2; // fParity
    }
    dcb.ByteSize = settings.data_bits;
    dcb.Parity = match settings.parity {
        Parity::None => NOPARITY,
        Parity::Odd => ODDPARITY,
        Parity::Even => EVENPARITY,
        Parity::Mark => MARKPARITY,
        Parity::Space => SPACEPARITY,
    } as u8;
    dcb.StopBits = match settings.stop_bits {
        StopBits::One => ONESTOPBIT,
        StopBits::OnePointFive => ONE5STOPBITS,
        StopBits::Two => TWOSTOPBITS,
    } as u8;
    Ok(dcb)
}

pub(crate) struct OpenState {
    thread: Mutex<Option<thread::JoinHandle<Result<SerialPort>>>>,
}

impl OpenState {
    pub fn wait(self) -> Result<SerialPort> {
        let Some(handle) = self.thread.into_inner().unwrap() else {
            return Err(Error::Io(io::Error::other("open already waited for")));
        };
        handle
            .join()
            .unwrap_or(Err(Error::Io(io::Error::other("open thread panicked"))))
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.thread.lock().unwrap().as_ref() {
            unsafe { CancelSynchronousIo(handle.as_raw_handle() as HANDLE) };
        }
    }
}

pub(crate) fn begin_open(path: &str, settings: &Settings) -> Result<OpenState> {
    let wide = to_utf16(path);
    let dcb = fill_dcb(settings)?;
    let timeout = settings
        .timeout
        .map(|t| t.as_millis().min(MAXDWORD as u128) as u32)
        .unwrap_or(MAXDWORD);
    let thread = thread::Builder::new()
        .name("devio-serial-open".into())
        .spawn(move || {
            let handle = syscall!(
                FILE,
                CreateFileW(
                    wide.as_ptr(),
                    GENERIC_READ | GENERIC_WRITE,
                    0,
                    std::ptr::null(),
                    OPEN_EXISTING,
                    FILE_FLAG_OVERLAPPED,
                    0,
                )
            )
            .map_err(Error::from)?;
            let handle = OwnedHandle(handle);

            // Return immediately with whatever is buffered, bounded by the
            // configured total timeout.
            let timeouts = COMMTIMEOUTS {
                ReadIntervalTimeout: MAXDWORD,
                ReadTotalTimeoutMultiplier: MAXDWORD,
                ReadTotalTimeoutConstant: timeout,
                WriteTotalTimeoutMultiplier: 0,
                WriteTotalTimeoutConstant: 0,
            };
            unsafe {
                SetCommTimeouts(handle.0, &timeouts);
                SetCommState(handle.0, &dcb);
            }

            Ok(SerialPort {
                inner: Arc::new(PortInner { handle }),
            })
        })
        .map_err(Error::Io)?;
    Ok(OpenState {
        thread: Mutex::new(Some(thread)),
    })
}

pub(crate) fn write(port: &PortInner, buf: &[u8]) -> Result<usize> {
    let event = syscall!(
        HANDLE,
        CreateEventW(std::ptr::null(), 1, 0, std::ptr::null())
    )?;
    let event = OwnedHandle(event);
    let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
    overlapped.hEvent = event.0;

    let mut transferred = 0u32;
    let res = unsafe {
        WriteFile(
            port.handle.0,
            buf.as_ptr(),
            buf.len() as u32,
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
            GetOverlappedResult(port.handle.0, &overlapped, &mut transferred, 1)
        )?;
    }
    Ok(transferred as usize)
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

/// Issue the overlapped read and register its event with the wait set.
/// Called with the transfer mutex held.
pub(crate) fn start_read(inner: &Arc<TransferInner>, st: &mut TransferState) -> Result<()> {
    let port = st.port.as_ref().ok_or(Error::InvalidParam)?.inner.clone();

    let overlapped = inner.io.overlapped.get();
    unsafe {
        *overlapped = mem::zeroed();
        (*overlapped).hEvent = inner.io.event.0;
    }

    let mut transferred = 0u32;
    let res = unsafe {
        ReadFile(
            port.handle.0,
            st.buf.as_mut_ptr(),
            st.buf.len() as u32,
            &mut transferred,
            overlapped,
        )
    };
    if res == 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(ERROR_IO_PENDING as i32) {
            return Err(err.into());
        }
    }
    // Even on synchronous success the event is signalled and the transfer
    // is reaped through the dispatcher.
    inner.ctx.prepare_add()?;
    let arc = inner.clone();
    inner.ctx.add(WaitObject::handle(inner.io.event.0), move |wake| {
        crate::reap(&arc, wake)
    });
    trace!("overlapped read issued");
    Ok(())
}

/// The overlapped event fired; collect the result.
pub(crate) fn complete_read(inner: &Arc<TransferInner>) -> (TransferStatus, usize) {
    let st = inner.state.lock().unwrap();
    let Some(port) = st.port.as_ref().map(|p| p.inner.clone()) else {
        return (TransferStatus::Error, 0);
    };
    drop(st);

    let mut transferred = 0u32;
    let res = unsafe {
        GetOverlappedResult(
            port.handle.0,
            inner.io.overlapped.get(),
            &mut transferred,
            1,
        )
    };
    if res == 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(ERROR_OPERATION_ABORTED as i32) {
            (TransferStatus::Cancelled, 0)
        } else {
            (TransferStatus::Error, 0)
        }
    } else {
        (TransferStatus::Completed, transferred as usize)
    }
}

/// Cancel the in-flight overlapped read. Called with the transfer mutex
/// held.
pub(crate) fn cancel(inner: &Arc<TransferInner>, st: &mut TransferState) {
    st.cancel_task = None;
    if let Some(port) = st.port.as_ref() {
        unsafe { CancelIoEx(port.inner.handle.0, inner.io.overlapped.get()) };
    }
}

/// COM-port discovery walks the device registry, which lives outside this
/// backend; open ports by path (`\\.\COM3`) instead.
pub(crate) fn devices() -> Result<Vec<DeviceInfo>> {
    Err(Error::NotSupported)
}
