//! termios-backed ports read through the `poll` wait set.

use std::{
    fs, io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::Arc,
};

use devio_dispatch::{syscall, Error, Result, TransferStatus, WaitObject};
use tracing::trace;

use crate::{DeviceInfo, Parity, SerialPort, Settings, StopBits, TransferInner, TransferState};

pub(crate) struct PortInner {
    fd: OwnedFd,
}

impl AsRawFd for SerialPort {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.fd.as_raw_fd()
    }
}

impl FromRawFd for SerialPort {
    /// Wrap an already-open descriptor. The descriptor should be
    /// non-blocking; no line settings are applied.
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            inner: Arc::new(PortInner {
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
            }),
        }
    }
}

fn baud_constant(rate: u32) -> Option<libc::speed_t> {
    Some(match rate {
        50 => libc::B50,
        75 => libc::B75,
        110 => libc::B110,
        134 => libc::B134,
        150 => libc::B150,
        200 => libc::B200,
        300 => libc::B300,
        600 => libc::B600,
        1200 => libc::B1200,
        1800 => libc::B1800,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        _ => return None,
    })
}

fn apply_settings(fd: RawFd, settings: &Settings) -> Result<()> {
    let speed = baud_constant(settings.baud_rate).ok_or(Error::InvalidParam)?;

    let mut tios: libc::termios = unsafe { std::mem::zeroed() };
    syscall!(libc::tcgetattr(fd, &mut tios))?;

    unsafe {
        libc::cfsetispeed(&mut tios, speed);
        libc::cfsetospeed(&mut tios, speed);
    }

    tios.c_iflag = 0;
    tios.c_oflag = 0;
    tios.c_cflag = libc::CREAD;
    tios.c_lflag = 0;

    tios.c_cflag |= match settings.data_bits {
        5 => libc::CS5,
        6 => libc::CS6,
        7 => libc::CS7,
        _ => libc::CS8,
    };

    if settings.stop_bits == StopBits::Two {
        tios.c_cflag |= libc::CSTOPB;
    }

    match settings.parity {
        Parity::None => {}
        Parity::Odd => {
            tios.c_cflag |= libc::PARENB | libc::PARODD;
            tios.c_iflag = libc::INPCK;
        }
        Parity::Even => {
            tios.c_cflag |= libc::PARENB;
            tios.c_iflag = libc::INPCK;
        }
        Parity::Mark | Parity::Space => return Err(Error::InvalidParam),
    }

    syscall!(libc::tcsetattr(fd, libc::TCSANOW, &tios))?;
    Ok(())
}

pub(crate) enum OpenState {
    Ready(Result<SerialPort>),
}

impl OpenState {
    pub fn wait(self) -> Result<SerialPort> {
        match self {
            Self::Ready(res) => res,
        }
    }

    pub fn cancel(&self) {}
}

pub(crate) fn begin_open(path: &str, settings: &Settings) -> Result<OpenState> {
    Ok(OpenState::Ready(open(path, settings)))
}

fn open(path: &str, settings: &Settings) -> Result<SerialPort> {
    let c_path =
        std::ffi::CString::new(path.as_bytes()).map_err(|_| Error::InvalidParam)?;
    let fd = syscall!(libc::open(
        c_path.as_ptr(),
        libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK,
    ))?;
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    apply_settings(fd.as_raw_fd(), settings)?;
    Ok(SerialPort {
        inner: Arc::new(PortInner { fd }),
    })
}

pub(crate) fn write(port: &PortInner, buf: &[u8]) -> Result<usize> {
    let mut pfd = libc::pollfd {
        fd: port.fd.as_raw_fd(),
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        match syscall!(libc::poll(&mut pfd, 1, -1)) {
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    debug_assert!((pfd.revents & libc::POLLNVAL) == 0);
    if (pfd.revents & libc::POLLHUP) != 0 {
        return Ok(0);
    }
    if (pfd.revents & libc::POLLERR) != 0 {
        return Err(Error::Io(io::Error::other("poll reported an error")));
    }
    match syscall!(libc::write(
        port.fd.as_raw_fd(),
        buf.as_ptr() as *const _,
        buf.len(),
    )) {
        Ok(n) => Ok(n as usize),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Per-transfer OS state. The fd backend keeps everything in the shared
/// record, so there is nothing here.
pub(crate) struct TransferIo;

impl TransferIo {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }
}

/// Register the port with the wait set. Called with the transfer mutex
/// held, both on first submission and when a continuous read re-arms.
pub(crate) fn start_read(inner: &Arc<TransferInner>, st: &mut TransferState) -> Result<()> {
    let port = st.port.as_ref().ok_or(Error::InvalidParam)?;
    let obj = WaitObject::readable(port.inner.fd.as_raw_fd());
    inner.ctx.prepare_add()?;
    let arc = inner.clone();
    inner.ctx.add(obj, move |wake| crate::reap(&arc, wake));
    Ok(())
}

/// The wait set reported the port readable; pull the bytes out.
pub(crate) fn complete_read(inner: &Arc<TransferInner>) -> (TransferStatus, usize) {
    let mut st = inner.state.lock().unwrap();
    let Some(port) = st.port.as_ref().map(|p| p.inner.clone()) else {
        return (TransferStatus::Error, 0);
    };
    let fd = port.fd.as_raw_fd();
    let len = st.buf.len();
    match syscall!(libc::read(fd, st.buf.as_mut_ptr() as *mut _, len)) {
        Ok(n) => {
            trace!(n, "serial read ready");
            (TransferStatus::Completed, n as usize)
        }
        // Spurious readiness; report an empty completion like a
        // zero-length read would.
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => (TransferStatus::Completed, 0),
        Err(_) => (TransferStatus::Error, 0),
    }
}

/// Queue the prepared cancellation handler. Called with the transfer
/// mutex held.
pub(crate) fn cancel(inner: &Arc<TransferInner>, st: &mut TransferState) {
    let Some(task) = st.cancel_task.take() else {
        return;
    };
    let Some(port) = st.port.as_ref() else {
        return;
    };
    let ctx = inner.ctx.clone();
    let obj = WaitObject::readable(port.inner.fd.as_raw_fd());
    task.submit(move || ctx.remove(obj));
}

pub(crate) fn devices() -> Result<Vec<DeviceInfo>> {
    let mut res = Vec::new();
    let entries = match fs::read_dir("/sys/class/tty") {
        Ok(entries) => entries,
        Err(_) => return Ok(res),
    };
    for entry in entries.flatten() {
        // Nodes without a `device` link are virtual consoles.
        if !entry.path().join("device").exists() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        res.push(DeviceInfo {
            path: format!("/dev/{name}"),
            name,
        });
    }
    res.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(res)
}
