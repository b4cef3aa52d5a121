cfg_if::cfg_if! {
    if #[cfg(windows)] {
        mod windows;
        pub(crate) use windows::*;
    } else {
        mod usbfs;
        pub(crate) use usbfs::*;
    }
}
