//! Portable asynchronous I/O core for device access.
//!
//! `devio` multiplexes many in-flight device operations over a single
//! waiting thread: a wait-set dispatcher parks on a bounded set of kernel
//! wait objects and invokes per-object callbacks on readiness, while a
//! loop token guarantees at most one driving thread at a time. USB and
//! serial backends build their transfer engines on the same primitives,
//! so synchronous waits, callbacks, events and timers all wake through
//! one mechanism.
//!
//! ```no_run
//! use devio::dispatch::Context;
//! use devio::usb::UsbContext;
//!
//! fn main() -> devio::dispatch::Result<()> {
//!     let ctx = Context::with_worker()?;
//!     let usb = UsbContext::new(&ctx)?;
//!     for dev in usb.devices()? {
//!         let desc = dev.descriptor();
//!         println!("{:04x}:{:04x}", desc.id_vendor, desc.id_product);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

#[doc(inline)]
pub use devio_dispatch as dispatch;

#[cfg(feature = "serial")]
#[doc(inline)]
pub use devio_serial as serial;

#[cfg(feature = "usb")]
#[doc(inline)]
pub use devio_usb as usb;
