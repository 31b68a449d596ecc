//! USB Subsystem
//!
//! The narrow interface the driver core consumes from the USB stack:
//! - [`link`]: the link trait, asynchronous transfers and their completion
//! - [`control`]: vendor control-plane requests with bounded retry
//! - [`host`]: a libusb backend (feature `rusb`)

pub mod control;
pub mod link;

#[cfg(feature = "rusb")]
pub mod host;
