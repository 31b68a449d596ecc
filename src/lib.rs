//! bladeRF Host Driver Library
//!
//! This library drives a bladeRF USB software defined radio from the host:
//! continuous RX/TX sample streaming over the bulk data endpoints, register
//! access to the onboard peripherals (RF transceiver, clock synthesizer,
//! VCTCXO trim DAC, FPGA GPIO) and in-field reprogramming of the device's
//! SPI flash.
//!
//! # Architecture
//!
//! The driver is organized in layers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SESSION LAYER                           │
//! │  Mode state machine  │  read / write  │  control(request)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    STREAMING ENGINE                          │
//! │  Slot pool  │  Ring admission  │  Completion handling        │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │   REGISTER PROTOCOL          │   FIRMWARE UPGRADE           │
//! │   16-byte framed packets     │   erase → write → verify     │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │                        USB LINK                              │
//! │  Control requests  │  Bulk requests  │  Async transfers      │
//! │           libusb backend (feature `rusb`) or a test double   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - **Bounded everything**: fixed slot pools, a fixed concurrency window,
//!   no allocation on the data path
//! - **Type-driven design**: directions, modes, peripherals and frames are
//!   value types with explicit encode/decode
//! - **No unsafe code**
//! - **Short critical sections**: ring locks are never held across a
//!   submission, a copy or a wait
//! - **Explicit error handling**: all fallible operations return `Result`

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// USB Link
///
/// The transport trait the driver consumes, vendor control requests and the
/// optional libusb backend.
pub mod usb;

/// Streaming Engine
///
/// Slot pools, ring admission and completion handling per direction.
pub mod stream;

/// Register Access Protocol
///
/// Framed single-register reads and writes.
pub mod protocol;

/// Firmware Upgrade
///
/// Flash erase, page write and verify.
pub mod firmware;

/// Device Session
///
/// Mode state machine and the public read/write/control surface.
pub mod session;

/// Error types
pub mod error;

/// Shared types used across modules
pub mod types;

/// Driver configuration and constants
pub mod config;

pub use error::{Error, Result};
pub use session::{ControlRequest, ControlResponse, Session};

/// Prelude module for common imports
pub mod prelude {
    //! Convenient re-exports for common types and traits.

    pub use crate::config::{StreamConfig, NUM_SLOTS, TRANSFER_SIZE};
    pub use crate::error::{Error, ProtocolError, Result, TransportError, UpgradeError, UpgradePhase};
    pub use crate::firmware::FirmwareImage;
    pub use crate::protocol::{Peripheral, RegisterRecord};
    pub use crate::session::{ControlRequest, ControlResponse, Session};
    pub use crate::types::*;
    pub use crate::usb::link::{Transfer, UsbLink};

    #[cfg(feature = "rusb")]
    pub use crate::usb::host::RusbLink;
}
