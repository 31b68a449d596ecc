//! Driver configuration and device constants
//!
//! This module defines compile-time constants for the bladeRF USB interface.
//! Endpoint numbers, request types, timeouts, ring geometry and flash layout
//! are centralized here. The only runtime knob is [`StreamConfig`], which
//! sizes the per-direction transfer rings.

use core::time::Duration;

use crate::error::{Error, Result};

/// USB vendor ID (Nuand)
pub const USB_VID: u16 = 0x1d50;

/// USB product ID (bladeRF)
pub const USB_PID: u16 = 0x6066;

/// Vendor request type, host to device
pub const USB_TYPE_OUT: u8 = 0x40;

/// Vendor request type, device to host
pub const USB_TYPE_IN: u8 = 0xC0;

/// Default timeout for control and bulk requests
pub const USB_TIMEOUT: Duration = Duration::from_millis(1000);

/// Flash sector erase timeout (erases are slow)
pub const FLASH_ERASE_TIMEOUT: Duration = Duration::from_millis(100_000);

/// Attempts made for a control-plane request before the transport error is surfaced
pub const CONTROL_ATTEMPTS: u32 = 3;

/// Number of transfer slots per direction
pub const NUM_SLOTS: usize = 1024;

/// Size of one streaming transfer in bytes
pub const TRANSFER_SIZE: usize = 4096;

/// Default number of transfers simultaneously outstanding with the link
pub const CONCURRENCY_WINDOW: usize = 8;

/// Upper bound on the concurrency window (sizes the in-flight tracking set)
pub const MAX_WINDOW: usize = 32;

/// Flash page size in bytes
pub const FLASH_PAGE_SIZE: usize = 256;

/// Flash erase sector size in bytes
pub const FLASH_SECTOR_SIZE: usize = 64 * 1024;

/// Flash control transfer size on a high-speed link
pub const FLASH_CHUNK_HIGH_SPEED: usize = 64;

/// Flash control transfer size on a super-speed link
pub const FLASH_CHUNK_SUPER_SPEED: usize = 256;

/// Status word returned by a successful sector erase
pub const FLASH_ERASE_OK: u32 = 1;

/// Register frame length on the wire
pub const REGISTER_FRAME_LEN: usize = 16;

/// Register frame magic byte
pub const REGISTER_MAGIC: u8 = b'N';

/// Placeholder data byte sent with register reads
pub const REGISTER_READ_PLACEHOLDER: u8 = 0xFF;

/// Attempts made to collect a register response that timed out
pub const REGISTER_RESPONSE_ATTEMPTS: u32 = 3;

/// Timeout for a single register response poll
pub const REGISTER_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1);

/// Endpoint assignments
pub mod endpoints {
    //! Bulk endpoint addresses

    /// Streaming samples, host to device
    pub const STREAM_OUT: u8 = 0x01;

    /// Streaming samples, device to host
    pub const STREAM_IN: u8 = 0x81;

    /// Control and register frames, host to device
    pub const CONTROL_OUT: u8 = 0x02;

    /// Control and register frames, device to host
    pub const CONTROL_IN: u8 = 0x82;
}

/// Per-direction transfer ring sizing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Number of slots in the ring (power of two)
    pub slots: usize,
    /// Bytes per transfer
    pub transfer_size: usize,
    /// Maximum transfers outstanding with the link
    pub window: usize,
}

impl StreamConfig {
    /// Create the default configuration
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: NUM_SLOTS,
            transfer_size: TRANSFER_SIZE,
            window: CONCURRENCY_WINDOW,
        }
    }

    /// Set the slot count
    #[must_use]
    pub const fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }

    /// Set the transfer size
    #[must_use]
    pub const fn with_transfer_size(mut self, transfer_size: usize) -> Self {
        self.transfer_size = transfer_size;
        self
    }

    /// Set the concurrency window
    #[must_use]
    pub const fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Check the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the slot count is not a power
    /// of two, does not fit a `u16` slot id, the window is outside
    /// `1..=MAX_WINDOW`, or the transfer size is zero.
    pub fn validate(&self) -> Result<()> {
        if !self.slots.is_power_of_two() {
            return Err(Error::InvalidArgument("slot count must be a power of two"));
        }
        if self.slots > usize::from(u16::MAX) + 1 {
            return Err(Error::InvalidArgument("slot count exceeds 65536"));
        }
        if self.window == 0 || self.window > MAX_WINDOW {
            return Err(Error::InvalidArgument("concurrency window out of range"));
        }
        if self.transfer_size == 0 {
            return Err(Error::InvalidArgument("transfer size must be non-zero"));
        }
        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new()
    }
}
