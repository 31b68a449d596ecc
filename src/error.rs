//! Error types
//!
//! Transport failures come from the USB link, protocol failures from a device
//! that answered with something unexpected. Everything surfaces through the
//! crate-wide [`Error`].

use core::fmt;

use thiserror::Error;

use crate::types::{Direction, Mode};

/// Result alias used throughout the crate
pub type Result<T> = core::result::Result<T, Error>;

/// Link-level failure reported by the USB transport
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Request did not complete in time
    #[error("timed out")]
    Timeout,
    /// Endpoint stalled
    #[error("endpoint stalled")]
    Stall,
    /// Device went away
    #[error("no such device")]
    NoDevice,
    /// Device sent more data than requested
    #[error("overflow")]
    Overflow,
    /// Resource busy
    #[error("busy")]
    Busy,
    /// Transfer was cancelled before completion
    #[error("cancelled")]
    Cancelled,
    /// Any other I/O failure
    #[error("i/o error")]
    Io,
}

/// Device answered, but not with what the protocol expects
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Fewer bytes than the exchange requires
    #[error("short response: expected {expected} bytes, got {actual}")]
    ShortResponse {
        /// Bytes expected
        expected: usize,
        /// Bytes received
        actual: usize,
    },
    /// Register frame did not start with the magic byte
    #[error("bad frame magic {0:#04x}")]
    BadMagic(u8),
    /// Mode byte carries a direction or peripheral that does not exist
    #[error("bad frame mode byte {0:#04x}")]
    BadMode(u8),
    /// Status word other than the expected success code
    #[error("unexpected status word {0:#x}")]
    UnexpectedStatus(u32),
    /// FPGA reported as unconfigured
    #[error("FPGA not configured")]
    FpgaNotConfigured,
}

/// Firmware upgrade phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradePhase {
    /// Sector erase
    Erase,
    /// Page programming
    Write,
    /// Read-back comparison
    Verify,
}

impl fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Erase => f.write_str("erase"),
            Self::Write => f.write_str("write"),
            Self::Verify => f.write_str("verify"),
        }
    }
}

/// Why an upgrade stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum UpgradeErrorKind {
    /// Link failure
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Unexpected device answer
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Read-back byte differs from the image
    #[error("expected byte {expected:#04x}, got {observed:#04x}")]
    Mismatch {
        /// Byte in the image
        expected: u8,
        /// Byte read back from flash
        observed: u8,
    },
}

/// Firmware upgrade failure with the exact point it stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("firmware upgrade stopped in {phase} phase at offset {offset:#010x}: {kind}")]
pub struct UpgradeError {
    /// Phase that failed
    pub phase: UpgradePhase,
    /// Flash byte offset (sector start for erase, page start or chunk start
    /// for write, mismatching byte for verify)
    pub offset: u32,
    /// Cause
    pub kind: UpgradeErrorKind,
}

impl UpgradeError {
    /// Flash page containing the failing offset
    #[must_use]
    pub const fn page(&self) -> u32 {
        self.offset / crate::config::FLASH_PAGE_SIZE as u32
    }

    /// Offset within the failing page
    #[must_use]
    pub const fn page_offset(&self) -> u32 {
        self.offset % crate::config::FLASH_PAGE_SIZE as u32
    }
}

/// Crate-wide error
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// USB link failure
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    /// Unexpected device answer
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    /// Operation not allowed in the current session mode
    #[error("{operation} not allowed in {mode} mode")]
    Mode {
        /// Mode the session was in
        mode: Mode,
        /// Operation that was refused
        operation: &'static str,
    },
    /// Streaming direction was disabled while the caller waited
    #[error("{0} stream disabled")]
    StreamDisabled(Direction),
    /// Wait interrupted before data or room became available
    #[error("interrupted")]
    Interrupted,
    /// Firmware upgrade failed
    #[error(transparent)]
    Upgrade(#[from] UpgradeError),
    /// Transfer buffer allocation failed
    #[error("buffer allocation failed")]
    AllocationFailed,
    /// Caller-supplied value out of range
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Link speed does not support the requested operation
    #[error("unsupported link speed")]
    UnsupportedSpeed,
}

impl Error {
    /// Build a mode error
    #[must_use]
    pub const fn mode(mode: Mode, operation: &'static str) -> Self {
        Self::Mode { mode, operation }
    }
}
