//! Shared types used across the driver
//!
//! Small value types naming directions, interfaces, session modes and link
//! speeds, so the rest of the crate never passes bare integers around.

use core::fmt;

use crate::config::{endpoints, FLASH_CHUNK_HIGH_SPEED, FLASH_CHUNK_SUPER_SPEED};

/// Streaming direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host (samples received)
    Rx,
    /// Host to device (samples transmitted)
    Tx,
}

impl Direction {
    /// Streaming bulk endpoint for this direction
    #[must_use]
    pub const fn endpoint(self) -> u8 {
        match self {
            Self::Rx => endpoints::STREAM_IN,
            Self::Tx => endpoints::STREAM_OUT,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rx => f.write_str("RX"),
            Self::Tx => f.write_str("TX"),
        }
    }
}

/// USB interface the device exposes for each operating mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interface {
    /// FPGA configuration and register frames
    Config,
    /// RF sample streaming
    Streaming,
    /// SPI flash access
    Firmware,
}

impl Interface {
    /// Interface number
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Config => 0,
            Self::Streaming => 1,
            Self::Firmware => 2,
        }
    }
}

/// Session operating mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Mode {
    /// Created, slot pools not started
    #[default]
    Idle,
    /// Configuration interface active
    Config,
    /// Streaming interface active
    Streaming,
    /// Firmware (flash) interface active
    Firmware,
    /// Closed; no further operations
    Terminated,
}

impl Mode {
    /// Interface backing this mode, if any
    #[must_use]
    pub const fn interface(self) -> Option<Interface> {
        match self {
            Self::Config => Some(Interface::Config),
            Self::Streaming => Some(Interface::Streaming),
            Self::Firmware => Some(Interface::Firmware),
            Self::Idle | Self::Terminated => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Config => "config",
            Self::Streaming => "streaming",
            Self::Firmware => "firmware",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Negotiated USB link speed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkSpeed {
    /// USB 1.1 full speed
    Full,
    /// USB 2.0 high speed
    High,
    /// USB 3.0 super speed
    Super,
}

impl LinkSpeed {
    /// Control transfer size used for flash page access
    ///
    /// Flash access is only supported on high- and super-speed links.
    #[must_use]
    pub const fn flash_chunk_size(self) -> Option<usize> {
        match self {
            Self::High => Some(FLASH_CHUNK_HIGH_SPEED),
            Self::Super => Some(FLASH_CHUNK_SUPER_SPEED),
            Self::Full => None,
        }
    }
}

/// Firmware version reported by the device
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
}

impl Version {
    /// Decode the little-endian wire form
    #[must_use]
    pub const fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self {
            major: u16::from_le_bytes([bytes[0], bytes[1]]),
            minor: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Snapshot of one direction's ring bookkeeping
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStatus {
    /// Slots in the ring
    pub capacity: usize,
    /// Concurrency window
    pub window: usize,
    /// Next slot to admit
    pub producer: usize,
    /// Next slot to consume
    pub consumer: usize,
    /// Transfers outstanding with the link
    pub in_flight: usize,
    /// Completed RX slots awaiting a reader, or queued TX slots awaiting submission
    pub ready: usize,
}
