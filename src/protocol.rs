//! Register Access Protocol
//!
//! Single-register reads and writes to the onboard peripherals, carried in
//! fixed 16-byte frames over the control bulk endpoints.
//!
//! ```text
//!  byte 0     byte 1                         byte 2    byte 3
//! ┌────────┬───────────────────────────────┬─────────┬──────────┬─────────────┐
//! │ 'N'    │ dir[7:6] │ dev[5:4] │ cnt[3:0] │ address │ data/0xFF │ zero fill…  │
//! └────────┴───────────────────────────────┴─────────┴──────────┴─────────────┘
//! ```
//!
//! A read carries the placeholder `0xFF`; the device answers with the same
//! frame and the register value written over the placeholder.

use log::debug;

use crate::config::{
    endpoints, REGISTER_FRAME_LEN, REGISTER_MAGIC, REGISTER_READ_PLACEHOLDER,
    REGISTER_RESPONSE_ATTEMPTS, REGISTER_RESPONSE_TIMEOUT, USB_TIMEOUT,
};
use crate::error::{ProtocolError, Result, TransportError};
use crate::usb::link::UsbLink;

const COUNT_MASK: u8 = 0x0F;
const DEVICE_SHIFT: u8 = 4;
const DEVICE_MASK: u8 = 0x30;
const ACCESS_SHIFT: u8 = 6;
const ACCESS_MASK: u8 = 0xC0;

/// Minimum bytes in a register response: magic, mode, address, data
const RESPONSE_MIN_LEN: usize = 4;

/// Peripheral addressed by a register frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Peripheral {
    /// FPGA general purpose I/O
    Gpio,
    /// LMS6002D RF transceiver
    RfTransceiver,
    /// Trim DAC of the reference oscillator
    Vctcxo,
    /// Si5338 clock synthesizer
    ClockSynth,
}

impl Peripheral {
    /// Two-bit selector on the wire
    #[must_use]
    pub const fn selector(self) -> u8 {
        match self {
            Self::Gpio => 0,
            Self::RfTransceiver => 1,
            Self::Vctcxo => 2,
            Self::ClockSynth => 3,
        }
    }

    /// Peripheral for a two-bit selector
    #[must_use]
    pub const fn from_selector(selector: u8) -> Option<Self> {
        match selector {
            0 => Some(Self::Gpio),
            1 => Some(Self::RfTransceiver),
            2 => Some(Self::Vctcxo),
            3 => Some(Self::ClockSynth),
            _ => None,
        }
    }
}

/// Register access direction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Read a register
    Read,
    /// Write a register
    Write,
}

impl Access {
    const fn bits(self) -> u8 {
        match self {
            Self::Read => 2,
            Self::Write => 1,
        }
    }

    const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            2 => Some(Self::Read),
            1 => Some(Self::Write),
            _ => None,
        }
    }
}

/// Decoded mode byte
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketMode {
    /// Read or write
    pub access: Access,
    /// Target peripheral
    pub peripheral: Peripheral,
    /// Number of address/data pairs (always 1 for this driver)
    pub count: u8,
}

impl PacketMode {
    /// Pack into the wire byte
    #[must_use]
    pub const fn encode(self) -> u8 {
        (self.access.bits() << ACCESS_SHIFT)
            | ((self.peripheral.selector() << DEVICE_SHIFT) & DEVICE_MASK)
            | (self.count & COUNT_MASK)
    }

    /// Unpack a wire byte
    ///
    /// # Errors
    ///
    /// [`ProtocolError::BadMode`] if the direction bits are not read or write.
    pub fn decode(byte: u8) -> core::result::Result<Self, ProtocolError> {
        let access = Access::from_bits((byte & ACCESS_MASK) >> ACCESS_SHIFT)
            .ok_or(ProtocolError::BadMode(byte))?;
        let peripheral = Peripheral::from_selector((byte & DEVICE_MASK) >> DEVICE_SHIFT)
            .ok_or(ProtocolError::BadMode(byte))?;
        Ok(Self {
            access,
            peripheral,
            count: byte & COUNT_MASK,
        })
    }
}

/// One register record: an address and its data byte
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterRecord {
    /// Register address
    pub address: u8,
    /// Register value
    pub data: u8,
}

/// A single-register request or response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterPacket {
    /// Target peripheral
    pub peripheral: Peripheral,
    /// Read or write
    pub access: Access,
    /// Register address
    pub address: u8,
    /// Value to write, or the value read back
    pub data: u8,
}

impl RegisterPacket {
    /// Read request for one register
    #[must_use]
    pub const fn read(peripheral: Peripheral, address: u8) -> Self {
        Self {
            peripheral,
            access: Access::Read,
            address,
            data: REGISTER_READ_PLACEHOLDER,
        }
    }

    /// Write request for one register
    #[must_use]
    pub const fn write(peripheral: Peripheral, address: u8, data: u8) -> Self {
        Self {
            peripheral,
            access: Access::Write,
            address,
            data,
        }
    }

    /// Mode byte for this packet
    #[must_use]
    pub const fn mode(&self) -> PacketMode {
        PacketMode {
            access: self.access,
            peripheral: self.peripheral,
            count: 1,
        }
    }

    /// Address and data as a record
    #[must_use]
    pub const fn record(&self) -> RegisterRecord {
        RegisterRecord {
            address: self.address,
            data: self.data,
        }
    }

    /// Serialize to a full zero-padded frame
    #[must_use]
    pub const fn encode(&self) -> [u8; REGISTER_FRAME_LEN] {
        let mut frame = [0u8; REGISTER_FRAME_LEN];
        frame[0] = REGISTER_MAGIC;
        frame[1] = self.mode().encode();
        frame[2] = self.address;
        frame[3] = match self.access {
            Access::Read => REGISTER_READ_PLACEHOLDER,
            Access::Write => self.data,
        };
        frame
    }

    /// Parse a frame
    ///
    /// Only the first four bytes are significant.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::ShortResponse`] for fewer than four bytes
    /// - [`ProtocolError::BadMagic`] if the first byte is not `'N'`
    /// - [`ProtocolError::BadMode`] for an unknown direction
    pub fn decode(frame: &[u8]) -> core::result::Result<Self, ProtocolError> {
        if frame.len() < RESPONSE_MIN_LEN {
            return Err(ProtocolError::ShortResponse {
                expected: RESPONSE_MIN_LEN,
                actual: frame.len(),
            });
        }
        if frame[0] != REGISTER_MAGIC {
            return Err(ProtocolError::BadMagic(frame[0]));
        }
        let mode = PacketMode::decode(frame[1])?;
        Ok(Self {
            peripheral: mode.peripheral,
            access: mode.access,
            address: frame[2],
            data: frame[3],
        })
    }
}

/// Send a register packet and collect the device's answer
///
/// The request goes out on the control OUT endpoint with the normal timeout.
/// The response is polled on the control IN endpoint with a short timeout;
/// only timeouts are retried, any other failure ends the exchange.
///
/// Returns the address and data the device echoed back.
///
/// # Errors
///
/// Transport failure on send, or on the last response attempt; protocol
/// error if the response is malformed.
pub fn transact<L: UsbLink + ?Sized>(link: &L, packet: &RegisterPacket) -> Result<RegisterRecord> {
    let request = packet.encode();
    link.bulk_out(endpoints::CONTROL_OUT, &request, USB_TIMEOUT)?;

    let mut response = [0u8; REGISTER_FRAME_LEN];

    let mut attempts = REGISTER_RESPONSE_ATTEMPTS;
    let received = loop {
        match link.bulk_in(endpoints::CONTROL_IN, &mut response, REGISTER_RESPONSE_TIMEOUT) {
            Ok(n) => break n,
            Err(TransportError::Timeout) if attempts > 1 => {
                attempts -= 1;
                debug!("register response timed out, {attempts} tries left");
            }
            Err(err) => return Err(err.into()),
        }
    };
    let answer = RegisterPacket::decode(&response[..received.min(REGISTER_FRAME_LEN)])?;
    Ok(answer.record())
}
