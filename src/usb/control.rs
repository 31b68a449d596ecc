//! Vendor control-plane requests
//!
//! Fixed-size little-endian exchanges identified by a command code. Transport
//! failures are retried up to [`CONTROL_ATTEMPTS`] times; a device that
//! answers with the wrong amount of data is reported at once.

use log::warn;

use crate::config::{CONTROL_ATTEMPTS, USB_TIMEOUT};
use crate::error::{ProtocolError, Result, TransportError};
use crate::types::Version;
use crate::usb::link::UsbLink;

/// Vendor request codes understood by the device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Read firmware version
    QueryVersion = 0,
    /// Read FPGA configuration status
    QueryFpgaStatus = 1,
    /// Enter FPGA programming
    BeginProgramming = 2,
    /// Enable or disable the RX RF path
    RfRx = 4,
    /// Enable or disable the TX RF path
    RfTx = 5,
    /// Read from SPI flash
    FlashRead = 100,
    /// Write to SPI flash
    FlashWrite = 101,
    /// Erase one SPI flash sector
    FlashErase = 102,
}

impl Command {
    /// Request code on the wire
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Retry a transport operation up to `attempts` times
///
/// Only transport errors are retried; the last one is returned when every
/// attempt failed.
pub(crate) fn with_retries<T>(
    what: &str,
    attempts: u32,
    mut op: impl FnMut() -> core::result::Result<T, TransportError>,
) -> core::result::Result<T, TransportError> {
    let mut left = attempts.max(1);
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                left -= 1;
                warn!("{what} failed with {err}, {left} tries left");
                if left == 0 {
                    return Err(err);
                }
            }
        }
    }
}

/// Control-plane request helper bound to a link
pub struct ControlPlane<'a, L: UsbLink + ?Sized> {
    link: &'a L,
}

impl<'a, L: UsbLink + ?Sized> ControlPlane<'a, L> {
    /// Wrap a link
    #[must_use]
    pub const fn new(link: &'a L) -> Self {
        Self { link }
    }

    /// Receive a response for a command into `buf`
    ///
    /// # Errors
    ///
    /// Transport error after all attempts failed.
    pub fn receive(&self, command: Command, buf: &mut [u8]) -> Result<usize> {
        let n = with_retries("control IN request", CONTROL_ATTEMPTS, || {
            self.link.control_in(command.code(), 0, 0, buf, USB_TIMEOUT)
        })?;
        Ok(n)
    }

    /// Send a command with a payload
    ///
    /// # Errors
    ///
    /// Transport error after all attempts failed.
    pub fn send(&self, command: Command, payload: &[u8]) -> Result<usize> {
        let n = with_retries("control OUT request", CONTROL_ATTEMPTS, || {
            self.link.control_out(command.code(), 0, 0, payload, USB_TIMEOUT)
        })?;
        Ok(n)
    }

    /// Receive a single little-endian word
    ///
    /// # Errors
    ///
    /// Transport error after retries, or [`ProtocolError::ShortResponse`].
    pub fn receive_word(&self, command: Command) -> Result<u32> {
        let mut buf = [0u8; 4];
        let n = self.receive(command, &mut buf)?;
        if n != buf.len() {
            return Err(ProtocolError::ShortResponse {
                expected: buf.len(),
                actual: n,
            }
            .into());
        }
        Ok(u32::from_le_bytes(buf))
    }

    /// Send a single little-endian word
    ///
    /// # Errors
    ///
    /// Transport error after retries, or [`ProtocolError::ShortResponse`]
    /// if the device accepted fewer bytes.
    pub fn send_word(&self, command: Command, value: u32) -> Result<()> {
        let payload = value.to_le_bytes();
        let n = self.send(command, &payload)?;
        if n != payload.len() {
            return Err(ProtocolError::ShortResponse {
                expected: payload.len(),
                actual: n,
            }
            .into());
        }
        Ok(())
    }

    /// Query the firmware version
    ///
    /// # Errors
    ///
    /// Transport error after retries, or a short response.
    pub fn query_version(&self) -> Result<Version> {
        let mut buf = [0u8; 4];
        let n = self.receive(Command::QueryVersion, &mut buf)?;
        if n != buf.len() {
            return Err(ProtocolError::ShortResponse {
                expected: buf.len(),
                actual: n,
            }
            .into());
        }
        Ok(Version::from_le_bytes(buf))
    }

    /// Query the FPGA configuration status word (non-zero when configured)
    ///
    /// # Errors
    ///
    /// Transport error after retries, or a short response.
    pub fn query_fpga_status(&self) -> Result<u32> {
        self.receive_word(Command::QueryFpgaStatus)
    }
}
