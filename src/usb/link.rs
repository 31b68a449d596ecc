//! USB link abstraction
//!
//! The driver never talks to libusb (or a kernel) directly. Everything it
//! needs from the transport is expressed by [`UsbLink`]: synchronous control
//! and bulk requests, an interface switch, and asynchronous streaming
//! transfers that finish through [`Transfer::complete`].

use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use crate::error::TransportError;
use crate::types::{Direction, Interface, LinkSpeed};

/// Transfer buffer owned by a ring slot
pub type Buffer = Box<[u8]>;

/// Receiver of finished transfers
///
/// Implemented by the streaming engine. Called from whatever context the
/// link finishes transfers on.
pub trait CompletionSink: Send + Sync {
    /// Take back a finished transfer
    fn complete(&self, transfer: Transfer, result: Result<usize, TransportError>);
}

/// One asynchronous streaming transfer
///
/// Owns its slot's buffer while the link holds it. Dropping a transfer
/// without completing it leaks the slot until the ring is reset, so links
/// must always call [`Transfer::complete`].
pub struct Transfer {
    direction: Direction,
    slot: u16,
    epoch: u32,
    buffer: Buffer,
    sink: Arc<dyn CompletionSink>,
}

impl Transfer {
    pub(crate) fn new(
        direction: Direction,
        slot: u16,
        epoch: u32,
        buffer: Buffer,
        sink: Arc<dyn CompletionSink>,
    ) -> Self {
        Self {
            direction,
            slot,
            epoch,
            buffer,
            sink,
        }
    }

    /// Direction of the transfer
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Bulk endpoint the transfer targets
    #[must_use]
    pub const fn endpoint(&self) -> u8 {
        self.direction.endpoint()
    }

    /// Ring slot the transfer belongs to
    #[must_use]
    pub const fn slot(&self) -> u16 {
        self.slot
    }

    /// Data to send (TX) or space to receive into (RX)
    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Mutable access for the link to fill RX data
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Hand the transfer back to its ring
    ///
    /// `result` is the byte count moved, or the reason the transfer failed.
    /// Use [`TransportError::Cancelled`] for transfers killed by
    /// [`UsbLink::cancel_all`].
    pub fn complete(self, result: Result<usize, TransportError>) {
        let sink = Arc::clone(&self.sink);
        sink.complete(self, result);
    }

    pub(crate) const fn epoch(&self) -> u32 {
        self.epoch
    }

    pub(crate) fn into_buffer(self) -> Buffer {
        self.buffer
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("direction", &self.direction)
            .field("slot", &self.slot)
            .field("epoch", &self.epoch)
            .field("len", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

/// Submission refused by the link; the transfer comes back untouched
#[derive(Debug)]
pub struct Rejected {
    /// The refused transfer
    pub transfer: Transfer,
    /// Why it was refused
    pub error: TransportError,
}

/// Transport used by the driver
///
/// Control and bulk requests are synchronous. Streaming transfers are
/// asynchronous: [`UsbLink::submit`] queues one and returns, and the link
/// later calls [`Transfer::complete`] from its own context.
pub trait UsbLink: Send + Sync + 'static {
    /// Negotiated link speed
    fn speed(&self) -> LinkSpeed;

    /// Switch the device to the interface backing a mode
    ///
    /// # Errors
    ///
    /// Returns the transport failure if the switch did not happen.
    fn set_interface(&self, interface: Interface) -> Result<(), TransportError>;

    /// Vendor control request, device to host
    ///
    /// # Errors
    ///
    /// Returns the transport failure.
    fn control_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Vendor control request, host to device
    ///
    /// # Errors
    ///
    /// Returns the transport failure.
    fn control_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Synchronous bulk read
    ///
    /// # Errors
    ///
    /// Returns the transport failure.
    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration)
        -> Result<usize, TransportError>;

    /// Synchronous bulk write
    ///
    /// # Errors
    ///
    /// Returns the transport failure.
    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration)
        -> Result<usize, TransportError>;

    /// Queue an asynchronous streaming transfer
    ///
    /// # Errors
    ///
    /// Returns the transfer with the reason if the link refused it. A
    /// refused transfer must not be completed.
    fn submit(&self, transfer: Transfer) -> Result<(), Rejected>;

    /// Cancel every outstanding transfer in one direction
    ///
    /// Must not return until every cancelled transfer has been completed.
    fn cancel_all(&self, direction: Direction);
}

impl<L: UsbLink> UsbLink for Arc<L> {
    fn speed(&self) -> LinkSpeed {
        (**self).speed()
    }

    fn set_interface(&self, interface: Interface) -> Result<(), TransportError> {
        (**self).set_interface(interface)
    }

    fn control_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        (**self).control_in(request, value, index, buf, timeout)
    }

    fn control_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        (**self).control_out(request, value, index, data, timeout)
    }

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).bulk_in(endpoint, buf, timeout)
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).bulk_out(endpoint, data, timeout)
    }

    fn submit(&self, transfer: Transfer) -> Result<(), Rejected> {
        (**self).submit(transfer)
    }

    fn cancel_all(&self, direction: Direction) {
        (**self).cancel_all(direction);
    }
}
