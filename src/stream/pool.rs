//! Transfer slot pool
//!
//! A fixed arena of pre-allocated transfer buffers addressed by slot index.
//! Each slot carries a tagged state that says who owns its buffer right now.

use core::mem;

use crate::error::{Error, Result};
use crate::usb::link::Buffer;

/// Ownership state of one slot
#[derive(Debug)]
pub(crate) enum SlotState {
    /// Owned by the ring, available for admission
    Free(Buffer),
    /// Buffer lent to a reader or writer that is copying data
    Claimed,
    /// TX data deposited and marked valid, awaiting submission
    Queued(Buffer),
    /// Buffer owned by the link
    InFlight,
    /// RX data completed, awaiting a reader
    Ready(Buffer),
    /// RX transfer failed; skipped by the reader
    Dropped(Buffer),
}

impl SlotState {
    pub(crate) const fn is_free(&self) -> bool {
        matches!(self, Self::Free(_))
    }
}

/// Fixed set of equally sized transfer slots
#[derive(Debug)]
pub(crate) struct SlotPool {
    slots: Vec<SlotState>,
}

impl SlotPool {
    /// Allocate `count` zeroed buffers of `transfer_size` bytes
    ///
    /// Any buffers allocated before a failure are released on return.
    pub(crate) fn allocate(count: usize, transfer_size: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(count)
            .map_err(|_| Error::AllocationFailed)?;

        for _ in 0..count {
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(transfer_size)
                .map_err(|_| Error::AllocationFailed)?;
            buffer.resize(transfer_size, 0);
            slots.push(SlotState::Free(buffer.into_boxed_slice()));
        }

        Ok(Self { slots })
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn state(&self, index: usize) -> &SlotState {
        &self.slots[index]
    }

    /// Replace a slot's state, returning the old one
    pub(crate) fn replace(&mut self, index: usize, state: SlotState) -> SlotState {
        mem::replace(&mut self.slots[index], state)
    }

    /// Return every buffer the ring still holds to `Free`
    ///
    /// Slots whose buffer is with the link or a caller keep their state and
    /// are returned when that party hands the buffer back.
    pub(crate) fn reclaim_all(&mut self) {
        for slot in &mut self.slots {
            let state = mem::replace(slot, SlotState::Claimed);
            *slot = match state {
                SlotState::Queued(buf) | SlotState::Ready(buf) | SlotState::Dropped(buf) => {
                    SlotState::Free(buf)
                }
                other => other,
            };
        }
    }

    /// Count slots whose buffer is currently held by the ring
    #[cfg(test)]
    pub(crate) fn held(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s, SlotState::Claimed | SlotState::InFlight))
            .count()
    }
}
