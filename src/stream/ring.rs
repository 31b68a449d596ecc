//! Ring index and admission bookkeeping
//!
//! Pure, lock-free state for one direction: producer/consumer cursors over
//! the slot pool, the in-flight and ready/pending counters, and the set of
//! slots currently with the link. The owning channel wraps it in a lock and
//! keeps every call O(1) (except [`Ring::reset`]).
//!
//! RX slots move `Free → InFlight → Ready → Claimed → Free`; TX slots move
//! `Free → Claimed → Queued → InFlight → Free`.

use heapless::Vec;

use crate::config::MAX_WINDOW;
use crate::error::TransportError;
use crate::stream::pool::{SlotPool, SlotState};
use crate::types::{Direction, RingStatus};
use crate::usb::link::Buffer;

/// A slot buffer lent out of the ring
#[derive(Debug)]
pub(crate) struct Claim {
    pub(crate) slot: u16,
    pub(crate) epoch: u32,
    pub(crate) buffer: Buffer,
}

/// What a completion did to the ring
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Completion {
    /// Transfer succeeded with this many bytes
    Accepted(usize),
    /// Transfer failed; slot returned to circulation
    Failed(TransportError),
    /// Transfer was cancelled
    Cancelled,
    /// Transfer predates the last reset, or was never tracked
    Stale,
}

/// Per-direction ring state
#[derive(Debug)]
pub(crate) struct Ring {
    direction: Direction,
    pool: SlotPool,
    mask: usize,
    window: usize,
    producer: usize,
    consumer: usize,
    in_flight: usize,
    /// RX: completed slots awaiting a reader. TX: deposited slots awaiting submission.
    ready: usize,
    /// RX slots that completed with an error and still sit in FIFO order
    dropped: usize,
    tracking: Vec<u16, MAX_WINDOW>,
    epoch: u32,
    pumping: bool,
    repump: bool,
}

impl Ring {
    /// Build a ring over a pool whose length is a power of two
    pub(crate) fn new(direction: Direction, pool: SlotPool, window: usize) -> Self {
        debug_assert!(pool.len().is_power_of_two());
        let mask = pool.len() - 1;
        Self {
            direction,
            pool,
            mask,
            window: window.min(MAX_WINDOW),
            producer: 0,
            consumer: 0,
            in_flight: 0,
            ready: 0,
            dropped: 0,
            tracking: Vec::new(),
            epoch: 0,
            pumping: false,
            repump: false,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.pool.len()
    }

    pub(crate) const fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub(crate) fn status(&self) -> RingStatus {
        RingStatus {
            capacity: self.capacity(),
            window: self.window,
            producer: self.producer,
            consumer: self.consumer,
            in_flight: self.in_flight,
            ready: self.ready,
        }
    }

    const fn next(&self, index: usize) -> usize {
        (index + 1) & self.mask
    }

    const fn prev(&self, index: usize) -> usize {
        index.wrapping_sub(1) & self.mask
    }

    #[allow(clippy::cast_possible_truncation)]
    fn lend(&mut self, index: usize, buffer: Buffer) -> Claim {
        Claim {
            slot: index as u16,
            epoch: self.epoch,
            buffer,
        }
    }

    fn track(&mut self, slot: u16) {
        // The window is capped at MAX_WINDOW, so the set never overflows.
        let pushed = self.tracking.push(slot);
        debug_assert!(pushed.is_ok());
    }

    fn untrack(&mut self, slot: u16) -> bool {
        match self.tracking.iter().position(|&s| s == slot) {
            Some(pos) => {
                self.tracking.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Take the next slot to hand to the link, if the window and ring allow
    pub(crate) fn admit(&mut self) -> Option<Claim> {
        if self.in_flight >= self.window {
            return None;
        }
        match self.direction {
            Direction::Rx => self.admit_rx(),
            Direction::Tx => self.admit_tx(),
        }
    }

    fn admit_rx(&mut self) -> Option<Claim> {
        if self.in_flight + self.ready + self.dropped >= self.capacity() {
            return None;
        }
        let index = self.producer;
        if !self.pool.state(index).is_free() {
            return None;
        }
        let SlotState::Free(buffer) = self.pool.replace(index, SlotState::InFlight) else {
            return None;
        };
        self.producer = self.next(index);
        self.in_flight += 1;
        let claim = self.lend(index, buffer);
        self.track(claim.slot);
        Some(claim)
    }

    fn admit_tx(&mut self) -> Option<Claim> {
        let index = self.consumer;
        if !matches!(self.pool.state(index), SlotState::Queued(_)) {
            return None;
        }
        let SlotState::Queued(buffer) = self.pool.replace(index, SlotState::InFlight) else {
            return None;
        };
        self.consumer = self.next(index);
        self.ready -= 1;
        self.in_flight += 1;
        let claim = self.lend(index, buffer);
        self.track(claim.slot);
        Some(claim)
    }

    /// Undo an admission the link refused
    ///
    /// Only valid for the most recent admission; the pump serializes
    /// admissions so nothing else can have moved the cursor since.
    pub(crate) fn unadmit(&mut self, slot: u16, epoch: u32, buffer: Buffer) {
        let index = usize::from(slot);
        if epoch != self.epoch || !self.untrack(slot) {
            if matches!(self.pool.state(index), SlotState::InFlight) {
                self.pool.replace(index, SlotState::Free(buffer));
            }
            return;
        }
        self.in_flight -= 1;
        match self.direction {
            Direction::Rx => {
                debug_assert_eq!(self.prev(self.producer), index);
                self.producer = index;
                self.pool.replace(index, SlotState::Free(buffer));
            }
            Direction::Tx => {
                debug_assert_eq!(self.prev(self.consumer), index);
                self.consumer = index;
                self.ready += 1;
                self.pool.replace(index, SlotState::Queued(buffer));
            }
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Book a finished transfer and take its buffer back
    pub(crate) fn complete(
        &mut self,
        slot: u16,
        epoch: u32,
        buffer: Buffer,
        result: Result<usize, TransportError>,
    ) -> Completion {
        let index = usize::from(slot);
        if index >= self.capacity() {
            return Completion::Stale;
        }
        if epoch != self.epoch || !self.untrack(slot) {
            if matches!(self.pool.state(index), SlotState::InFlight) {
                self.pool.replace(index, SlotState::Free(buffer));
            }
            return Completion::Stale;
        }
        self.in_flight -= 1;

        match (self.direction, result) {
            (Direction::Rx, Ok(n)) => {
                self.pool.replace(index, SlotState::Ready(buffer));
                self.ready += 1;
                Completion::Accepted(n)
            }
            (Direction::Rx, Err(err)) => {
                self.pool.replace(index, SlotState::Dropped(buffer));
                self.dropped += 1;
                if err == TransportError::Cancelled {
                    Completion::Cancelled
                } else {
                    Completion::Failed(err)
                }
            }
            (Direction::Tx, result) => {
                self.pool.replace(index, SlotState::Free(buffer));
                match result {
                    Ok(n) => Completion::Accepted(n),
                    Err(TransportError::Cancelled) => Completion::Cancelled,
                    Err(err) => Completion::Failed(err),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Caller side
    // ------------------------------------------------------------------

    /// Claim the oldest completed RX slot
    ///
    /// Failed slots at the head are recycled on the way.
    pub(crate) fn claim_rx(&mut self) -> Option<Claim> {
        loop {
            let index = self.consumer;
            match self.pool.state(index) {
                SlotState::Dropped(_) => {
                    if let SlotState::Dropped(buffer) = self.pool.replace(index, SlotState::Claimed) {
                        self.pool.replace(index, SlotState::Free(buffer));
                    }
                    self.dropped -= 1;
                    self.consumer = self.next(index);
                }
                SlotState::Ready(_) => {
                    let SlotState::Ready(buffer) = self.pool.replace(index, SlotState::Claimed) else {
                        return None;
                    };
                    self.ready -= 1;
                    self.consumer = self.next(index);
                    return Some(self.lend(index, buffer));
                }
                _ => return None,
            }
        }
    }

    /// Return a buffer lent by [`Ring::claim_rx`]
    pub(crate) fn release(&mut self, claim: Claim) {
        let index = usize::from(claim.slot);
        if matches!(self.pool.state(index), SlotState::Claimed) {
            self.pool.replace(index, SlotState::Free(claim.buffer));
        }
    }

    /// Reserve the next TX producer slot for a writer
    pub(crate) fn reserve_tx(&mut self) -> Option<Claim> {
        let index = self.producer;
        if self.ready + self.in_flight >= self.capacity() || !self.pool.state(index).is_free() {
            return None;
        }
        let SlotState::Free(buffer) = self.pool.replace(index, SlotState::Claimed) else {
            return None;
        };
        self.producer = self.next(index);
        self.ready += 1;
        Some(self.lend(index, buffer))
    }

    /// Mark a reserved TX slot valid
    ///
    /// A claim from before the last reset only returns its buffer.
    pub(crate) fn commit_tx(&mut self, claim: Claim) {
        let index = usize::from(claim.slot);
        if !matches!(self.pool.state(index), SlotState::Claimed) {
            return;
        }
        let state = if claim.epoch == self.epoch {
            SlotState::Queued(claim.buffer)
        } else {
            SlotState::Free(claim.buffer)
        };
        self.pool.replace(index, state);
    }

    // ------------------------------------------------------------------
    // Pump serialization
    // ------------------------------------------------------------------

    /// Try to become the submitting context; otherwise ask it to go again
    pub(crate) fn begin_pump(&mut self) -> bool {
        if self.pumping {
            self.repump = true;
            false
        } else {
            self.pumping = true;
            self.repump = false;
            true
        }
    }

    /// Whether some context currently holds the submitting role
    pub(crate) const fn is_pumping(&self) -> bool {
        self.pumping
    }

    /// Finish a pump pass; returns `true` when the pump may stop
    pub(crate) fn end_pump(&mut self) -> bool {
        if self.repump {
            self.repump = false;
            false
        } else {
            self.pumping = false;
            true
        }
    }

    /// Give up the submitting role after a refused submission
    ///
    /// Pending triggers are dropped; the next completion or caller starts over.
    pub(crate) fn abort_pump(&mut self) {
        self.pumping = false;
        self.repump = false;
    }

    /// Empty the ring after its transfers were cancelled
    ///
    /// Returns how many transfers were still tracked; their late completions
    /// are treated as stale.
    pub(crate) fn reset(&mut self) -> usize {
        let orphans = self.tracking.len();
        self.pool.reclaim_all();
        self.tracking.clear();
        self.producer = 0;
        self.consumer = 0;
        self.in_flight = 0;
        self.ready = 0;
        self.dropped = 0;
        self.epoch = self.epoch.wrapping_add(1);
        orphans
    }
}
