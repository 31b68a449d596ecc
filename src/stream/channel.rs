//! One streaming direction
//!
//! [`StreamChannel`] ties a [`Ring`] to a link. Callers block in
//! [`StreamChannel::read`] / [`StreamChannel::write`]; the link finishes
//! transfers through the [`CompletionSink`] impl, which updates the ring,
//! re-arms submissions and signals the waiting caller.
//!
//! Lock discipline: the ring lock is only held while the ring is mutated.
//! Submissions, cancellation and buffer copies all happen outside it.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::{debug, info, warn};

use crate::config::StreamConfig;
use crate::error::{Error, Result, TransportError};
use crate::stream::pool::SlotPool;
use crate::stream::ring::{Completion, Ring};
use crate::types::{Direction, RingStatus};
use crate::usb::link::{CompletionSink, Rejected, Transfer, UsbLink};

/// Streaming engine for a single direction
///
/// Supports one blocked caller at a time.
pub struct StreamChannel<L: UsbLink> {
    direction: Direction,
    config: StreamConfig,
    link: Arc<L>,
    ring: spin::Mutex<Option<Ring>>,
    enabled: AtomicBool,
    bytes: AtomicU64,
    wake: Signal<CriticalSectionRawMutex, ()>,
    interrupt: Signal<CriticalSectionRawMutex, ()>,
    this: Weak<Self>,
}

impl<L: UsbLink> StreamChannel<L> {
    /// Create a stopped, disabled channel
    #[must_use]
    pub fn new(direction: Direction, link: Arc<L>, config: StreamConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            direction,
            config,
            link,
            ring: spin::Mutex::new(None),
            enabled: AtomicBool::new(false),
            bytes: AtomicU64::new(0),
            wake: Signal::new(),
            interrupt: Signal::new(),
            this: this.clone(),
        })
    }

    /// Direction served by this channel
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Geometry of the slot pool
    #[must_use]
    pub const fn config(&self) -> StreamConfig {
        self.config
    }

    /// Whether the slot pool is allocated
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.ring.lock().is_some()
    }

    /// Whether transfers are being submitted
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Bytes moved by completed transfers since creation
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Snapshot of the ring counters; all zero when stopped
    #[must_use]
    pub fn status(&self) -> RingStatus {
        self.ring
            .lock()
            .as_ref()
            .map(Ring::status)
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Allocate the slot pool
    ///
    /// Does nothing if the pool is already allocated.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a bad geometry,
    /// [`Error::AllocationFailed`] if the buffers could not be allocated.
    pub fn start(&self) -> Result<()> {
        self.config.validate()?;
        if self.is_started() {
            return Ok(());
        }

        let pool = SlotPool::allocate(self.config.slots, self.config.transfer_size)?;
        let ring = Ring::new(self.direction, pool, self.config.window);

        let mut guard = self.ring.lock();
        if guard.is_none() {
            *guard = Some(ring);
            debug!(
                "{} pool started: {} slots of {} bytes",
                self.direction, self.config.slots, self.config.transfer_size
            );
        }
        Ok(())
    }

    /// Release the slot pool
    ///
    /// Call [`StreamChannel::disable`] first; buffers still with the link are
    /// dropped when the link completes them.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
        let ring = self.ring.lock().take();
        if let Some(ring) = ring {
            if ring.in_flight() > 0 {
                warn!(
                    "{} pool stopped with {} transfers in flight",
                    self.direction,
                    ring.in_flight()
                );
            }
            drop(ring);
            debug!("{} pool stopped", self.direction);
        }
        self.wake.signal(());
    }

    /// Start submitting transfers
    ///
    /// Clears any interrupt left over from a previous run.
    ///
    /// # Errors
    ///
    /// [`Error::StreamDisabled`] if the pool is not allocated.
    pub fn enable(&self) -> Result<()> {
        if !self.is_started() {
            return Err(Error::StreamDisabled(self.direction));
        }
        self.interrupt.reset();
        if !self.enabled.swap(true, Ordering::AcqRel) {
            info!("{} stream enabled", self.direction);
        }
        self.pump();
        Ok(())
    }

    /// Stop submitting, cancel everything outstanding and empty the ring
    ///
    /// Waits for a submission already in progress to reach the link, then
    /// returns once the link has completed every cancelled transfer. Returns
    /// how many transfers the link failed to hand back.
    pub fn disable(&self) -> usize {
        if self.enabled.swap(false, Ordering::AcqRel) {
            info!("{} stream disabled", self.direction);
        }
        // A pump that admitted a slot before `enabled` cleared is still
        // submitting it; cancel_all has to see that transfer.
        while self.ring.lock().as_ref().is_some_and(Ring::is_pumping) {
            std::thread::yield_now();
        }
        self.link.cancel_all(self.direction);

        let orphans = self.ring.lock().as_mut().map_or(0, Ring::reset);
        if orphans > 0 {
            warn!(
                "{} ring reset with {orphans} transfers not handed back",
                self.direction
            );
        }
        self.wake.signal(());
        orphans
    }

    /// Wake the blocked caller with [`Error::Interrupted`]
    ///
    /// If nobody is waiting, the next wait is interrupted instead.
    pub fn interrupt(&self) {
        self.interrupt.signal(());
    }

    // ------------------------------------------------------------------
    // Caller side
    // ------------------------------------------------------------------

    /// Copy the oldest completed RX transfer into `out`
    ///
    /// Waits for a completion when none is ready. Returns the transfer size.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `out` is shorter than one transfer
    /// - [`Error::StreamDisabled`] if nothing is ready and the direction is disabled
    /// - [`Error::Interrupted`] if the wait was interrupted; no slot is consumed
    pub async fn read(&self, out: &mut [u8]) -> Result<usize> {
        let size = self.config.transfer_size;
        if out.len() < size {
            return Err(Error::InvalidArgument("read buffer smaller than one transfer"));
        }

        loop {
            let claim = {
                let mut guard = self.ring.lock();
                let ring = guard
                    .as_mut()
                    .ok_or(Error::StreamDisabled(self.direction))?;
                ring.claim_rx()
            };

            if let Some(claim) = claim {
                out[..size].copy_from_slice(&claim.buffer[..size]);
                if let Some(ring) = self.ring.lock().as_mut() {
                    ring.release(claim);
                }
                self.pump();
                return Ok(size);
            }

            if !self.is_enabled() {
                return Err(Error::StreamDisabled(self.direction));
            }
            self.pump();
            self.wait().await?;
        }
    }

    /// Deposit `data` into the next TX slot and queue it
    ///
    /// Short data is zero-padded to the transfer size. Waits while the ring
    /// is full and the direction is enabled. Returns `data.len()`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `data` is longer than one transfer
    /// - [`Error::StreamDisabled`] if the pool is not allocated, or the ring
    ///   is full while the direction is disabled
    /// - [`Error::Interrupted`] if the wait was interrupted; nothing is queued
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if data.len() > self.config.transfer_size {
            return Err(Error::InvalidArgument("write larger than one transfer"));
        }

        let mut claim = loop {
            let claim = {
                let mut guard = self.ring.lock();
                let ring = guard
                    .as_mut()
                    .ok_or(Error::StreamDisabled(self.direction))?;
                ring.reserve_tx()
            };
            if let Some(claim) = claim {
                break claim;
            }
            if !self.is_enabled() {
                // Full ring that nothing will drain
                return Err(Error::StreamDisabled(self.direction));
            }
            self.pump();
            self.wait().await?;
        };

        let (head, tail) = claim.buffer.split_at_mut(data.len());
        head.copy_from_slice(data);
        tail.fill(0);

        if let Some(ring) = self.ring.lock().as_mut() {
            ring.commit_tx(claim);
        }
        self.pump();
        Ok(data.len())
    }

    async fn wait(&self) -> Result<()> {
        match select(self.wake.wait(), self.interrupt.wait()).await {
            Either::First(()) => Ok(()),
            Either::Second(()) => Err(Error::Interrupted),
        }
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Submit admissible slots until the window or the ring says stop
    ///
    /// Only one context submits at a time; a trigger that arrives while
    /// another context is submitting makes that context go around again.
    fn pump(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let sink: Arc<dyn CompletionSink> = this;

        {
            let mut guard = self.ring.lock();
            match guard.as_mut() {
                Some(ring) => {
                    if !ring.begin_pump() {
                        return;
                    }
                }
                None => return,
            }
        }

        loop {
            let claim = {
                let mut guard = self.ring.lock();
                let Some(ring) = guard.as_mut() else {
                    return;
                };
                let admitted = if self.is_enabled() { ring.admit() } else { None };
                match admitted {
                    Some(claim) => claim,
                    None if ring.end_pump() => return,
                    None => continue,
                }
            };

            let transfer = Transfer::new(
                self.direction,
                claim.slot,
                claim.epoch,
                claim.buffer,
                Arc::clone(&sink),
            );
            if let Err(Rejected { transfer, error }) = self.link.submit(transfer) {
                warn!(
                    "{} submission of slot {} refused: {error}",
                    self.direction,
                    transfer.slot()
                );
                let (slot, epoch) = (transfer.slot(), transfer.epoch());
                if let Some(ring) = self.ring.lock().as_mut() {
                    ring.unadmit(slot, epoch, transfer.into_buffer());
                    ring.abort_pump();
                }
                return;
            }
        }
    }
}

impl<L: UsbLink> CompletionSink for StreamChannel<L> {
    fn complete(&self, transfer: Transfer, result: core::result::Result<usize, TransportError>) {
        let (slot, epoch) = (transfer.slot(), transfer.epoch());
        let outcome = match self.ring.lock().as_mut() {
            Some(ring) => ring.complete(slot, epoch, transfer.into_buffer(), result),
            None => Completion::Stale,
        };

        match outcome {
            Completion::Stale => {
                // The returned buffer may be the slot admission is waiting on.
                self.pump();
                return;
            }
            Completion::Accepted(n) => {
                self.bytes.fetch_add(n as u64, Ordering::Relaxed);
            }
            Completion::Failed(err) => {
                warn!("{} transfer in slot {slot} failed: {err}", self.direction);
            }
            Completion::Cancelled => {}
        }

        if outcome != Completion::Cancelled {
            self.pump();
        }
        self.wake.signal(());
    }
}

impl<L: UsbLink> core::fmt::Debug for StreamChannel<L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamChannel")
            .field("direction", &self.direction)
            .field("enabled", &self.is_enabled())
            .field("status", &self.status())
            .field("bytes", &self.bytes())
            .finish_non_exhaustive()
    }
}
