//! libusb backend
//!
//! [`RusbLink`] drives a real device through `rusb`. Control and bulk
//! requests run on the caller's thread. Streaming transfers are queued to one
//! worker thread per direction, which performs the bulk transfer and completes
//! it.
//!
//! Cancellation bumps the direction's generation and then waits for the
//! worker to acknowledge a flush marker placed behind every queued transfer,
//! so every transfer submitted before the cancel has been completed when
//! [`UsbLink::cancel_all`] returns.

use core::time::Duration;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, info, warn};
use rusb::{DeviceHandle, GlobalContext, Speed};

use crate::config::{USB_PID, USB_TYPE_IN, USB_TYPE_OUT, USB_VID};
use crate::error::{Error, Result, TransportError};
use crate::types::{Direction, Interface, LinkSpeed};
use crate::usb::link::{Rejected, Transfer, UsbLink};

/// Slice of a streaming bulk transfer between cancellation checks
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

struct Device {
    handle: DeviceHandle<GlobalContext>,
    claimed: Option<u8>,
}

type SharedDevice = Arc<RwLock<Device>>;

enum Job {
    Transfer { transfer: Transfer, generation: u32 },
    Flush(Sender<()>),
}

fn map_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Pipe => TransportError::Stall,
        rusb::Error::NoDevice => TransportError::NoDevice,
        rusb::Error::Overflow => TransportError::Overflow,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::Interrupted => TransportError::Cancelled,
        _ => TransportError::Io,
    }
}

struct Worker {
    jobs: Option<Sender<Job>>,
    generation: Arc<AtomicU32>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(direction: Direction, device: SharedDevice) -> Result<Self> {
        let (jobs, queue) = channel::unbounded();
        let generation = Arc::new(AtomicU32::new(0));
        let thread = thread::Builder::new()
            .name(format!("bladerf-{direction}"))
            .spawn({
                let generation = Arc::clone(&generation);
                move || run(direction, &device, &queue, &generation)
            })
            .map_err(|_| Error::Transport(TransportError::Io))?;

        Ok(Self {
            jobs: Some(jobs),
            generation,
            thread: Some(thread),
        })
    }

    fn submit(&self, transfer: Transfer) -> core::result::Result<(), Rejected> {
        let Some(jobs) = &self.jobs else {
            return Err(Rejected {
                transfer,
                error: TransportError::NoDevice,
            });
        };
        let generation = self.generation.load(Ordering::Acquire);
        match jobs.send(Job::Transfer {
            transfer,
            generation,
        }) {
            Err(channel::SendError(Job::Transfer { transfer, .. })) => Err(Rejected {
                transfer,
                error: TransportError::NoDevice,
            }),
            Ok(()) | Err(channel::SendError(Job::Flush(_))) => Ok(()),
        }
    }

    fn cancel_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let Some(jobs) = &self.jobs else {
            return;
        };
        let (ack, done) = channel::bounded(1);
        if jobs.send(Job::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(direction: Direction, device: &SharedDevice, queue: &Receiver<Job>, generation: &AtomicU32) {
    debug!("{direction} worker started");
    for job in queue {
        match job {
            Job::Flush(ack) => {
                let _ = ack.send(());
            }
            Job::Transfer {
                mut transfer,
                generation: submitted,
            } => {
                let result = if generation.load(Ordering::Acquire) == submitted {
                    perform(device, &mut transfer, generation, submitted)
                } else {
                    Err(TransportError::Cancelled)
                };
                transfer.complete(result);
            }
        }
    }
    debug!("{direction} worker stopped");
}

fn perform(
    device: &SharedDevice,
    transfer: &mut Transfer,
    generation: &AtomicU32,
    submitted: u32,
) -> core::result::Result<usize, TransportError> {
    let endpoint = transfer.endpoint();
    loop {
        let result = {
            let device = device.read().unwrap_or_else(PoisonError::into_inner);
            match transfer.direction() {
                Direction::Rx => device
                    .handle
                    .read_bulk(endpoint, transfer.buffer_mut(), POLL_TIMEOUT),
                Direction::Tx => device
                    .handle
                    .write_bulk(endpoint, transfer.buffer(), POLL_TIMEOUT),
            }
        };
        match result {
            Err(rusb::Error::Timeout) if generation.load(Ordering::Acquire) == submitted => {}
            Err(rusb::Error::Timeout) => return Err(TransportError::Cancelled),
            other => return other.map_err(map_error),
        }
    }
}

/// [`UsbLink`] over a libusb device handle
pub struct RusbLink {
    device: SharedDevice,
    speed: LinkSpeed,
    rx: Worker,
    tx: Worker,
}

impl RusbLink {
    /// Take over an open device handle
    ///
    /// # Errors
    ///
    /// Transport failure if the worker threads cannot be started.
    pub fn new(handle: DeviceHandle<GlobalContext>) -> Result<Self> {
        let speed = match handle.device().speed() {
            Speed::Super | Speed::SuperPlus => LinkSpeed::Super,
            Speed::High => LinkSpeed::High,
            _ => LinkSpeed::Full,
        };
        let device = Arc::new(RwLock::new(Device {
            handle,
            claimed: None,
        }));
        let rx = Worker::spawn(Direction::Rx, Arc::clone(&device))?;
        let tx = Worker::spawn(Direction::Tx, Arc::clone(&device))?;
        info!("bladeRF link up at {speed:?} speed");
        Ok(Self {
            device,
            speed,
            rx,
            tx,
        })
    }

    /// Open the first attached bladeRF
    ///
    /// # Errors
    ///
    /// [`TransportError::NoDevice`] if none is attached or it cannot be opened.
    pub fn open_first() -> Result<Self> {
        let handle = rusb::open_device_with_vid_pid(USB_VID, USB_PID)
            .ok_or(TransportError::NoDevice)?;
        Self::new(handle)
    }

    const fn worker(&self, direction: Direction) -> &Worker {
        match direction {
            Direction::Rx => &self.rx,
            Direction::Tx => &self.tx,
        }
    }
}

impl UsbLink for RusbLink {
    fn speed(&self) -> LinkSpeed {
        self.speed
    }

    fn set_interface(&self, interface: Interface) -> core::result::Result<(), TransportError> {
        let number = interface.number();
        let mut device = self.device.write().unwrap_or_else(PoisonError::into_inner);
        if device.claimed != Some(number) {
            if let Some(previous) = device.claimed.take() {
                if let Err(err) = device.handle.release_interface(previous) {
                    warn!("releasing interface {previous} failed: {err}");
                }
            }
            device.handle.claim_interface(number).map_err(map_error)?;
            device.claimed = Some(number);
        }
        device
            .handle
            .set_alternate_setting(number, 0)
            .map_err(map_error)
    }

    fn control_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> core::result::Result<usize, TransportError> {
        let device = self.device.read().unwrap_or_else(PoisonError::into_inner);
        device
            .handle
            .read_control(USB_TYPE_IN, request, value, index, buf, timeout)
            .map_err(map_error)
    }

    fn control_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> core::result::Result<usize, TransportError> {
        let device = self.device.read().unwrap_or_else(PoisonError::into_inner);
        device
            .handle
            .write_control(USB_TYPE_OUT, request, value, index, data, timeout)
            .map_err(map_error)
    }

    fn bulk_in(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> core::result::Result<usize, TransportError> {
        let device = self.device.read().unwrap_or_else(PoisonError::into_inner);
        device
            .handle
            .read_bulk(endpoint, buf, timeout)
            .map_err(map_error)
    }

    fn bulk_out(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> core::result::Result<usize, TransportError> {
        let device = self.device.read().unwrap_or_else(PoisonError::into_inner);
        device
            .handle
            .write_bulk(endpoint, data, timeout)
            .map_err(map_error)
    }

    fn submit(&self, transfer: Transfer) -> core::result::Result<(), Rejected> {
        self.worker(transfer.direction()).submit(transfer)
    }

    fn cancel_all(&self, direction: Direction) {
        self.worker(direction).cancel_all();
    }
}
