//! Simulated bladeRF for integration tests
//!
//! Implements the link trait in memory: an SPI flash with operation logs,
//! register files per peripheral, queued streaming transfers completed on
//! demand, and knobs to inject failures.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use bladerf_host::config::{endpoints, FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE, REGISTER_FRAME_LEN};
use bladerf_host::error::TransportError;
use bladerf_host::types::{Direction, Interface, LinkSpeed};
use bladerf_host::usb::control::Command;
use bladerf_host::usb::link::{Rejected, Transfer, UsbLink};

pub const SIM_FLASH_SECTORS: usize = 4;

#[derive(Debug)]
pub struct SimState {
    pub speed: LinkSpeed,
    pub interface: Option<Interface>,
    pub interface_log: Vec<Interface>,
    pub interface_failure: Option<TransportError>,

    pub version: (u16, u16),
    pub fpga_status: u32,
    pub begin_status: u32,
    /// `(command code, word)` for every RF enable/disable
    pub rf_log: Vec<(u8, u32)>,
    /// Failures returned by the next control requests, in order
    pub control_failures: VecDeque<TransportError>,
    /// Control requests seen, by command code
    pub control_log: Vec<u8>,

    pub flash: Vec<u8>,
    pub erase_status: u32,
    /// Sector whose erase always stalls
    pub erase_fail_sector: Option<u16>,
    pub erase_log: Vec<u16>,
    /// `(page, chunk length)` for every write request
    pub write_log: Vec<(u16, usize)>,
    /// `(page, chunk length)` for every read request
    pub read_log: Vec<(u16, usize)>,
    /// Flash offset whose byte reads back inverted
    pub corrupt: Option<usize>,
    /// Accept this many bytes less than requested on flash writes
    pub short_write: usize,
    write_cursor: Option<(u16, usize)>,
    read_cursor: Option<(u16, usize)>,

    pub registers: HashMap<(u8, u8), u8>,
    /// Register response polls that time out before the answer arrives
    pub register_timeouts: u32,
    /// Replace the response magic byte
    pub response_magic: Option<u8>,
    pub control_responses: VecDeque<Vec<u8>>,
    pub control_bulk_log: Vec<Vec<u8>>,
    pub register_frames: Vec<[u8; REGISTER_FRAME_LEN]>,

    pub pending: VecDeque<Transfer>,
    /// Submissions to refuse before accepting again
    pub reject_next: usize,
    pub submitted: [usize; 2],
    pub max_outstanding: [usize; 2],
    pub cancelled: [usize; 2],
    /// Payload of every TX transfer completed successfully
    pub tx_data: Vec<Vec<u8>>,
    /// Slot ids of submitted transfers, in order
    pub submit_order: Vec<(Direction, u16)>,
    rx_sequence: u8,
}

const fn index(direction: Direction) -> usize {
    match direction {
        Direction::Rx => 0,
        Direction::Tx => 1,
    }
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            speed: LinkSpeed::High,
            interface: None,
            interface_log: Vec::new(),
            interface_failure: None,
            version: (1, 6),
            fpga_status: 1,
            begin_status: 1,
            rf_log: Vec::new(),
            control_failures: VecDeque::new(),
            control_log: Vec::new(),
            flash: vec![0u8; SIM_FLASH_SECTORS * FLASH_SECTOR_SIZE],
            erase_status: 1,
            erase_fail_sector: None,
            erase_log: Vec::new(),
            write_log: Vec::new(),
            read_log: Vec::new(),
            corrupt: None,
            short_write: 0,
            write_cursor: None,
            read_cursor: None,
            registers: HashMap::new(),
            register_timeouts: 0,
            response_magic: None,
            control_responses: VecDeque::new(),
            control_bulk_log: Vec::new(),
            register_frames: Vec::new(),
            pending: VecDeque::new(),
            reject_next: 0,
            submitted: [0; 2],
            max_outstanding: [0; 2],
            cancelled: [0; 2],
            tx_data: Vec::new(),
            submit_order: Vec::new(),
            rx_sequence: 0,
        }
    }
}

impl SimState {
    pub fn outstanding(&self, direction: Direction) -> usize {
        self.pending
            .iter()
            .filter(|t| t.direction() == direction)
            .count()
    }

    fn advance(cursor: &mut Option<(u16, usize)>, page: u16, len: usize) -> usize {
        let offset = match *cursor {
            Some((p, offset)) if p == page && offset < FLASH_PAGE_SIZE => offset,
            _ => 0,
        };
        *cursor = Some((page, offset + len));
        usize::from(page) * FLASH_PAGE_SIZE + offset
    }

    fn answer_register(&mut self, frame: &[u8]) {
        let mut request = [0u8; REGISTER_FRAME_LEN];
        request.copy_from_slice(&frame[..REGISTER_FRAME_LEN]);
        self.register_frames.push(request);

        let mode = frame[1];
        let device = (mode >> 4) & 0x3;
        let write = (mode >> 6) == 1;
        let address = frame[2];

        let mut response = request.to_vec();
        if write {
            self.registers.insert((device, address), frame[3]);
        } else {
            response[3] = self.registers.get(&(device, address)).copied().unwrap_or(0);
        }
        if let Some(magic) = self.response_magic {
            response[0] = magic;
        }
        self.control_responses.push_back(response);
    }
}

#[derive(Debug, Default)]
pub struct SimDevice {
    state: Mutex<SimState>,
    /// While set, `submit` blocks before touching the queue
    gate_closed: AtomicBool,
    gate_waiting: AtomicBool,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_speed(speed: LinkSpeed) -> Self {
        let sim = Self::new();
        sim.state().speed = speed;
        sim
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    /// Hold every following `submit` call until `open_gate`
    pub fn close_gate(&self) {
        self.gate_waiting.store(false, Ordering::SeqCst);
        self.gate_closed.store(true, Ordering::SeqCst);
    }

    pub fn open_gate(&self) {
        self.gate_closed.store(false, Ordering::SeqCst);
    }

    /// A submission is parked at the closed gate
    pub fn gate_waiting(&self) -> bool {
        self.gate_waiting.load(Ordering::SeqCst)
    }

    /// Complete the oldest queued transfer successfully
    ///
    /// RX transfers are filled with a running sequence byte.
    pub fn complete_next(&self) -> bool {
        let next = {
            let mut state = self.state();
            state.pending.pop_front().map(|mut transfer| {
                let len = transfer.buffer().len();
                match transfer.direction() {
                    Direction::Rx => {
                        let seq = state.rx_sequence;
                        state.rx_sequence = seq.wrapping_add(1);
                        transfer.buffer_mut().fill(seq);
                    }
                    Direction::Tx => state.tx_data.push(transfer.buffer().to_vec()),
                }
                (transfer, len)
            })
        };
        match next {
            Some((transfer, len)) => {
                transfer.complete(Ok(len));
                true
            }
            None => false,
        }
    }

    /// Fail the oldest queued transfer
    pub fn fail_next(&self, error: TransportError) -> bool {
        let next = self.state().pending.pop_front();
        match next {
            Some(transfer) => {
                transfer.complete(Err(error));
                true
            }
            None => false,
        }
    }

    /// Complete every transfer queued right now; returns how many
    pub fn complete_queued(&self) -> usize {
        let count = self.state().pending.len();
        for _ in 0..count {
            self.complete_next();
        }
        count
    }

    /// Take the oldest queued transfer without completing it
    pub fn take_next(&self) -> Option<Transfer> {
        self.state().pending.pop_front()
    }

    /// Flash contents
    pub fn flash(&self, range: std::ops::Range<usize>) -> Vec<u8> {
        self.state().flash[range].to_vec()
    }

    pub fn queue_control_response(&self, bytes: &[u8]) {
        self.state().control_responses.push_back(bytes.to_vec());
    }

    fn control_failure(&self) -> Option<TransportError> {
        self.state().control_failures.pop_front()
    }
}

impl UsbLink for SimDevice {
    fn speed(&self) -> LinkSpeed {
        self.state().speed
    }

    fn set_interface(&self, interface: Interface) -> Result<(), TransportError> {
        let mut state = self.state();
        if let Some(err) = state.interface_failure {
            return Err(err);
        }
        state.interface = Some(interface);
        state.interface_log.push(interface);
        Ok(())
    }

    fn control_in(
        &self,
        request: u8,
        _value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        if let Some(err) = self.control_failure() {
            return Err(err);
        }
        let mut state = self.state();
        state.control_log.push(request);

        let word = |value: u32, buf: &mut [u8]| {
            let bytes = value.to_le_bytes();
            let n = buf.len().min(4);
            buf[..n].copy_from_slice(&bytes[..n]);
            n
        };

        let n = match request {
            r if r == Command::QueryVersion.code() => {
                let (major, minor) = state.version;
                let value = u32::from(major) | (u32::from(minor) << 16);
                word(value, buf)
            }
            r if r == Command::QueryFpgaStatus.code() => word(state.fpga_status, buf),
            r if r == Command::BeginProgramming.code() => word(state.begin_status, buf),
            r if r == Command::FlashErase.code() => {
                state.erase_log.push(index);
                if state.erase_fail_sector == Some(index) {
                    return Err(TransportError::Stall);
                }
                let start = usize::from(index) * FLASH_SECTOR_SIZE;
                if let Some(sector) = state.flash.get_mut(start..start + FLASH_SECTOR_SIZE) {
                    sector.fill(0xFF);
                }
                word(state.erase_status, buf)
            }
            r if r == Command::FlashRead.code() => {
                state.read_log.push((index, buf.len()));
                let offset = SimState::advance(&mut state.read_cursor, index, buf.len());
                buf.copy_from_slice(&state.flash[offset..offset + buf.len()]);
                if let Some(bad) = state.corrupt {
                    if (offset..offset + buf.len()).contains(&bad) {
                        buf[bad - offset] = !buf[bad - offset];
                    }
                }
                buf.len()
            }
            _ => return Err(TransportError::Stall),
        };
        Ok(n)
    }

    fn control_out(
        &self,
        request: u8,
        _value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        if let Some(err) = self.control_failure() {
            return Err(err);
        }
        let mut state = self.state();
        state.control_log.push(request);

        match request {
            r if r == Command::RfRx.code() || r == Command::RfTx.code() => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&data[..4]);
                state.rf_log.push((request, u32::from_le_bytes(bytes)));
                Ok(data.len())
            }
            r if r == Command::FlashWrite.code() => {
                state.write_log.push((index, data.len()));
                let offset = SimState::advance(&mut state.write_cursor, index, data.len());
                let accepted = data.len() - state.short_write.min(data.len());
                for (cell, byte) in state.flash[offset..offset + accepted]
                    .iter_mut()
                    .zip(data)
                {
                    *cell &= byte;
                }
                Ok(accepted)
            }
            _ => Err(TransportError::Stall),
        }
    }

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        assert_eq!(endpoint, endpoints::CONTROL_IN);
        let mut state = self.state();
        if state.register_timeouts > 0 {
            state.register_timeouts -= 1;
            return Err(TransportError::Timeout);
        }
        let response = state
            .control_responses
            .pop_front()
            .ok_or(TransportError::Timeout)?;
        let n = response.len().min(buf.len());
        buf[..n].copy_from_slice(&response[..n]);
        Ok(n)
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        assert_eq!(endpoint, endpoints::CONTROL_OUT);
        let mut state = self.state();
        state.control_bulk_log.push(data.to_vec());
        if data.len() == REGISTER_FRAME_LEN && data[0] == b'N' {
            state.answer_register(data);
        }
        Ok(data.len())
    }

    fn submit(&self, transfer: Transfer) -> Result<(), Rejected> {
        while self.gate_closed.load(Ordering::SeqCst) {
            self.gate_waiting.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
        }
        let mut state = self.state();
        if state.reject_next > 0 {
            state.reject_next -= 1;
            return Err(Rejected {
                transfer,
                error: TransportError::Busy,
            });
        }
        let direction = transfer.direction();
        let i = index(direction);
        state.submitted[i] += 1;
        state.submit_order.push((direction, transfer.slot()));
        state.pending.push_back(transfer);
        let outstanding = state.outstanding(direction);
        state.max_outstanding[i] = state.max_outstanding[i].max(outstanding);
        Ok(())
    }

    fn cancel_all(&self, direction: Direction) {
        let cancelled: Vec<Transfer> = {
            let mut state = self.state();
            let (matching, rest): (VecDeque<_>, VecDeque<_>) = state
                .pending
                .drain(..)
                .partition(|t| t.direction() == direction);
            state.pending = rest;
            state.cancelled[index(direction)] += matching.len();
            matching.into_iter().collect()
        };
        for transfer in cancelled {
            transfer.complete(Err(TransportError::Cancelled));
        }
    }
}

/// Drive a future to completion on the current thread
pub fn block_on<F: core::future::Future>(future: F) -> F::Output {
    embassy_futures::block_on(future)
}
