//! Device Session
//!
//! A [`Session`] owns one device: both streaming channels, the current
//! interface mode and the configuration lock that serializes every mode
//! transition, register exchange and firmware upgrade.
//!
//! ```text
//!          start()            end_programming() / check_programming()
//!   IDLE ──────────▶ CONFIG ───────────────────────────────▶ STREAMING
//!                      ▲  ◀─────────────────────────────────    │
//!                      │        begin_programming()             │
//!                      │                                        │
//!   end_firmware_access()    begin_firmware_access()            │
//!                      │     upgrade_firmware()                 │
//!                      └──────────── FIRMWARE ◀─────────────────┘
//!
//!   any ── close() ──▶ TERMINATED
//! ```
//!
//! Leaving streaming mode disables both directions first. Blocking stream
//! waits never hold the configuration lock.

use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use log::{info, warn};

use crate::config::{endpoints, StreamConfig, USB_TIMEOUT};
use crate::error::{Error, ProtocolError, Result};
use crate::firmware::{FirmwareImage, FlashProgrammer};
use crate::protocol::{self, Peripheral, RegisterPacket, RegisterRecord};
use crate::stream::StreamChannel;
use crate::types::{Direction, Mode, RingStatus, Version};
use crate::usb::control::{Command, ControlPlane};
use crate::usb::link::UsbLink;

/// Control operation, as accepted by [`Session::control`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlRequest<'a> {
    /// Read the firmware version
    QueryVersion,
    /// Read the FPGA configuration status word
    QueryFpgaStatus,
    /// Switch to configuration mode and start FPGA programming
    BeginProgramming,
    /// Finish FPGA programming and enter streaming mode
    EndProgramming,
    /// Enter streaming mode if the FPGA came up
    CheckProgramming,
    /// Enable or disable RX streaming
    RfRx(bool),
    /// Enable or disable TX streaming
    RfTx(bool),
    /// Read one register
    RegisterRead(Peripheral, u8),
    /// Write one register
    RegisterWrite(Peripheral, RegisterRecord),
    /// Erase, write and verify the flash
    UpgradeFirmware(&'a FirmwareImage),
}

/// Result of a [`ControlRequest`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlResponse {
    /// Firmware version
    Version(Version),
    /// Device status word
    Status(u32),
    /// Whether the session is now in streaming mode
    Programmed(bool),
    /// Register address and value echoed by the device
    Register(RegisterRecord),
    /// Operation completed
    Done,
}

#[derive(Debug, Default)]
struct SessionState {
    mode: Mode,
}

const fn rf_command(direction: Direction) -> Command {
    match direction {
        Direction::Rx => Command::RfRx,
        Direction::Tx => Command::RfTx,
    }
}

/// An open device
pub struct Session<L: UsbLink> {
    link: Arc<L>,
    rx: Arc<StreamChannel<L>>,
    tx: Arc<StreamChannel<L>>,
    state: Mutex<CriticalSectionRawMutex, SessionState>,
}

impl<L: UsbLink> Session<L> {
    /// Wrap a link in an idle session
    #[must_use]
    pub fn new(link: L, config: StreamConfig) -> Self {
        let link = Arc::new(link);
        Self {
            rx: StreamChannel::new(Direction::Rx, Arc::clone(&link), config),
            tx: StreamChannel::new(Direction::Tx, Arc::clone(&link), config),
            link,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Create a session and start it
    ///
    /// # Errors
    ///
    /// See [`Session::start`].
    pub async fn open(link: L, config: StreamConfig) -> Result<Self> {
        let session = Self::new(link, config);
        session.start().await?;
        Ok(session)
    }

    /// Allocate both slot pools and enter configuration mode
    ///
    /// # Errors
    ///
    /// - [`Error::Mode`] unless the session is idle
    /// - [`Error::AllocationFailed`] / [`Error::InvalidArgument`] from the
    ///   pools; nothing stays allocated
    /// - transport failure switching interface
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.mode != Mode::Idle {
            return Err(Error::mode(state.mode, "start"));
        }

        let started = self.rx.start().and_then(|()| self.tx.start());
        if let Err(err) = started {
            self.rx.stop();
            self.tx.stop();
            return Err(err);
        }

        if let Err(err) = self.enter(&mut state, Mode::Config) {
            self.rx.stop();
            self.tx.stop();
            return Err(err);
        }
        Ok(())
    }

    /// The underlying link
    #[must_use]
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Current mode
    pub async fn mode(&self) -> Mode {
        self.state.lock().await.mode
    }

    fn channel(&self, direction: Direction) -> &StreamChannel<L> {
        match direction {
            Direction::Rx => self.rx.as_ref(),
            Direction::Tx => self.tx.as_ref(),
        }
    }

    fn control_plane(&self) -> ControlPlane<'_, L> {
        ControlPlane::new(&*self.link)
    }

    // ------------------------------------------------------------------
    // Mode transitions
    // ------------------------------------------------------------------

    fn enter(&self, state: &mut SessionState, mode: Mode) -> Result<()> {
        if state.mode == mode {
            return Ok(());
        }
        if mode == Mode::Streaming && !(self.rx.is_started() && self.tx.is_started()) {
            return Err(Error::mode(state.mode, "enter streaming"));
        }
        if state.mode == Mode::Streaming {
            self.quiesce();
        }
        if let Some(interface) = mode.interface() {
            self.link.set_interface(interface)?;
        }
        info!("mode {} -> {}", state.mode, mode);
        state.mode = mode;
        Ok(())
    }

    /// Disable both directions, tolerating RF command failures
    fn quiesce(&self) {
        for direction in [Direction::Tx, Direction::Rx] {
            if let Err(err) = self.disable_direction(direction) {
                warn!("{direction} RF disable failed: {err}");
            }
        }
    }

    fn enable_direction(&self, direction: Direction) -> Result<()> {
        let channel = self.channel(direction);
        if channel.is_enabled() {
            return Ok(());
        }
        self.control_plane().send_word(rf_command(direction), 1)?;
        channel.enable()
    }

    fn disable_direction(&self, direction: Direction) -> Result<()> {
        let channel = self.channel(direction);
        let was_enabled = channel.is_enabled();
        channel.disable();
        if was_enabled {
            self.control_plane().send_word(rf_command(direction), 0)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------

    /// Read samples
    ///
    /// In streaming mode this enables RX if needed and returns one full
    /// transfer. In configuration mode it is a single bulk read on the
    /// control endpoint.
    ///
    /// # Errors
    ///
    /// - [`Error::Mode`] in any other mode
    /// - [`Error::Interrupted`] if [`Session::interrupt`] woke the wait
    /// - [`Error::StreamDisabled`] if RX was disabled while waiting
    /// - transport failure
    pub async fn read(&self, out: &mut [u8]) -> Result<usize> {
        {
            let state = self.state.lock().await;
            match state.mode {
                Mode::Config => {
                    return Ok(self.link.bulk_in(endpoints::CONTROL_IN, out, USB_TIMEOUT)?);
                }
                Mode::Streaming => self.enable_direction(Direction::Rx)?,
                mode => return Err(Error::mode(mode, "read")),
            }
        }
        self.rx.read(out).await
    }

    /// Write samples
    ///
    /// In streaming mode TX is enabled if needed, then the data is queued for
    /// transmission, waiting while the ring is full. In configuration mode it
    /// is a single bulk write on the control endpoint.
    ///
    /// # Errors
    ///
    /// - [`Error::Mode`] in any other mode
    /// - [`Error::Interrupted`] if [`Session::interrupt`] woke the wait
    /// - [`Error::StreamDisabled`] if TX was disabled while waiting
    /// - [`Error::InvalidArgument`] if a streaming write exceeds one transfer
    /// - transport failure enabling TX; nothing was queued
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        {
            let state = self.state.lock().await;
            match state.mode {
                Mode::Config => {
                    return Ok(self.link.bulk_out(endpoints::CONTROL_OUT, data, USB_TIMEOUT)?);
                }
                Mode::Streaming => {
                    if data.len() > self.tx.config().transfer_size {
                        return Err(Error::InvalidArgument("write larger than one transfer"));
                    }
                    // Nothing is queued unless TX is running
                    self.enable_direction(Direction::Tx)?;
                }
                mode => return Err(Error::mode(mode, "write")),
            }
        }
        self.tx.write(data).await
    }

    /// Wake a caller blocked in [`Session::read`] or [`Session::write`]
    pub fn interrupt(&self, direction: Direction) {
        self.channel(direction).interrupt();
    }

    /// Ring counters for one direction
    #[must_use]
    pub fn ring_status(&self, direction: Direction) -> RingStatus {
        self.channel(direction).status()
    }

    /// Bytes moved in one direction
    #[must_use]
    pub fn bytes(&self, direction: Direction) -> u64 {
        self.channel(direction).bytes()
    }

    /// Bytes moved in both directions
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.rx.bytes() + self.tx.bytes()
    }

    /// Whether a direction is streaming
    #[must_use]
    pub fn is_enabled(&self, direction: Direction) -> bool {
        self.channel(direction).is_enabled()
    }

    // ------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------

    /// Firmware version
    ///
    /// # Errors
    ///
    /// [`Error::Mode`] once closed; transport or protocol failure.
    pub async fn version(&self) -> Result<Version> {
        let state = self.state.lock().await;
        if state.mode == Mode::Terminated {
            return Err(Error::mode(state.mode, "query version"));
        }
        self.control_plane().query_version()
    }

    /// FPGA configuration status word (non-zero when configured)
    ///
    /// # Errors
    ///
    /// [`Error::Mode`] once closed; transport or protocol failure.
    pub async fn fpga_status(&self) -> Result<u32> {
        let state = self.state.lock().await;
        if state.mode == Mode::Terminated {
            return Err(Error::mode(state.mode, "query FPGA status"));
        }
        self.control_plane().query_fpga_status()
    }

    /// Enter configuration mode and tell the device programming starts
    ///
    /// Returns the device's status word.
    ///
    /// # Errors
    ///
    /// [`Error::Mode`] once closed; transport or protocol failure.
    pub async fn begin_programming(&self) -> Result<u32> {
        let mut state = self.state.lock().await;
        if state.mode == Mode::Terminated {
            return Err(Error::mode(state.mode, "begin programming"));
        }
        self.enter(&mut state, Mode::Config)?;
        self.control_plane().receive_word(Command::BeginProgramming)
    }

    /// Finish programming: enter streaming mode if the FPGA is configured
    ///
    /// Returns the FPGA status word.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::FpgaNotConfigured`] if the status word is zero
    /// - [`Error::Mode`] outside configuration mode, or without slot pools
    /// - transport failure
    pub async fn end_programming(&self) -> Result<u32> {
        let mut state = self.state.lock().await;
        if state.mode != Mode::Config {
            return Err(Error::mode(state.mode, "end programming"));
        }
        let status = self.control_plane().query_fpga_status()?;
        if status == 0 {
            return Err(ProtocolError::FpgaNotConfigured.into());
        }
        self.enter(&mut state, Mode::Streaming)?;
        Ok(status)
    }

    /// Enter streaming mode if the FPGA is configured
    ///
    /// Returns whether the session is in streaming mode afterwards. Outside
    /// configuration mode nothing is sent.
    ///
    /// # Errors
    ///
    /// Transport failure, or [`Error::Mode`] without slot pools.
    pub async fn check_programming(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.mode != Mode::Config {
            return Ok(state.mode == Mode::Streaming);
        }
        let status = self.control_plane().query_fpga_status()?;
        if status == 0 {
            return Ok(false);
        }
        self.enter(&mut state, Mode::Streaming)?;
        Ok(true)
    }

    /// Enable or disable RX streaming
    ///
    /// # Errors
    ///
    /// [`Error::Mode`] outside streaming mode; transport failure.
    pub async fn set_rf_rx(&self, enable: bool) -> Result<()> {
        self.set_rf(Direction::Rx, enable).await
    }

    /// Enable or disable TX streaming
    ///
    /// # Errors
    ///
    /// [`Error::Mode`] outside streaming mode; transport failure.
    pub async fn set_rf_tx(&self, enable: bool) -> Result<()> {
        self.set_rf(Direction::Tx, enable).await
    }

    async fn set_rf(&self, direction: Direction, enable: bool) -> Result<()> {
        let state = self.state.lock().await;
        if state.mode != Mode::Streaming {
            return Err(Error::mode(state.mode, "switch RF path"));
        }
        if enable {
            self.enable_direction(direction)
        } else {
            self.disable_direction(direction)
        }
    }

    /// Read one peripheral register
    ///
    /// # Errors
    ///
    /// [`Error::Mode`] outside configuration and streaming mode; transport
    /// or protocol failure.
    pub async fn register_read(&self, peripheral: Peripheral, address: u8) -> Result<RegisterRecord> {
        self.register_exchange(RegisterPacket::read(peripheral, address))
            .await
    }

    /// Write one peripheral register
    ///
    /// Returns the record the device echoed.
    ///
    /// # Errors
    ///
    /// [`Error::Mode`] outside configuration and streaming mode; transport
    /// or protocol failure.
    pub async fn register_write(
        &self,
        peripheral: Peripheral,
        record: RegisterRecord,
    ) -> Result<RegisterRecord> {
        self.register_exchange(RegisterPacket::write(peripheral, record.address, record.data))
            .await
    }

    async fn register_exchange(&self, packet: RegisterPacket) -> Result<RegisterRecord> {
        let state = self.state.lock().await;
        if !matches!(state.mode, Mode::Config | Mode::Streaming) {
            return Err(Error::mode(state.mode, "register access"));
        }
        protocol::transact(&*self.link, &packet)
    }

    /// Enter firmware (flash) access mode
    ///
    /// # Errors
    ///
    /// [`Error::Mode`] when idle or closed; transport failure.
    pub async fn begin_firmware_access(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if matches!(state.mode, Mode::Idle | Mode::Terminated) {
            return Err(Error::mode(state.mode, "begin firmware access"));
        }
        self.enter(&mut state, Mode::Firmware)
    }

    /// Leave firmware access mode for configuration mode
    ///
    /// # Errors
    ///
    /// [`Error::Mode`] outside firmware mode; transport failure.
    pub async fn end_firmware_access(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.mode != Mode::Firmware {
            return Err(Error::mode(state.mode, "end firmware access"));
        }
        self.enter(&mut state, Mode::Config)
    }

    /// Reprogram the flash with `image`
    ///
    /// Enters firmware access mode if needed; the session stays there
    /// afterwards, whatever the outcome. A full-speed link is refused before
    /// the mode changes.
    ///
    /// # Errors
    ///
    /// - [`Error::Mode`] when idle or closed
    /// - [`Error::UnsupportedSpeed`] on a full-speed link
    /// - [`Error::Upgrade`] naming the phase and offset that failed
    pub async fn upgrade_firmware(&self, image: &FirmwareImage) -> Result<()> {
        let mut state = self.state.lock().await;
        if matches!(state.mode, Mode::Idle | Mode::Terminated) {
            return Err(Error::mode(state.mode, "upgrade firmware"));
        }
        let programmer = FlashProgrammer::new(&*self.link, self.link.speed())?;
        self.enter(&mut state, Mode::Firmware)?;
        programmer.upgrade(image)
    }

    /// Run one control operation
    ///
    /// # Errors
    ///
    /// Whatever the matching typed method returns.
    pub async fn control(&self, request: ControlRequest<'_>) -> Result<ControlResponse> {
        let response = match request {
            ControlRequest::QueryVersion => ControlResponse::Version(self.version().await?),
            ControlRequest::QueryFpgaStatus => ControlResponse::Status(self.fpga_status().await?),
            ControlRequest::BeginProgramming => {
                ControlResponse::Status(self.begin_programming().await?)
            }
            ControlRequest::EndProgramming => ControlResponse::Status(self.end_programming().await?),
            ControlRequest::CheckProgramming => {
                ControlResponse::Programmed(self.check_programming().await?)
            }
            ControlRequest::RfRx(enable) => {
                self.set_rf_rx(enable).await?;
                ControlResponse::Done
            }
            ControlRequest::RfTx(enable) => {
                self.set_rf_tx(enable).await?;
                ControlResponse::Done
            }
            ControlRequest::RegisterRead(peripheral, address) => {
                ControlResponse::Register(self.register_read(peripheral, address).await?)
            }
            ControlRequest::RegisterWrite(peripheral, record) => {
                ControlResponse::Register(self.register_write(peripheral, record).await?)
            }
            ControlRequest::UpgradeFirmware(image) => {
                self.upgrade_firmware(image).await?;
                ControlResponse::Done
            }
        };
        Ok(response)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Disable both directions, release the slot pools and terminate
    ///
    /// Closing twice is harmless.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.mode == Mode::Terminated {
            return;
        }
        if state.mode == Mode::Streaming {
            self.quiesce();
        } else {
            self.tx.disable();
            self.rx.disable();
        }
        self.tx.stop();
        self.rx.stop();
        info!("mode {} -> {}", state.mode, Mode::Terminated);
        state.mode = Mode::Terminated;
    }
}

impl<L: UsbLink> core::fmt::Debug for Session<L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("rx", &self.rx)
            .field("tx", &self.tx)
            .finish_non_exhaustive()
    }
}
