//! Firmware Upgrade
//!
//! Reprograms the device's SPI flash through vendor control requests in
//! three strictly ordered phases:
//!
//! 1. **Erase** every 64 KiB sector the image touches
//! 2. **Write** pages from the last to the first
//! 3. **Verify** pages from the first to the last, stopping at the first
//!    byte that differs
//!
//! Pages move in chunks sized by the link speed. Erase and read-back requests
//! are retried on transport failure; page writes are not. A failure in any
//! phase ends the upgrade, and the flash is left as it is.

use log::{debug, info};

use crate::config::{
    CONTROL_ATTEMPTS, FLASH_ERASE_OK, FLASH_ERASE_TIMEOUT, FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE,
    USB_TIMEOUT,
};
use crate::error::{
    Error, ProtocolError, Result, TransportError, UpgradeError, UpgradeErrorKind, UpgradePhase,
};
use crate::types::LinkSpeed;
use crate::usb::control::{with_retries, Command};
use crate::usb::link::UsbLink;

/// Value of erased flash bytes
pub const ERASED_BYTE: u8 = 0xFF;

/// Firmware image rounded up to whole flash pages
#[derive(Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Take an image of `len` bytes from `buffer`
    ///
    /// The length is rounded up to the page size and the rounded length is
    /// taken from `buffer`, which must be at least that long.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an empty image, a buffer shorter than
    /// the rounded length, or an image too large to address.
    pub fn new(len: usize, buffer: &[u8]) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidArgument("empty firmware image"));
        }
        let rounded = len
            .checked_next_multiple_of(FLASH_PAGE_SIZE)
            .ok_or(Error::InvalidArgument("firmware image too large"))?;
        if buffer.len() < rounded {
            return Err(Error::InvalidArgument(
                "firmware buffer shorter than page-rounded length",
            ));
        }
        Self::from_vec(buffer[..rounded].to_vec())
    }

    /// Take an image of any length, padding the last page with erased bytes
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an empty or unaddressable image.
    pub fn padded(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidArgument("empty firmware image"));
        }
        let rounded = bytes
            .len()
            .checked_next_multiple_of(FLASH_PAGE_SIZE)
            .ok_or(Error::InvalidArgument("firmware image too large"))?;
        let mut data = bytes.to_vec();
        data.resize(rounded, ERASED_BYTE);
        Self::from_vec(data)
    }

    fn from_vec(data: Vec<u8>) -> Result<Self> {
        // Page and sector numbers travel as 16-bit request indices, and the
        // failure offset as a u32.
        if data.len() / FLASH_PAGE_SIZE > usize::from(u16::MAX) + 1 {
            return Err(Error::InvalidArgument("firmware image exceeds flash page range"));
        }
        Ok(Self { data })
    }

    /// Length in bytes, a multiple of the page size
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always `false`; empty images are refused
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Image bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of flash pages
    #[must_use]
    pub fn pages(&self) -> usize {
        self.data.len() / FLASH_PAGE_SIZE
    }

    /// Number of flash sectors touched
    #[must_use]
    pub fn sectors(&self) -> usize {
        self.data.len().div_ceil(FLASH_SECTOR_SIZE)
    }

    /// Bytes of page `index`
    ///
    /// # Panics
    ///
    /// If `index` is not below [`FirmwareImage::pages`].
    #[must_use]
    pub fn page(&self, index: usize) -> &[u8] {
        let start = index * FLASH_PAGE_SIZE;
        &self.data[start..start + FLASH_PAGE_SIZE]
    }
}

impl core::fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("len", &self.len())
            .field("pages", &self.pages())
            .field("sectors", &self.sectors())
            .finish()
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn request_index(index: usize) -> u16 {
    index as u16
}

#[allow(clippy::cast_possible_truncation)]
const fn flash_offset(offset: usize) -> u32 {
    offset as u32
}

/// Erase, write and verify an image over a link
pub struct FlashProgrammer<'a, L: UsbLink + ?Sized> {
    link: &'a L,
    chunk: usize,
}

impl<'a, L: UsbLink + ?Sized> FlashProgrammer<'a, L> {
    /// Bind to a link running at `speed`
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedSpeed`] on a full-speed link.
    pub fn new(link: &'a L, speed: LinkSpeed) -> Result<Self> {
        let chunk = speed.flash_chunk_size().ok_or(Error::UnsupportedSpeed)?;
        Ok(Self { link, chunk })
    }

    /// Bytes moved per control request
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk
    }

    /// Run all three phases
    ///
    /// # Errors
    ///
    /// [`Error::Upgrade`] naming the phase and flash offset that failed.
    pub fn upgrade(&self, image: &FirmwareImage) -> Result<()> {
        info!(
            "flash upgrade: {} bytes, {} sectors, {} pages",
            image.len(),
            image.sectors(),
            image.pages()
        );
        self.erase(image)?;
        self.write(image)?;
        self.verify(image)?;
        info!("flash upgrade complete");
        Ok(())
    }

    /// Erase every sector the image covers
    ///
    /// # Errors
    ///
    /// [`Error::Upgrade`] in the erase phase at the failing sector's offset.
    pub fn erase(&self, image: &FirmwareImage) -> Result<()> {
        for sector in 0..image.sectors() {
            let fail = |kind: UpgradeErrorKind| UpgradeError {
                phase: UpgradePhase::Erase,
                offset: flash_offset(sector * FLASH_SECTOR_SIZE),
                kind,
            };

            let mut status = [0u8; 4];
            let n = with_retries("flash erase", CONTROL_ATTEMPTS, || {
                self.link.control_in(
                    Command::FlashErase.code(),
                    0,
                    request_index(sector),
                    &mut status,
                    FLASH_ERASE_TIMEOUT,
                )
            })
            .map_err(|err| fail(err.into()))?;

            if n != status.len() {
                return Err(fail(
                    ProtocolError::ShortResponse {
                        expected: status.len(),
                        actual: n,
                    }
                    .into(),
                )
                .into());
            }
            let word = u32::from_le_bytes(status);
            if word != FLASH_ERASE_OK {
                return Err(fail(ProtocolError::UnexpectedStatus(word).into()).into());
            }
            debug!("erased sector {sector}");
        }
        info!("erased {} sectors", image.sectors());
        Ok(())
    }

    /// Program pages from the last to the first
    ///
    /// # Errors
    ///
    /// [`Error::Upgrade`] in the write phase at the failing chunk's offset.
    pub fn write(&self, image: &FirmwareImage) -> Result<()> {
        for page in (0..image.pages()).rev() {
            let bytes = image.page(page);
            for (i, chunk) in bytes.chunks(self.chunk).enumerate() {
                let offset = page * FLASH_PAGE_SIZE + i * self.chunk;
                let fail = |kind: UpgradeErrorKind| UpgradeError {
                    phase: UpgradePhase::Write,
                    offset: flash_offset(offset),
                    kind,
                };

                let n = self
                    .link
                    .control_out(
                        Command::FlashWrite.code(),
                        0,
                        request_index(page),
                        chunk,
                        USB_TIMEOUT,
                    )
                    .map_err(|err: TransportError| fail(err.into()))?;
                if n != chunk.len() {
                    return Err(fail(
                        ProtocolError::ShortResponse {
                            expected: chunk.len(),
                            actual: n,
                        }
                        .into(),
                    )
                    .into());
                }
            }
        }
        info!("wrote {} pages", image.pages());
        Ok(())
    }

    /// Read pages back from the first to the last and compare
    ///
    /// # Errors
    ///
    /// [`Error::Upgrade`] in the verify phase; for a mismatch the offset is
    /// the first differing byte.
    pub fn verify(&self, image: &FirmwareImage) -> Result<()> {
        let mut readback = [0u8; FLASH_PAGE_SIZE];
        for page in 0..image.pages() {
            let expected = image.page(page);
            for (i, chunk) in readback.chunks_mut(self.chunk).enumerate() {
                let offset = page * FLASH_PAGE_SIZE + i * self.chunk;
                let fail = |kind: UpgradeErrorKind| UpgradeError {
                    phase: UpgradePhase::Verify,
                    offset: flash_offset(offset),
                    kind,
                };

                let want = chunk.len();
                let n = with_retries("flash read", CONTROL_ATTEMPTS, || {
                    self.link.control_in(
                        Command::FlashRead.code(),
                        0,
                        request_index(page),
                        chunk,
                        USB_TIMEOUT,
                    )
                })
                .map_err(|err| fail(err.into()))?;
                if n != want {
                    return Err(fail(
                        ProtocolError::ShortResponse {
                            expected: want,
                            actual: n,
                        }
                        .into(),
                    )
                    .into());
                }
            }

            if let Some(pos) = expected.iter().zip(&readback).position(|(a, b)| a != b) {
                let offset = page * FLASH_PAGE_SIZE + pos;
                return Err(UpgradeError {
                    phase: UpgradePhase::Verify,
                    offset: flash_offset(offset),
                    kind: UpgradeErrorKind::Mismatch {
                        expected: expected[pos],
                        observed: readback[pos],
                    },
                }
                .into());
            }
        }
        info!("verified {} pages", image.pages());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rounds_up_to_page() {
        let buffer = vec![0xA5; 512];
        let image = FirmwareImage::new(300, &buffer).unwrap();
        assert_eq!(image.len(), 512);
        assert_eq!(image.pages(), 2);
        assert_eq!(image.sectors(), 1);
    }

    #[test]
    fn new_refuses_short_buffer() {
        let buffer = vec![0u8; 300];
        assert_eq!(
            FirmwareImage::new(300, &buffer),
            Err(Error::InvalidArgument(
                "firmware buffer shorter than page-rounded length"
            ))
        );
    }

    #[test]
    fn padded_fills_with_erased_bytes() {
        let image = FirmwareImage::padded(&[1, 2, 3]).unwrap();
        assert_eq!(image.len(), FLASH_PAGE_SIZE);
        assert_eq!(&image.as_bytes()[..3], &[1, 2, 3]);
        assert!(image.as_bytes()[3..].iter().all(|&b| b == ERASED_BYTE));
    }

    #[test]
    fn empty_image_refused() {
        assert!(FirmwareImage::padded(&[]).is_err());
        assert!(FirmwareImage::new(0, &[0u8; 256]).is_err());
    }

    #[test]
    fn sector_count_spans_partial_sector() {
        let image = FirmwareImage::padded(&vec![0u8; FLASH_SECTOR_SIZE + 1]).unwrap();
        assert_eq!(image.sectors(), 2);
        assert_eq!(image.pages(), FLASH_SECTOR_SIZE / FLASH_PAGE_SIZE + 1);
    }
}
