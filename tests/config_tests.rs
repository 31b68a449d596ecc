//! Configuration and Constants Tests
//!
//! Tests to verify device constants and stream geometry checks.
//! Run with: cargo test --test config_tests

use bladerf_host::config::*;
use bladerf_host::error::Error;

// =============================================================================
// Device Identity and Endpoints
// =============================================================================

#[test]
fn usb_ids_match_bladerf() {
    assert_eq!(USB_VID, 0x1d50);
    assert_eq!(USB_PID, 0x6066);
}

#[test]
fn vendor_request_types() {
    // Vendor type, device recipient; bit 7 selects device-to-host
    assert_eq!(USB_TYPE_OUT, 0x40);
    assert_eq!(USB_TYPE_IN, USB_TYPE_OUT | 0x80);
}

#[test]
fn endpoint_directions() {
    // IN endpoints carry bit 7
    assert_eq!(endpoints::STREAM_IN & 0x80, 0x80);
    assert_eq!(endpoints::CONTROL_IN & 0x80, 0x80);
    assert_eq!(endpoints::STREAM_OUT & 0x80, 0);
    assert_eq!(endpoints::CONTROL_OUT & 0x80, 0);
    assert_eq!(endpoints::STREAM_IN & 0x7F, endpoints::STREAM_OUT);
    assert_eq!(endpoints::CONTROL_IN & 0x7F, endpoints::CONTROL_OUT);
}

// =============================================================================
// Flash Layout
// =============================================================================

#[test]
fn sector_holds_whole_pages() {
    assert_eq!(FLASH_SECTOR_SIZE % FLASH_PAGE_SIZE, 0);
    assert_eq!(FLASH_SECTOR_SIZE / FLASH_PAGE_SIZE, 256);
}

#[test]
fn flash_chunks_divide_a_page() {
    assert_eq!(FLASH_PAGE_SIZE % FLASH_CHUNK_HIGH_SPEED, 0);
    assert_eq!(FLASH_CHUNK_SUPER_SPEED, FLASH_PAGE_SIZE);
}

#[test]
fn erase_timeout_exceeds_request_timeout() {
    assert!(FLASH_ERASE_TIMEOUT > USB_TIMEOUT);
}

// =============================================================================
// Register Frames
// =============================================================================

#[test]
fn register_frame_constants() {
    assert_eq!(REGISTER_FRAME_LEN, 16);
    assert_eq!(REGISTER_MAGIC, b'N');
    assert_eq!(REGISTER_READ_PLACEHOLDER, 0xFF);
    assert!(REGISTER_RESPONSE_TIMEOUT < USB_TIMEOUT);
}

// =============================================================================
// Stream Geometry
// =============================================================================

#[test]
fn default_geometry() {
    let config = StreamConfig::default();
    assert_eq!(config, StreamConfig::new());
    assert_eq!(config.slots, 1024);
    assert_eq!(config.transfer_size, 4096);
    assert_eq!(config.window, 8);
    assert!(config.validate().is_ok());
}

#[test]
fn default_window_fits_tracking_set() {
    assert!(CONCURRENCY_WINDOW <= MAX_WINDOW);
    assert!(CONCURRENCY_WINDOW <= NUM_SLOTS);
}

#[test]
fn slot_count_must_be_power_of_two() {
    for slots in [0, 3, 10, 1000] {
        let config = StreamConfig::new().with_slots(slots);
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
    }
    for slots in [1, 2, 64, 65536] {
        assert!(StreamConfig::new().with_slots(slots).validate().is_ok());
    }
}

#[test]
fn slot_count_must_fit_slot_id() {
    let config = StreamConfig::new().with_slots(1 << 17);
    assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
}

#[test]
fn window_bounds() {
    assert!(StreamConfig::new().with_window(0).validate().is_err());
    assert!(StreamConfig::new().with_window(MAX_WINDOW + 1).validate().is_err());
    assert!(StreamConfig::new().with_window(1).validate().is_ok());
    assert!(StreamConfig::new().with_window(MAX_WINDOW).validate().is_ok());
}

#[test]
fn transfer_size_must_be_non_zero() {
    let config = StreamConfig::new().with_transfer_size(0);
    assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
}
