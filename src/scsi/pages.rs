//! Byte layouts of the data-in payloads.

use crate::config::Config;

use super::Geometry;

pub const STANDARD_INQUIRY_LEN: usize = 36;

/// VPD page codes.
pub const VPD_SUPPORTED_PAGES: u8 = 0x00;
pub const VPD_DEVICE_IDENTIFICATION: u8 = 0x83;

/// Standard INQUIRY data (SPC-2): removable direct-access block device.
pub fn standard_inquiry(config: &Config) -> [u8; STANDARD_INQUIRY_LEN] {
    let mut data = [0u8; STANDARD_INQUIRY_LEN];
    data[0] = 0x00; // Peripheral device type: SBC direct access
    data[1] = 0x80; // RMB: Removable
    data[2] = 0x04; // Version: SPC-2
    data[3] = 0x02; // Response data format
    data[4] = (STANDARD_INQUIRY_LEN - 5) as u8;
    data[8..16].copy_from_slice(&config.vendor);
    data[16..32].copy_from_slice(&config.product);
    data[32..36].copy_from_slice(&config.revision);
    data
}

/// VPD page 00h listing the pages this device serves.
pub fn supported_vpd_pages() -> [u8; 6] {
    [
        0x00,
        VPD_SUPPORTED_PAGES,
        0x00,
        0x02, // Page length
        VPD_SUPPORTED_PAGES,
        VPD_DEVICE_IDENTIFICATION,
    ]
}

pub const DEVICE_IDENTIFICATION_LEN: usize = 4 + 4 + 8 + 16;

/// VPD page 83h with a single T10 vendor ID based designator made of the
/// vendor and product identification.
pub fn device_identification(config: &Config) -> [u8; DEVICE_IDENTIFICATION_LEN] {
    let mut data = [0u8; DEVICE_IDENTIFICATION_LEN];
    data[1] = VPD_DEVICE_IDENTIFICATION;
    data[3] = (DEVICE_IDENTIFICATION_LEN - 4) as u8;
    data[4] = 0x02; // Code set: ASCII
    data[5] = 0x01; // Association: logical unit, designator type: T10 vendor ID
    data[7] = (DEVICE_IDENTIFICATION_LEN - 8) as u8;
    data[8..16].copy_from_slice(&config.vendor);
    data[16..32].copy_from_slice(&config.product);
    data
}

fn device_specific(config: &Config) -> u8 {
    if config.write_protect {
        0x80
    } else {
        0x00
    }
}

/// MODE SENSE (6) parameter header without block descriptors or pages.
pub fn mode_sense6(config: &Config) -> [u8; 4] {
    [
        0x03, // Mode data length (3 bytes follow)
        0x00, // Medium type: default
        device_specific(config),
        0x00, // Block descriptor length: 0
    ]
}

/// MODE SENSE (10) parameter header without block descriptors or pages.
pub fn mode_sense10(config: &Config) -> [u8; 8] {
    [
        0x00,
        0x06, // Mode data length (6 bytes follow)
        0x00,
        device_specific(config),
        0x00,
        0x00,
        0x00,
        0x00, // Block descriptor length: 0
    ]
}

/// READ CAPACITY (10): last LBA and block length, big-endian.
pub fn read_capacity10(geometry: Geometry) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[0..4].copy_from_slice(&geometry.block_count.saturating_sub(1).to_be_bytes());
    data[4..8].copy_from_slice(&geometry.block_size.to_be_bytes());
    data
}

/// READ FORMAT CAPACITIES: header plus the current capacity descriptor.
pub fn read_format_capacities(geometry: Geometry) -> [u8; 12] {
    let mut data = [0u8; 12];
    data[3] = 0x08; // Capacity list length (8 bytes follow)
    data[4..8].copy_from_slice(&geometry.block_count.to_be_bytes());
    data[8] = 0x02; // Descriptor type: Formatted media
    data[9..12].copy_from_slice(&geometry.block_size.to_be_bytes()[1..4]);
    data
}
