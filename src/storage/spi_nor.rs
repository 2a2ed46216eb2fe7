//! External SPI NOR flash.

use embedded_hal::spi::{Error as _, Operation, SpiDevice};

use super::{SpiFlash, StorageError};

/// JEDEC READ DATA, 24-bit address, no dummy cycles.
const READ_DATA: u8 = 0x03;

/// Largest capacity reachable with 3-byte addressing.
const MAX_CAPACITY: u32 = 1 << 24;

/// SPI NOR flash read through any `embedded-hal` SPI device.
pub struct SpiNor<SPI> {
    spi: SPI,
    capacity: u32,
}

impl<SPI: SpiDevice> SpiNor<SPI> {
    /// `capacity` is clamped to the 16 MiB reachable with 3-byte addresses.
    pub fn new(spi: SPI, capacity: u32) -> Self {
        Self {
            spi,
            capacity: capacity.min(MAX_CAPACITY),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn release(self) -> SPI {
        self.spi
    }
}

impl<SPI: SpiDevice> SpiFlash for SpiNor<SPI> {
    fn read(&mut self, address: u32, dest: &mut [u8]) -> Result<(), StorageError> {
        let end = u64::from(address) + dest.len() as u64;
        if end > u64::from(self.capacity) {
            return Err(StorageError::OutOfBounds);
        }

        let [_, a2, a1, a0] = address.to_be_bytes();
        self.spi
            .transaction(&mut [
                Operation::Write(&[READ_DATA, a2, a1, a0]),
                Operation::Read(dest),
            ])
            .map_err(|e| {
                warn!("SPI NOR transaction failed: {:?}", e.kind());
                StorageError::Bus
            })
    }
}
