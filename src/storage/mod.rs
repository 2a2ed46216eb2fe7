//! Storage backends holding the partitions.
//!
//! Two kinds of flash sit behind the partitions: the on-chip NOR flash, which
//! can only be read a whole 32-bit word at a time, and an external SPI NOR
//! flash with byte granular reads. [`Storage`] hides that difference and
//! serves byte ranges addressed in absolute device offsets.

pub mod mapped;
pub mod spi_nor;

/// Size of an internal flash word in bytes.
pub const WORD_SIZE: usize = 4;

/// Words fetched per internal flash request.
const WORDS_PER_READ: usize = 32;

/// Device a partition is stored on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageDevice {
    /// On-chip NOR flash, word addressed.
    InternalFlash,
    /// External SPI NOR flash, byte addressed.
    SpiFlash,
}

/// Errors raised by the storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    /// The board has no such device.
    NoDevice,
    /// The request reaches past the end of the device.
    OutOfBounds,
    /// A word read was requested at an address that is not word aligned.
    Misaligned,
    /// The bus transaction failed.
    Bus,
}

/// On-chip flash that only supports word aligned, word granular reads.
pub trait InternalFlash {
    /// Reads `words.len()` consecutive words starting at the word aligned byte
    /// `address`.
    fn read_words(&mut self, address: u32, words: &mut [u32]) -> Result<(), StorageError>;
}

/// External flash with byte granular reads.
pub trait SpiFlash {
    /// Fills `dest` with the bytes starting at `address`.
    fn read(&mut self, address: u32, dest: &mut [u8]) -> Result<(), StorageError>;
}

impl<T: InternalFlash + ?Sized> InternalFlash for &mut T {
    fn read_words(&mut self, address: u32, words: &mut [u32]) -> Result<(), StorageError> {
        (**self).read_words(address, words)
    }
}

impl<T: SpiFlash + ?Sized> SpiFlash for &mut T {
    fn read(&mut self, address: u32, dest: &mut [u8]) -> Result<(), StorageError> {
        (**self).read(address, dest)
    }
}

/// Placeholder for a backend that is not fitted on the board.
#[derive(Debug, Default, Clone, Copy)]
pub struct Absent;

impl InternalFlash for Absent {
    fn read_words(&mut self, _address: u32, _words: &mut [u32]) -> Result<(), StorageError> {
        Err(StorageError::NoDevice)
    }
}

impl SpiFlash for Absent {
    fn read(&mut self, _address: u32, _dest: &mut [u8]) -> Result<(), StorageError> {
        Err(StorageError::NoDevice)
    }
}

/// Routes reads to the backend a partition lives on.
pub struct Storage<I, S> {
    internal: I,
    spi: S,
}

impl<I: InternalFlash, S: SpiFlash> Storage<I, S> {
    pub const fn new(internal: I, spi: S) -> Self {
        Self { internal, spi }
    }

    /// Reads `dest.len()` bytes at absolute byte `offset` of `device`.
    ///
    /// Each call is a single blocking request; no second request is issued
    /// before the previous one has returned.
    pub fn read(
        &mut self,
        device: StorageDevice,
        offset: u32,
        dest: &mut [u8],
    ) -> Result<(), StorageError> {
        if dest.is_empty() {
            return Ok(());
        }

        let result = match device {
            StorageDevice::InternalFlash => read_internal(&mut self.internal, offset, dest),
            StorageDevice::SpiFlash => self.spi.read(offset, dest),
        };

        result.map_err(|e| {
            error!(
                "storage read failed: {:?} at 0x{:08x} (+{}): {:?}",
                device,
                offset,
                dest.len(),
                e
            );
            e
        })
    }

    pub fn release(self) -> (I, S) {
        (self.internal, self.spi)
    }
}

/// Reads an arbitrary byte range from word-only flash.
///
/// A misaligned head and a partial tail each cost one extra word read, of
/// which only the needed bytes are copied.
fn read_internal<I: InternalFlash>(
    flash: &mut I,
    mut address: u32,
    mut dest: &mut [u8],
) -> Result<(), StorageError> {
    let head = address as usize % WORD_SIZE;
    if head != 0 {
        let mut word = [0u32; 1];
        flash.read_words(address - head as u32, &mut word)?;

        let n = (WORD_SIZE - head).min(dest.len());
        dest[..n].copy_from_slice(&word[0].to_le_bytes()[head..head + n]);

        address = advance(address, n)?;
        dest = &mut core::mem::take(&mut dest)[n..];
    }

    let mut words = [0u32; WORDS_PER_READ];
    while dest.len() >= WORD_SIZE {
        let count = (dest.len() / WORD_SIZE).min(WORDS_PER_READ);
        flash.read_words(address, &mut words[..count])?;

        let bytes = count * WORD_SIZE;
        for (chunk, word) in dest[..bytes].chunks_exact_mut(WORD_SIZE).zip(&words[..count]) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }

        address = advance(address, bytes)?;
        dest = &mut core::mem::take(&mut dest)[bytes..];
    }

    if !dest.is_empty() {
        let mut word = [0u32; 1];
        flash.read_words(address, &mut word)?;
        let tail = dest.len();
        dest.copy_from_slice(&word[0].to_le_bytes()[..tail]);
    }

    Ok(())
}

fn advance(address: u32, by: usize) -> Result<u32, StorageError> {
    u32::try_from(by)
        .ok()
        .and_then(|by| address.checked_add(by))
        .ok_or(StorageError::OutOfBounds)
}
