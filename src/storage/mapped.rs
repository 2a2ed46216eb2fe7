//! Memory-mapped on-chip flash.

use super::{InternalFlash, StorageError, WORD_SIZE};

/// On-chip NOR flash visible in the address space, read one word at a time.
pub struct MappedFlash {
    base: usize,
    size: u32,
}

impl MappedFlash {
    /// # Safety
    ///
    /// `base..base + size` must be word aligned, readable memory for as long
    /// as the returned value exists, and must not be erased or programmed
    /// while it is being read.
    pub const unsafe fn new(base: usize, size: u32) -> Self {
        Self { base, size }
    }

    pub const fn size(&self) -> u32 {
        self.size
    }
}

impl InternalFlash for MappedFlash {
    fn read_words(&mut self, address: u32, words: &mut [u32]) -> Result<(), StorageError> {
        if address as usize % WORD_SIZE != 0 {
            return Err(StorageError::Misaligned);
        }
        let end = u64::from(address) + (words.len() * WORD_SIZE) as u64;
        if end > u64::from(self.size) {
            return Err(StorageError::OutOfBounds);
        }

        let src = (self.base + address as usize) as *const u32;
        for (i, word) in words.iter_mut().enumerate() {
            // SAFETY: bounds and alignment checked above, validity of the
            // whole window is the constructor's contract.
            *word = unsafe { core::ptr::read_volatile(src.add(i)) };
        }
        Ok(())
    }
}
