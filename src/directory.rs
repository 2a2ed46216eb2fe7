//! Virtual directory exposing each resolved partition as one file.

use core::fmt;

use heapless::Vec;

use crate::partition::{Attributes, PartitionDescriptor, MAX_PARTITIONS};
use crate::storage::{InternalFlash, SpiFlash, Storage, StorageError};

/// Files the directory can hold.
pub const MAX_FILES: usize = MAX_PARTITIONS;
/// Files plus the root entry.
pub const MAX_ENTRIES: usize = MAX_FILES + 1;

/// Reads `dest.len()` bytes at byte `offset` of the file tagged `tag`.
pub type ReadCallback<C> = fn(&mut C, &mut [u8], u32, usize) -> Result<(), StorageError>;

/// One node of the directory tree, in the order the FAT image lists them.
pub struct DirectoryEntry<C> {
    /// 8.3 file name; empty for the root.
    pub name: &'static str,
    pub is_directory: bool,
    /// 0 for the root, 1 for its children.
    pub level: u8,
    /// Byte offset added to every read of this entry.
    pub offset: u32,
    pub current_size: u32,
    /// Space reserved in the image for the file.
    pub max_size: u32,
    /// Handed back to `read` untouched.
    pub tag: usize,
    pub attributes: Attributes,
    pub read: Option<ReadCallback<C>>,
}

impl<C> DirectoryEntry<C> {
    pub const fn root() -> Self {
        Self {
            name: "",
            is_directory: true,
            level: 0,
            offset: 0,
            current_size: 0,
            max_size: 0,
            tag: 0,
            attributes: Attributes::DIRECTORY,
            read: None,
        }
    }
}

impl<C> Clone for DirectoryEntry<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for DirectoryEntry<C> {}

impl<C> fmt::Debug for DirectoryEntry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryEntry")
            .field("name", &self.name)
            .field("is_directory", &self.is_directory)
            .field("level", &self.level)
            .field("offset", &self.offset)
            .field("current_size", &self.current_size)
            .field("max_size", &self.max_size)
            .field("tag", &self.tag)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DirectoryError {
    /// More partitions than the directory has room for.
    TooManyEntries,
}

/// Read context of the partition files: the storage dispatcher plus the
/// partitions, indexed by entry tag.
pub struct PartitionReader<I, S> {
    storage: Storage<I, S>,
    partitions: Vec<PartitionDescriptor, MAX_FILES>,
}

impl<I: InternalFlash, S: SpiFlash> PartitionReader<I, S> {
    pub fn new(
        storage: Storage<I, S>,
        partitions: &[PartitionDescriptor],
    ) -> Result<Self, DirectoryError> {
        Ok(Self {
            storage,
            partitions: Vec::from_slice(partitions).map_err(|_| DirectoryError::TooManyEntries)?,
        })
    }

    pub fn partitions(&self) -> &[PartitionDescriptor] {
        &self.partitions
    }

    pub fn release(self) -> Storage<I, S> {
        self.storage
    }
}

/// Reads part of a partition file.
///
/// Anything past the end of the partition is left untouched in `dest`.
pub fn read_partition<I: InternalFlash, S: SpiFlash>(
    reader: &mut PartitionReader<I, S>,
    dest: &mut [u8],
    offset: u32,
    tag: usize,
) -> Result<(), StorageError> {
    let partition = reader.partitions.get(tag).ok_or(StorageError::NoDevice)?;
    let geometry = partition.geometry;

    let available = geometry.size.saturating_sub(offset) as usize;
    let len = dest.len().min(available);
    if len == 0 {
        return Ok(());
    }

    let start = geometry
        .start
        .checked_add(offset)
        .ok_or(StorageError::OutOfBounds)?;
    reader.storage.read(geometry.device, start, &mut dest[..len])
}

/// Lays out the root followed by one file per partition, tagged with its
/// index in `partitions`.
pub fn build_directory<I: InternalFlash, S: SpiFlash>(
    partitions: &[PartitionDescriptor],
) -> Result<Vec<DirectoryEntry<PartitionReader<I, S>>, MAX_ENTRIES>, DirectoryError> {
    if partitions.len() > MAX_FILES {
        error!(
            "{} partitions, the directory holds {}",
            partitions.len(),
            MAX_FILES
        );
        return Err(DirectoryError::TooManyEntries);
    }

    let mut entries = Vec::new();
    entries
        .push(DirectoryEntry::root())
        .map_err(|_| DirectoryError::TooManyEntries)?;

    for (tag, partition) in partitions.iter().enumerate() {
        let file = DirectoryEntry {
            name: partition.file_name,
            is_directory: false,
            level: 1,
            offset: 0,
            current_size: partition.geometry.size,
            max_size: partition.geometry.size,
            tag,
            attributes: partition.attributes,
            read: Some(read_partition::<I, S> as ReadCallback<PartitionReader<I, S>>),
        };
        entries
            .push(file)
            .map_err(|_| DirectoryError::TooManyEntries)?;
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{PartitionGeometry, PartitionId};
    use crate::storage::{Absent, StorageDevice};

    /// Word flash backed by a byte image where byte `n` is `n as u8`.
    struct Ramp;

    impl InternalFlash for Ramp {
        fn read_words(&mut self, address: u32, words: &mut [u32]) -> Result<(), StorageError> {
            for (i, word) in words.iter_mut().enumerate() {
                let base = address + 4 * i as u32;
                *word = u32::from_le_bytes([
                    base as u8,
                    (base + 1) as u8,
                    (base + 2) as u8,
                    (base + 3) as u8,
                ]);
            }
            Ok(())
        }
    }

    fn partition(id: PartitionId, name: &'static str, start: u32, size: u32) -> PartitionDescriptor {
        PartitionDescriptor {
            id,
            attributes: Attributes::READ_ONLY,
            file_name: name,
            geometry: PartitionGeometry {
                device: StorageDevice::InternalFlash,
                start,
                size,
            },
        }
    }

    fn partitions() -> [PartitionDescriptor; 2] {
        [
            partition(PartitionId::Firmware, "FIRMWARE.BIN", 0x100, 0x40),
            partition(PartitionId::Settings, "SETTINGS.BIN", 0x1000, 0x10),
        ]
    }

    #[test]
    fn root_comes_first_then_files_in_order() {
        let entries = build_directory::<Ramp, Absent>(&partitions()).unwrap();

        assert_eq!(entries.len(), 3);
        assert!(entries[0].is_directory);
        assert_eq!(entries[0].level, 0);
        assert!(entries[0].read.is_none());

        assert_eq!(entries[1].name, "FIRMWARE.BIN");
        assert_eq!(entries[1].tag, 0);
        assert_eq!(entries[1].level, 1);
        assert_eq!(entries[1].current_size, 0x40);
        assert_eq!(entries[2].name, "SETTINGS.BIN");
        assert_eq!(entries[2].tag, 1);
    }

    #[test]
    fn too_many_partitions_are_rejected() {
        let many = [partition(PartitionId::Storage, "STORAGE.BIN", 0, 4); MAX_FILES + 1];
        assert_eq!(
            build_directory::<Ramp, Absent>(&many).unwrap_err(),
            DirectoryError::TooManyEntries
        );
    }

    #[test]
    fn reads_are_relative_to_the_partition() {
        let entries = build_directory::<Ramp, Absent>(&partitions()).unwrap();
        let mut reader = PartitionReader::new(Storage::new(Ramp, Absent), &partitions()).unwrap();

        let file = entries[2];
        let read = file.read.unwrap();
        let mut dest = [0u8; 4];
        read(&mut reader, &mut dest, 2, file.tag).unwrap();
        assert_eq!(dest, [0x02, 0x03, 0x04, 0x05]);
    }

    #[test]
    fn reads_are_clamped_to_the_partition_end() {
        let mut reader = PartitionReader::new(Storage::new(Ramp, Absent), &partitions()).unwrap();

        let mut dest = [0xEEu8; 8];
        read_partition(&mut reader, &mut dest, 0x0C, 1).unwrap();
        assert_eq!(&dest[..4], &[0x0C, 0x0D, 0x0E, 0x0F]);
        assert_eq!(&dest[4..], &[0xEE; 4]);

        let mut past = [0xEEu8; 4];
        read_partition(&mut reader, &mut past, 0x20, 1).unwrap();
        assert_eq!(past, [0xEE; 4]);
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let mut reader = PartitionReader::new(Storage::new(Ramp, Absent), &partitions()).unwrap();
        let mut dest = [0u8; 4];
        assert_eq!(
            read_partition(&mut reader, &mut dest, 0, 7),
            Err(StorageError::NoDevice)
        );
    }
}
