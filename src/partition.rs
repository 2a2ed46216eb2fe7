//! Partition catalog.
//!
//! The static [`CATALOG`] names every partition the device can expose. At
//! startup it is resolved against the board's [`PartitionTable`]; partitions
//! the board does not have are left out.

use bitflags::bitflags;
use heapless::Vec;

use crate::storage::StorageDevice;

/// Upper bound on resolved partitions.
pub const MAX_PARTITIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PartitionId {
    Bootloader,
    Firmware,
    Settings,
    Storage,
    External,
}

bitflags! {
    /// FAT directory entry attribute byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

/// One row of the static catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: PartitionId,
    /// 8.3 name of the file exposing the partition.
    pub file_name: &'static str,
    pub attributes: Attributes,
}

const PROTECTED: Attributes = Attributes::READ_ONLY.union(Attributes::SYSTEM);

pub static CATALOG: [CatalogEntry; 5] = [
    CatalogEntry {
        id: PartitionId::Bootloader,
        file_name: "BOOTLOAD.BIN",
        attributes: PROTECTED,
    },
    CatalogEntry {
        id: PartitionId::Firmware,
        file_name: "FIRMWARE.BIN",
        attributes: Attributes::READ_ONLY,
    },
    CatalogEntry {
        id: PartitionId::Settings,
        file_name: "SETTINGS.BIN",
        attributes: Attributes::READ_ONLY,
    },
    CatalogEntry {
        id: PartitionId::Storage,
        file_name: "STORAGE.BIN",
        attributes: Attributes::READ_ONLY,
    },
    CatalogEntry {
        id: PartitionId::External,
        file_name: "EXTFLASH.BIN",
        attributes: Attributes::READ_ONLY,
    },
];

/// Where a partition lives, in absolute device bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PartitionGeometry {
    pub device: StorageDevice,
    pub start: u32,
    pub size: u32,
}

/// The platform's partition layout.
pub trait PartitionTable {
    fn lookup(&self, id: PartitionId) -> Option<PartitionGeometry>;
}

impl PartitionTable for [(PartitionId, PartitionGeometry)] {
    fn lookup(&self, id: PartitionId) -> Option<PartitionGeometry> {
        self.iter()
            .find(|(entry, _)| *entry == id)
            .map(|(_, geometry)| *geometry)
    }
}

impl<const N: usize> PartitionTable for [(PartitionId, PartitionGeometry); N] {
    fn lookup(&self, id: PartitionId) -> Option<PartitionGeometry> {
        self.as_slice().lookup(id)
    }
}

/// A catalog entry resolved against the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub id: PartitionId,
    pub attributes: Attributes,
    pub file_name: &'static str,
    pub geometry: PartitionGeometry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CatalogError {
    /// The board has more partitions than [`MAX_PARTITIONS`].
    TooManyPartitions,
}

/// Resolves every catalog entry the board has, keeping catalog order.
///
/// Entries the table does not know are skipped. Running out of room for an
/// entry that did resolve is an error.
pub fn resolve_catalog<T: PartitionTable + ?Sized>(
    catalog: &[CatalogEntry],
    table: &T,
) -> Result<Vec<PartitionDescriptor, MAX_PARTITIONS>, CatalogError> {
    let mut resolved = Vec::new();
    for entry in catalog {
        let Some(geometry) = table.lookup(entry.id) else {
            debug!("partition {:?} not present", entry.id);
            continue;
        };
        let descriptor = PartitionDescriptor {
            id: entry.id,
            attributes: entry.attributes,
            file_name: entry.file_name,
            geometry,
        };
        if resolved.push(descriptor).is_err() {
            error!("partition catalog full at {:?}", entry.id);
            return Err(CatalogError::TooManyPartitions);
        }
        info!(
            "partition {:?}: {:?} 0x{:08x} +0x{:x}",
            entry.id,
            geometry.device,
            geometry.start,
            geometry.size
        );
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn internal(start: u32, size: u32) -> PartitionGeometry {
        PartitionGeometry {
            device: StorageDevice::InternalFlash,
            start,
            size,
        }
    }

    #[test]
    fn absent_partitions_are_skipped() {
        let table = [
            (PartitionId::Firmware, internal(0x2_0000, 0x1000)),
            (PartitionId::Bootloader, internal(0, 0x2_0000)),
        ];
        let resolved = resolve_catalog(&CATALOG, &table).unwrap();

        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].id, PartitionId::Bootloader);
        assert_eq!(resolved[0].file_name, "BOOTLOAD.BIN");
        assert!(resolved[0].attributes.contains(Attributes::SYSTEM));
        assert_eq!(resolved[1].id, PartitionId::Firmware);
        assert_eq!(resolved[1].geometry, internal(0x2_0000, 0x1000));
    }

    #[test]
    fn empty_table_resolves_nothing() {
        let table: [(PartitionId, PartitionGeometry); 0] = [];
        assert!(resolve_catalog(&CATALOG, &table).unwrap().is_empty());
    }

    #[test]
    fn overflowing_catalog_is_an_error() {
        let catalog = [CATALOG[3]; MAX_PARTITIONS + 1];
        let table = [(PartitionId::Storage, internal(0x1E_0000, 0x2_0000))];

        assert_eq!(
            resolve_catalog(&catalog, &table),
            Err(CatalogError::TooManyPartitions)
        );
        let full = resolve_catalog(&catalog[..MAX_PARTITIONS], &table).unwrap();
        assert_eq!(full.len(), MAX_PARTITIONS);
    }

    #[test]
    fn catalog_names_fit_short_names() {
        for entry in &CATALOG {
            let (stem, ext) = entry.file_name.split_once('.').unwrap();
            assert!(stem.len() <= 8 && ext.len() <= 3, "{}", entry.file_name);
        }
    }
}
