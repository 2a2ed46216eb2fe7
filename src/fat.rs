//! FAT32 image synthesis.
//!
//! [`Volume`] presents a directory listing as a read-only FAT32 block device
//! without storing the image: boot sector, FSInfo, FATs and the root
//! directory are generated on the fly for each sector read, file data comes
//! from the entries' read callbacks.
//!
//! Layout: 32 reserved sectors (boot sector at 0, FSInfo at 1, their backups at
//! 6 and 7), two FATs, then the data region with 4 KiB clusters. The root
//! directory is cluster 2, files follow as contiguous cluster runs in listing
//! order. The cluster count is padded to the FAT32 minimum so every driver
//! detects the volume as FAT32.

use heapless::Vec;

use crate::directory::{DirectoryEntry, ReadCallback, MAX_FILES};
use crate::partition::Attributes;
use crate::scsi::{BlockDevice, Geometry};
use crate::storage::StorageError;

pub const SECTOR_SIZE: usize = 512;
const SECTORS_PER_CLUSTER: u32 = 8;
const CLUSTER_SIZE: u32 = SECTOR_SIZE as u32 * SECTORS_PER_CLUSTER;
const RESERVED_SECTORS: u32 = 32;
const FAT_COUNT: u32 = 2;
/// Fewer clusters than this and a driver takes the volume for FAT16.
const MIN_CLUSTERS: u32 = 65_525;
const MAX_CLUSTERS: u32 = 0x0FFF_FFF5;

const FSINFO_SECTOR: u32 = 1;
const BACKUP_BOOT_SECTOR: u32 = 6;
const BACKUP_FSINFO_SECTOR: u32 = BACKUP_BOOT_SECTOR + FSINFO_SECTOR;

const ROOT_CLUSTER: u32 = 2;
const FIRST_FILE_CLUSTER: u32 = 3;

const FAT_MEDIA: u32 = 0x0FFF_FFF8;
const FAT_EOC: u32 = 0x0FFF_FFFF;
const FAT_ENTRIES_PER_SECTOR: u32 = (SECTOR_SIZE / 4) as u32;

const DIR_ENTRY_SIZE: usize = 32;
const DIR_ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / DIR_ENTRY_SIZE;

/// 2024-01-01, stamped on every entry.
const FAT_DATE: u16 = ((2024 - 1980) << 9) | (1 << 5) | 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FatError {
    /// The listing does not start with a root directory entry.
    MissingRoot,
    /// Subdirectories or nested files.
    Unsupported,
    TooManyFiles,
    /// The files do not fit in a FAT32 volume.
    TooLarge,
}

struct File<C> {
    entry: DirectoryEntry<C>,
    short_name: [u8; 11],
    first_cluster: u32,
    clusters: u32,
}

impl<C> File<C> {
    fn contains(&self, cluster: u32) -> bool {
        self.clusters != 0
            && cluster >= self.first_cluster
            && cluster - self.first_cluster < self.clusters
    }
}

/// Read-only FAT32 volume over a directory listing.
pub struct Volume<C> {
    context: C,
    files: Vec<File<C>, MAX_FILES>,
    label: [u8; 11],
    volume_id: u32,
    cluster_count: u32,
    fat_sectors: u32,
    total_sectors: u32,
}

impl<C> Volume<C> {
    /// Lays out the image for `entries`, which must start with the root
    /// followed by its files. `context` is handed to every read callback.
    pub fn new(context: C, entries: &[DirectoryEntry<C>]) -> Result<Self, FatError> {
        let (root, children) = entries.split_first().ok_or(FatError::MissingRoot)?;
        if !root.is_directory || root.level != 0 {
            return Err(FatError::MissingRoot);
        }

        let mut files = Vec::new();
        let mut next_cluster = FIRST_FILE_CLUSTER;
        for entry in children {
            if entry.is_directory || entry.level != 1 {
                warn!("FAT: unsupported entry {}", entry.name);
                return Err(FatError::Unsupported);
            }

            let clusters = entry.max_size.max(entry.current_size).div_ceil(CLUSTER_SIZE);
            let first_cluster = if clusters == 0 { 0 } else { next_cluster };
            next_cluster = next_cluster
                .checked_add(clusters)
                .filter(|&c| c - 2 <= MAX_CLUSTERS)
                .ok_or(FatError::TooLarge)?;

            let file = File {
                entry: *entry,
                short_name: short_name(entry.name),
                first_cluster,
                clusters,
            };
            files.push(file).map_err(|_| FatError::TooManyFiles)?;
        }

        let cluster_count = (next_cluster - 2).max(MIN_CLUSTERS);
        let fat_sectors = ((cluster_count + 2) * 4).div_ceil(SECTOR_SIZE as u32);
        let total_sectors = cluster_count
            .checked_mul(SECTORS_PER_CLUSTER)
            .and_then(|data| data.checked_add(RESERVED_SECTORS + FAT_COUNT * fat_sectors))
            .ok_or(FatError::TooLarge)?;

        info!(
            "FAT: {} files, {} clusters, {} sectors",
            files.len(),
            cluster_count,
            total_sectors
        );

        Ok(Self {
            context,
            files,
            label: short_label("FLASH"),
            volume_id: 0x4355_0001,
            cluster_count,
            fat_sectors,
            total_sectors,
        })
    }

    /// Volume label, upper-cased and truncated to 11 characters.
    pub fn label(mut self, label: &str) -> Self {
        self.label = short_label(label);
        self
    }

    pub fn volume_id(mut self, volume_id: u32) -> Self {
        self.volume_id = volume_id;
        self
    }

    pub fn total_sectors(&self) -> u32 {
        self.total_sectors
    }

    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    fn data_start(&self) -> u32 {
        RESERVED_SECTORS + FAT_COUNT * self.fat_sectors
    }

    /// Fills `sector` with the content of sector `lba`.
    pub fn read_sector(&mut self, lba: u32, sector: &mut [u8; SECTOR_SIZE]) -> Result<(), StorageError> {
        if lba >= self.total_sectors {
            return Err(StorageError::OutOfBounds);
        }
        sector.fill(0);

        let data_start = self.data_start();
        match lba {
            0 | BACKUP_BOOT_SECTOR => self.boot_sector(sector),
            FSINFO_SECTOR | BACKUP_FSINFO_SECTOR => fs_info(sector),
            _ if lba < RESERVED_SECTORS => {}
            _ if lba < data_start => {
                let index = (lba - RESERVED_SECTORS) % self.fat_sectors;
                self.fat_sector(index, sector);
            }
            _ => {
                let relative = lba - data_start;
                let cluster = relative / SECTORS_PER_CLUSTER + 2;
                let within = relative % SECTORS_PER_CLUSTER;
                if cluster == ROOT_CLUSTER {
                    self.root_sector(within as usize, sector);
                } else {
                    self.data_sector(cluster, within, sector)?;
                }
            }
        }
        Ok(())
    }

    fn boot_sector(&self, s: &mut [u8; SECTOR_SIZE]) {
        s[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
        s[3..11].copy_from_slice(b"MSWIN4.1");
        s[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
        s[13] = SECTORS_PER_CLUSTER as u8;
        s[14..16].copy_from_slice(&(RESERVED_SECTORS as u16).to_le_bytes());
        s[16] = FAT_COUNT as u8;
        // Root entry count and 16-bit total sectors stay 0 on FAT32.
        s[21] = 0xF8; // Media: fixed disk
        s[24..26].copy_from_slice(&63u16.to_le_bytes()); // Sectors per track
        s[26..28].copy_from_slice(&255u16.to_le_bytes()); // Heads
        s[32..36].copy_from_slice(&self.total_sectors.to_le_bytes());
        s[36..40].copy_from_slice(&self.fat_sectors.to_le_bytes());
        s[44..48].copy_from_slice(&ROOT_CLUSTER.to_le_bytes());
        s[48..50].copy_from_slice(&(FSINFO_SECTOR as u16).to_le_bytes());
        s[50..52].copy_from_slice(&(BACKUP_BOOT_SECTOR as u16).to_le_bytes());
        s[64] = 0x80; // Drive number
        s[66] = 0x29; // Extended boot signature
        s[67..71].copy_from_slice(&self.volume_id.to_le_bytes());
        s[71..82].copy_from_slice(&self.label);
        s[82..90].copy_from_slice(b"FAT32   ");
        s[510] = 0x55;
        s[511] = 0xAA;
    }

    fn fat_sector(&self, index: u32, s: &mut [u8; SECTOR_SIZE]) {
        let first = index * FAT_ENTRIES_PER_SECTOR;
        let end = first + FAT_ENTRIES_PER_SECTOR;
        let mut put = |cluster: u32, value: u32| {
            let at = ((cluster - first) * 4) as usize;
            s[at..at + 4].copy_from_slice(&value.to_le_bytes());
        };

        for (cluster, value) in [(0, FAT_MEDIA), (1, FAT_EOC), (ROOT_CLUSTER, FAT_EOC)] {
            if (first..end).contains(&cluster) {
                put(cluster, value);
            }
        }

        for file in self.files.iter().filter(|f| f.clusters != 0) {
            let last = file.first_cluster + file.clusters - 1;
            let from = file.first_cluster.max(first);
            let to = last.min(end - 1);
            for cluster in from..=to {
                put(cluster, if cluster == last { FAT_EOC } else { cluster + 1 });
            }
        }
    }

    fn root_sector(&self, within: usize, s: &mut [u8; SECTOR_SIZE]) {
        // Slot 0 holds the volume label, slot n the (n-1)th file.
        let first = within * DIR_ENTRIES_PER_SECTOR;
        for (slot, chunk) in s.chunks_exact_mut(DIR_ENTRY_SIZE).enumerate() {
            match first + slot {
                0 => dir_entry(chunk, &self.label, Attributes::VOLUME_ID, 0, 0),
                n => {
                    let Some(file) = self.files.get(n - 1) else {
                        break;
                    };
                    let attributes = file.entry.attributes
                        - Attributes::DIRECTORY
                        - Attributes::VOLUME_ID;
                    dir_entry(
                        chunk,
                        &file.short_name,
                        attributes,
                        file.first_cluster,
                        file.entry.current_size,
                    );
                }
            }
        }
    }

    fn data_sector(
        &mut self,
        cluster: u32,
        within: u32,
        s: &mut [u8; SECTOR_SIZE],
    ) -> Result<(), StorageError> {
        let Some(file) = self.files.iter().find(|f| f.contains(cluster)) else {
            return Ok(());
        };

        let offset = (cluster - file.first_cluster) * CLUSTER_SIZE + within * SECTOR_SIZE as u32;
        if offset >= file.entry.current_size {
            return Ok(());
        }
        let len = ((file.entry.current_size - offset) as usize).min(SECTOR_SIZE);

        let read: ReadCallback<C> = match file.entry.read {
            Some(read) => read,
            None => return Ok(()),
        };
        let at = file
            .entry
            .offset
            .checked_add(offset)
            .ok_or(StorageError::OutOfBounds)?;
        let tag = file.entry.tag;
        read(&mut self.context, &mut s[..len], at, tag)
    }
}

impl<C> BlockDevice for Volume<C> {
    fn geometry(&mut self) -> Result<Geometry, StorageError> {
        Ok(Geometry {
            block_count: self.total_sectors,
            block_size: SECTOR_SIZE as u32,
        })
    }

    fn read(&mut self, offset: u64, mut dest: &mut [u8]) -> Result<(), StorageError> {
        let mut sector = [0u8; SECTOR_SIZE];
        let mut offset = offset;
        while !dest.is_empty() {
            let lba = u32::try_from(offset / SECTOR_SIZE as u64)
                .map_err(|_| StorageError::OutOfBounds)?;
            let within = (offset % SECTOR_SIZE as u64) as usize;
            let len = (SECTOR_SIZE - within).min(dest.len());

            self.read_sector(lba, &mut sector)?;
            dest[..len].copy_from_slice(&sector[within..within + len]);

            offset += len as u64;
            dest = &mut core::mem::take(&mut dest)[len..];
        }
        Ok(())
    }
}

fn fs_info(s: &mut [u8; SECTOR_SIZE]) {
    s[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
    s[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
    // Free count and next free are unknown.
    s[488..492].copy_from_slice(&u32::MAX.to_le_bytes());
    s[492..496].copy_from_slice(&u32::MAX.to_le_bytes());
    s[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
}

fn dir_entry(e: &mut [u8], name: &[u8; 11], attributes: Attributes, cluster: u32, size: u32) {
    e[0..11].copy_from_slice(name);
    e[11] = attributes.bits();
    e[16..18].copy_from_slice(&FAT_DATE.to_le_bytes()); // Created
    e[18..20].copy_from_slice(&FAT_DATE.to_le_bytes()); // Accessed
    e[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
    e[24..26].copy_from_slice(&FAT_DATE.to_le_bytes()); // Modified
    e[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
    e[28..32].copy_from_slice(&size.to_le_bytes());
}

fn short_char(c: u8) -> u8 {
    match c.to_ascii_uppercase() {
        c @ (b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' | b'~' | b'!' | b'#' | b'$' | b'%' | b'&') => c,
        _ => b'_',
    }
}

/// `"firmware.bin"` -> `b"FIRMWAREBIN"`.
fn short_name(name: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    for (dst, &c) in out[..8].iter_mut().zip(stem.as_bytes()) {
        *dst = short_char(c);
    }
    for (dst, &c) in out[8..].iter_mut().zip(ext.as_bytes()) {
        *dst = short_char(c);
    }
    out
}

fn short_label(label: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    for (dst, &c) in out.iter_mut().zip(label.as_bytes()) {
        *dst = if c == b' ' { c } else { short_char(c) };
    }
    out
}
