//! Command Block Wrapper and Command Status Wrapper codec.

use crate::scsi::{Direction, Request, CDB_MAX_LEN};

/// Exact length of a CBW on the wire.
pub const CBW_LEN: usize = 31;
/// Exact length of a CSW on the wire.
pub const CSW_LEN: usize = 13;

pub const CBW_SIGNATURE: u32 = 0x4342_5355;
pub const CSW_SIGNATURE: u32 = 0x5342_5355;

const DIRECTION_IN: u8 = 1 << 7;

/// Why a received CBW was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CbwError {
    /// Transfer length other than 31 bytes.
    Length(usize),
    /// Wrong signature.
    Signature(u32),
    /// `cdb_length` outside `1..=16`.
    CdbLength(u8),
}

/// Command Block Wrapper, host to device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cbw {
    pub tag: u32,
    pub data_length: u32,
    pub flags: u8,
    pub lun: u8,
    pub cdb_length: u8,
    pub cdb: [u8; CDB_MAX_LEN],
}

impl Cbw {
    pub fn parse(bytes: &[u8]) -> Result<Self, CbwError> {
        if bytes.len() != CBW_LEN {
            return Err(CbwError::Length(bytes.len()));
        }

        let signature = le_u32(&bytes[0..4]);
        if signature != CBW_SIGNATURE {
            return Err(CbwError::Signature(signature));
        }

        let cdb_length = bytes[14] & 0x1F;
        if !(1..=CDB_MAX_LEN as u8).contains(&cdb_length) {
            return Err(CbwError::CdbLength(cdb_length));
        }

        // Bytes past cdb_length are not part of the command.
        let mut cdb = [0u8; CDB_MAX_LEN];
        cdb[..usize::from(cdb_length)].copy_from_slice(&bytes[15..15 + usize::from(cdb_length)]);

        Ok(Self {
            tag: le_u32(&bytes[4..8]),
            data_length: le_u32(&bytes[8..12]),
            flags: bytes[12],
            lun: bytes[13] & 0x0F,
            cdb_length,
            cdb,
        })
    }

    pub fn direction(&self) -> Direction {
        if self.data_length == 0 {
            Direction::None
        } else if self.flags & DIRECTION_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// The command handed to the SCSI interpreter.
    pub fn request(&self) -> Request {
        Request::new(
            &self.cdb[..usize::from(self.cdb_length)],
            self.data_length,
            self.direction(),
        )
    }

    pub fn to_bytes(&self) -> [u8; CBW_LEN] {
        let mut bytes = [0u8; CBW_LEN];
        bytes[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.tag.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.data_length.to_le_bytes());
        bytes[12] = self.flags;
        bytes[13] = self.lun;
        bytes[14] = self.cdb_length;
        bytes[15..].copy_from_slice(&self.cdb);
        bytes
    }
}

/// The status of a Mass Storage command.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandStatus {
    #[default]
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

/// Command Status Wrapper, device to host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Csw {
    /// Copied from the CBW being completed.
    pub tag: u32,
    /// `data_length` of the CBW minus the bytes actually moved.
    pub data_residue: u32,
    pub status: CommandStatus,
}

impl Csw {
    pub fn to_bytes(&self) -> [u8; CSW_LEN] {
        let mut bytes = [0u8; CSW_LEN];
        bytes[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.tag.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.data_residue.to_le_bytes());
        bytes[12] = self.status as u8;
        bytes
    }

    /// Decodes a CSW; `None` if the length, signature or status is invalid.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != CSW_LEN || le_u32(&bytes[0..4]) != CSW_SIGNATURE {
            return None;
        }
        let status = match bytes[12] {
            0x00 => CommandStatus::Passed,
            0x01 => CommandStatus::Failed,
            0x02 => CommandStatus::PhaseError,
            _ => return None,
        };
        Some(Self {
            tag: le_u32(&bytes[4..8]),
            data_residue: le_u32(&bytes[8..12]),
            status,
        })
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inquiry() -> Cbw {
        let mut cdb = [0u8; CDB_MAX_LEN];
        cdb[..6].copy_from_slice(&[0x12, 0, 0, 0, 36, 0]);
        Cbw {
            tag: 7,
            data_length: 36,
            flags: 0x80,
            lun: 0,
            cdb_length: 6,
            cdb,
        }
    }

    #[test]
    fn parses_a_well_formed_cbw() {
        let bytes = inquiry().to_bytes();
        assert_eq!(&bytes[..4], &[0x55, 0x53, 0x42, 0x43]);

        let cbw = Cbw::parse(&bytes).unwrap();
        assert_eq!(cbw, inquiry());
        assert_eq!(cbw.direction(), Direction::In);
        assert_eq!(&cbw.request().cdb[..6], &[0x12, 0, 0, 0, 36, 0]);
    }

    #[test]
    fn trailing_cdb_bytes_are_ignored() {
        let mut bytes = inquiry().to_bytes();
        bytes[15 + 6] = 0xAA;
        assert_eq!(Cbw::parse(&bytes).unwrap().cdb[6], 0);
    }

    #[test]
    fn rejects_malformed_wrappers() {
        let bytes = inquiry().to_bytes();
        assert_eq!(Cbw::parse(&bytes[..30]), Err(CbwError::Length(30)));

        let mut long = [0u8; 32];
        long[..31].copy_from_slice(&bytes);
        assert_eq!(Cbw::parse(&long), Err(CbwError::Length(32)));

        let mut bad = bytes;
        bad[3] = 0x44;
        assert_eq!(Cbw::parse(&bad), Err(CbwError::Signature(0x4442_5355)));

        let mut empty = bytes;
        empty[14] = 0;
        assert_eq!(Cbw::parse(&empty), Err(CbwError::CdbLength(0)));

        let mut oversized = bytes;
        oversized[14] = 17;
        assert_eq!(Cbw::parse(&oversized), Err(CbwError::CdbLength(17)));
    }

    #[test]
    fn direction_follows_flags_and_length() {
        let mut cbw = inquiry();
        cbw.flags = 0;
        assert_eq!(cbw.direction(), Direction::Out);
        cbw.data_length = 0;
        cbw.flags = 0x80;
        assert_eq!(cbw.direction(), Direction::None);
    }

    #[test]
    fn csw_layout() {
        let csw = Csw {
            tag: 7,
            data_residue: 0x0102,
            status: CommandStatus::Failed,
        };
        let bytes = csw.to_bytes();
        assert_eq!(
            bytes,
            [0x55, 0x53, 0x42, 0x53, 7, 0, 0, 0, 0x02, 0x01, 0, 0, 0x01]
        );
        assert_eq!(Csw::parse(&bytes), Some(csw));
        assert_eq!(Csw::parse(&bytes[..12]), None);
    }
}
