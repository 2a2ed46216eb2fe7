//! Sense data model.

use crate::storage::StorageError;

/// Length of fixed format sense data.
pub const SENSE_DATA_LEN: usize = 18;

/// SCSI sense key (SPC-3 table 27), the subset this device reports.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SenseKey {
    #[default]
    NoSense = 0x00,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
}

/// Additional sense code and qualifier pairs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdditionalSense {
    #[default]
    NoAdditionalSense,
    /// 11h/00h
    UnrecoveredReadError,
    /// 21h/00h
    LbaOutOfRange,
    /// 24h/00h
    InvalidFieldInCdb,
    /// 25h/00h
    LogicalUnitNotSupported,
    /// 27h/00h
    WriteProtected,
    /// 3Ah/00h
    MediumNotPresent,
}

impl AdditionalSense {
    /// `(ASC, ASCQ)`
    pub const fn code(self) -> (u8, u8) {
        match self {
            Self::NoAdditionalSense => (0x00, 0x00),
            Self::UnrecoveredReadError => (0x11, 0x00),
            Self::LbaOutOfRange => (0x21, 0x00),
            Self::InvalidFieldInCdb => (0x24, 0x00),
            Self::LogicalUnitNotSupported => (0x25, 0x00),
            Self::WriteProtected => (0x27, 0x00),
            Self::MediumNotPresent => (0x3A, 0x00),
        }
    }
}

/// The sense record of the single logical unit.
///
/// Also the error type of a failing command: the interpreter stores it and
/// hands it back to the host on the next REQUEST SENSE.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sense {
    pub key: SenseKey,
    pub additional: AdditionalSense,
}

impl Sense {
    pub const NONE: Self = Self::new(SenseKey::NoSense, AdditionalSense::NoAdditionalSense);
    pub const INVALID_CDB: Self =
        Self::new(SenseKey::IllegalRequest, AdditionalSense::InvalidFieldInCdb);
    pub const LBA_OUT_OF_RANGE: Self =
        Self::new(SenseKey::IllegalRequest, AdditionalSense::LbaOutOfRange);
    pub const LUN_NOT_SUPPORTED: Self =
        Self::new(SenseKey::IllegalRequest, AdditionalSense::LogicalUnitNotSupported);
    pub const MEDIUM_NOT_PRESENT: Self =
        Self::new(SenseKey::NotReady, AdditionalSense::MediumNotPresent);
    pub const WRITE_PROTECTED: Self =
        Self::new(SenseKey::DataProtect, AdditionalSense::WriteProtected);
    pub const UNRECOVERED_READ_ERROR: Self =
        Self::new(SenseKey::HardwareError, AdditionalSense::UnrecoveredReadError);

    pub const fn new(key: SenseKey, additional: AdditionalSense) -> Self {
        Self { key, additional }
    }

    pub const fn asc(&self) -> u8 {
        self.additional.code().0
    }

    pub const fn ascq(&self) -> u8 {
        self.additional.code().1
    }

    /// Fixed format sense data for "current errors" (response code 70h).
    pub fn to_fixed_format(&self) -> [u8; SENSE_DATA_LEN] {
        let mut data = [0u8; SENSE_DATA_LEN];
        data[0] = 0x70;
        data[2] = self.key as u8;
        // Additional sense length: bytes following byte 7
        data[7] = (SENSE_DATA_LEN - 8) as u8;
        data[12] = self.asc();
        data[13] = self.ascq();
        data
    }
}

impl From<StorageError> for Sense {
    fn from(_: StorageError) -> Self {
        Sense::UNRECOVERED_READ_ERROR
    }
}
