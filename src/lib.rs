//! USB Mass Storage device exposing flash partitions as files.
//!
//! The device implements the Bulk-Only Transport with the SCSI transparent
//! command set. The medium is a read-only FAT32 volume synthesized on the fly,
//! with one file per flash partition present on the board.
//!
//! Data flows top down:
//!
//! - [`class::MscClass`] adapts `usb-device` callbacks to [`bot::Event`]s,
//! - [`bot::BotSession`] runs the CBW / data / CSW state machine,
//! - [`scsi::Interpreter`] executes each command against a [`scsi::BlockDevice`],
//! - [`fat::Volume`] is that block device, routing file data reads to
//!   [`directory::read_partition`],
//! - [`storage::Storage`] reads the partition from internal or SPI flash.

#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod bot;
pub mod class;
pub mod config;
pub mod directory;
pub mod fat;
pub mod partition;
pub mod scsi;
pub mod storage;

pub use bot::BotSession;
pub use class::MscClass;
pub use config::Config;
pub use fat::Volume;
