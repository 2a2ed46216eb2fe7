//! SCSI transparent command set interpreter.
//!
//! The interpreter decodes a Command Descriptor Block, runs it against the
//! medium and leaves the data-in payload in a [`StagingBuffer`]. Every command
//! fits in one buffer except READ (10), which is started with
//! [`Command::Start`] and then continued chunk by chunk with
//! [`Command::Continue`] until its [`ReadCursor`] is exhausted.

pub mod opcode;
pub mod pages;
pub mod sense;

pub use opcode::OpCode;
pub use sense::{AdditionalSense, Sense, SenseKey};

use crate::config::Config;
use crate::storage::StorageError;

/// Capacity of the staging buffer, one chunk of a data phase.
pub const BUFFER_SIZE: usize = 512;

/// Largest Command Descriptor Block carried by a CBW.
pub const CDB_MAX_LEN: usize = 16;

/// Number of blocks and bytes per block of the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Geometry {
    pub block_count: u32,
    pub block_size: u32,
}

/// The medium behind the logical unit.
pub trait BlockDevice {
    /// Current geometry; an error means the medium is not ready.
    fn geometry(&mut self) -> Result<Geometry, StorageError>;

    /// Fills `dest` with the bytes starting at byte `offset` of the medium.
    fn read(&mut self, offset: u64, dest: &mut [u8]) -> Result<(), StorageError>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn geometry(&mut self) -> Result<Geometry, StorageError> {
        (**self).geometry()
    }

    fn read(&mut self, offset: u64, dest: &mut [u8]) -> Result<(), StorageError> {
        (**self).read(offset, dest)
    }
}

/// Direction of the data phase announced by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// No data phase.
    None,
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

/// A command as handed over by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Request {
    /// CDB bytes; everything past the valid length is zero.
    pub cdb: [u8; CDB_MAX_LEN],
    /// Bytes the host expects to move in the data phase.
    pub data_length: u32,
    pub direction: Direction,
}

impl Request {
    pub fn new(cdb: &[u8], data_length: u32, direction: Direction) -> Self {
        let mut block = [0u8; CDB_MAX_LEN];
        let len = cdb.len().min(CDB_MAX_LEN);
        block[..len].copy_from_slice(&cdb[..len]);
        Self {
            cdb: block,
            data_length,
            direction,
        }
    }

    fn u16_at(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.cdb[at], self.cdb[at + 1]])
    }

    fn u32_at(&self, at: usize) -> u32 {
        u32::from_be_bytes([
            self.cdb[at],
            self.cdb[at + 1],
            self.cdb[at + 2],
            self.cdb[at + 3],
        ])
    }
}

/// Progress of a streaming READ (10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReadCursor {
    /// Byte address of the next chunk on the medium.
    pub address: u64,
    /// Bytes still to be delivered.
    pub remaining: u32,
    pub block_size: u32,
    pub block_count: u32,
}

/// The two ways the interpreter is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// First invocation for a freshly accepted command.
    Start(Request),
    /// Next chunk of a streaming READ (10).
    Continue(ReadCursor),
}

/// What the staging buffer holds after a successful invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// The buffer holds the last (or only, possibly empty) chunk.
    Complete,
    /// The buffer holds a chunk and more follow from the returned cursor.
    Streaming(ReadCursor),
}

/// Fixed capacity buffer for one chunk of a data phase.
pub struct StagingBuffer {
    data: [u8; BUFFER_SIZE],
    len: usize,
}

impl StagingBuffer {
    pub const fn new() -> Self {
        Self {
            data: [0; BUFFER_SIZE],
            len: 0,
        }
    }

    /// The valid part of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Copies `payload` truncated to `allocation` bytes.
    fn fill(&mut self, payload: &[u8], allocation: usize) {
        let len = payload.len().min(allocation).min(BUFFER_SIZE);
        self.data[..len].copy_from_slice(&payload[..len]);
        self.len = len;
    }

    /// Marks `len` bytes valid and returns them for writing.
    fn reserve(&mut self, len: usize) -> &mut [u8] {
        self.len = len.min(BUFFER_SIZE);
        &mut self.data[..self.len]
    }
}

impl Default for StagingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Command interpreter of the single logical unit, owner of its sense record.
pub struct Interpreter {
    config: Config,
    sense: Sense,
}

impl Interpreter {
    pub const fn new(config: Config) -> Self {
        Self {
            config,
            sense: Sense::NONE,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The current sense record.
    pub fn sense(&self) -> Sense {
        self.sense
    }

    /// Records a failure detected outside the interpreter.
    pub fn fail(&mut self, sense: Sense) -> Sense {
        warn!("SCSI: command failed: {:?}", sense);
        self.sense = sense;
        sense
    }

    /// Runs one invocation of a command.
    ///
    /// On success `buffer` holds the data-in payload (possibly empty). On
    /// failure the returned sense is also stored for REQUEST SENSE and the
    /// buffer is left empty.
    pub fn execute<D: BlockDevice>(
        &mut self,
        device: &mut D,
        command: Command,
        buffer: &mut StagingBuffer,
    ) -> Result<Outcome, Sense> {
        buffer.clear();
        let result = match command {
            Command::Start(request) => self.start(device, &request, buffer),
            Command::Continue(cursor) => stream(device, cursor, buffer),
        };

        result.map_err(|sense| {
            buffer.clear();
            self.fail(sense)
        })
    }

    fn start<D: BlockDevice>(
        &mut self,
        device: &mut D,
        request: &Request,
        buffer: &mut StagingBuffer,
    ) -> Result<Outcome, Sense> {
        let op = match OpCode::try_from(request.cdb[0]) {
            Ok(op) => op,
            Err(code) => {
                warn!("SCSI: Unknown command 0x{:02x}", code);
                return Err(Sense::INVALID_CDB);
            }
        };
        debug!("SCSI: {:?}", op);

        match op {
            OpCode::TestUnitReady => {
                if request.data_length != 0 {
                    return Err(Sense::INVALID_CDB);
                }
            }

            OpCode::Inquiry => {
                let evpd = request.cdb[1] & 0x01 != 0;
                let allocation = usize::from(request.u16_at(3));
                if evpd {
                    match request.cdb[2] {
                        pages::VPD_DEVICE_IDENTIFICATION => buffer
                            .fill(&pages::device_identification(&self.config), allocation),
                        _ => buffer.fill(&pages::supported_vpd_pages(), allocation),
                    }
                } else {
                    buffer.fill(&pages::standard_inquiry(&self.config), allocation);
                }
            }

            OpCode::RequestSense => {
                let allocation = usize::from(request.cdb[4]);
                buffer.fill(&self.sense.to_fixed_format(), allocation);
                self.sense = Sense::NONE;
            }

            OpCode::ReadCapacity10 => {
                let geometry = device.geometry().map_err(|_| Sense::MEDIUM_NOT_PRESENT)?;
                buffer.fill(&pages::read_capacity10(geometry), BUFFER_SIZE);
            }

            OpCode::ReadFormatCapacities => {
                let geometry = device.geometry().map_err(|_| Sense::MEDIUM_NOT_PRESENT)?;
                let allocation = usize::from(request.u16_at(7));
                buffer.fill(&pages::read_format_capacities(geometry), allocation);
            }

            OpCode::ModeSense6 => {
                let allocation = usize::from(request.cdb[4]);
                buffer.fill(&pages::mode_sense6(&self.config), allocation);
            }

            OpCode::ModeSense10 => {
                let allocation = usize::from(request.u16_at(7));
                buffer.fill(&pages::mode_sense10(&self.config), allocation);
            }

            OpCode::StartStopUnit | OpCode::PreventAllowMediumRemoval => {}

            OpCode::Read10 => return start_read(device, request, buffer),

            OpCode::Write10 => {
                warn!("SCSI: Write rejected, medium is read-only");
                return Err(Sense::WRITE_PROTECTED);
            }
        }

        Ok(Outcome::Complete)
    }
}

/// Validates a READ (10) and delivers its first chunk.
fn start_read<D: BlockDevice>(
    device: &mut D,
    request: &Request,
    buffer: &mut StagingBuffer,
) -> Result<Outcome, Sense> {
    if request.direction != Direction::In && request.data_length != 0 {
        return Err(Sense::INVALID_CDB);
    }

    let geometry = device.geometry().map_err(|_| Sense::MEDIUM_NOT_PRESENT)?;

    let lba = request.u32_at(2);
    let blocks = request.u16_at(7);
    debug!("SCSI: Read lba={} len={}", lba, blocks);

    if u64::from(lba) + u64::from(blocks) > u64::from(geometry.block_count) {
        return Err(Sense::LBA_OUT_OF_RANGE);
    }

    let bytes = u64::from(blocks) * u64::from(geometry.block_size);
    if bytes != u64::from(request.data_length) {
        warn!(
            "SCSI: Read of {} bytes but host expects {}",
            bytes,
            request.data_length
        );
        return Err(Sense::INVALID_CDB);
    }
    if bytes == 0 {
        return Ok(Outcome::Complete);
    }

    let cursor = ReadCursor {
        address: u64::from(lba) * u64::from(geometry.block_size),
        remaining: request.data_length,
        block_size: geometry.block_size,
        block_count: geometry.block_count,
    };
    stream(device, cursor, buffer)
}

/// Reads the next chunk at the cursor into the buffer.
fn stream<D: BlockDevice>(
    device: &mut D,
    mut cursor: ReadCursor,
    buffer: &mut StagingBuffer,
) -> Result<Outcome, Sense> {
    let len = (cursor.remaining as usize).min(BUFFER_SIZE);
    device.read(cursor.address, buffer.reserve(len))?;

    trace!("SCSI: chunk of {} at 0x{:x}", len, cursor.address);
    cursor.address += len as u64;
    cursor.remaining -= len as u32;

    if cursor.remaining == 0 {
        Ok(Outcome::Complete)
    } else {
        Ok(Outcome::Streaming(cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Medium whose byte at offset `n` is `n as u8`.
    struct Ramp {
        geometry: Option<Geometry>,
        reads: usize,
        fail_reads: bool,
    }

    impl Ramp {
        fn new(block_count: u32) -> Self {
            Self {
                geometry: Some(Geometry {
                    block_count,
                    block_size: 512,
                }),
                reads: 0,
                fail_reads: false,
            }
        }
    }

    impl BlockDevice for Ramp {
        fn geometry(&mut self) -> Result<Geometry, StorageError> {
            self.geometry.ok_or(StorageError::NoDevice)
        }

        fn read(&mut self, offset: u64, dest: &mut [u8]) -> Result<(), StorageError> {
            self.reads += 1;
            if self.fail_reads {
                return Err(StorageError::Bus);
            }
            for (i, byte) in dest.iter_mut().enumerate() {
                *byte = (offset + i as u64) as u8;
            }
            Ok(())
        }
    }

    fn request(cdb: &[u8], data_length: u32) -> Command {
        Command::Start(Request::new(cdb, data_length, Direction::In))
    }

    fn read10(lba: u32, blocks: u16) -> [u8; 10] {
        let [l0, l1, l2, l3] = lba.to_be_bytes();
        let [b0, b1] = blocks.to_be_bytes();
        [0x28, 0, l0, l1, l2, l3, 0, b0, b1, 0]
    }

    #[test]
    fn inquiry_is_truncated_to_allocation_length() {
        let mut scsi = Interpreter::new(Config::new());
        let mut buffer = StagingBuffer::new();
        let outcome = scsi
            .execute(&mut Ramp::new(8), request(&[0x12, 0, 0, 0, 5, 0], 5), &mut buffer)
            .unwrap();

        assert_eq!(outcome, Outcome::Complete);
        assert_eq!(buffer.as_slice(), &[0x00, 0x80, 0x04, 0x02, 0x1F]);
    }

    #[test]
    fn inquiry_vpd_pages() {
        let mut scsi = Interpreter::new(Config::new());
        let mut buffer = StagingBuffer::new();

        scsi.execute(&mut Ramp::new(8), request(&[0x12, 1, 0x00, 0, 64, 0], 64), &mut buffer)
            .unwrap();
        assert_eq!(buffer.as_slice(), &[0x00, 0x00, 0x00, 0x02, 0x00, 0x83]);

        scsi.execute(&mut Ramp::new(8), request(&[0x12, 1, 0x83, 0, 64, 0], 64), &mut buffer)
            .unwrap();
        assert_eq!(buffer.len(), pages::DEVICE_IDENTIFICATION_LEN);
        assert_eq!(buffer.as_slice()[1], 0x83);
    }

    #[test]
    fn test_unit_ready_requires_no_data_phase() {
        let mut scsi = Interpreter::new(Config::new());
        let mut buffer = StagingBuffer::new();
        let ready = Command::Start(Request::new(&[0; 6], 0, Direction::None));
        assert_eq!(
            scsi.execute(&mut Ramp::new(8), ready, &mut buffer),
            Ok(Outcome::Complete)
        );
        assert!(buffer.is_empty());

        assert_eq!(
            scsi.execute(&mut Ramp::new(8), request(&[0; 6], 4), &mut buffer),
            Err(Sense::INVALID_CDB)
        );
    }

    #[test]
    fn read_capacity_without_medium_fails_not_ready() {
        let mut scsi = Interpreter::new(Config::new());
        let mut buffer = StagingBuffer::new();
        let mut medium = Ramp::new(8);
        medium.geometry = None;

        assert_eq!(
            scsi.execute(&mut medium, request(&[0x25; 1], 8), &mut buffer),
            Err(Sense::MEDIUM_NOT_PRESENT)
        );
        assert_eq!(scsi.sense(), Sense::MEDIUM_NOT_PRESENT);
    }

    #[test]
    fn read_capacity_reports_last_lba() {
        let mut scsi = Interpreter::new(Config::new());
        let mut buffer = StagingBuffer::new();
        scsi.execute(&mut Ramp::new(100), request(&[0x25; 1], 8), &mut buffer)
            .unwrap();
        assert_eq!(buffer.as_slice(), &[0, 0, 0, 99, 0, 0, 2, 0]);
    }

    #[test]
    fn request_sense_returns_then_clears_the_record() {
        let mut scsi = Interpreter::new(Config::new());
        let mut buffer = StagingBuffer::new();
        let mut medium = Ramp::new(8);

        assert!(scsi.execute(&mut medium, request(&[0xFF], 0), &mut buffer).is_err());

        scsi.execute(&mut medium, request(&[0x03, 0, 0, 0, 18, 0], 18), &mut buffer)
            .unwrap();
        assert_eq!(buffer.as_slice()[2], 0x05);
        assert_eq!(buffer.as_slice()[12], 0x24);

        scsi.execute(&mut medium, request(&[0x03, 0, 0, 0, 18, 0], 18), &mut buffer)
            .unwrap();
        assert_eq!(buffer.as_slice()[2], 0x00);
        assert_eq!(buffer.as_slice()[12], 0x00);
    }

    #[test]
    fn read_streams_in_buffer_sized_chunks() {
        let mut scsi = Interpreter::new(Config::new());
        let mut buffer = StagingBuffer::new();
        let mut medium = Ramp::new(16);

        let mut outcome = scsi
            .execute(&mut medium, request(&read10(2, 3), 1536), &mut buffer)
            .unwrap();
        let mut delivered = buffer.as_slice().to_vec();

        while let Outcome::Streaming(cursor) = outcome {
            outcome = scsi
                .execute(&mut medium, Command::Continue(cursor), &mut buffer)
                .unwrap();
            delivered.extend_from_slice(buffer.as_slice());
        }

        assert_eq!(delivered.len(), 1536);
        assert_eq!(medium.reads, 3);
        assert!(delivered
            .iter()
            .enumerate()
            .all(|(i, &b)| b == (1024 + i) as u8));
    }

    #[test]
    fn read_past_the_end_never_touches_the_medium() {
        let mut scsi = Interpreter::new(Config::new());
        let mut buffer = StagingBuffer::new();
        let mut medium = Ramp::new(16);

        assert_eq!(
            scsi.execute(&mut medium, request(&read10(15, 2), 1024), &mut buffer),
            Err(Sense::LBA_OUT_OF_RANGE)
        );
        assert_eq!(medium.reads, 0);
    }

    #[test]
    fn read_length_must_match_data_length() {
        let mut scsi = Interpreter::new(Config::new());
        let mut buffer = StagingBuffer::new();
        assert_eq!(
            scsi.execute(&mut Ramp::new(16), request(&read10(0, 2), 512), &mut buffer),
            Err(Sense::INVALID_CDB)
        );
    }

    #[test]
    fn read_from_host_to_device_is_rejected() {
        let mut scsi = Interpreter::new(Config::new());
        let mut buffer = StagingBuffer::new();
        let out = Command::Start(Request::new(&read10(0, 1), 512, Direction::Out));
        assert_eq!(
            scsi.execute(&mut Ramp::new(16), out, &mut buffer),
            Err(Sense::INVALID_CDB)
        );
    }

    #[test]
    fn storage_failure_during_read_is_a_hardware_error() {
        let mut scsi = Interpreter::new(Config::new());
        let mut buffer = StagingBuffer::new();
        let mut medium = Ramp::new(16);
        medium.fail_reads = true;

        assert_eq!(
            scsi.execute(&mut medium, request(&read10(0, 1), 512), &mut buffer),
            Err(Sense::UNRECOVERED_READ_ERROR)
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn write_is_always_rejected() {
        let mut scsi = Interpreter::new(Config::new());
        let mut buffer = StagingBuffer::new();
        let mut medium = Ramp::new(16);
        let write = Command::Start(Request::new(
            &[0x2A, 0, 0, 0, 0, 0, 0, 0, 1, 0],
            512,
            Direction::Out,
        ));

        assert_eq!(
            scsi.execute(&mut medium, write, &mut buffer),
            Err(Sense::WRITE_PROTECTED)
        );
        assert_eq!(medium.reads, 0);
    }
}
