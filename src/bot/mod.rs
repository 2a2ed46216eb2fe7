//! Bulk-Only Transport.
//!
//! [`BotSession`] owns everything one BOT function needs between endpoint
//! completions: the function state, the staging buffer, the SCSI interpreter
//! with its sense record and the medium. The USB glue feeds it [`Event`]s and
//! it answers by scheduling transfers on a [`BulkEndpoints`] implementation.
//!
//! Exactly one CBW is in flight at a time: the read for the next CBW is only
//! posted once the CSW of the current one has been sent.

pub mod wrapper;

pub use wrapper::{Cbw, CbwError, CommandStatus, Csw, CBW_LEN, CSW_LEN};

use crate::config::Config;
use crate::scsi::{
    BlockDevice, Command, Direction, Interpreter, Outcome, ReadCursor, Sense, StagingBuffer,
};

/// Class request: Get Max LUN.
pub const REQ_GET_MAX_LUN: u8 = 0xFE;
/// Class request: Bulk-Only Mass Storage Reset.
pub const REQ_BULK_ONLY_RESET: u8 = 0xFF;

/// Index of the highest LUN, the only one being 0.
const MAX_LUN: [u8; 1] = [0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Endpoint {
    In,
    Out,
}

/// Bulk endpoint pair as seen by the session.
///
/// Every call only schedules a transfer; completion comes back later as an
/// [`Event`]. At most one transfer per direction is outstanding.
pub trait BulkEndpoints {
    /// Arms the OUT endpoint for a transfer of up to `len` bytes. Arming an
    /// endpoint that already has a read outstanding has no effect.
    fn read(&mut self, len: usize);

    /// Queues `data` on the IN endpoint.
    fn write(&mut self, data: &[u8]);

    /// Halts an endpoint until the host clears the halt feature.
    fn stall(&mut self, ep: Endpoint);
}

impl<T: BulkEndpoints + ?Sized> BulkEndpoints for &mut T {
    fn read(&mut self, len: usize) {
        (**self).read(len)
    }

    fn write(&mut self, data: &[u8]) {
        (**self).write(data)
    }

    fn stall(&mut self, ep: Endpoint) {
        (**self).stall(ep)
    }
}

/// Notifications from the USB device driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    /// The host selected a configuration.
    Configured,
    /// An OUT transfer finished with the given bytes.
    OutComplete(&'a [u8]),
    /// The last IN transfer was delivered.
    InComplete,
    /// The host cleared ENDPOINT_HALT.
    ClearHalt(Endpoint),
    /// A transfer on the endpoint failed.
    Aborted(Endpoint),
}

/// Bookkeeping of the command being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Transfer {
    pub tag: u32,
    pub data_length: u32,
    /// Bytes moved in the data phase so far.
    pub transferred: u32,
    pub direction: Direction,
}

impl Transfer {
    fn new(cbw: &Cbw) -> Self {
        Self {
            tag: cbw.tag,
            data_length: cbw.data_length,
            transferred: 0,
            direction: cbw.direction(),
        }
    }

    fn remaining(&self) -> u32 {
        self.data_length.saturating_sub(self.transferred)
    }

    fn status(&self, status: CommandStatus) -> Csw {
        Csw {
            tag: self.tag,
            data_residue: self.remaining(),
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FunctionState {
    /// Waiting for a CBW, or for the CSW that ended the last command to go out.
    AwaitingCommand,
    /// A chunk is on the IN endpoint and more follow from `cursor`.
    StreamingData {
        transfer: Transfer,
        cursor: ReadCursor,
    },
    /// The last chunk is on the IN endpoint, the CSW follows.
    AwaitingStatus { transfer: Transfer },
}

pub struct BotSession<D> {
    state: FunctionState,
    buffer: StagingBuffer,
    scsi: Interpreter,
    device: D,
    /// CSW of a failed device-to-host command, sent once the host clears the
    /// halt on the IN endpoint.
    halted: Option<Csw>,
}

impl<D: BlockDevice> BotSession<D> {
    pub fn new(device: D, config: Config) -> Self {
        Self {
            state: FunctionState::AwaitingCommand,
            buffer: StagingBuffer::new(),
            scsi: Interpreter::new(config),
            device,
            halted: None,
        }
    }

    pub fn state(&self) -> FunctionState {
        self.state
    }

    /// The current sense record of the logical unit.
    pub fn sense(&self) -> Sense {
        self.scsi.sense()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Forgets the command in progress without touching the endpoints, for a
    /// USB bus reset.
    pub fn reset(&mut self) {
        self.state = FunctionState::AwaitingCommand;
        self.buffer.clear();
        self.halted = None;
    }

    /// Advances the state machine by one event.
    pub fn handle<E: BulkEndpoints>(&mut self, io: &mut E, event: Event<'_>) {
        match (self.state, event) {
            (_, Event::Configured) => {
                info!("BOT: configured");
                self.restart(io);
            }

            (FunctionState::AwaitingCommand, Event::OutComplete(bytes)) => {
                self.command(io, bytes);
            }

            (_, Event::OutComplete(bytes)) => {
                warn!("BOT: unexpected {} bytes while busy", bytes.len());
            }

            (FunctionState::StreamingData { transfer, cursor }, Event::InComplete) => {
                match self
                    .scsi
                    .execute(&mut self.device, Command::Continue(cursor), &mut self.buffer)
                {
                    Ok(outcome) => self.send_data(io, transfer, outcome),
                    Err(_) => self.send_status(io, transfer.status(CommandStatus::Failed)),
                }
            }

            (FunctionState::AwaitingStatus { transfer }, Event::InComplete) => {
                self.send_status(io, transfer.status(CommandStatus::Passed));
            }

            // The CSW went out, the next CBW may come.
            (FunctionState::AwaitingCommand, Event::InComplete) => {
                if self.halted.is_none() {
                    io.read(CBW_LEN);
                }
            }

            (state, Event::ClearHalt(Endpoint::In)) => {
                if let Some(csw) = self.halted.take() {
                    self.send_status(io, csw);
                    return;
                }
                match state {
                    FunctionState::StreamingData { transfer, .. }
                    | FunctionState::AwaitingStatus { transfer } => {
                        self.send_status(io, transfer.status(CommandStatus::Failed));
                    }
                    FunctionState::AwaitingCommand => io.read(CBW_LEN),
                }
            }

            (FunctionState::AwaitingCommand, Event::ClearHalt(Endpoint::Out)) => {
                if self.halted.is_none() {
                    io.read(CBW_LEN);
                }
            }

            (_, Event::ClearHalt(Endpoint::Out)) => {}

            (_, Event::Aborted(ep)) => {
                warn!("BOT: transfer aborted on {:?}", ep);
                self.restart(io);
            }
        }
    }

    /// Answers a class specific control request, returning the data stage.
    ///
    /// Unknown requests are accepted with no data.
    pub fn class_request<E: BulkEndpoints>(&mut self, io: &mut E, request: u8) -> &'static [u8] {
        match request {
            REQ_GET_MAX_LUN => &MAX_LUN,
            REQ_BULK_ONLY_RESET => {
                info!("BOT: mass storage reset");
                self.restart(io);
                &[]
            }
            _ => {
                debug!("BOT: ignoring class request 0x{:02x}", request);
                &[]
            }
        }
    }

    fn restart<E: BulkEndpoints>(&mut self, io: &mut E) {
        self.reset();
        io.read(CBW_LEN);
    }

    fn command<E: BulkEndpoints>(&mut self, io: &mut E, bytes: &[u8]) {
        let cbw = match Cbw::parse(bytes) {
            Ok(cbw) => cbw,
            Err(e) => {
                error!("BOT: invalid CBW: {:?}", e);
                self.scsi.fail(Sense::INVALID_CDB);
                io.stall(Endpoint::In);
                io.stall(Endpoint::Out);
                return;
            }
        };
        debug!(
            "BOT: CBW tag={} len={} lun={}",
            cbw.tag,
            cbw.data_length,
            cbw.lun
        );

        let transfer = Transfer::new(&cbw);
        if cbw.lun != 0 {
            self.scsi.fail(Sense::LUN_NOT_SUPPORTED);
            self.fail(io, transfer);
            return;
        }

        match self.scsi.execute(
            &mut self.device,
            Command::Start(cbw.request()),
            &mut self.buffer,
        ) {
            Ok(_) if !self.buffer.is_empty() && transfer.direction == Direction::Out => {
                self.buffer.clear();
                self.scsi.fail(Sense::INVALID_CDB);
                self.fail(io, transfer);
            }
            Ok(outcome) => self.send_data(io, transfer, outcome),
            Err(_) => self.fail(io, transfer),
        }
    }

    /// Puts the staging buffer on the IN endpoint, clamped to what the host
    /// still expects. Without data the CSW is sent right away.
    fn send_data<E: BulkEndpoints>(&mut self, io: &mut E, mut transfer: Transfer, outcome: Outcome) {
        let len = self.buffer.len().min(transfer.remaining() as usize);
        if len == 0 {
            self.send_status(io, transfer.status(CommandStatus::Passed));
            return;
        }

        io.write(&self.buffer.as_slice()[..len]);
        transfer.transferred += len as u32;

        self.state = match outcome {
            Outcome::Streaming(cursor) => FunctionState::StreamingData { transfer, cursor },
            Outcome::Complete => FunctionState::AwaitingStatus { transfer },
        };
    }

    fn send_status<E: BulkEndpoints>(&mut self, io: &mut E, csw: Csw) {
        debug!("BOT: CSW tag={} status={:?}", csw.tag, csw.status);
        io.write(&csw.to_bytes());
        self.state = FunctionState::AwaitingCommand;
    }

    /// Ends a command that failed before its data phase.
    fn fail<E: BulkEndpoints>(&mut self, io: &mut E, transfer: Transfer) {
        let csw = transfer.status(CommandStatus::Failed);
        match transfer.direction {
            Direction::None => self.send_status(io, csw),
            Direction::Out => {
                io.stall(Endpoint::Out);
                self.send_status(io, csw);
            }
            Direction::In => {
                io.stall(Endpoint::In);
                self.halted = Some(csw);
                self.state = FunctionState::AwaitingCommand;
            }
        }
    }
}
