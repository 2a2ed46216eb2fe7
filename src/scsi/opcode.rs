/// SCSI operation codes understood by the interpreter.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpCode {
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Inquiry = 0x12,
    ModeSense6 = 0x1A,
    StartStopUnit = 0x1B,
    PreventAllowMediumRemoval = 0x1E,
    ReadFormatCapacities = 0x23,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    ModeSense10 = 0x5A,
}

impl TryFrom<u8> for OpCode {
    /// The unsupported operation code.
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x00 => Self::TestUnitReady,
            0x03 => Self::RequestSense,
            0x12 => Self::Inquiry,
            0x1A => Self::ModeSense6,
            0x1B => Self::StartStopUnit,
            0x1E => Self::PreventAllowMediumRemoval,
            0x23 => Self::ReadFormatCapacities,
            0x25 => Self::ReadCapacity10,
            0x28 => Self::Read10,
            0x2A => Self::Write10,
            0x5A => Self::ModeSense10,
            other => return Err(other),
        })
    }
}
