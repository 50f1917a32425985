//! A hardware implementation of I2C for the ATMega328P.
//!
//! [`TWI`] works either as a blocking [`I2CBus`] (wrap it in
//! [`Blocking`](crate::Blocking)) or directly as a [`BusBackend`] that never
//! waits on the peripheral: every [`execute`](BusBackend::execute) looks at
//! TWINT once and moves the transfer on by at most one bus event.

use crate::backend::{rewind, settle};
use crate::{BusBackend, BusError, Direction, I2CBus, Operation, Transfer, DEFAULT_FREQUENCY_HZ};

/// CPU clock the bit rate is derived from.
pub const F_CPU: u32 = 16_000_000;

/// Where a non-blocking transfer is waiting.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    Idle,
    Start,
    RepeatedStart,
    WriteHeader,
    Writing,
    ReadHeader,
    Reading,
}

/// The 2-wire interface registers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Register {
    /// TWBR
    BitRate,
    /// TWSR
    Status,
    /// TWDR
    Data,
    /// TWCR
    Control,
}

impl Register {
    /// Memory-mapped address of the register.
    pub const fn address(self) -> *mut u8 {
        match self {
            Register::BitRate => TWBR,
            Register::Status => TWSR,
            Register::Data => TWDR,
            Register::Control => TWCR,
        }
    }
}

/// Access to the 2-wire interface registers.
pub trait Registers {
    /// Reads a register.
    fn read(&mut self, register: Register) -> u8;

    /// Writes a register.
    fn write(&mut self, register: Register, value: u8);
}

/// The ATMega328P's own registers.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mmio;

impl Registers for Mmio {
    fn read(&mut self, register: Register) -> u8 {
        unsafe { register.address().read_volatile() }
    }

    fn write(&mut self, register: Register, value: u8) {
        unsafe { register.address().write_volatile(value) }
    }
}

/// Represents the hardware 2-wire interface
pub struct TWI<R = Mmio> {
    /// Bit rate register value written by `init`.
    pub twbr: u8,
    registers: R,
    step: Step,
    index: usize,
}

impl TWI {
    /// Creates a new TWI instance
    pub const fn new(freq_hz: u32) -> Self {
        Self::with_registers(Mmio, freq_hz)
    }
}

impl<R> TWI<R> {
    /// Creates a TWI instance driving `registers`.
    pub const fn with_registers(registers: R, freq_hz: u32) -> Self {
        Self {
            twbr: bit_rate(freq_hz),
            registers,
            step: Step::Idle,
            index: 0,
        }
    }

    /// Gives the register access back.
    pub fn into_registers(self) -> R {
        self.registers
    }
}

impl Default for TWI {
    fn default() -> Self {
        Self::new(DEFAULT_FREQUENCY_HZ)
    }
}

/// TWBR value for `freq_hz` with a prescaler of 1.
pub const fn bit_rate(freq_hz: u32) -> u8 {
    ((F_CPU / freq_hz).saturating_sub(16) / 2) as u8
}

/// Represents status variants of the 2-wire status register
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TWSRStatus {
    StartTransmitted,
    RepeatedStartTransmitted,
    WriteHeaderTransmittedAckReceived,
    WriteHeaderTransmittedNackReceived,
    ReadHeaderTransmittedAckReceived,
    ReadHeaderTransmittedNackReceived,
    DataTransmittedAckReceived,
    DataTransmittedNackReceived,
    DataReceivedAckTransmitted,
    DataReceivedNackTransmitted,
    ArbitrationLost,
    NoInformation,
    BusError,
    /// A status code the master never expects.
    Unrecognized(u8),
}

impl TWSRStatus {
    /// Translates a raw TWSR value to a variant of [`Self`].
    ///
    /// The prescaler bits are masked off first.
    pub fn from_byte(value: u8) -> Self {
        match value & TWS_MASK {
            0x00 => Self::BusError,
            0x08 => Self::StartTransmitted,
            0x10 => Self::RepeatedStartTransmitted,
            0x18 => Self::WriteHeaderTransmittedAckReceived,
            0x20 => Self::WriteHeaderTransmittedNackReceived,
            0x28 => Self::DataTransmittedAckReceived,
            0x30 => Self::DataTransmittedNackReceived,
            0x38 => Self::ArbitrationLost,
            0x40 => Self::ReadHeaderTransmittedAckReceived,
            0x48 => Self::ReadHeaderTransmittedNackReceived,
            0x50 => Self::DataReceivedAckTransmitted,
            0x58 => Self::DataReceivedNackTransmitted,
            0xF8 => Self::NoInformation,
            other => Self::Unrecognized(other),
        }
    }
}

impl From<TWSRStatus> for BusError {
    fn from(status: TWSRStatus) -> Self {
        match status {
            TWSRStatus::WriteHeaderTransmittedNackReceived
            | TWSRStatus::ReadHeaderTransmittedNackReceived => BusError::DeviceNotPresent,
            TWSRStatus::DataTransmittedNackReceived => BusError::NegativeAcknowledge,
            _ => BusError::TransmitError,
        }
    }
}

/// The address of the 2-wire bit rate register
pub const TWBR: *mut u8 = 0x00B8 as *mut u8;

/// The address of the 2-wire status register
pub const TWSR: *mut u8 = 0x00B9 as *mut u8;

/// The address of the 2-wire data register
pub const TWDR: *mut u8 = 0x00BB as *mut u8;

/// The address of the 2-wire control register
pub const TWCR: *mut u8 = 0x00BC as *mut u8;

/// The mask for setting the TWCR interrupt bit
pub const TWINT: u8 = 0x80;

/// The mask for setting the TWCR enable acknowledge bit
pub const TWEA: u8 = 0x40;

/// The mask for setting the TWCR start condition bit
pub const TWSTA: u8 = 0x20;

/// The mask for setting the TWCR stop condition bit
pub const TWSTO: u8 = 0x10;

/// The mask for setting the TWCR enable bit
pub const TWEN: u8 = 0x04;

/// The mask selecting the status bits of TWSR
pub const TWS_MASK: u8 = 0xF8;

/// TWCR value clocking in the next byte, acknowledging it unless it is the
/// last one wanted.
fn receive_control(last: bool) -> u8 {
    TWINT | TWEN | if last { 0 } else { TWEA }
}

impl<R: Registers> TWI<R> {
    fn control(&mut self, value: u8) {
        self.registers.write(Register::Control, value);
    }

    fn status(&mut self) -> TWSRStatus {
        TWSRStatus::from_byte(self.registers.read(Register::Status))
    }

    fn hardware_ready(&mut self) -> bool {
        self.registers.read(Register::Control) & TWINT != 0
    }

    /// Awaits TWI hardware availability
    ///
    /// Repeatedly polls the TWCR until it signifies that
    /// the TWI hardware has finished its assigned
    /// operation, then returns.
    pub fn await_hardware(&mut self) {
        while !self.hardware_ready() {
            continue;
        }
    }
}

impl<R: Registers> I2CBus for TWI<R> {
    type Error = TWSRStatus;

    fn init(&mut self) {
        self.registers.write(Register::Status, 0x00);
        self.registers.write(Register::BitRate, self.twbr);
        self.control(TWEN);
    }

    fn start_condition(&mut self) -> Result<(), TWSRStatus> {
        self.control(TWINT | TWSTA | TWEN);
        self.await_hardware();
        match self.status() {
            TWSRStatus::StartTransmitted | TWSRStatus::RepeatedStartTransmitted => Ok(()),
            x => Err(x),
        }
    }

    fn stop_condition(&mut self) -> Result<(), TWSRStatus> {
        self.control(TWINT | TWSTO | TWEN);
        while self.registers.read(Register::Control) & TWSTO != 0 {
            continue;
        }
        Ok(())
    }

    fn send_header(&mut self, address: u8, direction: Direction) -> Result<(), TWSRStatus> {
        self.registers.write(Register::Data, direction.header(address));
        self.control(TWINT | TWEN);
        self.await_hardware();
        match self.status() {
            TWSRStatus::ReadHeaderTransmittedAckReceived if direction == Direction::Read => Ok(()),
            TWSRStatus::WriteHeaderTransmittedAckReceived if direction == Direction::Write => {
                Ok(())
            }
            x => Err(x),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TWSRStatus> {
        for byte in data {
            self.registers.write(Register::Data, *byte);
            self.control(TWINT | TWEN);
            self.await_hardware();
            match self.status() {
                TWSRStatus::DataTransmittedAckReceived => (),
                x => return Err(x),
            }
        }
        Ok(())
    }

    fn read(&mut self, data: &mut [u8], nack_last: bool) -> Result<(), TWSRStatus> {
        let count = data.len();
        for (i, byte) in data.iter_mut().enumerate() {
            let last = nack_last && i + 1 == count;
            self.control(receive_control(last));
            self.await_hardware();
            match self.status() {
                TWSRStatus::DataReceivedAckTransmitted if !last => (),
                TWSRStatus::DataReceivedNackTransmitted if last => (),
                x => return Err(x),
            }
            *byte = self.registers.read(Register::Data);
        }
        Ok(())
    }
}

impl<R: Registers> TWI<R> {
    fn finish(
        &mut self,
        transfer: &Transfer<'_>,
        result: Result<(), BusError>,
    ) -> nb::Result<(), BusError> {
        self.control(TWINT | TWSTO | TWEN);
        self.step = Step::Idle;
        settle(transfer.address(), result).map_err(nb::Error::Other)
    }

    fn header(
        &mut self,
        transfer: &Transfer<'_>,
        direction: Direction,
    ) -> nb::Result<(), BusError> {
        self.registers.write(Register::Data, direction.header(transfer.address()));
        self.control(TWINT | TWEN);
        self.step = match direction {
            Direction::Read => Step::ReadHeader,
            Direction::Write => Step::WriteHeader,
        };
        Err(nb::Error::WouldBlock)
    }

    fn write_next(&mut self, transfer: &mut Transfer<'_>) -> nb::Result<(), BusError> {
        if let Some(byte) = transfer.write_data().get(self.index).copied() {
            self.index += 1;
            self.registers.write(Register::Data, byte);
            self.control(TWINT | TWEN);
            self.step = Step::Writing;
            return Err(nb::Error::WouldBlock);
        }
        if transfer.operation() == Some(Operation::Request) {
            transfer.set_operation(Operation::RequestRead);
            self.index = 0;
            self.control(TWINT | TWSTA | TWEN);
            self.step = Step::RepeatedStart;
            return Err(nb::Error::WouldBlock);
        }
        self.finish(transfer, Ok(()))
    }

    fn read_next(&mut self, transfer: &mut Transfer<'_>) -> nb::Result<(), BusError> {
        let wanted = transfer.read_len();
        if self.index >= wanted {
            return self.finish(transfer, Ok(()));
        }
        self.control(receive_control(self.index + 1 == wanted));
        self.step = Step::Reading;
        Err(nb::Error::WouldBlock)
    }
}

impl<R: Registers> BusBackend for TWI<R> {
    fn init(&mut self) {
        I2CBus::init(self);
        self.step = Step::Idle;
    }

    fn start(&mut self, transfer: &mut Transfer<'_>) {
        rewind(transfer);
        self.index = 0;
        self.step = Step::Start;
        self.control(TWINT | TWSTA | TWEN);
    }

    fn execute(&mut self, transfer: &mut Transfer<'_>) -> nb::Result<(), BusError> {
        if self.step == Step::Idle {
            return Ok(());
        }
        if !self.hardware_ready() {
            return Err(nb::Error::WouldBlock);
        }
        let broadcast = transfer.address() == crate::GENERAL_CALL_ADDRESS;

        match (self.step, self.status()) {
            (Step::Start, TWSRStatus::StartTransmitted) => match transfer.operation() {
                Some(Operation::Read) => self.header(transfer, Direction::Read),
                _ => self.header(transfer, Direction::Write),
            },
            (Step::RepeatedStart, TWSRStatus::RepeatedStartTransmitted) => {
                self.header(transfer, Direction::Read)
            }
            (Step::WriteHeader, TWSRStatus::WriteHeaderTransmittedAckReceived) => {
                self.write_next(transfer)
            }
            (Step::WriteHeader, TWSRStatus::WriteHeaderTransmittedNackReceived) if broadcast => {
                self.write_next(transfer)
            }
            (Step::Writing, TWSRStatus::DataTransmittedAckReceived) => self.write_next(transfer),
            (Step::Writing, TWSRStatus::DataTransmittedNackReceived) if broadcast => {
                self.write_next(transfer)
            }
            (Step::ReadHeader, TWSRStatus::ReadHeaderTransmittedAckReceived) => {
                self.read_next(transfer)
            }
            (
                Step::Reading,
                TWSRStatus::DataReceivedAckTransmitted | TWSRStatus::DataReceivedNackTransmitted,
            ) => {
                let byte = self.registers.read(Register::Data);
                if let Some(slot) = transfer.read_buffer().get_mut(self.index) {
                    *slot = byte;
                }
                self.index += 1;
                self.read_next(transfer)
            }
            (_, unexpected) => self.finish(transfer, Err(unexpected.into())),
        }
    }

    fn is_idle(&mut self, _transfer: &Transfer<'_>) -> bool {
        self.registers.read(Register::Control) & TWSTO == 0
    }
}
