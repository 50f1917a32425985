#![cfg_attr(not(test), no_std)]

//! An asynchronous, poll-driven I2C master.
//!
//! Applications enqueue sends, reads and write-then-read requests through an
//! [`I2cMaster`] without blocking. Every call to [`I2cMaster::poll`] advances
//! the single in-flight transaction by one step, retries absent devices and
//! finally hands the outcome to the caller's callback.
//!
//! The physical bus is reached through a [`BusBackend`]. Blocking drivers
//! written against [`I2CBus`] plug in through [`Blocking`], `embedded-hal`
//! buses through [`HalBus`].

#[macro_use]
mod logging;

pub mod arena;
pub mod backend;
pub mod hal;
pub mod master;

#[cfg(feature = "hardware-atmega328p")]
pub mod hardware_atmega328p;

use core::fmt;

pub use arena::{Arena, Operation, Record, Transfer, HEADER_SIZE};
pub use backend::{Blocking, BusBackend};
pub use hal::HalBus;
pub use master::{
    BusState, Config, I2cMaster, ReadCallback, RequestCallback, SendCallback, DEFAULT_CAPACITY,
    DEFAULT_DEPTH,
};

/// Default bus clock rate.
pub const DEFAULT_FREQUENCY_HZ: u32 = 100_000;

/// Address used by broadcasts. No addressed acknowledgment is expected.
pub const GENERAL_CALL_ADDRESS: u8 = 0;

/// Represents data direction used for the R/W bit in the I2C header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Direction {
    /// Master receives.
    Read,
    /// Master transmits.
    Write,
}

impl Direction {
    /// Builds the address byte sent after a (repeated) start condition.
    pub const fn header(self, address: u8) -> u8 {
        (address << 1)
            | match self {
                Direction::Read => 1,
                Direction::Write => 0,
            }
    }
}

/// Outcome of a transaction that did not succeed.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The arena has no room for the transaction. Reported synchronously.
    OutOfMemory = 1,
    /// Nothing acknowledged the address.
    DeviceNotPresent = 2,
    /// The bus failed mid-transfer.
    TransmitError = 3,
    /// The addressed device rejected a data byte.
    NegativeAcknowledge = 4,
}

impl Error {
    /// Numeric status code. Success is `0`.
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Error::OutOfMemory => "transaction queue is full",
            Error::DeviceNotPresent => "device not present",
            Error::TransmitError => "transmit error",
            Error::NegativeAcknowledge => "negative acknowledge",
        };
        f.write_str(text)
    }
}

/// Failures a [`BusBackend`] can report for one physical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError {
    /// The address went unacknowledged.
    DeviceNotPresent,
    /// Arbitration loss, bus fault or an unexpected bus state.
    TransmitError,
    /// A data byte went unacknowledged.
    NegativeAcknowledge,
}

impl From<BusError> for Error {
    fn from(error: BusError) -> Self {
        match error {
            BusError::DeviceNotPresent => Error::DeviceNotPresent,
            BusError::TransmitError => Error::TransmitError,
            BusError::NegativeAcknowledge => Error::NegativeAcknowledge,
        }
    }
}

/// Represents a blocking I2C driver.
///
/// Each method performs one bus primitive and returns once the hardware is
/// done with it. Wrap an implementation in [`Blocking`] to queue transactions
/// on it.
pub trait I2CBus {
    /// The error type reported by the bus primitives.
    type Error: Into<BusError>;

    /// Initializes the [`I2CBus`]
    ///
    /// [`I2CBus`]: Self
    fn init(&mut self);

    /// Creates an I2C start (or repeated start) condition on the bus.
    fn start_condition(&mut self) -> Result<(), Self::Error>;

    /// Creates an I2C stop condition on the bus.
    fn stop_condition(&mut self) -> Result<(), Self::Error>;

    /// Sends an I2C header to the bus.
    fn send_header(&mut self, address: u8, direction: Direction) -> Result<(), Self::Error>;

    /// Sends data to an I2C slave.
    fn send(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Reads data from an I2C slave, not acknowledging the final byte when
    /// `nack_last` is set.
    fn read(&mut self, data: &mut [u8], nack_last: bool) -> Result<(), Self::Error>;
}
