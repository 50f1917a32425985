//! Backend for any blocking `embedded-hal` I2C bus.
//!
//! Pin assignment and clock rate belong to the HAL instance being wrapped.

use embedded_hal::i2c::{Error as _, ErrorKind, I2c, NoAcknowledgeSource};

use crate::backend::{rewind, settle};
use crate::{BusBackend, BusError, Operation, Transfer};

/// Runs queued transactions synchronously on an [`I2c`] implementation.
///
/// The write half of a request is staged in a `STAGE` byte buffer so the
/// write-then-read can go out as one `write_read` with a repeated start.
pub struct HalBus<I, const STAGE: usize = 32> {
    i2c: I,
    stage: [u8; STAGE],
}

impl<I: I2c, const STAGE: usize> HalBus<I, STAGE> {
    /// Wraps an `embedded-hal` bus.
    pub const fn new(i2c: I) -> Self {
        Self {
            i2c,
            stage: [0; STAGE],
        }
    }

    /// Gives the wrapped bus back.
    pub fn into_inner(self) -> I {
        self.i2c
    }

    fn request(&mut self, transfer: &mut Transfer<'_>) -> Result<(), BusError> {
        let write_len = transfer.write_len();
        let Some(stage) = self.stage.get_mut(..write_len) else {
            log_warn!("request write of {} bytes exceeds staging buffer", write_len);
            return Err(BusError::TransmitError);
        };
        stage.copy_from_slice(transfer.write_data());
        let address = transfer.address();
        self.i2c
            .write_read(address, stage, transfer.read_buffer())
            .map_err(|e| classify(e.kind()))
    }
}

/// Maps a HAL error onto the engine's failure classes.
///
/// HALs that cannot tell which byte went unacknowledged report
/// [`NoAcknowledgeSource::Unknown`]; that is treated as an absent device so
/// it stays eligible for retries.
pub fn classify(kind: ErrorKind) -> BusError {
    match kind {
        ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data) => BusError::NegativeAcknowledge,
        ErrorKind::NoAcknowledge(_) => BusError::DeviceNotPresent,
        _ => BusError::TransmitError,
    }
}

impl<I: I2c, const STAGE: usize> BusBackend for HalBus<I, STAGE> {
    fn init(&mut self) {}

    fn start(&mut self, transfer: &mut Transfer<'_>) {
        rewind(transfer);
    }

    fn execute(&mut self, transfer: &mut Transfer<'_>) -> nb::Result<(), BusError> {
        let address = transfer.address();
        let result = match transfer.operation() {
            Some(Operation::Send) => self
                .i2c
                .write(address, transfer.write_data())
                .map_err(|e| classify(e.kind())),
            Some(Operation::Read) => self
                .i2c
                .read(address, transfer.read_buffer())
                .map_err(|e| classify(e.kind())),
            Some(Operation::Request | Operation::RequestRead) => self.request(transfer),
            Some(Operation::Pending) | None => Ok(()),
        };
        settle(address, result).map_err(nb::Error::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Arena;
    use embedded_hal::i2c::{ErrorType, Operation as HalOperation, SevenBitAddress};

    #[derive(Debug)]
    struct FakeError(ErrorKind);

    impl embedded_hal::i2c::Error for FakeError {
        fn kind(&self) -> ErrorKind {
            self.0
        }
    }

    #[derive(Default)]
    struct FakeI2c {
        written: Vec<(u8, Vec<u8>)>,
        reply: Vec<u8>,
        fail: Option<ErrorKind>,
    }

    impl ErrorType for FakeI2c {
        type Error = FakeError;
    }

    impl I2c<SevenBitAddress> for FakeI2c {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [HalOperation<'_>],
        ) -> Result<(), FakeError> {
            if let Some(kind) = self.fail {
                return Err(FakeError(kind));
            }
            for operation in operations {
                match operation {
                    HalOperation::Write(bytes) => self.written.push((address, bytes.to_vec())),
                    HalOperation::Read(buffer) => {
                        let len = buffer.len();
                        buffer.copy_from_slice(&self.reply[..len]);
                    }
                }
            }
            Ok(())
        }
    }

    fn transfer_of(
        arena: &mut Arena<64>,
        operation: Operation,
        address: u8,
        data: &[u8],
        read: usize,
    ) {
        let record = arena.allocate(address, data.len(), read).unwrap();
        let mut transfer = arena.transfer(record).unwrap();
        transfer.payload()[..data.len()].copy_from_slice(data);
        transfer.set_operation(operation);
    }

    #[test]
    fn request_goes_out_as_write_read() {
        let mut arena = Arena::<64>::new();
        transfer_of(&mut arena, Operation::Request, 0x68, &[0x3B, 0x00], 2);
        let mut bus: HalBus<_> = HalBus::new(FakeI2c {
            reply: vec![0x12, 0x34],
            ..Default::default()
        });

        let head = arena.head().unwrap();
        let mut transfer = arena.transfer(head).unwrap();
        assert_eq!(bus.execute(&mut transfer), Ok(()));
        assert_eq!(transfer.read_buffer(), &[0x12, 0x34]);
        assert_eq!(bus.into_inner().written, vec![(0x68, vec![0x3B, 0x00])]);
    }

    #[test]
    fn oversized_request_is_a_transmit_error() {
        let mut arena = Arena::<64>::new();
        transfer_of(&mut arena, Operation::Request, 0x68, &[0; 8], 1);
        let mut bus: HalBus<FakeI2c, 4> = HalBus::new(FakeI2c::default());

        let head = arena.head().unwrap();
        let mut transfer = arena.transfer(head).unwrap();
        assert_eq!(
            bus.execute(&mut transfer),
            Err(nb::Error::Other(BusError::TransmitError))
        );
    }

    #[test]
    fn errors_are_classified() {
        assert_eq!(
            classify(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)),
            BusError::DeviceNotPresent
        );
        assert_eq!(
            classify(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown)),
            BusError::DeviceNotPresent
        );
        assert_eq!(
            classify(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data)),
            BusError::NegativeAcknowledge
        );
        assert_eq!(classify(ErrorKind::ArbitrationLoss), BusError::TransmitError);
        assert_eq!(classify(ErrorKind::Bus), BusError::TransmitError);
    }

    #[test]
    fn missing_device_surfaces_from_send() {
        let mut arena = Arena::<64>::new();
        transfer_of(&mut arena, Operation::Send, 0x20, &[1, 2], 0);
        let mut bus: HalBus<_> = HalBus::new(FakeI2c {
            fail: Some(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)),
            ..Default::default()
        });

        let head = arena.head().unwrap();
        let mut transfer = arena.transfer(head).unwrap();
        assert_eq!(
            bus.execute(&mut transfer),
            Err(nb::Error::Other(BusError::DeviceNotPresent))
        );
    }
}
