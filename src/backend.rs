//! The seam between the transaction engine and the physical bus.

use crate::{BusError, Direction, I2CBus, Operation, Transfer, GENERAL_CALL_ADDRESS};

/// Performs the physical operation of the head transaction.
///
/// The engine calls [`start`](Self::start) when a record is dispatched (and
/// again on every retry), then [`execute`](Self::execute) on each poll until
/// it stops returning [`nb::Error::WouldBlock`]. Once the outcome has been
/// delivered it waits for [`is_idle`](Self::is_idle) before calling
/// [`release`](Self::release) and dropping the record.
pub trait BusBackend {
    /// Configures pins and clock. Must be idempotent.
    fn init(&mut self);

    /// Begins the operation named by `transfer.operation()`.
    fn start(&mut self, transfer: &mut Transfer<'_>) {
        let _ = transfer;
    }

    /// Advances the operation. Synchronous backends do all the work here.
    fn execute(&mut self, transfer: &mut Transfer<'_>) -> nb::Result<(), BusError>;

    /// Whether the stop condition has gone out and the bus is released.
    fn is_idle(&mut self, transfer: &Transfer<'_>) -> bool {
        let _ = transfer;
        true
    }

    /// Frees per-transaction resources once the bus is idle.
    fn release(&mut self, transfer: &mut Transfer<'_>) {
        let _ = transfer;
    }
}

/// Resets a request whose write phase already went out, so a retry starts
/// from the beginning.
pub(crate) fn rewind(transfer: &mut Transfer<'_>) {
    if transfer.operation() == Some(Operation::RequestRead) {
        transfer.set_operation(Operation::Request);
    }
}

/// A general call has no addressed device, so missing acknowledgments are
/// not failures.
pub(crate) fn settle(address: u8, result: Result<(), BusError>) -> Result<(), BusError> {
    match result {
        Err(BusError::DeviceNotPresent | BusError::NegativeAcknowledge)
            if address == GENERAL_CALL_ADDRESS =>
        {
            Ok(())
        }
        other => other,
    }
}

/// Runs transactions synchronously on a blocking [`I2CBus`].
pub struct Blocking<B> {
    bus: B,
}

impl<B: I2CBus> Blocking<B> {
    /// Wraps a blocking bus.
    pub const fn new(bus: B) -> Self {
        Self { bus }
    }

    /// The wrapped bus.
    pub fn bus(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Gives the wrapped bus back.
    pub fn into_inner(self) -> B {
        self.bus
    }

    fn write_phase(&mut self, transfer: &Transfer<'_>) -> Result<(), B::Error> {
        self.bus.start_condition()?;
        self.bus.send_header(transfer.address(), Direction::Write)?;
        self.bus.send(transfer.write_data())
    }

    fn read_phase(&mut self, transfer: &mut Transfer<'_>) -> Result<(), B::Error> {
        self.bus.start_condition()?;
        self.bus.send_header(transfer.address(), Direction::Read)?;
        self.bus.read(transfer.read_buffer(), true)
    }

    fn run(&mut self, transfer: &mut Transfer<'_>) -> Result<(), B::Error> {
        match transfer.operation() {
            Some(Operation::Send) => self.write_phase(transfer),
            Some(Operation::Read) => self.read_phase(transfer),
            Some(Operation::Request | Operation::RequestRead) => {
                self.write_phase(transfer)?;
                transfer.set_operation(Operation::RequestRead);
                self.read_phase(transfer)
            }
            // Never dispatched unpopulated; nothing sensible to put on the bus.
            Some(Operation::Pending) | None => Ok(()),
        }
    }
}

impl<B: I2CBus> BusBackend for Blocking<B> {
    fn init(&mut self) {
        self.bus.init();
    }

    fn start(&mut self, transfer: &mut Transfer<'_>) {
        rewind(transfer);
    }

    fn execute(&mut self, transfer: &mut Transfer<'_>) -> nb::Result<(), BusError> {
        let result = self.run(transfer).map_err(Into::into);
        let stop = self.bus.stop_condition().map_err(Into::into);
        settle(transfer.address(), result.and(stop)).map_err(nb::Error::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Arena;

    #[derive(Debug, PartialEq)]
    enum Event {
        Init,
        Start,
        Stop,
        Header(u8, Direction),
        Send(Vec<u8>),
        Read(usize, bool),
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<Event>,
        nack_header: bool,
        nack_data: bool,
        reply: Vec<u8>,
    }

    impl I2CBus for Recorder {
        type Error = BusError;

        fn init(&mut self) {
            self.events.push(Event::Init);
        }

        fn start_condition(&mut self) -> Result<(), BusError> {
            self.events.push(Event::Start);
            Ok(())
        }

        fn stop_condition(&mut self) -> Result<(), BusError> {
            self.events.push(Event::Stop);
            Ok(())
        }

        fn send_header(&mut self, address: u8, direction: Direction) -> Result<(), BusError> {
            self.events.push(Event::Header(address, direction));
            if self.nack_header {
                return Err(BusError::DeviceNotPresent);
            }
            Ok(())
        }

        fn send(&mut self, data: &[u8]) -> Result<(), BusError> {
            self.events.push(Event::Send(data.to_vec()));
            if self.nack_data {
                return Err(BusError::NegativeAcknowledge);
            }
            Ok(())
        }

        fn read(&mut self, data: &mut [u8], nack_last: bool) -> Result<(), BusError> {
            self.events.push(Event::Read(data.len(), nack_last));
            data.copy_from_slice(&self.reply[..data.len()]);
            Ok(())
        }
    }

    fn queue(arena: &mut Arena<64>, address: u8, operation: Operation, data: &[u8], read: usize) {
        let record = arena.allocate(address, data.len(), read).unwrap();
        let mut transfer = arena.transfer(record).unwrap();
        transfer.payload()[..data.len()].copy_from_slice(data);
        transfer.set_operation(operation);
    }

    #[test]
    fn request_uses_repeated_start_and_fills_payload() {
        let mut arena = Arena::<64>::new();
        queue(&mut arena, 0x50, Operation::Request, &[0x10, 0x20], 3);
        let mut backend = Blocking::new(Recorder {
            reply: vec![7, 8, 9],
            ..Default::default()
        });

        let head = arena.head().unwrap();
        let mut transfer = arena.transfer(head).unwrap();
        backend.start(&mut transfer);
        assert_eq!(backend.execute(&mut transfer), Ok(()));
        assert_eq!(transfer.read_buffer(), &[7, 8, 9]);
        assert_eq!(transfer.operation(), Some(Operation::RequestRead));

        assert_eq!(
            backend.into_inner().events,
            vec![
                Event::Start,
                Event::Header(0x50, Direction::Write),
                Event::Send(vec![0x10, 0x20]),
                Event::Start,
                Event::Header(0x50, Direction::Read),
                Event::Read(3, true),
                Event::Stop,
            ]
        );
    }

    #[test]
    fn failure_still_releases_bus() {
        let mut arena = Arena::<64>::new();
        queue(&mut arena, 0x51, Operation::Send, &[1], 0);
        let mut backend = Blocking::new(Recorder {
            nack_header: true,
            ..Default::default()
        });

        let head = arena.head().unwrap();
        let mut transfer = arena.transfer(head).unwrap();
        assert_eq!(
            backend.execute(&mut transfer),
            Err(nb::Error::Other(BusError::DeviceNotPresent))
        );
        assert_eq!(backend.bus().events.last(), Some(&Event::Stop));
    }

    #[test]
    fn general_call_ignores_missing_acknowledge() {
        let mut arena = Arena::<64>::new();
        queue(&mut arena, GENERAL_CALL_ADDRESS, Operation::Send, &[0x06], 0);
        let mut backend = Blocking::new(Recorder {
            nack_data: true,
            ..Default::default()
        });

        let head = arena.head().unwrap();
        let mut transfer = arena.transfer(head).unwrap();
        assert_eq!(backend.execute(&mut transfer), Ok(()));
    }

    #[test]
    fn retry_rewinds_request() {
        let mut arena = Arena::<64>::new();
        queue(&mut arena, 0x52, Operation::RequestRead, &[1], 1);
        let mut backend = Blocking::new(Recorder::default());

        let head = arena.head().unwrap();
        let mut transfer = arena.transfer(head).unwrap();
        backend.start(&mut transfer);
        assert_eq!(transfer.operation(), Some(Operation::Request));
    }

    #[test]
    fn init_reaches_bus() {
        let mut backend = Blocking::new(Recorder::default());
        backend.init();
        assert_eq!(backend.bus().events, vec![Event::Init]);
    }
}
