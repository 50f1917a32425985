//! Transaction queue and the state machine driving it.
//!
//! Only the record at the head of the arena is ever on the bus. Its life is
//!
//! ```text
//! Free --enqueue--> Pending --outcome--> Closing --bus idle--> Free
//!                     ^   |
//!                     +---+ device not present, retries left
//! ```
//!
//! Leaving `Closing` compacts the finished record out of the arena and
//! immediately dispatches the next one, if any.

use core::cell::{RefCell, UnsafeCell};

use critical_section::Mutex;
use heapless::Deque;

use crate::{Arena, BusBackend, Error, Operation, Transfer, GENERAL_CALL_ADDRESS, HEADER_SIZE};

/// Arena size used when none is given.
pub const DEFAULT_CAPACITY: usize = 128;

/// Completion slots used when none is given. One per minimal record.
pub const DEFAULT_DEPTH: usize = DEFAULT_CAPACITY / HEADER_SIZE;

/// Completion of a [`send`](I2cMaster::send) or
/// [`broadcast`](I2cMaster::broadcast).
pub type SendCallback<C> = fn(Result<(), Error>, C);

/// Completion of a [`read`](I2cMaster::read). Success carries the bytes read.
pub type ReadCallback<C> = fn(Result<&[u8], Error>, C);

/// Completion of a [`request`](I2cMaster::request). Success carries the
/// bytes read after the write.
pub type RequestCallback<C> = fn(Result<&[u8], Error>, C);

#[derive(Clone, Copy)]
enum Callback<C> {
    None,
    Send(SendCallback<C>),
    Read(ReadCallback<C>),
    Request(RequestCallback<C>),
}

#[derive(Clone, Copy)]
struct Completion<C> {
    callback: Callback<C>,
    context: C,
}

/// An outcome ready to hand to the caller, with the lock released.
struct Delivery<C> {
    completion: Completion<C>,
    result: Result<usize, Error>,
}

impl<C: Copy> Delivery<C> {
    fn invoke(self, data: &[u8]) {
        let Completion { callback, context } = self.completion;
        let bytes = self.result.map(|len| &data[..len]);
        match callback {
            Callback::None => {}
            Callback::Send(callback) => callback(bytes.map(|_| ()), context),
            Callback::Read(callback) => callback(bytes, context),
            Callback::Request(callback) => callback(bytes, context),
        }
    }
}

/// Where the head transaction is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusState {
    /// Nothing dispatched.
    Free,
    /// Handed to the backend, outcome not known yet.
    Pending,
    /// Outcome delivered, waiting for the bus to go idle.
    Closing,
}

/// Runtime settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// How many times an absent device is retried before giving up.
    pub retry_count: u8,
}

impl Config {
    /// No retries.
    pub const fn new() -> Self {
        Self { retry_count: 0 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue state shared by every context. Only touched inside a critical
/// section.
struct Engine<C, const N: usize, const D: usize> {
    arena: Arena<N>,
    completions: Deque<Completion<C>, D>,
    state: BusState,
    tries: u8,
    retry_count: u8,
    config: Config,
    /// Bumped on every dispatch and reset, naming the record on the bus.
    ticket: u32,
    /// Whether a [`Claim`] on the worker is alive.
    claimed: bool,
}

/// What `poll` has to do with the worker once the lock is released.
enum Phase {
    Idle,
    Start(u32),
    Run(u32),
    Close(u32),
}

enum Verdict<C> {
    Stale,
    Retry,
    Deliver(Completion<C>),
}

impl<C: Copy, const N: usize, const D: usize> Engine<C, N, D> {
    fn reset(&mut self) {
        self.arena.clear();
        self.completions.clear();
        self.state = BusState::Free;
        self.tries = 0;
        self.retry_count = self.config.retry_count;
        self.ticket = self.ticket.wrapping_add(1);
    }

    fn enqueue(
        &mut self,
        operation: Operation,
        address: u8,
        data: &[u8],
        read_len: usize,
        completion: Completion<C>,
    ) -> Result<(), Error> {
        let record = self
            .arena
            .allocate(address, data.len(), read_len)
            .inspect_err(|_| {
                log_warn!("rejecting transaction for {}: arena full", address);
            })?;
        let Some(mut transfer) = self.arena.transfer(record) else {
            return Err(Error::OutOfMemory);
        };
        transfer.payload()[..data.len()].copy_from_slice(data);
        transfer.set_operation(operation);
        // `D` covers every record the arena can hold, so there is always room.
        let _ = self.completions.push_back(completion);

        self.dispatch();
        Ok(())
    }

    /// Marks the head record as on the bus if nothing else is. The next
    /// poll hands it to the backend.
    fn dispatch(&mut self) {
        if self.state != BusState::Free || self.arena.is_empty() {
            return;
        }
        self.state = BusState::Pending;
        self.tries = 0;
        self.ticket = self.ticket.wrapping_add(1);
    }

    /// Copies the head record into the worker.
    fn load<B>(&self, worker: &mut Worker<B, N>) -> bool {
        let Some(bytes) = self.arena.head().and_then(|head| self.arena.bytes(head)) else {
            return false;
        };
        worker.record[..bytes.len()].copy_from_slice(bytes);
        worker.ticket = Some(self.ticket);
        log_trace!("dispatching transaction {}", self.ticket);
        true
    }

    fn phase<B>(&self, worker: &mut Worker<B, N>) -> Phase {
        match self.state {
            BusState::Free => Phase::Idle,
            BusState::Pending if worker.ticket == Some(self.ticket) => Phase::Run(self.ticket),
            BusState::Pending if self.load(worker) => Phase::Start(self.ticket),
            BusState::Pending => Phase::Idle,
            BusState::Closing => Phase::Close(self.ticket),
        }
    }

    /// Records the outcome of one attempt and decides what follows.
    fn conclude(&mut self, ticket: u32, address: u8, error: Option<Error>) -> Verdict<C> {
        if ticket != self.ticket || self.state != BusState::Pending {
            return Verdict::Stale;
        }
        if error == Some(Error::DeviceNotPresent) {
            self.tries = self.tries.saturating_add(1);
            if self.tries <= self.retry_count {
                log_debug!(
                    "device {} not present, retry {} of {}",
                    address,
                    self.tries,
                    self.retry_count
                );
                return Verdict::Retry;
            }
        }
        let Some(completion) = self.completions.front().copied() else {
            return Verdict::Stale;
        };
        self.state = BusState::Closing;
        Verdict::Deliver(completion)
    }

    /// Drops the finished head record and dispatches the next one. Returns
    /// whether the worker was loaded with it.
    fn close<B>(&mut self, ticket: u32, worker: &mut Worker<B, N>) -> bool {
        if ticket != self.ticket || self.state != BusState::Closing {
            return false;
        }
        if let Some(head) = self.arena.head() {
            self.arena.compact(head);
        }
        self.completions.pop_front();
        self.state = BusState::Free;
        self.dispatch();
        self.state == BusState::Pending && self.load(worker)
    }
}

/// The backend and a private copy of the record it is working on.
///
/// Lives outside the critical section so bus transfers never run with
/// interrupts masked.
struct Worker<B, const N: usize> {
    backend: B,
    record: [u8; N],
    ticket: Option<u32>,
}

impl<B: BusBackend, const N: usize> Worker<B, N> {
    fn start(&mut self) {
        if let Some(mut transfer) = Transfer::parse(&mut self.record) {
            self.backend.start(&mut transfer);
        }
    }

    /// Waits out the stop condition, then releases the transfer.
    fn finish(&mut self) -> bool {
        let Some(mut transfer) = Transfer::parse(&mut self.record) else {
            return true;
        };
        if !self.backend.is_idle(&transfer) {
            return false;
        }
        self.backend.release(&mut transfer);
        true
    }
}

/// Exclusive access to the worker, given up on drop.
struct Claim<'a, B, C, const N: usize, const D: usize> {
    master: &'a I2cMaster<B, C, N, D>,
}

impl<B, C, const N: usize, const D: usize> Claim<'_, B, C, N, D> {
    fn worker(&mut self) -> &mut Worker<B, N> {
        // SAFETY: `claimed` stays set while this guard lives, so this is the
        // only reference to the worker.
        unsafe { &mut *self.master.worker.get() }
    }
}

impl<B, C, const N: usize, const D: usize> Drop for Claim<'_, B, C, N, D> {
    fn drop(&mut self) {
        critical_section::with(|cs| self.master.engine.borrow_ref_mut(cs).claimed = false);
    }
}

/// Asynchronous I2C master.
///
/// Transactions are queued in an `N` byte arena with room for at most `D`
/// outstanding completions, and run one at a time in the order they were
/// queued. `C` is the context handed back to each callback. `D` must be at
/// least `N / HEADER_SIZE` so the arena is always the binding limit.
///
/// Queue state is guarded by a critical section held only while it is being
/// read or changed, so a master can live in a `static` and be fed from
/// interrupt handlers and from inside callbacks. The backend runs outside
/// it. [`poll`](Self::poll) and [`init`](Self::init) must not be called from
/// two contexts at once.
///
/// ```ignore
/// static I2C: I2cMaster<HalBus<Bus>, u8> = I2cMaster::new(HalBus::new(bus));
///
/// fn on_temperature(result: Result<&[u8], Error>, sensor: u8) { /* ... */ }
///
/// I2C.init();
/// I2C.request(0x48, &[0x00], 2, Some(on_temperature), 0)?;
/// loop {
///     I2C.poll();
/// }
/// ```
pub struct I2cMaster<B, C = (), const N: usize = DEFAULT_CAPACITY, const D: usize = DEFAULT_DEPTH>
{
    engine: Mutex<RefCell<Engine<C, N, D>>>,
    worker: UnsafeCell<Worker<B, N>>,
}

// SAFETY: the engine is only reached inside a critical section and the
// worker only through a `Claim`, of which at most one exists at a time.
unsafe impl<B: Send, C: Send, const N: usize, const D: usize> Sync for I2cMaster<B, C, N, D> {}

impl<B, C, const N: usize, const D: usize> I2cMaster<B, C, N, D>
where
    B: BusBackend,
    C: Copy,
{
    const DEPTH_COVERS_ARENA: () = assert!(
        D >= N / HEADER_SIZE,
        "completion depth must cover every record the arena can hold"
    );

    /// Creates a master with the default [`Config`].
    pub const fn new(backend: B) -> Self {
        Self::with_config(backend, Config::new())
    }

    /// Creates a master whose [`init`](Self::init) restores `config`.
    pub const fn with_config(backend: B, config: Config) -> Self {
        let () = Self::DEPTH_COVERS_ARENA;
        Self {
            engine: Mutex::new(RefCell::new(Engine {
                arena: Arena::new(),
                completions: Deque::new(),
                state: BusState::Free,
                tries: 0,
                retry_count: config.retry_count,
                config,
                ticket: 0,
                claimed: false,
            })),
            worker: UnsafeCell::new(Worker {
                backend,
                record: [0; N],
                ticket: None,
            }),
        }
    }

    fn with_engine<R>(&self, f: impl FnOnce(&mut Engine<C, N, D>) -> R) -> R {
        critical_section::with(|cs| f(&mut *self.engine.borrow_ref_mut(cs)))
    }

    fn claim(&self) -> Option<Claim<'_, B, C, N, D>> {
        let claimed = self.with_engine(|engine| core::mem::replace(&mut engine.claimed, true));
        if claimed {
            return None;
        }
        Some(Claim { master: self })
    }

    /// Empties the queue, restores the configured retry count and
    /// initializes the backend.
    ///
    /// Queued transactions are dropped without a callback.
    pub fn init(&self) {
        let Some(mut claim) = self.claim() else {
            log_warn!("init skipped: poll in progress");
            return;
        };
        self.with_engine(Engine::reset);
        let worker = claim.worker();
        worker.ticket = None;
        worker.backend.init();
    }

    /// Advances the transaction on the bus by one step, invoking its
    /// callback when it finishes.
    pub fn poll(&self) {
        let Some(mut claim) = self.claim() else {
            return;
        };
        let worker = claim.worker();
        let mut scratch = [0u8; N];

        let delivery = match self.with_engine(|engine| engine.phase(worker)) {
            Phase::Idle => None,
            Phase::Start(ticket) => {
                worker.start();
                self.attempt(worker, ticket, &mut scratch)
            }
            Phase::Run(ticket) => self.attempt(worker, ticket, &mut scratch),
            Phase::Close(ticket) => {
                if worker.finish() && self.with_engine(|engine| engine.close(ticket, worker)) {
                    worker.start();
                }
                None
            }
        };

        drop(claim);
        if let Some(delivery) = delivery {
            delivery.invoke(&scratch);
        }
    }

    fn attempt(
        &self,
        worker: &mut Worker<B, N>,
        ticket: u32,
        scratch: &mut [u8],
    ) -> Option<Delivery<C>> {
        let Worker { backend, record, .. } = worker;
        let mut transfer = Transfer::parse(&mut record[..])?;
        let error = match backend.execute(&mut transfer) {
            Err(nb::Error::WouldBlock) => return None,
            Ok(()) => None,
            Err(nb::Error::Other(error)) => Some(Error::from(error)),
        };

        let address = transfer.address();
        match self.with_engine(|engine| engine.conclude(ticket, address, error)) {
            Verdict::Stale => None,
            Verdict::Retry => {
                backend.start(&mut transfer);
                None
            }
            Verdict::Deliver(completion) => {
                let result = match error {
                    None => {
                        let len = transfer.read_len();
                        scratch[..len].copy_from_slice(transfer.read_buffer());
                        Ok(len)
                    }
                    Some(error) => {
                        log_debug!("transaction for {} failed: {}", address, error);
                        Err(error)
                    }
                };
                Some(Delivery { completion, result })
            }
        }
    }

    /// Queues a write of `data` to `address`.
    ///
    /// `data` is copied, so it need not outlive the call. Returns
    /// [`Error::OutOfMemory`] without queueing anything when the arena is
    /// full; no callback is owed in that case.
    pub fn send(
        &self,
        address: u8,
        data: &[u8],
        callback: Option<SendCallback<C>>,
        context: C,
    ) -> Result<(), Error> {
        let callback = callback.map_or(Callback::None, Callback::Send);
        self.with_engine(|engine| {
            engine.enqueue(Operation::Send, address, data, 0, Completion { callback, context })
        })
    }

    /// Queues a write of `data` to the general call address.
    pub fn broadcast(
        &self,
        data: &[u8],
        callback: Option<SendCallback<C>>,
        context: C,
    ) -> Result<(), Error> {
        self.send(GENERAL_CALL_ADDRESS, data, callback, context)
    }

    /// Queues a write of `data` followed, after a repeated start, by a read
    /// of `read_len` bytes.
    pub fn request(
        &self,
        address: u8,
        data: &[u8],
        read_len: usize,
        callback: Option<RequestCallback<C>>,
        context: C,
    ) -> Result<(), Error> {
        let callback = callback.map_or(Callback::None, Callback::Request);
        self.with_engine(|engine| {
            engine.enqueue(
                Operation::Request,
                address,
                data,
                read_len,
                Completion { callback, context },
            )
        })
    }

    /// Queues a read of `read_len` bytes from `address`.
    pub fn read(
        &self,
        address: u8,
        read_len: usize,
        callback: Option<ReadCallback<C>>,
        context: C,
    ) -> Result<(), Error> {
        let callback = callback.map_or(Callback::None, Callback::Read);
        self.with_engine(|engine| {
            engine.enqueue(
                Operation::Read,
                address,
                &[],
                read_len,
                Completion { callback, context },
            )
        })
    }

    /// Sets how many times an absent device is retried. Returns the new
    /// value.
    pub fn set_retry_count(&self, count: u8) -> u8 {
        self.with_engine(|engine| {
            engine.retry_count = count;
            engine.retry_count
        })
    }

    /// Current retry ceiling.
    pub fn retry_count(&self) -> u8 {
        self.with_engine(|engine| engine.retry_count)
    }

    /// Where the head transaction is in its life.
    pub fn state(&self) -> BusState {
        self.with_engine(|engine| engine.state)
    }

    /// Arena bytes taken by queued transactions, the current one included.
    pub fn queued_bytes(&self) -> usize {
        self.with_engine(|engine| engine.arena.len())
    }

    /// Number of queued transactions, the current one included.
    pub fn queued(&self) -> usize {
        self.with_engine(|engine| engine.completions.len())
    }

    /// Runs `f` on the backend, or returns `None` while a poll is using it.
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> Option<R> {
        let mut claim = self.claim()?;
        Some(f(&mut claim.worker().backend))
    }
}
