//! Fixed-capacity byte arena holding the transaction queue.
//!
//! Records are packed back to back from offset 0, oldest first. Each one is
//! an [`HEADER_SIZE`] byte header followed by a payload region of
//! `max(write_len, read_len)` bytes rounded up to a multiple of four. The
//! payload is shared: write bytes are copied in before dispatch and read
//! bytes land in the same place.
//!
//! ```text
//! 0        1         2                4               6        8
//! +--------+---------+----------------+---------------+--------+----------
//! |  op    | address | write_len (LE) | read_len (LE) | unused | payload..
//! +--------+---------+----------------+---------------+--------+----------
//! ```

use crate::Error;

/// Size of the serialized record header.
pub const HEADER_SIZE: usize = 8;

const OP: usize = 0;
const ADDRESS: usize = 1;
const WRITE_LEN: usize = 2;
const READ_LEN: usize = 4;

/// What a queued record asks the bus to do.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Operation {
    /// Read from the device.
    Read = 0,
    /// Write, then read after a repeated start.
    Request = 1,
    /// Write to the device.
    Send = 2,
    /// Read phase of a [`Request`](Operation::Request), after its write
    /// phase went out.
    RequestRead = 3,
    /// Allocated but not yet populated.
    Pending = 4,
}

impl Operation {
    /// Decodes a header byte.
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Read),
            1 => Some(Self::Request),
            2 => Some(Self::Send),
            3 => Some(Self::RequestRead),
            4 => Some(Self::Pending),
            _ => None,
        }
    }
}

/// Number of arena bytes a record with these lengths occupies.
pub const fn record_size(write_len: usize, read_len: usize) -> usize {
    let payload = if write_len > read_len {
        write_len
    } else {
        read_len
    };
    HEADER_SIZE + ((payload + 3) & !3)
}

/// Handle to one record in an [`Arena`].
///
/// Handles are checked against the arena bounds on every access. A handle
/// taken before a compaction may no longer name the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    offset: usize,
    size: usize,
}

impl Record {
    /// Offset of the record header inside the arena.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Padded size of the record, header included.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Bump allocator over `N` bytes with FIFO release.
pub struct Arena<const N: usize> {
    buffer: [u8; N],
    used: usize,
}

impl<const N: usize> Arena<N> {
    const FITS_HEADER: () = assert!(N <= u16::MAX as usize, "arena capacity must fit in u16");

    /// Creates an empty arena.
    pub const fn new() -> Self {
        let () = Self::FITS_HEADER;
        Self {
            buffer: [0; N],
            used: 0,
        }
    }

    /// Total size in bytes.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Offset of the first free byte.
    pub fn len(&self) -> usize {
        self.used
    }

    /// Whether no record is queued.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Drops every record.
    pub fn clear(&mut self) {
        self.used = 0;
    }

    /// Reserves a record at the tail of the queue.
    ///
    /// The header is written with [`Operation::Pending`]; the caller fills in
    /// the payload and the real operation. Nothing changes on failure.
    pub fn allocate(
        &mut self,
        address: u8,
        write_len: usize,
        read_len: usize,
    ) -> Result<Record, Error> {
        if write_len > N || read_len > N {
            return Err(Error::OutOfMemory);
        }
        let size = record_size(write_len, read_len);
        if size > N - self.used {
            return Err(Error::OutOfMemory);
        }

        let offset = self.used;
        let header = &mut self.buffer[offset..offset + HEADER_SIZE];
        header[OP] = Operation::Pending as u8;
        header[ADDRESS] = address;
        header[WRITE_LEN..WRITE_LEN + 2].copy_from_slice(&(write_len as u16).to_le_bytes());
        header[READ_LEN..READ_LEN + 2].copy_from_slice(&(read_len as u16).to_le_bytes());
        header[6] = 0;
        header[7] = 0;
        self.used += size;

        Ok(Record { offset, size })
    }

    /// The oldest record, the only one ever on the bus.
    pub fn head(&self) -> Option<Record> {
        self.record_at(0)
    }

    /// Walks the queued records oldest first.
    pub fn records(&self) -> Records<'_, N> {
        Records {
            arena: self,
            offset: 0,
        }
    }

    fn record_at(&self, offset: usize) -> Option<Record> {
        if offset + HEADER_SIZE > self.used {
            return None;
        }
        let header = &self.buffer[offset..offset + HEADER_SIZE];
        let size = record_size(read_u16(header, WRITE_LEN), read_u16(header, READ_LEN));
        if offset + size > self.used {
            return None;
        }
        Some(Record { offset, size })
    }

    fn span(&self, record: Record) -> Option<core::ops::Range<usize>> {
        let end = record.offset.checked_add(record.size)?;
        if end > self.used || record.size < HEADER_SIZE {
            return None;
        }
        Some(record.offset..end)
    }

    /// Mutable view of a record, or `None` if the handle is out of bounds.
    pub fn transfer(&mut self, record: Record) -> Option<Transfer<'_>> {
        let span = self.span(record)?;
        Transfer::parse(&mut self.buffer[span])
    }

    /// Raw bytes of a record, header included.
    pub fn bytes(&self, record: Record) -> Option<&[u8]> {
        let span = self.span(record)?;
        Some(&self.buffer[span])
    }

    /// Removes the head record and shifts everything behind it down to
    /// offset 0.
    ///
    /// Returns the number of bytes reclaimed, `0` if `record` is not the
    /// current head.
    pub fn compact(&mut self, record: Record) -> usize {
        if record.offset != 0 || self.head() != Some(record) {
            return 0;
        }
        if self.used > record.size {
            self.buffer.copy_within(record.size..self.used, 0);
            self.used -= record.size;
        } else {
            self.used = 0;
        }
        record.size
    }
}

impl<const N: usize> Default for Arena<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`Arena::records`].
pub struct Records<'a, const N: usize> {
    arena: &'a Arena<N>,
    offset: usize,
}

impl<const N: usize> Iterator for Records<'_, N> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        let record = self.arena.record_at(self.offset)?;
        self.offset += record.size;
        Some(record)
    }
}

fn read_u16(bytes: &[u8], at: usize) -> usize {
    u16::from_le_bytes([bytes[at], bytes[at + 1]]) as usize
}

/// Borrowed view of one queued record, handed to bus backends.
pub struct Transfer<'a> {
    header: &'a mut [u8],
    payload: &'a mut [u8],
}

impl<'a> Transfer<'a> {
    /// Reads a record laid out as in an [`Arena`]: header first, payload
    /// after. Returns `None` if `bytes` is too short for what the header
    /// declares.
    pub fn parse(bytes: &'a mut [u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let (header, payload) = bytes.split_at_mut(HEADER_SIZE);
        let payload_len = read_u16(header, WRITE_LEN).max(read_u16(header, READ_LEN));
        let payload = payload.get_mut(..payload_len)?;
        Some(Transfer { header, payload })
    }

    /// Returns `None` for a header byte that names no operation.
    pub fn operation(&self) -> Option<Operation> {
        Operation::from_byte(self.header[OP])
    }

    /// Overwrites the operation byte.
    pub fn set_operation(&mut self, operation: Operation) {
        self.header[OP] = operation as u8;
    }

    /// 7-bit target address.
    pub fn address(&self) -> u8 {
        self.header[ADDRESS]
    }

    /// Number of bytes to write.
    pub fn write_len(&self) -> usize {
        read_u16(&self.header[..], WRITE_LEN)
    }

    /// Number of bytes to read.
    pub fn read_len(&self) -> usize {
        read_u16(&self.header[..], READ_LEN)
    }

    /// Bytes to put on the bus.
    pub fn write_data(&self) -> &[u8] {
        &self.payload[..self.write_len()]
    }

    /// Where received bytes go. Overlaps [`write_data`](Self::write_data).
    pub fn read_buffer(&mut self) -> &mut [u8] {
        let len = self.read_len();
        &mut self.payload[..len]
    }

    /// The whole payload region, `max(write_len, read_len)` bytes.
    pub fn payload(&mut self) -> &mut [u8] {
        &mut self.payload[..]
    }
}
