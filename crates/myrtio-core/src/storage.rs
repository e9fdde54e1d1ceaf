//! Power-loss safe record storage on NOR flash.
//!
//! A record region spans two erase sectors. Every save goes to the sector
//! that does not hold the newest valid record, so an interrupted erase or
//! write leaves the previous record readable. Records carry a wrapping
//! sequence number and a CRC-32 over header and payload.

use crc::{CRC_32_ISO_HDLC, Crc};
use embedded_storage::nor_flash::NorFlash;

const MAGIC_HEADER: u16 = 0xBEEF;
pub const MAGIC_HEADER_SIZE: usize = MAGIC_HEADER.to_le_bytes().len();

const SEQUENCE_SIZE: usize = 4;
const LENGTH_SIZE: usize = 2;
const CRC_SIZE: usize = 4;

/// magic | sequence | payload length
const HEADER_SIZE: usize = MAGIC_HEADER_SIZE + SEQUENCE_SIZE + LENGTH_SIZE;

/// Largest payload a single record can carry.
pub const MAX_RECORD_SIZE: usize = 224;

const SLOT_BUFFER_SIZE: usize = 256;

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    DriverError,
    InvalidMagicHeader,
    InvalidData,
    /// Region is unaligned or smaller than two erase sectors
    InvalidRegion,
    RecordTooLarge,
}

pub trait Encodable<const SIZE: usize>
where
    Self: Sized,
{
    fn encode(&self) -> [u8; SIZE];
    fn decode(data: &[u8]) -> Option<Self>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Corrupt,
    Valid(u32),
}

/// Double-buffered record storage inside a flash region.
pub struct PersistentStorage<F: NorFlash> {
    flash: F,
    offset: u32,
}

impl<F: NorFlash> PersistentStorage<F> {
    /// Use the two erase sectors starting at `offset` for records.
    pub fn new(flash: F, offset: u32) -> Result<Self, StorageError> {
        let sector = F::ERASE_SIZE;
        let start = offset as usize;
        if start % sector != 0 || start + 2 * sector > flash.capacity() {
            return Err(StorageError::InvalidRegion);
        }

        Ok(Self { flash, offset })
    }

    /// Load the newest valid record.
    pub fn load<const SIZE: usize, T: Encodable<SIZE>>(&mut self) -> Result<T, StorageError> {
        let mut first = [0xFFu8; SLOT_BUFFER_SIZE];
        let mut second = [0xFFu8; SLOT_BUFFER_SIZE];
        let a = self.read_slot::<SIZE>(0, &mut first)?;
        let b = self.read_slot::<SIZE>(1, &mut second)?;

        let buffer = match (a, b) {
            (SlotState::Valid(seq_a), SlotState::Valid(seq_b)) => {
                if is_newer(seq_b, seq_a) {
                    &second
                } else {
                    &first
                }
            }
            (SlotState::Valid(_), _) => &first,
            (_, SlotState::Valid(_)) => &second,
            (SlotState::Empty, SlotState::Empty) => return Err(StorageError::InvalidMagicHeader),
            _ => return Err(StorageError::InvalidData),
        };

        T::decode(&buffer[HEADER_SIZE..HEADER_SIZE + SIZE]).ok_or(StorageError::InvalidData)
    }

    /// Save a record without disturbing the newest valid one.
    pub fn save<const SIZE: usize, T: Encodable<SIZE>>(
        &mut self,
        record: &T,
    ) -> Result<(), StorageError> {
        let len = Self::slot_len(SIZE)?;

        let mut scratch = [0xFFu8; SLOT_BUFFER_SIZE];
        let a = self.read_slot::<SIZE>(0, &mut scratch)?;
        let b = self.read_slot::<SIZE>(1, &mut scratch)?;
        let (target, sequence) = match (a, b) {
            (SlotState::Valid(seq_a), SlotState::Valid(seq_b)) => {
                if is_newer(seq_b, seq_a) {
                    (0, seq_b.wrapping_add(1))
                } else {
                    (1, seq_a.wrapping_add(1))
                }
            }
            (SlotState::Valid(seq), _) => (1, seq.wrapping_add(1)),
            (_, SlotState::Valid(seq)) => (0, seq.wrapping_add(1)),
            _ => (0, 1),
        };

        let mut buffer = [0xFFu8; SLOT_BUFFER_SIZE];
        let payload_end = HEADER_SIZE + SIZE;
        buffer[0..MAGIC_HEADER_SIZE].copy_from_slice(&MAGIC_HEADER.to_le_bytes());
        buffer[MAGIC_HEADER_SIZE..MAGIC_HEADER_SIZE + SEQUENCE_SIZE]
            .copy_from_slice(&sequence.to_le_bytes());
        let stored_len = u16::try_from(SIZE).map_err(|_| StorageError::RecordTooLarge)?;
        buffer[MAGIC_HEADER_SIZE + SEQUENCE_SIZE..HEADER_SIZE]
            .copy_from_slice(&stored_len.to_le_bytes());
        buffer[HEADER_SIZE..payload_end].copy_from_slice(&record.encode());
        let crc = CHECKSUM.checksum(&buffer[..payload_end]);
        buffer[payload_end..payload_end + CRC_SIZE].copy_from_slice(&crc.to_le_bytes());

        let addr = self.slot_address(target);
        #[allow(clippy::cast_possible_truncation)]
        let sector = F::ERASE_SIZE as u32;
        self.flash
            .erase(addr, addr + sector)
            .map_err(|_| StorageError::DriverError)?;
        self.flash
            .write(addr, &buffer[..len])
            .map_err(|_| StorageError::DriverError)?;

        log::debug!("storage: saved record seq={} to slot {}", sequence, target);
        Ok(())
    }

    fn read_slot<const SIZE: usize>(
        &mut self,
        slot: u32,
        buffer: &mut [u8; SLOT_BUFFER_SIZE],
    ) -> Result<SlotState, StorageError> {
        let len = Self::slot_len(SIZE)?;
        let addr = self.slot_address(slot);
        self.flash
            .read(addr, &mut buffer[..len])
            .map_err(|_| StorageError::DriverError)?;

        let magic = u16::from_le_bytes([buffer[0], buffer[1]]);
        if magic != MAGIC_HEADER {
            let erased = buffer[..HEADER_SIZE].iter().all(|b| *b == 0xFF);
            return Ok(if erased {
                SlotState::Empty
            } else {
                SlotState::Corrupt
            });
        }

        let stored_len = u16::from_le_bytes([
            buffer[MAGIC_HEADER_SIZE + SEQUENCE_SIZE],
            buffer[MAGIC_HEADER_SIZE + SEQUENCE_SIZE + 1],
        ]);
        if usize::from(stored_len) != SIZE {
            return Ok(SlotState::Corrupt);
        }

        let payload_end = HEADER_SIZE + SIZE;
        let mut crc_bytes = [0u8; CRC_SIZE];
        crc_bytes.copy_from_slice(&buffer[payload_end..payload_end + CRC_SIZE]);
        if CHECKSUM.checksum(&buffer[..payload_end]) != u32::from_le_bytes(crc_bytes) {
            return Ok(SlotState::Corrupt);
        }

        let mut seq_bytes = [0u8; SEQUENCE_SIZE];
        seq_bytes.copy_from_slice(&buffer[MAGIC_HEADER_SIZE..MAGIC_HEADER_SIZE + SEQUENCE_SIZE]);
        Ok(SlotState::Valid(u32::from_le_bytes(seq_bytes)))
    }

    /// Slot byte length rounded up to the flash read/write granularity
    fn slot_len(size: usize) -> Result<usize, StorageError> {
        if size > MAX_RECORD_SIZE {
            return Err(StorageError::RecordTooLarge);
        }
        let align = F::READ_SIZE.max(F::WRITE_SIZE).max(1);
        let len = (HEADER_SIZE + size + CRC_SIZE).div_ceil(align) * align;
        if len > SLOT_BUFFER_SIZE {
            return Err(StorageError::RecordTooLarge);
        }
        Ok(len)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn slot_address(&self, slot: u32) -> u32 {
        self.offset + slot * F::ERASE_SIZE as u32
    }
}

/// Wrapping sequence comparison, `a` is newer than `b`.
#[allow(clippy::cast_possible_wrap)]
fn is_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}
