//! Double-buffered record storage on NOR flash.

use myrtio_core::storage::{Encodable, PersistentStorage, StorageError};
use tests::{MockFlash, SECTOR_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Counter {
    value: u32,
    tag: [u8; 4],
}

impl Counter {
    fn new(value: u32) -> Self {
        Self {
            value,
            tag: *b"cntr",
        }
    }
}

impl Encodable<8> for Counter {
    fn encode(&self) -> [u8; 8] {
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&self.value.to_le_bytes());
        data[4..].copy_from_slice(&self.tag);
        data
    }

    fn decode(data: &[u8]) -> Option<Self> {
        let value = u32::from_le_bytes(data[..4].try_into().ok()?);
        let tag = data[4..8].try_into().ok()?;
        Some(Self { value, tag })
    }
}

struct Oversized;

impl Encodable<300> for Oversized {
    fn encode(&self) -> [u8; 300] {
        [0; 300]
    }

    fn decode(_data: &[u8]) -> Option<Self> {
        Some(Self)
    }
}

fn storage(flash: &MockFlash) -> PersistentStorage<MockFlash> {
    PersistentStorage::new(flash.clone(), 0).unwrap()
}

// -----------------------------------------------------------------------------
// Region
// -----------------------------------------------------------------------------

#[test]
fn region_must_be_sector_aligned() {
    let flash = MockFlash::new(4 * SECTOR_SIZE);
    let result = PersistentStorage::new(flash, 100);
    assert!(matches!(result, Err(StorageError::InvalidRegion)));
}

#[test]
fn region_must_hold_two_sectors() {
    let flash = MockFlash::new(2 * SECTOR_SIZE);
    assert!(PersistentStorage::new(flash.clone(), 0).is_ok());
    let result = PersistentStorage::new(flash, SECTOR_SIZE as u32);
    assert!(matches!(result, Err(StorageError::InvalidRegion)));
}

#[test]
fn oversized_record_is_rejected() {
    let flash = MockFlash::new(2 * SECTOR_SIZE);
    let mut storage = storage(&flash);
    assert_eq!(
        storage.save::<300, Oversized>(&Oversized),
        Err(StorageError::RecordTooLarge)
    );
    assert_eq!(flash.write_count(), 0);
}

// -----------------------------------------------------------------------------
// Load / save
// -----------------------------------------------------------------------------

#[test]
fn empty_region_has_no_record() {
    let flash = MockFlash::new(2 * SECTOR_SIZE);
    let mut storage = storage(&flash);
    assert_eq!(
        storage.load::<8, Counter>(),
        Err(StorageError::InvalidMagicHeader)
    );
}

#[test]
fn saved_record_survives_reopen() {
    let flash = MockFlash::new(2 * SECTOR_SIZE);
    storage(&flash).save(&Counter::new(7)).unwrap();

    let mut reopened = storage(&flash);
    assert_eq!(reopened.load::<8, Counter>(), Ok(Counter::new(7)));
}

#[test]
fn newest_record_wins() {
    let flash = MockFlash::new(2 * SECTOR_SIZE);
    let mut storage = storage(&flash);
    for value in 1..=5 {
        storage.save(&Counter::new(value)).unwrap();
    }
    assert_eq!(storage.load::<8, Counter>(), Ok(Counter::new(5)));
}

#[test]
fn saves_alternate_between_sectors() {
    let flash = MockFlash::new(2 * SECTOR_SIZE);
    let mut storage = storage(&flash);

    storage.save(&Counter::new(1)).unwrap();
    assert!(!flash.is_erased(0, 16));
    assert!(flash.is_erased(SECTOR_SIZE, SECTOR_SIZE + 16));

    storage.save(&Counter::new(2)).unwrap();
    assert!(!flash.is_erased(0, 16));
    assert!(!flash.is_erased(SECTOR_SIZE, SECTOR_SIZE + 16));
}

#[test]
fn interrupted_save_keeps_previous_record() {
    let flash = MockFlash::new(2 * SECTOR_SIZE);
    let mut storage = storage(&flash);
    storage.save(&Counter::new(1)).unwrap();
    storage.save(&Counter::new(2)).unwrap();

    // Third save targets the first sector again: erase succeeds, write fails
    flash.fail_writes_from(0);
    assert_eq!(
        storage.save(&Counter::new(3)),
        Err(StorageError::DriverError)
    );
    flash.heal();

    assert_eq!(storage.load::<8, Counter>(), Ok(Counter::new(2)));
}

#[test]
fn corrupted_newest_record_falls_back_to_previous() {
    let flash = MockFlash::new(2 * SECTOR_SIZE);
    let mut storage = storage(&flash);
    storage.save(&Counter::new(1)).unwrap();
    storage.save(&Counter::new(2)).unwrap();

    flash.corrupt(SECTOR_SIZE + 12, 0x00);

    assert_eq!(storage.load::<8, Counter>(), Ok(Counter::new(1)));
}

#[test]
fn both_records_corrupted_is_invalid_data() {
    let flash = MockFlash::new(2 * SECTOR_SIZE);
    let mut storage = storage(&flash);
    storage.save(&Counter::new(1)).unwrap();
    storage.save(&Counter::new(2)).unwrap();

    flash.corrupt(12, 0x00);
    flash.corrupt(SECTOR_SIZE + 12, 0x00);

    assert_eq!(storage.load::<8, Counter>(), Err(StorageError::InvalidData));
}
