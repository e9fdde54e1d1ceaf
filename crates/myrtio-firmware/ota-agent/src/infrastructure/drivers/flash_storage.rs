//! Flash storage driver with shared mutex access
//!
//! Every flash user (boot record, OTA partitions, otadata) goes through one
//! global mutex. [`SharedFlashRegion`] exposes a partition as its own
//! `NorFlash` device with addresses relative to the partition start.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};
use embedded_storage::nor_flash::{
    ErrorType,
    NorFlash,
    NorFlashError,
    NorFlashErrorKind,
    ReadNorFlash,
};
use esp_hal::peripherals::FLASH;
use esp_storage::FlashStorage;
use static_cell::StaticCell;

/// Type alias for the shared flash storage mutex
pub(crate) type FlashStorageMutex = Mutex<CriticalSectionRawMutex, RefCell<FlashStorage<'static>>>;

static FLASH_STORAGE_CELL: StaticCell<FlashStorageMutex> = StaticCell::new();

/// Initialize the shared flash storage mutex from the FLASH peripheral.
///
/// # Panics
/// Panics if called more than once.
pub(crate) fn init_flash_storage_mutex(flash: FLASH<'static>) -> &'static FlashStorageMutex {
    let flash_storage = FlashStorage::new(flash);
    FLASH_STORAGE_CELL.init(Mutex::new(RefCell::new(flash_storage)))
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum FlashRegionError {
    OutOfBounds,
    Driver,
}

impl NorFlashError for FlashRegionError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            FlashRegionError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            FlashRegionError::Driver => NorFlashErrorKind::Other,
        }
    }
}

/// Window of the shared flash, locked per operation.
pub(crate) struct SharedFlashRegion {
    storage: &'static FlashStorageMutex,
    offset: u32,
    size: u32,
}

impl SharedFlashRegion {
    pub(crate) fn new(storage: &'static FlashStorageMutex, offset: u32, size: u32) -> Self {
        Self {
            storage,
            offset,
            size,
        }
    }

    fn address(&self, offset: u32, len: usize) -> Result<u32, FlashRegionError> {
        let len = u32::try_from(len).map_err(|_| FlashRegionError::OutOfBounds)?;
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(self.offset + offset),
            _ => Err(FlashRegionError::OutOfBounds),
        }
    }
}

impl ErrorType for SharedFlashRegion {
    type Error = FlashRegionError;
}

impl ReadNorFlash for SharedFlashRegion {
    const READ_SIZE: usize = <FlashStorage<'static> as ReadNorFlash>::READ_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let address = self.address(offset, bytes.len())?;
        self.storage.lock(|cell| {
            cell.borrow_mut()
                .read(address, bytes)
                .map_err(|_| FlashRegionError::Driver)
        })
    }

    fn capacity(&self) -> usize {
        self.size as usize
    }
}

impl NorFlash for SharedFlashRegion {
    const WRITE_SIZE: usize = <FlashStorage<'static> as NorFlash>::WRITE_SIZE;
    const ERASE_SIZE: usize = <FlashStorage<'static> as NorFlash>::ERASE_SIZE;

    #[allow(clippy::cast_possible_truncation)]
    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from > to || to > self.size {
            return Err(FlashRegionError::OutOfBounds);
        }

        // One sector per lock so other flash users are not starved
        let sector = Self::ERASE_SIZE as u32;
        let mut address = self.offset + from;
        let end = self.offset + to;
        while address < end {
            let next = (address + sector).min(end);
            self.storage.lock(|cell| {
                cell.borrow_mut()
                    .erase(address, next)
                    .map_err(|_| FlashRegionError::Driver)
            })?;
            address = next;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let address = self.address(offset, bytes.len())?;
        self.storage.lock(|cell| {
            NorFlash::write(&mut *cell.borrow_mut(), address, bytes)
                .map_err(|_| FlashRegionError::Driver)
        })
    }
}
