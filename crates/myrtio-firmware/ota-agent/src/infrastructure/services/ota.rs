//! OTA Update Service
//!
//! Wires the `myrtio-ota` ports to the ESP-IDF partition table and otadata.
//! All flash access goes through the shared flash mutex.

use esp_bootloader_esp_idf::{
    ota::{Ota, OtaImageState},
    partitions::{
        AppPartitionSubType,
        DataPartitionSubType,
        PARTITION_TABLE_MAX_LEN,
        PartitionType,
        read_partition_table,
    },
};
use esp_println::println;
use myrtio_ota::{
    BootError,
    BootRecord,
    BootRecordStore,
    EspImageValidator,
    FirmwareStorage,
    FlashBootRecordStore,
    PartitionId,
    Restart,
    SessionError,
};

use crate::infrastructure::{
    config,
    drivers::{FlashStorageMutex, SharedFlashRegion},
};

const OTA_APP_PARTITIONS: usize = 2;

#[derive(Debug)]
pub(crate) enum OtaError {
    /// Failed to read or parse partition table
    PartitionTable,
    /// No OTA data partition found
    NoOtaDataPartition,
    /// No app partition for the requested slot
    NoAppPartition,
    /// otadata could not be read or written
    InvalidState,
}

fn sub_type(id: PartitionId) -> AppPartitionSubType {
    match id {
        PartitionId::Slot0 => AppPartitionSubType::Ota0,
        PartitionId::Slot1 => AppPartitionSubType::Ota1,
    }
}

/// Run `f` against the otadata partition.
fn with_ota<R>(
    flash: &'static FlashStorageMutex,
    f: impl FnOnce(&mut Ota<'_, esp_storage::FlashStorage<'static>>) -> Result<R, OtaError>,
) -> Result<R, OtaError> {
    flash.lock(|cell| {
        let mut flash = cell.borrow_mut();
        let mut buffer = [0u8; PARTITION_TABLE_MAX_LEN];

        let pt = read_partition_table(&mut *flash, &mut buffer)
            .map_err(|_| OtaError::PartitionTable)?;
        let ota_data_part = pt
            .find_partition(PartitionType::Data(DataPartitionSubType::Ota))
            .map_err(|_| OtaError::PartitionTable)?
            .ok_or(OtaError::NoOtaDataPartition)?;

        let mut ota_region = ota_data_part.as_embedded_storage(&mut *flash);
        let mut ota =
            Ota::new(&mut ota_region, OTA_APP_PARTITIONS).map_err(|_| OtaError::InvalidState)?;
        f(&mut ota)
    })
}

/// OTA Service
///
/// Hands out the hardware implementations of the update ports.
#[derive(Clone, Copy)]
pub(crate) struct OtaService {
    flash: &'static FlashStorageMutex,
}

impl OtaService {
    pub(crate) fn new(flash: &'static FlashStorageMutex) -> Self {
        Self { flash }
    }

    /// Mark a freshly booted image as valid.
    ///
    /// Must run early during boot, otherwise the bootloader may fall back to
    /// the previous image on the next reset.
    pub(crate) fn handle_boot_state(&self) {
        let result = with_ota(self.flash, |ota| {
            let state = ota.current_ota_state().map_err(|_| OtaError::InvalidState)?;
            match state {
                OtaImageState::New | OtaImageState::PendingVerify => {
                    ota.set_current_ota_state(OtaImageState::Valid)
                        .map_err(|_| OtaError::InvalidState)?;
                    println!("ota: marked current image as VALID");
                }
                OtaImageState::Valid => println!("ota: current image already VALID"),
                _ => println!("ota: current image state: {:?}", state),
            }
            Ok(())
        });
        if let Err(e) = result {
            println!("ota: boot state check failed: {:?}", e);
        }
    }

    /// Partition the bootloader selected for this boot.
    pub(crate) fn running_partition(&self) -> PartitionId {
        let current = with_ota(self.flash, |ota| {
            ota.current_app_partition()
                .map_err(|_| OtaError::InvalidState)
        });
        match current {
            Ok(AppPartitionSubType::Ota1) => PartitionId::Slot1,
            Ok(_) => PartitionId::Slot0,
            Err(e) => {
                println!("ota: failed to read otadata: {:?}, assuming ota_0", e);
                PartitionId::Slot0
            }
        }
    }

    pub(crate) fn firmware_storage(&self) -> EspFirmwareStorage {
        EspFirmwareStorage { flash: self.flash }
    }

    pub(crate) fn boot_record_store(&self) -> Result<EspBootRecordStore, BootError> {
        let region = SharedFlashRegion::new(
            self.flash,
            config::STORAGE.boot_record_offset,
            config::STORAGE.boot_record_size,
        );
        let records = FlashBootRecordStore::new(region, 0).map_err(|_| BootError::Persist)?;

        Ok(EspBootRecordStore {
            flash: self.flash,
            records,
            last: None,
        })
    }
}

/// The `ota_0` / `ota_1` app partitions.
pub(crate) struct EspFirmwareStorage {
    flash: &'static FlashStorageMutex,
}

impl FirmwareStorage for EspFirmwareStorage {
    type Flash = SharedFlashRegion;
    type Validator = EspImageValidator;

    fn open_partition(&mut self, id: PartitionId) -> Result<SharedFlashRegion, SessionError> {
        let (offset, size) = self
            .flash
            .lock(|cell| {
                let mut flash = cell.borrow_mut();
                let mut buffer = [0u8; PARTITION_TABLE_MAX_LEN];
                let pt = read_partition_table(&mut *flash, &mut buffer)
                    .map_err(|_| OtaError::PartitionTable)?;
                let partition = pt
                    .find_partition(PartitionType::App(sub_type(id)))
                    .map_err(|_| OtaError::PartitionTable)?
                    .ok_or(OtaError::NoAppPartition)?;
                Ok((partition.offset(), partition.len()))
            })
            .map_err(|e: OtaError| {
                println!("ota: cannot open {:?}: {:?}", id, e);
                SessionError::Partition
            })?;

        println!(
            "ota: {:?} at offset 0x{:X}, size {} bytes",
            id, offset, size
        );
        Ok(SharedFlashRegion::new(self.flash, offset, size))
    }

    fn validator(&self) -> EspImageValidator {
        EspImageValidator::new()
    }
}

/// Boot record plus the bootloader's own selection in otadata.
///
/// The record is written first. A reset before otadata follows is repaired
/// at the next boot by reconciling the record with the running slot.
pub(crate) struct EspBootRecordStore {
    flash: &'static FlashStorageMutex,
    records: FlashBootRecordStore<SharedFlashRegion>,
    last: Option<BootRecord>,
}

impl BootRecordStore for EspBootRecordStore {
    fn load(&mut self) -> Result<Option<BootRecord>, BootError> {
        let record = self.records.load()?;
        self.last.clone_from(&record);
        Ok(record)
    }

    fn store(&mut self, record: &BootRecord) -> Result<(), BootError> {
        self.records.store(record)?;

        let selected = with_ota(self.flash, |ota| {
            ota.set_current_app_partition(sub_type(record.active))
                .and_then(|()| ota.set_current_ota_state(OtaImageState::New))
                .map_err(|_| OtaError::InvalidState)
        });
        if let Err(e) = selected {
            println!("ota: failed to update otadata: {:?}", e);
            // Keep the record in line with what the bootloader will run
            if let Some(previous) = &self.last {
                self.records.store(previous).ok();
            }
            return Err(BootError::Persist);
        }

        self.last = Some(record.clone());
        Ok(())
    }
}

pub(crate) struct EspRestart;

impl Restart for EspRestart {
    fn restart(&mut self) {
        println!("ota: rebooting...");
        esp_hal::system::software_reset();
    }
}
