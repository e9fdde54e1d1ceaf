//! Persisted boot selection.
//!
//! The [`BootRecord`] names the partition to run and the version it holds.
//! Only [`BootSelector`] writes it, and only for an image that passed
//! [`FlashWriteSession::finalize`](crate::session::FlashWriteSession::finalize).

use embedded_storage::nor_flash::NorFlash;
use myrtio_core::storage::{Encodable, PersistentStorage, StorageError};

use crate::{
    partition::PartitionId,
    session::CommittedImage,
    version::{VERSION_MAX_LEN, VersionDescriptor},
};

/// active | version len | version | previous | previous len | previous version
pub const BOOT_RECORD_SIZE: usize = 2 * (2 + VERSION_MAX_LEN);

const NO_PARTITION: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// Persistent store could not be written
    Persist,
    /// Target is the partition that is running
    ActivePartition,
    /// Nothing to roll back to
    NoPrevious,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootRecord {
    pub active: PartitionId,
    pub version: VersionDescriptor,
    pub previous: Option<(PartitionId, VersionDescriptor)>,
}

impl BootRecord {
    pub fn new(active: PartitionId, version: VersionDescriptor) -> Self {
        Self {
            active,
            version,
            previous: None,
        }
    }
}

fn encode_version(out: &mut [u8], version: &VersionDescriptor) {
    let bytes = version.as_bytes();
    #[allow(clippy::cast_possible_truncation)]
    let len = bytes.len() as u8;
    out[0] = len;
    out[1..=bytes.len()].copy_from_slice(bytes);
}

fn decode_version(data: &[u8]) -> Option<VersionDescriptor> {
    let len = usize::from(data[0]);
    if len > VERSION_MAX_LEN {
        return None;
    }
    VersionDescriptor::parse(&data[1..=len]).ok()
}

impl Encodable<BOOT_RECORD_SIZE> for BootRecord {
    fn encode(&self) -> [u8; BOOT_RECORD_SIZE] {
        let mut data = [0u8; BOOT_RECORD_SIZE];
        let half = BOOT_RECORD_SIZE / 2;

        data[0] = self.active.as_u8();
        encode_version(&mut data[1..half], &self.version);

        match &self.previous {
            Some((partition, version)) => {
                data[half] = partition.as_u8();
                encode_version(&mut data[half + 1..], version);
            }
            None => data[half] = NO_PARTITION,
        }
        data
    }

    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < BOOT_RECORD_SIZE {
            return None;
        }
        let half = BOOT_RECORD_SIZE / 2;

        let active = PartitionId::from_u8(data[0])?;
        let version = decode_version(&data[1..half])?;
        let previous = match data[half] {
            NO_PARTITION => None,
            raw => Some((
                PartitionId::from_u8(raw)?,
                decode_version(&data[half + 1..BOOT_RECORD_SIZE])?,
            )),
        };

        Some(Self {
            active,
            version,
            previous,
        })
    }
}

/// Persistent home of the [`BootRecord`].
///
/// `store` must be atomic: after a power loss either the old or the new
/// record is read back.
pub trait BootRecordStore {
    /// Read the stored record, `None` when nothing valid was ever written.
    fn load(&mut self) -> Result<Option<BootRecord>, BootError>;

    fn store(&mut self, record: &BootRecord) -> Result<(), BootError>;
}

/// [`BootRecordStore`] on a double-buffered flash region.
pub struct FlashBootRecordStore<F: NorFlash> {
    storage: PersistentStorage<F>,
}

impl<F: NorFlash> FlashBootRecordStore<F> {
    pub fn new(flash: F, offset: u32) -> Result<Self, StorageError> {
        Ok(Self {
            storage: PersistentStorage::new(flash, offset)?,
        })
    }
}

impl<F: NorFlash> BootRecordStore for FlashBootRecordStore<F> {
    fn load(&mut self) -> Result<Option<BootRecord>, BootError> {
        match self.storage.load::<BOOT_RECORD_SIZE, BootRecord>() {
            Ok(record) => Ok(Some(record)),
            Err(StorageError::InvalidMagicHeader) => Ok(None),
            Err(StorageError::InvalidData) => {
                log::warn!("boot: stored record is unreadable, ignoring it");
                Ok(None)
            }
            Err(_) => Err(BootError::Persist),
        }
    }

    fn store(&mut self, record: &BootRecord) -> Result<(), BootError> {
        self.storage
            .save::<BOOT_RECORD_SIZE, BootRecord>(record)
            .map_err(|_| BootError::Persist)
    }
}

/// Owner of the boot selection.
pub struct BootSelector<S: BootRecordStore> {
    store: S,
    record: BootRecord,
    /// `record` is known to be on flash
    persisted: bool,
}

impl<S: BootRecordStore> BootSelector<S> {
    /// Load the stored record, using `fallback` when there is none.
    pub fn new(mut store: S, fallback: BootRecord) -> Self {
        let (record, persisted) = match store.load() {
            Ok(Some(record)) => (record, true),
            Ok(None) => (fallback, false),
            Err(e) => {
                log::warn!("boot: failed to load record: {:?}", e);
                (fallback, false)
            }
        };

        Self {
            store,
            record,
            persisted,
        }
    }

    /// Partition the device runs from.
    pub fn current(&self) -> PartitionId {
        self.record.active
    }

    /// Version of the image in the active partition.
    pub fn version(&self) -> &VersionDescriptor {
        &self.record.version
    }

    /// Partition updates are written to.
    pub fn staging(&self) -> PartitionId {
        self.record.active.other()
    }

    pub fn record(&self) -> &BootRecord {
        &self.record
    }

    /// Select a committed image for the next boot.
    ///
    /// On failure the selection in memory and on flash is unchanged.
    pub fn mark_bootable(
        &mut self,
        image: CommittedImage,
        version: VersionDescriptor,
    ) -> Result<(), BootError> {
        if image.partition() == self.record.active {
            return Err(BootError::ActivePartition);
        }

        let next = BootRecord {
            active: image.partition(),
            version,
            previous: Some((self.record.active, self.record.version.clone())),
        };
        self.commit(next)?;
        log::info!(
            "boot: {:?} selected with version {}",
            self.record.active,
            self.record.version
        );
        Ok(())
    }

    /// Revert the selection to the previously active partition.
    pub fn rollback(&mut self) -> Result<(), BootError> {
        let Some((partition, version)) = self.record.previous.clone() else {
            return Err(BootError::NoPrevious);
        };

        let next = BootRecord {
            active: partition,
            version,
            previous: Some((self.record.active, self.record.version.clone())),
        };
        self.commit(next)?;
        log::info!("boot: rolled back to {:?}", self.record.active);
        Ok(())
    }

    /// Align the record with the image that actually booted.
    ///
    /// Returns whether the record had to be written.
    pub fn reconcile(
        &mut self,
        running: PartitionId,
        version: VersionDescriptor,
    ) -> Result<bool, BootError> {
        if self.record.active == running && self.record.version == version {
            if self.persisted {
                return Ok(false);
            }
            self.commit(self.record.clone())?;
            return Ok(true);
        }

        let previous = if self.record.active == running {
            self.record.previous.clone()
        } else {
            None
        };
        log::warn!(
            "boot: record names {:?} ({}), running {:?} ({})",
            self.record.active,
            self.record.version,
            running,
            version
        );
        self.commit(BootRecord {
            active: running,
            version,
            previous,
        })?;
        Ok(true)
    }

    fn commit(&mut self, next: BootRecord) -> Result<(), BootError> {
        if let Err(e) = self.store.store(&next) {
            log::error!("boot: failed to persist record: {:?}", e);
            return Err(e);
        }
        self.record = next;
        self.persisted = true;
        Ok(())
    }
}
