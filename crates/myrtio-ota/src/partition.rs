use embedded_storage::nor_flash::NorFlash;

use crate::{image::ImageValidator, session::SessionError};

/// One of the two application partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionId {
    Slot0,
    Slot1,
}

impl PartitionId {
    /// The partition that is not `self`.
    pub const fn other(self) -> Self {
        match self {
            PartitionId::Slot0 => PartitionId::Slot1,
            PartitionId::Slot1 => PartitionId::Slot0,
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            PartitionId::Slot0 => 0,
            PartitionId::Slot1 => 1,
        }
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PartitionId::Slot0),
            1 => Some(PartitionId::Slot1),
            _ => None,
        }
    }
}

/// Access to the application partitions of the device.
pub trait FirmwareStorage {
    /// Write handle scoped to one partition, offset 0 is its first byte
    type Flash: NorFlash;
    type Validator: ImageValidator;

    /// Open an exclusive write handle for `id`.
    fn open_partition(&mut self, id: PartitionId) -> Result<Self::Flash, SessionError>;

    /// Validator that matches the image format of this device.
    fn validator(&self) -> Self::Validator;
}
