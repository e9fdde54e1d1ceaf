mod flash_storage;
mod network;

pub(crate) use flash_storage::{FlashStorageMutex, SharedFlashRegion, init_flash_storage_mutex};
pub(crate) use network::init_network_stack;
