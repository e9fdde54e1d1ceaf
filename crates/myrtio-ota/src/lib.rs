#![no_std]

//! Unattended A/B firmware updates.
//!
//! The [`UpdateOrchestrator`] polls a [`VersionSource`], streams a new image
//! from an [`ArtifactSource`] into the staging partition through a
//! [`FlashWriteSession`], and selects it for boot with the [`BootSelector`]
//! only once the image is complete and valid.

pub mod boot;
pub mod error;
pub mod image;
pub mod orchestrator;
pub mod partition;
pub mod session;
pub mod source;
pub mod version;

pub use boot::{BootError, BootRecord, BootRecordStore, BootSelector, FlashBootRecordStore};
pub use error::UpdateError;
pub use image::{EspImageValidator, ImageError, ImageValidator};
pub use orchestrator::{CycleOutcome, OrchestratorState, Restart, UpdateConfig, UpdateOrchestrator};
pub use partition::{FirmwareStorage, PartitionId};
pub use session::{CommittedImage, FlashWriteSession, SessionError, SessionState};
pub use source::{
    ArtifactSource,
    ArtifactStream,
    FetchError,
    HttpArtifactClient,
    HttpVersionClient,
    VersionSource,
};
pub use version::{VersionDescriptor, VersionError};
