use crate::{boot::BootError, session::SessionError, source::FetchError};

/// Why an update cycle ended without installing an image.
///
/// None of these leave the device worse off: the active partition and the
/// boot record are untouched whenever a cycle fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateError {
    /// Version or artifact could not be fetched
    Fetch(FetchError),
    /// Artifact response did not announce a usable length
    MissingLength,
    Session(SessionError),
    Boot(BootError),
}

impl From<FetchError> for UpdateError {
    fn from(error: FetchError) -> Self {
        UpdateError::Fetch(error)
    }
}

impl From<SessionError> for UpdateError {
    fn from(error: SessionError) -> Self {
        UpdateError::Session(error)
    }
}

impl From<BootError> for UpdateError {
    fn from(error: BootError) -> Self {
        UpdateError::Boot(error)
    }
}
