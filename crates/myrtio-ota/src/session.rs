//! Flash write session: streams one image into the staging partition.
//!
//! `open` erases the target range, `write` appends chunks in
//! `WRITE_SIZE` aligned blocks, `finalize` flushes the padded tail and runs
//! the image validator. Every failure aborts the session, and an aborted
//! session erases the first sector so no image header survives.

use embedded_storage::nor_flash::NorFlash;

use crate::{
    image::{ImageError, ImageValidator},
    partition::PartitionId,
};

/// Largest flash write granularity the session can buffer.
pub const MAX_WRITE_ALIGN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opened,
    Writing,
    Finalizing,
    Committed,
    Aborted,
}

impl SessionState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, SessionState::Committed | SessionState::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// Declared size is zero
    EmptyImage,
    /// Declared size exceeds the partition capacity
    InsufficientSpace,
    /// Bytes written differ from the declared size
    SizeMismatch,
    /// Flash erase or write failed
    Write,
    /// Image failed the structural check
    Validation(ImageError),
    /// Operation not allowed in the current state
    InvalidState,
    /// Staging partition could not be opened
    Partition,
}

/// Proof that a partition holds a complete, validated image.
///
/// Only [`FlashWriteSession::finalize`] creates it.
#[derive(Debug, PartialEq, Eq)]
pub struct CommittedImage {
    partition: PartitionId,
    size: usize,
}

impl CommittedImage {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

pub struct FlashWriteSession<F: NorFlash, V: ImageValidator> {
    partition: PartitionId,
    flash: F,
    validator: V,
    state: SessionState,
    total_size: usize,
    bytes_written: usize,
    flushed: u32,
    tail: [u8; MAX_WRITE_ALIGN],
    tail_len: usize,
}

impl<F: NorFlash, V: ImageValidator> FlashWriteSession<F, V> {
    /// Start a session for an image of `total_size` bytes.
    ///
    /// Size checks run before the flash is touched.
    pub fn open(
        partition: PartitionId,
        mut flash: F,
        validator: V,
        total_size: usize,
    ) -> Result<Self, SessionError> {
        const { assert!(F::WRITE_SIZE <= MAX_WRITE_ALIGN) };

        if total_size == 0 {
            return Err(SessionError::EmptyImage);
        }
        let capacity = flash.capacity();
        if total_size > capacity {
            log::warn!(
                "ota: image of {} bytes does not fit partition {:?} ({} bytes)",
                total_size,
                partition,
                capacity
            );
            return Err(SessionError::InsufficientSpace);
        }

        let erase_size = total_size.div_ceil(F::ERASE_SIZE) * F::ERASE_SIZE;
        let erase_size = erase_size.min(capacity);
        let erase_end = u32::try_from(erase_size).map_err(|_| SessionError::InsufficientSpace)?;
        log::debug!("ota: erasing {} bytes of {:?}", erase_size, partition);
        flash
            .erase(0, erase_end)
            .map_err(|_| SessionError::Write)?;

        Ok(Self {
            partition,
            flash,
            validator,
            state: SessionState::Opened,
            total_size,
            bytes_written: 0,
            flushed: 0,
            tail: [0xFF; MAX_WRITE_ALIGN],
            tail_len: 0,
        })
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Bytes accepted so far, including the buffered tail.
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn progress_percent(&self) -> u8 {
        (self.bytes_written as u64 * 100 / self.total_size as u64) as u8
    }

    /// Append the next chunk of the image.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Opened | SessionState::Writing) {
            return Err(SessionError::InvalidState);
        }
        if chunk.is_empty() {
            return Ok(());
        }

        let next = match self.bytes_written.checked_add(chunk.len()) {
            Some(next) if next <= self.total_size => next,
            _ => {
                log::warn!(
                    "ota: chunk of {} bytes overruns the declared {} bytes",
                    chunk.len(),
                    self.total_size
                );
                self.abort();
                return Err(SessionError::SizeMismatch);
            }
        };

        self.state = SessionState::Writing;
        if let Err(e) = self.write_aligned(chunk) {
            log::warn!("ota: flash write failed at {}", self.flushed);
            self.abort();
            return Err(e);
        }
        self.bytes_written = next;
        Ok(())
    }

    /// Flush the tail and validate the image.
    pub fn finalize(&mut self) -> Result<CommittedImage, SessionError> {
        if !matches!(self.state, SessionState::Opened | SessionState::Writing) {
            return Err(SessionError::InvalidState);
        }
        if self.bytes_written != self.total_size {
            log::warn!(
                "ota: short image, {} of {} bytes",
                self.bytes_written,
                self.total_size
            );
            self.abort();
            return Err(SessionError::SizeMismatch);
        }

        self.state = SessionState::Finalizing;
        if self.tail_len > 0 {
            let align = F::WRITE_SIZE;
            if self.flash.write(self.flushed, &self.tail[..align]).is_err() {
                self.abort();
                return Err(SessionError::Write);
            }
            self.tail_len = 0;
        }

        if let Err(e) = self.validator.validate(&mut self.flash, self.total_size) {
            log::warn!("ota: image rejected: {:?}", e);
            self.abort();
            return Err(SessionError::Validation(e));
        }

        self.state = SessionState::Committed;
        Ok(CommittedImage {
            partition: self.partition,
            size: self.total_size,
        })
    }

    /// Release the session and invalidate the staging partition.
    ///
    /// Calling it again has no effect.
    pub fn abort(&mut self) {
        if self.state == SessionState::Aborted {
            return;
        }
        self.state = SessionState::Aborted;
        self.tail_len = 0;
        self.tail.fill(0xFF);

        let sector = F::ERASE_SIZE.min(self.flash.capacity());
        let erased = u32::try_from(sector)
            .ok()
            .and_then(|end| self.flash.erase(0, end).ok());
        if erased.is_none() {
            log::warn!("ota: failed to erase header of {:?}", self.partition);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_aligned(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let align = F::WRITE_SIZE;
        let mut idx = 0;

        // Complete partial word
        if self.tail_len > 0 {
            let take = (align - self.tail_len).min(data.len());
            self.tail[self.tail_len..self.tail_len + take].copy_from_slice(&data[..take]);
            self.tail_len += take;
            idx += take;

            if self.tail_len == align {
                self.flash
                    .write(self.flushed, &self.tail[..align])
                    .map_err(|_| SessionError::Write)?;
                self.flushed += align as u32;
                self.tail_len = 0;
                self.tail.fill(0xFF);
            }
        }

        // Write aligned bulk
        let rem = &data[idx..];
        let aligned_len = rem.len() - rem.len() % align;
        if aligned_len > 0 {
            self.flash
                .write(self.flushed, &rem[..aligned_len])
                .map_err(|_| SessionError::Write)?;
            self.flushed += aligned_len as u32;
        }

        // Keep trailing bytes
        let tail_bytes = &rem[aligned_len..];
        if !tail_bytes.is_empty() {
            self.tail[..tail_bytes.len()].copy_from_slice(tail_bytes);
            self.tail_len = tail_bytes.len();
        }

        Ok(())
    }
}

impl<F: NorFlash, V: ImageValidator> Drop for FlashWriteSession<F, V> {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            log::warn!("ota: session dropped while {:?}, aborting", self.state);
            self.abort();
        }
    }
}
