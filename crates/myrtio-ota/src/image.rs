//! Structural check of ESP application images.
//!
//! Layout: a 24 byte header, `segment_count` segments (8 byte header plus
//! data), zero padding up to the last byte of a 16 byte block, one XOR
//! checksum byte and, when header byte 23 is set, a SHA-256 digest of
//! everything before it.

use embedded_storage::nor_flash::ReadNorFlash;
use sha2::{Digest, Sha256};

pub const ESP_IMAGE_MAGIC: u8 = 0xE9;
pub const ESP_CHECKSUM_SEED: u8 = 0xEF;
pub const ESP_MAX_SEGMENTS: u8 = 16;

const HEADER_SIZE: usize = 24;
const SEGMENT_HEADER_SIZE: usize = 8;
const HASH_APPENDED_OFFSET: usize = 23;
const DIGEST_SIZE: usize = 32;

const READ_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    Read,
    InvalidMagic,
    InvalidSegmentCount,
    /// A segment or trailer runs past the declared size
    Truncated,
    Checksum,
    Digest,
    /// Bytes left after the trailer
    TrailingData,
}

/// Checks that a written partition holds a complete image.
pub trait ImageValidator {
    /// Validate the first `size` bytes of `flash`.
    fn validate<F: ReadNorFlash>(&self, flash: &mut F, size: usize) -> Result<(), ImageError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EspImageValidator;

impl EspImageValidator {
    pub const fn new() -> Self {
        Self
    }
}

impl ImageValidator for EspImageValidator {
    fn validate<F: ReadNorFlash>(&self, flash: &mut F, size: usize) -> Result<(), ImageError> {
        if size > flash.capacity() || READ_BUFFER_SIZE % F::READ_SIZE != 0 {
            return Err(ImageError::Read);
        }

        let mut reader = ImageReader::new(flash, size);

        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;
        if header[0] != ESP_IMAGE_MAGIC {
            return Err(ImageError::InvalidMagic);
        }
        let segment_count = header[1];
        if segment_count == 0 || segment_count > ESP_MAX_SEGMENTS {
            return Err(ImageError::InvalidSegmentCount);
        }
        let hash_appended = header[HASH_APPENDED_OFFSET] == 1;

        let mut checksum = ESP_CHECKSUM_SEED;
        for _ in 0..segment_count {
            let mut segment = [0u8; SEGMENT_HEADER_SIZE];
            reader.read_exact(&mut segment)?;
            let length = u32::from_le_bytes([segment[4], segment[5], segment[6], segment[7]]);
            let length = usize::try_from(length).map_err(|_| ImageError::Truncated)?;
            reader.consume(length, |bytes| {
                for byte in bytes {
                    checksum ^= byte;
                }
            })?;
        }

        // Checksum sits on the last byte of a 16 byte block
        let checksum_at = reader.position | 0xF;
        reader.consume(checksum_at - reader.position, |_| {})?;
        let mut stored = [0u8; 1];
        reader.read_exact(&mut stored)?;
        if stored[0] != checksum {
            log::warn!(
                "image: checksum mismatch, stored {:#04x}, computed {:#04x}",
                stored[0],
                checksum
            );
            return Err(ImageError::Checksum);
        }

        if hash_appended {
            let computed = reader.digest.clone().finalize();
            let mut expected = [0u8; DIGEST_SIZE];
            reader.read_exact(&mut expected)?;
            if computed.as_slice() != expected.as_slice() {
                log::warn!("image: SHA-256 digest mismatch");
                return Err(ImageError::Digest);
            }
        }

        if reader.position != size {
            log::warn!(
                "image: {} trailing bytes after the image",
                size - reader.position
            );
            return Err(ImageError::TrailingData);
        }

        Ok(())
    }
}

/// Sequential reader over aligned flash windows that hashes what it reads.
struct ImageReader<'f, F: ReadNorFlash> {
    flash: &'f mut F,
    buffer: [u8; READ_BUFFER_SIZE],
    window_start: usize,
    window_len: usize,
    position: usize,
    size: usize,
    digest: Sha256,
}

impl<'f, F: ReadNorFlash> ImageReader<'f, F> {
    fn new(flash: &'f mut F, size: usize) -> Self {
        Self {
            flash,
            buffer: [0xFF; READ_BUFFER_SIZE],
            window_start: 0,
            window_len: 0,
            position: 0,
            size,
            digest: Sha256::new(),
        }
    }

    fn refill(&mut self) -> Result<(), ImageError> {
        let start = self.position - self.position % READ_BUFFER_SIZE;
        let available = READ_BUFFER_SIZE.min(self.flash.capacity() - start);
        let len = available - available % F::READ_SIZE;
        if len == 0 {
            return Err(ImageError::Read);
        }

        let offset = u32::try_from(start).map_err(|_| ImageError::Read)?;
        self.flash
            .read(offset, &mut self.buffer[..len])
            .map_err(|_| ImageError::Read)?;
        self.window_start = start;
        self.window_len = len;
        Ok(())
    }

    /// Pass the next `len` bytes to `sink`, piece by piece.
    fn consume(&mut self, mut len: usize, mut sink: impl FnMut(&[u8])) -> Result<(), ImageError> {
        match self.position.checked_add(len) {
            Some(end) if end <= self.size => {}
            _ => return Err(ImageError::Truncated),
        }

        while len > 0 {
            let window_end = self.window_start + self.window_len;
            if self.position < self.window_start || self.position >= window_end {
                self.refill()?;
            }

            let offset = self.position - self.window_start;
            let n = len.min(self.window_len - offset);
            let bytes = &self.buffer[offset..offset + n];
            self.digest.update(bytes);
            sink(bytes);

            self.position += n;
            len -= n;
        }
        Ok(())
    }

    fn read_exact(&mut self, out: &mut [u8]) -> Result<(), ImageError> {
        let mut filled = 0;
        self.consume(out.len(), |bytes| {
            out[filled..filled + bytes.len()].copy_from_slice(bytes);
            filled += bytes.len();
        })
    }
}
