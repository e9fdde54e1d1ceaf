use heapless::String;

/// Longest accepted version token.
pub const VERSION_MAX_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionError {
    NotUtf8,
    Empty,
    TooLong,
    /// Contains whitespace or non-printable characters
    InvalidCharacter,
}

/// Opaque firmware build identifier.
///
/// Tokens are only ever compared for equality, never ordered: the remote
/// value is free-form text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDescriptor(String<VERSION_MAX_LEN>);

impl VersionDescriptor {
    /// Parse a raw token, trimming incidental whitespace.
    pub fn parse(raw: &[u8]) -> Result<Self, VersionError> {
        let text = core::str::from_utf8(raw).map_err(|_| VersionError::NotUtf8)?;
        Self::from_str_trimmed(text)
    }

    pub fn from_str_trimmed(text: &str) -> Result<Self, VersionError> {
        let token = text.trim();
        if token.is_empty() {
            return Err(VersionError::Empty);
        }
        if !token.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(VersionError::InvalidCharacter);
        }

        let mut value = String::new();
        value.push_str(token).map_err(|()| VersionError::TooLong)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl core::fmt::Display for VersionDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
