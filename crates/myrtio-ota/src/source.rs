//! Remote version and artifact sources.

use myrtio_core::http::{self, Connector, HttpError, HttpResponse, StatusCode, Url};

use crate::version::{VersionDescriptor, VersionError};

/// Upper bound for the version document body.
pub const VERSION_BODY_LIMIT: usize = 128;

/// Largest chunk handed out by [`HttpArtifactStream`].
pub const ARTIFACT_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchError {
    /// Network unreachable, connection lost or timed out
    Transport,
    /// Server answered with a non-success status
    Protocol(StatusCode),
    /// Response is not valid HTTP
    Malformed,
    InvalidVersion(VersionError),
    InvalidUrl,
}

impl From<HttpError> for FetchError {
    fn from(error: HttpError) -> Self {
        match error {
            HttpError::Resolve | HttpError::Connect | HttpError::Closed => FetchError::Transport,
            HttpError::Status(code) => FetchError::Protocol(code),
            HttpError::Parse | HttpError::HeadersTooLarge | HttpError::FormatHeaders => {
                FetchError::Malformed
            }
            HttpError::InvalidUrl | HttpError::UnsupportedScheme => FetchError::InvalidUrl,
        }
    }
}

/// Remote version descriptor.
#[allow(async_fn_in_trait)]
pub trait VersionSource {
    async fn fetch_version(&mut self) -> Result<VersionDescriptor, FetchError>;
}

/// Forward-only firmware byte stream.
#[allow(async_fn_in_trait)]
pub trait ArtifactStream {
    /// Length announced by the server.
    fn declared_length(&self) -> Option<usize>;

    /// Next chunk, `None` once the stream is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<&[u8]>, FetchError>;
}

/// Opens firmware streams.
#[allow(async_fn_in_trait)]
pub trait ArtifactSource {
    type Stream<'a>: ArtifactStream
    where
        Self: 'a;

    async fn open(&mut self, url: &str) -> Result<Self::Stream<'_>, FetchError>;
}

pub struct HttpVersionClient<'u, C: Connector> {
    connector: C,
    url: &'u str,
}

impl<'u, C: Connector> HttpVersionClient<'u, C> {
    pub fn new(connector: C, url: &'u str) -> Self {
        Self { connector, url }
    }
}

impl<C: Connector> VersionSource for HttpVersionClient<'_, C> {
    async fn fetch_version(&mut self) -> Result<VersionDescriptor, FetchError> {
        let url = Url::parse(self.url)?;
        let mut response = http::get(&mut self.connector, &url).await?;

        if response.is_chunked() {
            log::warn!("ota: version reply uses chunked coding");
            return Err(FetchError::Malformed);
        }
        let too_long = FetchError::InvalidVersion(VersionError::TooLong);
        if response
            .content_length()
            .is_some_and(|length| length as usize > VERSION_BODY_LIMIT)
        {
            return Err(too_long);
        }

        let mut body = [0u8; VERSION_BODY_LIMIT];
        let len = response.read_to_end(&mut body).await?;
        if len == VERSION_BODY_LIMIT {
            // The whole document must fit, never parse a prefix
            let mut extra = [0u8; 1];
            if response.read_body(&mut extra).await? > 0 {
                return Err(too_long);
            }
        }
        VersionDescriptor::parse(&body[..len]).map_err(FetchError::InvalidVersion)
    }
}

pub struct HttpArtifactClient<C: Connector> {
    connector: C,
}

impl<C: Connector> HttpArtifactClient<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }
}

impl<C: Connector> ArtifactSource for HttpArtifactClient<C> {
    type Stream<'a>
        = HttpArtifactStream<C::Connection<'a>>
    where
        Self: 'a;

    async fn open(&mut self, url: &str) -> Result<Self::Stream<'_>, FetchError> {
        let url = Url::parse(url)?;
        let response = http::get(&mut self.connector, &url).await?;

        Ok(HttpArtifactStream {
            response,
            buffer: [0; ARTIFACT_CHUNK_SIZE],
        })
    }
}

/// Body of an artifact response, read in fixed size pieces.
pub struct HttpArtifactStream<T> {
    response: HttpResponse<T>,
    buffer: [u8; ARTIFACT_CHUNK_SIZE],
}

impl<T: embedded_io_async::Read> ArtifactStream for HttpArtifactStream<T> {
    fn declared_length(&self) -> Option<usize> {
        self.response
            .content_length()
            .and_then(|length| usize::try_from(length).ok())
    }

    async fn next_chunk(&mut self) -> Result<Option<&[u8]>, FetchError> {
        let n = self.response.read_body(&mut self.buffer).await?;
        if n == 0 {
            if let Some(length) = self.response.content_length()
                && self.response.received() < length
            {
                log::warn!(
                    "ota: artifact ended after {} of {} bytes",
                    self.response.received(),
                    length
                );
            }
            return Ok(None);
        }
        Ok(Some(&self.buffer[..n]))
    }
}
