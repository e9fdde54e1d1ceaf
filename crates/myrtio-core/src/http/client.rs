use embedded_io_async::{Read, Write};
use heapless::String;

use super::{
    CachePolicy,
    Connector,
    HttpError,
    RequestHeaders,
    StatusCode,
    Url,
    headers::{find_content_length, is_chunked, parse_status_line, read_heading},
};

/// Room for the status line and headers of a reply relayed by a caching proxy.
pub const HEADER_BUFFER_SIZE: usize = 2048;
const REQUEST_BUFFER_SIZE: usize = 384;

/// Response of a `GET` request with the body left unread on the transport.
pub struct HttpResponse<T> {
    transport: T,
    status: StatusCode,
    content_length: Option<u32>,
    chunked: bool,
    head: [u8; HEADER_BUFFER_SIZE],
    head_len: usize,
    body_start: usize,
    received: u32,
}

impl<T: Read> HttpResponse<T> {
    /// Read the status line and headers from the transport.
    pub async fn read_head(mut transport: T) -> Result<Self, HttpError> {
        let mut head = [0u8; HEADER_BUFFER_SIZE];
        let (header_end, head_len) = read_heading(&mut head, &mut transport).await?;

        // Only parse the headers portion, the tail may be binary body data
        let header_str = core::str::from_utf8(&head[..header_end]).map_err(|_| HttpError::Parse)?;
        let (status, rest) = parse_status_line(header_str).ok_or(HttpError::Parse)?;
        let chunked = is_chunked(rest);
        let content_length = if chunked {
            None
        } else {
            find_content_length(rest)
        };

        log::debug!(
            "http: status {}, content_length={:?}, {} body bytes buffered",
            status,
            content_length,
            head_len - header_end
        );

        Ok(Self {
            transport,
            status,
            content_length,
            chunked,
            head,
            head_len,
            body_start: header_end,
            received: 0,
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Declared body length, `None` when the server did not announce one.
    pub fn content_length(&self) -> Option<u32> {
        self.content_length
    }

    /// Whether the body uses chunked transfer coding, which is not decoded.
    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Body bytes handed out so far.
    pub fn received(&self) -> u32 {
        self.received
    }

    /// Read the next piece of the body into `buf`.
    ///
    /// Returns `Ok(0)` once the declared length is reached or the peer
    /// closed the stream. Never reads past the declared length.
    pub async fn read_body(&mut self, buf: &mut [u8]) -> Result<usize, HttpError> {
        let remaining = match self.content_length {
            Some(length) => length.saturating_sub(self.received) as usize,
            None => usize::MAX,
        };
        let limit = buf.len().min(remaining);
        if limit == 0 {
            return Ok(0);
        }

        let n = if self.body_start < self.head_len {
            let n = limit.min(self.head_len - self.body_start);
            buf[..n].copy_from_slice(&self.head[self.body_start..self.body_start + n]);
            self.body_start += n;
            n
        } else {
            self.transport
                .read(&mut buf[..limit])
                .await
                .map_err(|_| HttpError::Closed)?
        };

        self.received = self
            .received
            .saturating_add(u32::try_from(n).unwrap_or(u32::MAX));
        Ok(n)
    }

    /// Read the body until `buf` is full or the body ends.
    pub async fn read_to_end(&mut self, buf: &mut [u8]) -> Result<usize, HttpError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_body(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

/// Send an uncached `GET` and read the response head.
///
/// Any status other than `200` is returned as [`HttpError::Status`].
pub async fn get<'c, C: Connector>(
    connector: &'c mut C,
    url: &Url<'_>,
) -> Result<HttpResponse<C::Connection<'c>>, HttpError> {
    let mut request: String<REQUEST_BUFFER_SIZE> = String::new();
    RequestHeaders::get(url)
        .with_cache(CachePolicy::NoStore)
        .render(&mut request)?;

    let mut connection = connector.connect(url).await?;
    connection
        .write_all(request.as_bytes())
        .await
        .map_err(|_| HttpError::Closed)?;
    connection.flush().await.map_err(|_| HttpError::Closed)?;

    let response = HttpResponse::read_head(connection).await?;
    if response.status() != 200 {
        log::warn!("http: {} answered {}", url.host, response.status());
        return Err(HttpError::Status(response.status()));
    }

    Ok(response)
}
