use core::fmt::Write;

use embedded_io_async::Read;

use super::{HttpError, Url};

pub type StatusCode = u16;

/// Caching directives sent with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Let intermediaries answer from cache
    Default,
    /// Force every intermediary to revalidate with the origin
    NoStore,
}

/// HTTP socket connection policy.
#[derive(Debug, Clone, Copy)]
enum ConnectionPolicy {
    Close,
}

impl ConnectionPolicy {
    fn as_str(self) -> &'static str {
        match self {
            ConnectionPolicy::Close => "close",
        }
    }
}

pub(super) trait TargetWriter {
    fn write_to(&self, writer: &mut impl Write) -> Result<(), core::fmt::Error>;
}

/// Request line and headers of a `GET` request.
pub struct RequestHeaders<'a> {
    url: &'a Url<'a>,
    cache: CachePolicy,
    connection: ConnectionPolicy,
}

impl<'a> RequestHeaders<'a> {
    pub const fn get(url: &'a Url<'a>) -> Self {
        Self {
            url,
            cache: CachePolicy::Default,
            connection: ConnectionPolicy::Close,
        }
    }

    /// Set the caching directives.
    #[must_use]
    pub const fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    /// Render the request into a writer.
    pub fn render(&self, writer: &mut impl Write) -> Result<(), HttpError> {
        self.write_to(writer).map_err(HttpError::from)
    }
}

impl TargetWriter for RequestHeaders<'_> {
    fn write_to(&self, writer: &mut impl Write) -> Result<(), core::fmt::Error> {
        write!(writer, "GET {} HTTP/1.1\r\n", self.url.path)?;
        if self.url.has_explicit_port() {
            write!(writer, "Host: {}:{}\r\n", self.url.host, self.url.port)?;
        } else {
            write!(writer, "Host: {}\r\n", self.url.host)?;
        }
        if self.cache == CachePolicy::NoStore {
            write!(writer, "Cache-Control: no-cache, no-store, must-revalidate\r\n")?;
            write!(writer, "Pragma: no-cache\r\n")?;
            write!(writer, "Expires: 0\r\n")?;
        }
        write!(writer, "Connection: {}\r\n", self.connection.as_str())?;
        write!(writer, "\r\n")?;
        Ok(())
    }
}

/// Parse the status line from the header string.
///
/// Returns the status code and the rest of the header string.
pub(super) fn parse_status_line(header_str: &str) -> Option<(StatusCode, &str)> {
    let line_end = header_str.find("\r\n").unwrap_or(header_str.len());
    let first_line = &header_str[..line_end];
    let mut parts = first_line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    let code = parts.next()?.parse::<StatusCode>().ok()?;
    let rest = header_str.get(line_end + 2..).unwrap_or("");

    Some((code, rest))
}

/// Read the status line and headers from the transport.
///
/// Returns the position of the end of the headers and the number of bytes
/// read, which may include the start of the body.
pub(super) async fn read_heading<R: Read>(
    buf: &mut [u8],
    transport: &mut R,
) -> Result<(usize, usize), HttpError> {
    let mut header_len = 0;
    loop {
        if header_len >= buf.len() {
            return Err(HttpError::HeadersTooLarge);
        }
        let n = transport
            .read(&mut buf[header_len..])
            .await
            .map_err(|_| HttpError::Closed)?;
        if n == 0 {
            return Err(HttpError::Closed);
        }
        // Resume the search a few bytes back in case the marker was split
        let search_from = header_len.saturating_sub(3);
        header_len += n;
        if let Some(pos) = buf[search_from..header_len]
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
        {
            return Ok((search_from + pos + 4, header_len));
        }
    }
}

/// Find a header value by case-insensitive name.
fn find_header<'h>(header: &'h str, name: &str) -> Option<&'h str> {
    header.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then_some(value.trim())
    })
}

/// Find the content length in the header string.
pub(super) fn find_content_length(header: &str) -> Option<u32> {
    let length = find_header(header, "content-length")?.parse::<u64>().ok()?;
    u32::try_from(length).ok()
}

/// Whether the body uses chunked transfer coding.
pub(super) fn is_chunked(header: &str) -> bool {
    find_header(header, "transfer-encoding").is_some_and(|value| {
        value
            .split(',')
            .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
    })
}
