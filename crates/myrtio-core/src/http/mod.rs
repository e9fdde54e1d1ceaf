//! Minimal HTTP/1.1 client for pulling small documents and firmware images.
//!
//! The client is transport agnostic: a [`Connector`] opens any
//! `embedded_io_async` stream (plain TCP on the device, scripted streams in
//! tests). Only `GET` with `Connection: close` is supported.

mod client;
mod headers;
mod url;

use embedded_io_async::{Read, Write};

pub use client::{HEADER_BUFFER_SIZE, HttpResponse, get};
pub use headers::{CachePolicy, RequestHeaders, StatusCode};
pub use url::{Scheme, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpError {
    /// Host name could not be resolved
    Resolve,
    /// Connection could not be established
    Connect,
    /// Transport failed or closed mid-exchange (includes timeouts)
    Closed,
    /// Response head is not valid HTTP
    Parse,
    HeadersTooLarge,
    FormatHeaders,
    InvalidUrl,
    UnsupportedScheme,
    /// Server answered with a non-success status code
    Status(StatusCode),
}

impl From<core::fmt::Error> for HttpError {
    fn from(_error: core::fmt::Error) -> Self {
        HttpError::FormatHeaders
    }
}

/// Opens byte streams to remote hosts.
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Connection<'a>: Read + Write
    where
        Self: 'a;

    async fn connect(&mut self, url: &Url<'_>) -> Result<Self::Connection<'_>, HttpError>;
}
