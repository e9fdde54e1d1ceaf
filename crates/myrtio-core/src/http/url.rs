use super::HttpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub const fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Borrowed absolute URL, `scheme://host[:port][/path]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Url<'a> {
    pub scheme: Scheme,
    pub host: &'a str,
    pub port: u16,
    pub path: &'a str,
}

impl<'a> Url<'a> {
    pub fn parse(raw: &'a str) -> Result<Self, HttpError> {
        let raw = raw.trim();
        let (scheme, rest) = if let Some(rest) = raw.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else if let Some(rest) = raw.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else {
            return Err(HttpError::InvalidUrl);
        };

        let (authority, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, "/"),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| HttpError::InvalidUrl)?;
                (host, port)
            }
            None => (authority, scheme.default_port()),
        };

        if host.is_empty() || host.contains(|c: char| c.is_whitespace() || c == '@') {
            return Err(HttpError::InvalidUrl);
        }

        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }

    /// Whether the port differs from the scheme default
    pub fn has_explicit_port(&self) -> bool {
        self.port != self.scheme.default_port()
    }
}
