use embassy_net::{IpAddress, Stack, dns::DnsQueryType, tcp::TcpSocket};
use embassy_time::{Duration, Timer};

use crate::http::{Connector, HttpError, Scheme, Url};

/// Wait for the network link to become active
pub async fn wait_for_link(stack: Stack<'_>) {
    loop {
        if stack.is_link_up() {
            break;
        }
        Timer::after(Duration::from_millis(100)).await;
    }
}

/// Wait for the network stack to obtain an IPv4 address via DHCP
/// Returns the obtained IPv4 configuration
pub async fn wait_for_ip(stack: Stack<'_>) -> embassy_net::StaticConfigV4 {
    loop {
        if let Some(config) = stack.config_v4() {
            return config;
        }
        Timer::after(Duration::from_millis(100)).await;
    }
}

/// Wait for full network connectivity (link + IP address)
/// Returns the obtained IPv4 configuration
pub async fn wait_for_connection(stack: Stack<'_>) -> embassy_net::StaticConfigV4 {
    wait_for_link(stack).await;
    wait_for_ip(stack).await
}

/// Resolves a hostname to an IP address
pub async fn resolve_host(stack: Stack<'_>, host: &str) -> Result<IpAddress, HttpError> {
    if let Ok(ip) = host.parse::<embassy_net::Ipv4Address>() {
        return Ok(IpAddress::Ipv4(ip));
    }

    let addresses = stack
        .dns_query(host, DnsQueryType::A)
        .await
        .map_err(|_| HttpError::Resolve)?;

    addresses.first().copied().ok_or(HttpError::Resolve)
}

/// Plain TCP [`Connector`] backed by an embassy-net stack.
///
/// Owns the socket buffers, so only one connection can be open at a time.
/// The socket timeout bounds every read and write of the exchange.
pub struct TcpConnector<'s, const RX: usize, const TX: usize> {
    stack: Stack<'s>,
    timeout: Duration,
    rx_buffer: [u8; RX],
    tx_buffer: [u8; TX],
}

impl<'s, const RX: usize, const TX: usize> TcpConnector<'s, RX, TX> {
    pub const fn new(stack: Stack<'s>, timeout: Duration) -> Self {
        Self {
            stack,
            timeout,
            rx_buffer: [0; RX],
            tx_buffer: [0; TX],
        }
    }
}

impl<const RX: usize, const TX: usize> Connector for TcpConnector<'_, RX, TX> {
    type Connection<'a>
        = TcpSocket<'a>
    where
        Self: 'a;

    async fn connect(&mut self, url: &Url<'_>) -> Result<TcpSocket<'_>, HttpError> {
        // TLS is terminated by a separate connector
        if url.scheme != Scheme::Http {
            return Err(HttpError::UnsupportedScheme);
        }

        let addr = resolve_host(self.stack, url.host).await?;
        let mut socket = TcpSocket::new(self.stack, &mut self.rx_buffer, &mut self.tx_buffer);
        socket.set_timeout(Some(self.timeout));
        socket.connect((addr, url.port)).await.map_err(|e| {
            log::warn!("net: connect to {}:{} failed: {:?}", url.host, url.port, e);
            HttpError::Connect
        })?;

        Ok(socket)
    }
}
