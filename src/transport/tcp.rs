//! TCP transport implementation for the message hub connection

use crate::transport::traits::{TransportConnector, TransportStream};
use anyhow::Result;
use async_trait::async_trait;
use remote_agent_shared::intervals::DEFAULT_HUB_PORT;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Turn a configured hub host into a connectable `host:port`
pub fn hub_address(host: &str) -> String {
    let trimmed = host.trim();
    // A dangling ':' means no port; a bare IPv6 literal keeps its own colons
    let host = match trimmed.strip_suffix(':') {
        Some(rest) if rest.starts_with('[') || !rest.contains(':') => rest,
        _ => trimmed,
    };
    let has_port = match host.rsplit_once(':') {
        Some((_, port)) => !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()),
        None => false,
    };
    let bare_ipv6 = host.matches(':').count() > 1 && !host.starts_with('[');

    if has_port && !bare_ipv6 {
        host.to_string()
    } else if bare_ipv6 {
        format!("[{}]:{}", host, DEFAULT_HUB_PORT)
    } else {
        format!("{}:{}", host, DEFAULT_HUB_PORT)
    }
}

/// TCP stream wrapper implementing TransportStream
pub struct TcpTransportStream {
    inner: TcpStream,
}

impl TcpTransportStream {
    pub fn new(stream: TcpStream) -> Self {
        Self { inner: stream }
    }
}

impl AsyncRead for TcpTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl TransportStream for TcpTransportStream {
    async fn shutdown(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}

/// TCP connector for a message hub address
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    /// Create a connector for the given hub host (port defaulted when absent)
    pub fn new(host: &str) -> Self {
        Self {
            address: hub_address(host),
        }
    }

    /// Address this connector dials
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    type Stream = TcpTransportStream;

    async fn connect(&self) -> Result<Self::Stream> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        Ok(TcpTransportStream::new(stream))
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_address_defaults_port() {
        assert_eq!(hub_address("hub.example.com"), "hub.example.com:8080");
        assert_eq!(hub_address("hub.example.com:9000"), "hub.example.com:9000");
        assert_eq!(hub_address("10.0.0.5"), "10.0.0.5:8080");
    }

    #[test]
    fn test_hub_address_trailing_colon() {
        assert_eq!(hub_address("hub.example.com:"), "hub.example.com:8080");
        assert_eq!(hub_address(" 10.0.0.5: "), "10.0.0.5:8080");
        assert_eq!(hub_address("[::1]:"), "[::1]:8080");
        assert_eq!(hub_address("fe80::"), "[fe80::]:8080");
    }

    #[test]
    fn test_hub_address_ipv6() {
        assert_eq!(hub_address("::1"), "[::1]:8080");
        assert_eq!(hub_address("[::1]:9000"), "[::1]:9000");
        assert_eq!(hub_address("[::1]"), "[::1]:8080");
    }

    #[test]
    fn test_connector_name() {
        let connector = TcpConnector::new("127.0.0.1:9000");
        assert_eq!(connector.name(), "TCP");
        assert_eq!(connector.address(), "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to find a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = TcpConnector::new(&addr.to_string());
        assert!(connector.connect().await.is_err());
    }
}
