//! Socket plumbing: plain TCP, implicit TLS, and STARTTLS upgrades.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::types::error::{MailError, Result};

/// A mail server connection, plain or encrypted.
pub enum MailStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl MailStream {
    /// Upgrade a plain connection to TLS in place (STARTTLS). Fails on an
    /// already-encrypted stream.
    pub async fn upgrade_to_tls(self, host: &str, handshake_timeout: Duration) -> Result<Self> {
        match self {
            MailStream::Plain(tcp) => {
                let tls = wrap_tls(host, tcp, handshake_timeout).await?;
                Ok(MailStream::Tls(Box::new(tls)))
            }
            MailStream::Tls(_) => Err(MailError::Internal(
                "connection is already encrypted".to_string(),
            )),
        }
    }
}

impl AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MailStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MailStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MailStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MailStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Open a TCP connection with a timeout.
pub async fn connect_plain(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    debug!("Connecting to {}", addr);
    let stream = timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| MailError::Network(format!("connection timeout to {}", addr)))?
        .map_err(|e| MailError::Network(format!("connect to {} failed: {}", addr, e)))?;
    Ok(stream)
}

/// Perform a TLS handshake over an established TCP stream.
pub async fn wrap_tls(
    host: &str,
    tcp: TcpStream,
    handshake_timeout: Duration,
) -> Result<TlsStream<TcpStream>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| MailError::Network(format!("invalid server name: {}", host)))?;

    let tls = timeout(handshake_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| MailError::Network(format!("TLS handshake timeout to {}", host)))?
        .map_err(|e| MailError::Network(format!("TLS handshake with {} failed: {}", host, e)))?;
    Ok(tls)
}
