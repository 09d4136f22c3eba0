use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Debug, Clone, Default)]
pub struct ServerTlsOptions {
    pub enabled: bool,
    /// PEM files; both empty means a self-signed certificate is generated.
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct ClientTlsOptions {
    pub enabled: bool,
    /// SNI / verification name. Defaults to the host of the server address.
    pub server_name: String,
    pub insecure_skip_verify: bool,
    pub ca_file: String,
}

/// Wraps an accepted or dialed control connection.
///
/// Only the control channel goes through this; relay and public connections
/// stay raw TCP.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn wrap(&self, tcp: TcpStream) -> anyhow::Result<BoxedStream>;
}

pub fn default_alpn() -> Vec<Vec<u8>> {
    vec![b"lanbridge".to_vec()]
}

pub mod tcp;
pub mod tls;

pub fn server_transport(opts: &ServerTlsOptions) -> anyhow::Result<Arc<dyn ControlTransport>> {
    if !opts.enabled {
        return Ok(Arc::new(tcp::PlainTransport::new()));
    }
    Ok(Arc::new(tls::TlsServerTransport::new(opts)?))
}

pub fn client_transport(
    opts: &ClientTlsOptions,
    server_addr: &str,
) -> anyhow::Result<Arc<dyn ControlTransport>> {
    if !opts.enabled {
        return Ok(Arc::new(tcp::PlainTransport::new()));
    }
    Ok(Arc::new(tls::TlsClientTransport::new(opts, server_addr)?))
}
