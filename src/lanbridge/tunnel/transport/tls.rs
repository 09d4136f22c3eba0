use std::{fs, path::Path, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use rcgen::generate_simple_self_signed;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::lanbridge::{
    net,
    tunnel::transport::{
        BoxedStream, ClientTlsOptions, ControlTransport, ServerTlsOptions, default_alpn,
    },
};

pub struct TlsServerTransport {
    acceptor: TlsAcceptor,
}

impl TlsServerTransport {
    pub fn new(opts: &ServerTlsOptions) -> anyhow::Result<Self> {
        let (certs, key) = load_or_generate_cert(&opts.cert_file, &opts.key_file)?;
        let mut cfg = rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        cfg.alpn_protocols = default_alpn();
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(cfg)),
        })
    }
}

#[async_trait]
impl ControlTransport for TlsServerTransport {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn wrap(&self, tcp: TcpStream) -> anyhow::Result<BoxedStream> {
        let s = self.acceptor.accept(tcp).await.context("tls accept")?;
        Ok(Box::new(s))
    }
}

pub struct TlsClientTransport {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsClientTransport {
    pub fn new(opts: &ClientTlsOptions, server_addr: &str) -> anyhow::Result<Self> {
        let mut cfg = if opts.insecure_skip_verify {
            rustls::ClientConfig::builder_with_provider(crypto_provider())
                .with_safe_default_protocol_versions()?
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new())
                .with_no_client_auth()
        } else {
            let ca_file = opts.ca_file.trim();
            if ca_file.is_empty() {
                anyhow::bail!("tls: ca_file is required unless insecure_skip_verify is set");
            }
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certs(Path::new(ca_file))? {
                roots.add(cert)?;
            }
            rustls::ClientConfig::builder_with_provider(crypto_provider())
                .with_safe_default_protocol_versions()?
                .with_root_certificates(roots)
                .with_no_client_auth()
        };
        cfg.alpn_protocols = default_alpn();

        let name = match opts.server_name.trim() {
            "" => default_server_name(server_addr),
            n => n.to_string(),
        };
        let server_name = ServerName::try_from(name.clone())
            .with_context(|| format!("tls: invalid server name {name:?}"))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(cfg)),
            server_name,
        })
    }
}

#[async_trait]
impl ControlTransport for TlsClientTransport {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn wrap(&self, tcp: TcpStream) -> anyhow::Result<BoxedStream> {
        let s = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .context("tls connect")?;
        Ok(Box::new(s))
    }
}

/// Explicit provider: other crates in the tree may enable a second rustls
/// backend, which makes the process default ambiguous.
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn default_server_name(server_addr: &str) -> String {
    let host = net::host_of(server_addr);
    if host.is_empty() || host.starts_with(':') {
        return "localhost".into();
    }
    host.trim_start_matches('[').trim_end_matches(']').to_string()
}

pub fn load_or_generate_cert(
    cert_file: &str,
    key_file: &str,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_file = cert_file.trim();
    let key_file = key_file.trim();

    if !cert_file.is_empty() || !key_file.is_empty() {
        if cert_file.is_empty() || key_file.is_empty() {
            anyhow::bail!("tls: requires both cert_file and key_file (or neither to auto-generate)");
        }
        let certs = load_certs(Path::new(cert_file))?;
        let key = load_key(Path::new(key_file))?;
        return Ok((certs, key));
    }

    let rcgen::CertifiedKey { cert, signing_key } =
        generate_simple_self_signed(["localhost".to_string()])?;
    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
    Ok((vec![cert_der], key_der))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("tls: no certificate found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let Some(k) = rustls_pemfile::private_key(&mut rd)? else {
        anyhow::bail!("tls: no private key found in {}", path.display());
    };
    Ok(k)
}

/// Accepts any server certificate.
///
/// NOTE: vulnerable to MITM. Intended for local dev / testing only.
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(crypto_provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
