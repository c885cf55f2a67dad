//! Transport to the alert server
//!
//! [`ServerConnection`](super::ServerConnection) only needs a byte stream.
//! Production code dials TLS over TCP; tests hand out in-memory duplex
//! streams through their own [`Dialer`].

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, instrument};

use crate::error::{ConfigError, ConfigResult};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens a fresh byte stream to the alert server
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> std::io::Result<BoxedStream>;
}

/// Client certificate and key used for mutual authentication
#[derive(Debug, Clone, Copy)]
pub struct ClientIdentity<'a> {
    pub cert_file: &'a Path,
    pub key_file: &'a Path,
}

/// TLS over TCP, the server certificate validated against a configured CA
pub struct TlsDialer {
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    connector: TlsConnector,
}

impl std::fmt::Debug for TlsDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsDialer")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsDialer {
    pub fn new(
        host: &str,
        port: u16,
        ca_file: &Path,
        identity: Option<ClientIdentity<'_>>,
    ) -> ConfigResult<Self> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_file, "server CA")? {
            roots.add(cert).map_err(|e| ConfigError::InvalidPem {
                what: "server CA",
                path: ca_file.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ConfigError::InvalidPem {
                what: "TLS configuration",
                path: ca_file.to_path_buf(),
                reason: e.to_string(),
            })?
            .with_root_certificates(roots);

        let config = match identity {
            Some(identity) => {
                let certs = load_certs(identity.cert_file, "client certificate")?;
                let key = load_key(identity.key_file)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| ConfigError::InvalidPem {
                        what: "client certificate",
                        path: identity.cert_file.to_path_buf(),
                        reason: e.to_string(),
                    })?
            }
            None => builder.with_no_client_auth(),
        };

        let server_name =
            ServerName::try_from(host.to_string()).map_err(|_| ConfigError::EmptyField("server host"))?;

        Ok(Self {
            host: host.to_string(),
            port,
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    #[instrument(skip(self), fields(server = %self.host, port = self.port))]
    async fn dial(&self) -> std::io::Result<BoxedStream> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        tcp.set_nodelay(true)?;

        let stream = self.connector.connect(self.server_name.clone(), tcp).await?;
        debug!("TLS session established");

        Ok(Box::new(stream))
    }
}

fn open(path: &Path, what: &'static str) -> ConfigResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|_| ConfigError::MissingFile {
            what,
            path: path.to_path_buf(),
        })
}

fn load_certs(path: &Path, what: &'static str) -> ConfigResult<Vec<CertificateDer<'static>>> {
    let mut reader = open(path, what)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::InvalidPem {
            what,
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(ConfigError::InvalidPem {
            what,
            path: path.to_path_buf(),
            reason: "no certificate found".to_string(),
        });
    }

    Ok(certs)
}

fn load_key(path: &Path) -> ConfigResult<PrivateKeyDer<'static>> {
    let invalid = |reason: String| ConfigError::InvalidPem {
        what: "client key",
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = open(path, "client key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| invalid(e.to_string()))?
        .ok_or_else(|| invalid("no private key found".to_string()))
}
