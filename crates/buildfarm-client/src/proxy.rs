//! Local authenticating proxy in front of the remote executor.
//!
//! The build tool speaks plaintext to `127.0.0.1:<port>`; each accepted
//! connection is spliced onto a mutual-TLS connection to the executor.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bf_core::{AuthInfo, SERVER_TLS_NAME};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::error::{ClientError, ClientResult};

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Client TLS configuration for talking to the executor.
#[derive(Clone)]
pub struct ProxyCredentials {
    client_config: Arc<rustls::ClientConfig>,
}

impl ProxyCredentials {
    pub fn from_pem(auth: &AuthInfo) -> ClientResult<Self> {
        let ca = parse_certs(&auth.tls_certificate, "CA certificate")?;
        let chain = parse_certs(&auth.tls_client_certificate, "client certificate")?;
        let key = parse_key(&auth.tls_client_key)?;

        let mut roots = rustls::RootCertStore::empty();
        for cert in ca {
            roots.add(cert)?;
        }

        let mut config = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)?;
        config.alpn_protocols = vec![b"h2".to_vec()];

        Ok(Self {
            client_config: Arc::new(config),
        })
    }

    /// Read `ca.crt`, `client.crt` and `client.pkcs8.key` from `dir`.
    pub fn from_files(dir: &Path) -> ClientResult<Self> {
        let read = |name: &str| std::fs::read_to_string(dir.join(name));
        Self::from_pem(&AuthInfo {
            tls_certificate: read("ca.crt")?,
            tls_client_certificate: read("client.crt")?,
            tls_client_key: read("client.pkcs8.key")?,
        })
    }
}

fn parse_certs(pem: &str, what: &str) -> ClientResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ClientError::Tls(format!("no {what} found in PEM input")));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> ClientResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())?
        .ok_or_else(|| ClientError::Tls("no private key found in PEM input".to_string()))
}

/// A running proxy. Dropping it stops accepting connections.
pub struct AuthProxy {
    listen_address: SocketAddr,
    task: JoinHandle<()>,
}

impl AuthProxy {
    /// Listen on an ephemeral localhost port and forward to `backend`
    /// (`host:port`).
    pub async fn start(credentials: ProxyCredentials, backend: String) -> ClientResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let listen_address = listener.local_addr()?;
        let server_name = ServerName::try_from(SERVER_TLS_NAME)
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        let connector = TlsConnector::from(credentials.client_config);
        info!(listen = %listen_address, %backend, "auth proxy started");

        let task = tokio::spawn(async move {
            let accept = || listener.accept();
            accept_loop(accept, ACCEPT_BACKOFF, |(inbound, peer): (TcpStream, SocketAddr)| {
                debug!(%peer, "auth proxy connection");
                let connector = connector.clone();
                let server_name = server_name.clone();
                let backend = backend.clone();
                tokio::spawn(async move {
                    if let Err(e) = forward(inbound, &backend, connector, server_name).await {
                        warn!(%peer, %backend, error = %e, "auth proxy connection failed");
                    }
                });
            })
            .await;
        });

        Ok(Self {
            listen_address,
            task,
        })
    }

    pub fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }
}

impl Drop for AuthProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Hand every accepted connection to `handle`, sleeping `backoff` after
/// each accept error.
async fn accept_loop<T, F, Fut>(mut accept: F, backoff: Duration, mut handle: impl FnMut(T))
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => handle(accepted),
            Err(e) => {
                warn!(error = %e, ?backoff, "auth proxy accept failed");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

async fn forward(
    mut inbound: TcpStream,
    backend: &str,
    connector: TlsConnector,
    server_name: ServerName<'static>,
) -> std::io::Result<()> {
    let outbound = TcpStream::connect(backend).await?;
    outbound.set_nodelay(true)?;
    let mut tls = connector.connect(server_name, outbound).await?;
    let (up, down) = tokio::io::copy_bidirectional(&mut inbound, &mut tls).await?;
    debug!(%backend, up, down, "auth proxy connection closed");
    Ok(())
}
