//! Live handshake trust probe.
//!
//! Issues a leaf for a hostname that resolves to loopback, serves it over
//! HTTPS on an ephemeral port, and runs an out-of-process HTTP client against
//! it. The root is trusted iff the client gets the expected body back.
//!
//! The request deliberately does not go through this process's own TLS
//! client, so the answer reflects what other programs on the machine see.

use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;

use crate::config::CertManagerConfig;
use crate::error::{CertError, Result};
use crate::issuance::IssuanceCache;
use crate::root::RootCaManager;

/// Body served by the probe listener.
pub const HTTPS_RESPONSE: &str = "HTTPS Server is ON";

/// Where the external client should connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    /// Hostname the leaf was issued for.
    pub host: String,
    /// Loopback address the listener is bound to.
    pub addr: SocketAddr,
}

impl ProbeTarget {
    /// `https://<host>:<port>`
    pub fn url(&self) -> String {
        format!("https://{}:{}", self.host, self.addr.port())
    }
}

/// Captured result of an external client run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOutput {
    /// Everything the client wrote to stdout.
    pub stdout: String,
    /// Spawn failure, non-zero exit, or timeout.
    pub error: Option<String>,
}

/// An HTTP client that runs outside this process.
#[async_trait]
pub trait ExternalHttpClient: Send + Sync {
    /// Fetches `target` and reports what came back. Never fails; problems are
    /// reported through [`ClientOutput::error`].
    async fn fetch(&self, target: &ProbeTarget, timeout: Duration) -> ClientOutput;
}

/// Runs `curl`.
#[derive(Debug, Clone)]
pub struct CurlClient {
    program: String,
}

impl CurlClient {
    /// Uses the given curl executable.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for CurlClient {
    fn default() -> Self {
        Self::new("curl")
    }
}

#[async_trait]
impl ExternalHttpClient for CurlClient {
    async fn fetch(&self, target: &ProbeTarget, timeout: Duration) -> ClientOutput {
        let resolve = format!("{}:{}:{}", target.host, target.addr.port(), target.addr.ip());
        let child = tokio::process::Command::new(&self.program)
            .args(["--silent", "--show-error", "--resolve", &resolve])
            .arg(target.url())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(out)) => ClientOutput {
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                error: (!out.status.success()).then(|| {
                    format!(
                        "{} exited with {}: {}",
                        self.program,
                        out.status,
                        String::from_utf8_lossy(&out.stderr).trim()
                    )
                }),
            },
            Ok(Err(e)) => ClientOutput {
                stdout: String::new(),
                error: Some(format!("failed to run {}: {}", self.program, e)),
            },
            Err(_) => ClientOutput {
                stdout: String::new(),
                error: Some(format!("{} timed out after {:?}", self.program, timeout)),
            },
        }
    }
}

/// Trust probe that performs a real TLS handshake through an external client.
#[derive(Clone)]
pub struct NetworkTrustProbe {
    hostname: String,
    timeout: Duration,
    client: Arc<dyn ExternalHttpClient>,
}

impl std::fmt::Debug for NetworkTrustProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkTrustProbe")
            .field("hostname", &self.hostname)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl NetworkTrustProbe {
    /// Creates a probe for `hostname` using `client`.
    pub fn new(
        hostname: impl Into<String>,
        timeout: Duration,
        client: Arc<dyn ExternalHttpClient>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            timeout,
            client,
        }
    }

    /// Probe using curl with the configured hostname and timeout.
    pub fn from_config(config: &CertManagerConfig) -> Self {
        Self::new(
            config.probe_hostname.clone(),
            config.probe_timeout(),
            Arc::new(CurlClient::default()),
        )
    }

    /// Runs the probe.
    ///
    /// Errors only when the root CA is missing, the leaf cannot be issued, or
    /// the listener cannot be set up. Anything the client reports folds into
    /// `Ok(false)`.
    pub async fn run(&self, root: &RootCaManager, issuance: &IssuanceCache) -> Result<bool> {
        if !root.is_root_ca_present() {
            return Err(CertError::RootCaNotExist);
        }

        let leaf = issuance.get_certificate(&self.hostname).await?;
        let root_material = root.material().await?;
        let server_config = server_config(
            &leaf.certificate,
            root_material.certificate.as_bytes(),
            &leaf.private_key,
        )?;

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| CertError::TrustProbe(format!("failed to bind probe port: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| CertError::TrustProbe(format!("failed to read probe port: {}", e)))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        let server = spawn_listener(listener, acceptor, shutdown_rx);

        let target = ProbeTarget {
            host: leaf.hostname.clone(),
            addr,
        };
        tracing::debug!("Probing root CA trust via {}", target.url());
        let output = self.client.fetch(&target, self.timeout).await;

        let _ = shutdown_tx.send(());
        let _ = server.await;

        if let Some(error) = &output.error {
            tracing::debug!("Trust probe client reported: {}", error);
        }
        Ok(output.stdout.contains(HTTPS_RESPONSE))
    }
}

fn server_config(leaf_cert: &[u8], root_cert: &[u8], leaf_key: &[u8]) -> Result<ServerConfig> {
    let mut chain = parse_certs(leaf_cert)?;
    chain.extend(parse_certs(root_cert)?);

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &leaf_key[..])
        .map_err(|e| CertError::TrustProbe(format!("invalid leaf key: {}", e)))?
        .ok_or_else(|| CertError::TrustProbe("leaf key file holds no private key".into()))?;

    ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| CertError::TrustProbe(e.to_string()))?
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .map_err(|e| CertError::TrustProbe(format!("invalid probe certificate: {}", e)))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| CertError::TrustProbe(format!("invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(CertError::TrustProbe("no certificate found in PEM".into()));
    }
    Ok(certs)
}

/// Serves [`HTTPS_RESPONSE`] until `shutdown` fires. Open connections are
/// dropped with the task.
fn spawn_listener(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    mut shutdown: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::debug!("Probe listener accept failed: {}", e);
                            continue;
                        }
                    };
                    let acceptor = acceptor.clone();
                    connections.spawn(async move {
                        let tls = match acceptor.accept(stream).await {
                            Ok(tls) => tls,
                            Err(e) => {
                                tracing::debug!("Probe handshake with {} failed: {}", peer, e);
                                return;
                            }
                        };
                        let service = service_fn(|_req: Request<Incoming>| async {
                            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(
                                HTTPS_RESPONSE.as_bytes(),
                            ))))
                        });
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(tls), service)
                            .await
                        {
                            tracing::debug!("Probe connection with {} ended: {}", peer, e);
                        }
                    });
                }
            }
        }
        connections.shutdown().await;
    })
}
