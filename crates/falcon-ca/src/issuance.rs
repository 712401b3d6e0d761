//! Leaf certificate issuance with per-hostname deduplication.
//!
//! ## Flow
//!
//! ```text
//! get_certificate(host)
//!     │
//!     ├─ root CA missing ──────────────► RootCaNotExist
//!     │
//!     ├─ issuance for host in flight ──► join its waiter list
//!     │
//!     └─ otherwise register + spawn issuing task
//!                 │
//!                 ├─ cache pair on disk ─► read it
//!                 └─ else ───────────────► CertAuthority::issue_leaf, write key, write cert
//!                 │
//!                 └─ remove registry entry, send result to every waiter
//! ```
//!
//! The issuing task, not the first caller, resolves the group. Dropping any
//! caller's future leaves the other waiters unaffected.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::authority::{CertAuthority, KeyCertPair};
use crate::error::{CertError, Result};
use crate::root::RootCaManager;
use crate::store::{self, KeyStore, LeafPaths};

/// A leaf certificate and its private key for one hostname.
///
/// The byte buffers are immutable and cheap to clone.
#[derive(Clone, PartialEq, Eq)]
pub struct LeafCertificate {
    /// Normalized hostname.
    pub hostname: String,
    /// Private key (PEM).
    pub private_key: Bytes,
    /// Certificate (PEM).
    pub certificate: Bytes,
    /// Backing key file.
    pub key_path: PathBuf,
    /// Backing certificate file.
    pub cert_path: PathBuf,
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("hostname", &self.hostname)
            .field("cert_path", &self.cert_path)
            .field("certificate_len", &self.certificate.len())
            .finish()
    }
}

/// Point-in-time issuance counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IssuanceStats {
    /// Requests served from an existing on-disk pair.
    pub cache_hits: u64,
    /// Leaves signed by the authority and persisted.
    pub leaves_issued: u64,
    /// Requests that joined an issuance already in flight.
    pub coalesced: u64,
    /// Issuances that ended in an error.
    pub failures: u64,
}

type Waiter = oneshot::Sender<Result<LeafCertificate>>;

#[derive(Debug, Default)]
struct Counters {
    cache_hits: AtomicU64,
    leaves_issued: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
}

/// Read-through/write-through leaf certificate cache over the filesystem.
#[derive(Clone)]
pub struct IssuanceCache {
    store: KeyStore,
    root: Arc<RootCaManager>,
    authority: Arc<dyn CertAuthority>,
    in_flight: Arc<Mutex<HashMap<String, Vec<Waiter>>>>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for IssuanceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuanceCache")
            .field("cache_dir", &self.store.cache_dir())
            .field("in_flight", &self.in_flight.lock().len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl IssuanceCache {
    /// Creates a cache issuing leaves signed by `root`.
    pub fn new(
        store: KeyStore,
        root: Arc<RootCaManager>,
        authority: Arc<dyn CertAuthority>,
    ) -> Self {
        Self {
            store,
            root,
            authority,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Returns the leaf certificate for `hostname`, issuing it if needed.
    ///
    /// Concurrent calls for the same hostname share a single issuance and
    /// all receive the same result.
    pub async fn get_certificate(&self, hostname: &str) -> Result<LeafCertificate> {
        self.root.ensure_present()?;
        let paths = self.store.paths_for(hostname)?;
        let root = self.root.material().await?;

        let (tx, rx) = oneshot::channel();
        let leader = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get_mut(&paths.hostname) {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    in_flight.insert(paths.hostname.clone(), vec![tx]);
                    true
                }
            }
        };

        if leader {
            tokio::spawn(self.clone().issue(paths.clone(), root));
        } else {
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Joined in-flight issuance for {}", paths.hostname);
        }

        rx.await
            .unwrap_or_else(|_| Err(CertError::IssuanceAborted(paths.hostname)))
    }

    /// Returns a snapshot of the issuance counters.
    pub fn stats(&self) -> IssuanceStats {
        IssuanceStats {
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            leaves_issued: self.counters.leaves_issued.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Number of hostnames with an issuance in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    async fn issue(self, paths: LeafPaths, root: Arc<KeyCertPair>) {
        let result = self.load_or_issue(&paths, root).await;
        if let Err(e) = &result {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Certificate issuance for {} failed: {}", paths.hostname, e);
        }

        let waiters = self
            .in_flight
            .lock()
            .remove(&paths.hostname)
            .unwrap_or_default();
        for waiter in waiters {
            // A waiter whose caller went away is fine to skip.
            let _ = waiter.send(result.clone());
        }
    }

    async fn load_or_issue(
        &self,
        paths: &LeafPaths,
        root: Arc<KeyCertPair>,
    ) -> Result<LeafCertificate> {
        if let Some((key, cert)) = store::read_pair(&paths.key_path, &paths.cert_path).await? {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Serving cached certificate for {}", paths.hostname);
            return Ok(leaf(paths, key.into(), cert.into()));
        }

        let authority = Arc::clone(&self.authority);
        let hostname = paths.hostname.clone();
        let pair = tokio::task::spawn_blocking(move || authority.issue_leaf(&hostname, &root))
            .await
            .map_err(|_| CertError::IssuanceAborted(paths.hostname.clone()))??;

        store::write_pair(
            &paths.key_path,
            pair.private_key.as_bytes(),
            &paths.cert_path,
            pair.certificate.as_bytes(),
        )
        .await?;

        self.counters.leaves_issued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Issued certificate for {}", paths.hostname);
        Ok(leaf(
            paths,
            Bytes::from(pair.private_key),
            Bytes::from(pair.certificate),
        ))
    }
}

fn leaf(paths: &LeafPaths, private_key: Bytes, certificate: Bytes) -> LeafCertificate {
    LeafCertificate {
        hostname: paths.hostname.clone(),
        private_key,
        certificate,
        key_path: paths.key_path.clone(),
        cert_path: paths.cert_path.clone(),
    }
}
