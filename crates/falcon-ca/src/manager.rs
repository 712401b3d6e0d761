//! Public entry point tying the store, root CA, issuance cache and trust
//! verifier together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::authority::{CertAuthority, RcgenAuthority};
use crate::config::CertManagerConfig;
use crate::error::{CertError, Result};
use crate::issuance::{IssuanceCache, IssuanceStats, LeafCertificate};
use crate::root::RootCaManager;
use crate::store::KeyStore;
use crate::trust::TrustVerifier;

/// Certificate lifecycle manager for the MITM proxy.
///
/// Cheap to clone; clones share caches and the in-flight registry.
#[derive(Debug, Clone)]
pub struct CertManager {
    store: KeyStore,
    root: Arc<RootCaManager>,
    issuance: IssuanceCache,
    trust: Arc<TrustVerifier>,
}

impl CertManager {
    /// Creates a manager with the built-in rcgen authority.
    pub fn new(config: CertManagerConfig) -> Self {
        let authority = RcgenAuthority::new(
            config.cert_attrs.clone(),
            config.root_validity_days,
            config.leaf_validity_days,
        );
        Self::with_authority(config, Arc::new(authority))
    }

    /// Creates a manager using the default root directory.
    pub fn with_default_dir() -> Self {
        Self::new(CertManagerConfig::default())
    }

    /// Creates a manager with a custom certificate authority.
    pub fn with_authority(config: CertManagerConfig, authority: Arc<dyn CertAuthority>) -> Self {
        let store = KeyStore::open(config.root_dir.as_deref());
        let root = Arc::new(RootCaManager::new(store.clone(), Arc::clone(&authority)));
        let issuance = IssuanceCache::new(store.clone(), Arc::clone(&root), authority);
        let trust = Arc::new(TrustVerifier::for_current_platform(&config));

        Self {
            store,
            root,
            issuance,
            trust,
        }
    }

    /// Replaces the trust verifier.
    pub fn with_trust_verifier(mut self, verifier: TrustVerifier) -> Self {
        self.trust = Arc::new(verifier);
        self
    }

    /// Generates the root CA. See [`RootCaManager::generate_root_ca`].
    ///
    /// Must not run while the proxy is serving requests.
    pub async fn generate_root_ca(
        &self,
        common_name: &str,
        overwrite: bool,
    ) -> Result<(PathBuf, PathBuf)> {
        self.root.generate_root_ca(common_name, overwrite).await
    }

    /// Returns the leaf certificate for `hostname`, issuing it on first use.
    pub async fn get_certificate(&self, hostname: &str) -> Result<LeafCertificate> {
        self.issuance.get_certificate(hostname).await
    }

    /// Deletes every cached leaf certificate. The root CA is kept.
    pub async fn clear_certs(&self) -> Result<()> {
        let removed = self.store.clear_cache_dir().await?;
        self.root.invalidate();
        tracing::info!("Cleared {} cached leaf certificate files", removed);
        Ok(())
    }

    /// Deletes the root CA and every cached leaf certificate.
    pub async fn remove_root_ca(&self) -> Result<()> {
        self.root.remove_root_ca().await
    }

    /// True iff both root CA files exist.
    pub fn is_root_ca_present(&self) -> bool {
        self.root.is_root_ca_present()
    }

    /// Path to the root CA certificate, if it exists.
    pub fn root_ca_path(&self) -> Option<PathBuf> {
        self.root.root_ca_path()
    }

    /// Root CA certificate in PEM form, for display and installation.
    pub async fn root_ca_pem(&self) -> Result<String> {
        if !self.is_root_ca_present() {
            return Err(CertError::RootCaNotExist);
        }
        Ok(self.root.material().await?.certificate.clone())
    }

    /// The resolved root directory.
    pub fn root_dir(&self) -> &Path {
        self.store.root_dir()
    }

    /// Whether the operating system trusts the root CA.
    pub async fn is_root_ca_trusted(&self) -> Result<bool> {
        self.trust.is_trusted(&self.root, &self.issuance).await
    }

    /// Snapshot of leaf issuance counters.
    pub fn issuance_stats(&self) -> IssuanceStats {
        self.issuance.stats()
    }
}
