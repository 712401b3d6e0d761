//! Root CA lifecycle: creation, overwrite policy and cache invalidation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::authority::{CertAuthority, KeyCertPair};
use crate::error::{AuthorityError, CertError, Result};
use crate::store::{self, KeyStore};

/// Manages the root CA pair stored in a [`KeyStore`].
///
/// Not safe to run [`generate_root_ca`](Self::generate_root_ca) while leaf
/// issuance is in flight; callers serialize the two.
pub struct RootCaManager {
    store: KeyStore,
    authority: Arc<dyn CertAuthority>,
    /// Memoized positive result of the presence check.
    present: AtomicBool,
    /// Root key/cert loaded on first use.
    material: RwLock<Option<Arc<KeyCertPair>>>,
}

impl std::fmt::Debug for RootCaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCaManager")
            .field("store", &self.store)
            .field("present", &self.present.load(Ordering::Relaxed))
            .field("material_loaded", &self.material.read().is_some())
            .finish()
    }
}

impl RootCaManager {
    /// Creates a manager over the given store.
    pub fn new(store: KeyStore, authority: Arc<dyn CertAuthority>) -> Self {
        Self {
            store,
            authority,
            present: AtomicBool::new(false),
            material: RwLock::new(None),
        }
    }

    /// Generates a new root CA pair.
    ///
    /// Fails with [`CertError::RootCaAlreadyExists`] when a pair exists and
    /// `overwrite` is false; nothing on disk changes in that case. Otherwise
    /// the leaf cache is cleared before the new pair is written, since leaves
    /// signed by the old root are useless afterwards.
    ///
    /// Returns the `(key_path, cert_path)` of the new pair.
    pub async fn generate_root_ca(
        &self,
        common_name: &str,
        overwrite: bool,
    ) -> Result<(PathBuf, PathBuf)> {
        let common_name = common_name.trim();
        if common_name.is_empty() {
            tracing::error!("A common name is required to generate the root CA");
            return Err(CertError::CommonNameRequired);
        }

        if self.is_root_ca_present() && !overwrite {
            tracing::error!(
                "Root CA already exists at {:?}; pass overwrite to replace it",
                self.store.root_cert_path()
            );
            return Err(CertError::RootCaAlreadyExists);
        }

        let removed = self.store.clear_cache_dir().await?;
        tracing::info!("Cleared {} cached leaf certificate files", removed);
        self.invalidate();

        let authority = Arc::clone(&self.authority);
        let name = common_name.to_string();
        let pair = tokio::task::spawn_blocking(move || authority.generate_root(&name))
            .await
            .map_err(|e| AuthorityError::KeyGeneration(e.to_string()))??;

        let key_path = self.store.root_key_path();
        let cert_path = self.store.root_cert_path();
        store::write_pair(
            &key_path,
            pair.private_key.as_bytes(),
            &cert_path,
            pair.certificate.as_bytes(),
        )
        .await?;

        tracing::info!("Generated root CA {:?} at {:?}", common_name, cert_path);
        tracing::info!("Trust {:?} in your system to intercept HTTPS", cert_path);

        Ok((key_path, cert_path))
    }

    /// Deletes the root CA pair together with all leaf certificates.
    pub async fn remove_root_ca(&self) -> Result<()> {
        let removed = self.store.clear_cache_dir().await?;
        self.store.remove_root_pair().await?;
        self.invalidate();
        tracing::info!(
            "Removed root CA and {} cached leaf certificate files",
            removed
        );
        Ok(())
    }

    /// True iff both root CA files exist on disk. Does not validate them.
    pub fn is_root_ca_present(&self) -> bool {
        self.store.root_pair_exists()
    }

    /// Memoized presence check for the issuance path.
    ///
    /// A positive answer is cached until the next
    /// [`invalidate`](Self::invalidate).
    pub fn ensure_present(&self) -> Result<()> {
        if self.present.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.is_root_ca_present() {
            tracing::warn!(
                "Cannot find {:?} or {:?}; generate a root CA first",
                self.store.root_cert_path(),
                self.store.root_key_path()
            );
            return Err(CertError::RootCaNotExist);
        }
        self.present.store(true, Ordering::Release);
        Ok(())
    }

    /// Returns the root certificate path if the pair exists.
    pub fn root_ca_path(&self) -> Option<PathBuf> {
        self.is_root_ca_present()
            .then(|| self.store.root_cert_path())
    }

    /// Returns the root key/cert, reading them from disk on first use.
    pub async fn material(&self) -> Result<Arc<KeyCertPair>> {
        let cached = self.material.read().clone();
        if let Some(material) = cached {
            return Ok(material);
        }

        let private_key = tokio::fs::read_to_string(self.store.root_key_path()).await?;
        let certificate = tokio::fs::read_to_string(self.store.root_cert_path()).await?;
        let loaded = Arc::new(KeyCertPair {
            private_key,
            certificate,
        });

        // A concurrent loader may have won; keep whichever landed first.
        let mut slot = self.material.write();
        Ok(Arc::clone(slot.get_or_insert(loaded)))
    }

    /// Drops the memoized presence flag and the in-memory root material.
    pub fn invalidate(&self) {
        self.present.store(false, Ordering::Release);
        *self.material.write() = None;
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &KeyStore {
        &self.store
    }
}
