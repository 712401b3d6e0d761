//! Root CA trust verification.
//!
//! Answers "does the operating system trust our root CA?". Platforms with a
//! native trust store query go through a [`PlatformTrustProbe`]; everything
//! else runs the [`NetworkTrustProbe`], which serves a leaf signed by the root
//! CA on a loopback port and lets an independent HTTP client connect to it.

mod network;
mod platform;

pub use network::{
    ClientOutput, CurlClient, ExternalHttpClient, NetworkTrustProbe, ProbeTarget, HTTPS_RESPONSE,
};
pub use platform::PlatformTrustProbe;
#[cfg(target_os = "windows")]
pub use platform::WindowsCertStoreProbe;

use crate::config::CertManagerConfig;
use crate::error::{CertError, Result};
use crate::issuance::IssuanceCache;
use crate::root::RootCaManager;

enum Strategy {
    Platform(Box<dyn PlatformTrustProbe>),
    Network(NetworkTrustProbe),
}

/// Chooses and runs a trust probe.
pub struct TrustVerifier {
    strategy: Strategy,
}

impl std::fmt::Debug for TrustVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let strategy = match &self.strategy {
            Strategy::Platform(_) => "platform",
            Strategy::Network(_) => "network",
        };
        f.debug_struct("TrustVerifier")
            .field("strategy", &strategy)
            .finish()
    }
}

impl TrustVerifier {
    /// Picks the native probe where one exists, else the network probe.
    pub fn for_current_platform(config: &CertManagerConfig) -> Self {
        #[cfg(target_os = "windows")]
        {
            let _ = config;
            Self::platform(WindowsCertStoreProbe)
        }

        #[cfg(not(target_os = "windows"))]
        {
            Self::network(NetworkTrustProbe::from_config(config))
        }
    }

    /// Uses the given native probe.
    pub fn platform(probe: impl PlatformTrustProbe + 'static) -> Self {
        Self {
            strategy: Strategy::Platform(Box::new(probe)),
        }
    }

    /// Uses the given network probe.
    pub fn network(probe: NetworkTrustProbe) -> Self {
        Self {
            strategy: Strategy::Network(probe),
        }
    }

    /// Reports whether the root CA is trusted.
    ///
    /// Fails with [`CertError::RootCaNotExist`] when there is no root CA.
    /// Probe failures count as "not trusted"; only setup failures of the
    /// network probe are returned as errors.
    pub async fn is_trusted(&self, root: &RootCaManager, issuance: &IssuanceCache) -> Result<bool> {
        let Some(cert_path) = root.root_ca_path() else {
            return Err(CertError::RootCaNotExist);
        };

        match &self.strategy {
            Strategy::Platform(probe) => match probe.is_trusted(&cert_path).await {
                Ok(trusted) => Ok(trusted),
                Err(e) => {
                    tracing::warn!("Platform trust probe failed, assuming untrusted: {}", e);
                    Ok(false)
                }
            },
            Strategy::Network(probe) => probe.run(root, issuance).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::Path;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::authority::RcgenAuthority;
    use crate::store::KeyStore;

    struct FixedProbe(io::Result<bool>);

    #[async_trait]
    impl PlatformTrustProbe for FixedProbe {
        async fn is_trusted(&self, root_cert_path: &Path) -> io::Result<bool> {
            assert!(root_cert_path.ends_with("falcon.crt"));
            match &self.0 {
                Ok(trusted) => Ok(*trusted),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            }
        }
    }

    async fn setup(with_root: bool) -> (TempDir, Arc<RootCaManager>, IssuanceCache) {
        let temp_dir = TempDir::new().unwrap();
        let store = KeyStore::open(Some(temp_dir.path()));
        let authority = Arc::new(RcgenAuthority::default());
        let root = Arc::new(RootCaManager::new(store.clone(), authority.clone()));
        if with_root {
            root.generate_root_ca("Test Root", false).await.unwrap();
        }
        let issuance = IssuanceCache::new(store, root.clone(), authority);
        (temp_dir, root, issuance)
    }

    #[tokio::test]
    async fn platform_probe_answer_is_returned() {
        let (_temp_dir, root, issuance) = setup(true).await;

        let trusted = TrustVerifier::platform(FixedProbe(Ok(true)));
        assert!(trusted.is_trusted(&root, &issuance).await.unwrap());

        let untrusted = TrustVerifier::platform(FixedProbe(Ok(false)));
        assert!(!untrusted.is_trusted(&root, &issuance).await.unwrap());
    }

    #[tokio::test]
    async fn platform_probe_failure_means_untrusted() {
        let (_temp_dir, root, issuance) = setup(true).await;
        let verifier = TrustVerifier::platform(FixedProbe(Err(io::Error::new(
            io::ErrorKind::NotFound,
            "certutil missing",
        ))));

        assert!(!verifier.is_trusted(&root, &issuance).await.unwrap());
    }

    #[tokio::test]
    async fn missing_root_is_an_error_for_every_strategy() {
        let (_temp_dir, root, issuance) = setup(false).await;

        let platform = TrustVerifier::platform(FixedProbe(Ok(true)));
        assert!(matches!(
            platform.is_trusted(&root, &issuance).await,
            Err(CertError::RootCaNotExist)
        ));

        let network = TrustVerifier::for_current_platform(&CertManagerConfig::default());
        assert!(matches!(
            network.is_trusted(&root, &issuance).await,
            Err(CertError::RootCaNotExist)
        ));
    }

    #[test]
    fn debug_names_strategy() {
        let verifier = TrustVerifier::platform(FixedProbe(Ok(true)));
        assert!(format!("{:?}", verifier).contains("platform"));
    }
}
