//! Certificate manager configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CertError, Result};

/// Name of the default root directory, created under the user's home.
pub const DEFAULT_ROOT_DIR_NAME: &str = ".falcon";

/// Hostname used by the network trust probe. Resolves to 127.0.0.1.
pub const DEFAULT_PROBE_HOSTNAME: &str = "localtest.me";

/// Default timeout for the external client used by the trust probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Subject attributes applied to every generated certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertAttrs {
    /// Country name (C).
    pub country: Option<String>,
    /// Organization name (O).
    pub organization: Option<String>,
    /// State or province name (ST).
    pub state: Option<String>,
    /// Organizational unit name (OU).
    pub organizational_unit: Option<String>,
}

impl Default for CertAttrs {
    fn default() -> Self {
        Self {
            country: Some("CN".to_string()),
            organization: Some("Falcon".to_string()),
            state: Some("SH".to_string()),
            organizational_unit: Some("Falcon SSL Proxy".to_string()),
        }
    }
}

/// Configuration for [`CertManager`](crate::CertManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertManagerConfig {
    /// Explicit root directory. Defaults to `<home>/.falcon/`.
    pub root_dir: Option<PathBuf>,
    /// Default subject attributes for generated certificates.
    pub cert_attrs: CertAttrs,
    /// Validity of the root CA certificate in days.
    pub root_validity_days: u32,
    /// Validity of issued leaf certificates in days.
    pub leaf_validity_days: u32,
    /// Hostname the network trust probe requests a certificate for.
    pub probe_hostname: String,
    /// Timeout for the external HTTP client, in milliseconds.
    pub probe_timeout_ms: u64,
}

impl Default for CertManagerConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            cert_attrs: CertAttrs::default(),
            root_validity_days: 3650,
            leaf_validity_days: 825,
            probe_hostname: DEFAULT_PROBE_HOSTNAME.to_string(),
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl CertManagerConfig {
    /// Creates a configuration rooted at the given directory.
    pub fn with_root_dir(root_dir: impl AsRef<Path>) -> Self {
        Self {
            root_dir: Some(root_dir.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Loads a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| CertError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Returns the probe timeout as a [`Duration`].
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Returns `<home>/.falcon/`, or `None` when no home directory is known.
pub fn default_root_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(DEFAULT_ROOT_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let config = CertManagerConfig::default();
        assert!(config.root_dir.is_none());
        assert_eq!(config.probe_hostname, "localtest.me");
        assert_eq!(config.probe_timeout(), Duration::from_millis(1000));
        assert_eq!(config.cert_attrs.organization.as_deref(), Some("Falcon"));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("falcon.json");
        std::fs::write(
            &path,
            r#"{"root_dir": "/srv/falcon", "cert_attrs": {"organization": "Acme"}}"#,
        )
        .unwrap();

        let config = CertManagerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.root_dir, Some(PathBuf::from("/srv/falcon")));
        assert_eq!(config.cert_attrs.organization.as_deref(), Some("Acme"));
        assert_eq!(config.cert_attrs.country.as_deref(), Some("CN"));
        assert_eq!(config.leaf_validity_days, 825);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("falcon.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = CertManagerConfig::from_json_file(&path).unwrap_err();
        assert!(matches!(err, CertError::Config(_)));
    }

    #[test]
    fn default_root_dir_ends_with_dir_name() {
        if let Some(dir) = default_root_dir() {
            assert!(dir.ends_with(DEFAULT_ROOT_DIR_NAME));
        }
    }
}
