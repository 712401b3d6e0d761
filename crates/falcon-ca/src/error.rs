//! Error types for certificate management.

use std::sync::Arc;

use thiserror::Error;

/// Certificate manager error type.
///
/// Cloneable so that one failed issuance can be delivered to every caller
/// waiting on the same hostname.
#[derive(Debug, Clone, Error)]
pub enum CertError {
    /// Root CA generation was requested without a common name.
    #[error("root CA common name is required")]
    CommonNameRequired,

    /// Root CA already exists and overwrite was not requested.
    #[error("root CA already exists; request an overwrite to replace it")]
    RootCaAlreadyExists,

    /// No root CA key/certificate pair on disk.
    #[error("root CA does not exist; generate one first")]
    RootCaNotExist,

    /// The certificate authority failed to produce key material.
    #[error("certificate generation failed: {0}")]
    Generation(#[from] AuthorityError),

    /// Hostname cannot be used as a cache key.
    #[error("invalid hostname: {0:?}")]
    InvalidHostname(String),

    /// The network trust probe could not set up its listener.
    #[error("trust probe failed: {0}")]
    TrustProbe(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// The issuing task ended without reporting a result.
    #[error("certificate issuance for {0} was aborted")]
    IssuanceAborted(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for CertError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Error reported by a [`CertAuthority`](crate::CertAuthority).
#[derive(Debug, Clone, Error)]
pub enum AuthorityError {
    /// Key pair generation failed.
    #[error("failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Certificate signing failed.
    #[error("failed to sign certificate: {0}")]
    Signing(String),

    /// Root CA material could not be parsed.
    #[error("failed to parse root CA: {0}")]
    Parse(String),
}

impl From<rcgen::Error> for AuthorityError {
    fn from(e: rcgen::Error) -> Self {
        Self::Signing(e.to_string())
    }
}

/// Result type for certificate operations.
pub type Result<T> = std::result::Result<T, CertError>;
