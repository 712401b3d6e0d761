//! Falcon CA - certificate lifecycle management for the Falcon MITM proxy.
//!
//! Creates a self-signed root certificate authority, issues per-hostname
//! leaf certificates on demand, caches them on disk, and checks whether the
//! operating system trusts the root.
//!
//! ## Features
//!
//! - Root CA creation with an explicit overwrite gate
//! - On-demand leaf issuance, at most one signing operation per hostname at
//!   a time no matter how many connections ask
//! - Read-through/write-through disk cache under `<root>/certs/`
//! - Trust verification through a native store probe or a live HTTPS
//!   handshake checked by an external client
//!
//! ## Architecture
//!
//! ```text
//! CertManager
//!   ├─ KeyStore          paths under <root>/, hostname validation
//!   ├─ RootCaManager     falcon.crt / falcon.key, overwrite policy
//!   ├─ IssuanceCache     in-flight registry → CertAuthority → disk
//!   └─ TrustVerifier     PlatformTrustProbe | NetworkTrustProbe
//! ```
//!
//! ## Example
//!
//! ```no_run
//! # async fn run() -> falcon_ca::Result<()> {
//! use falcon_ca::{CertManager, CertManagerConfig};
//!
//! let manager = CertManager::new(CertManagerConfig::default());
//! if !manager.is_root_ca_present() {
//!     manager.generate_root_ca("Falcon Root CA", false).await?;
//! }
//! let leaf = manager.get_certificate("example.com").await?;
//! println!("{}", leaf.cert_path.display());
//! # Ok(())
//! # }
//! ```

mod authority;
mod config;
mod error;
mod issuance;
mod manager;
mod root;
mod store;
pub mod trust;

pub use authority::{CertAuthority, KeyCertPair, RcgenAuthority};
pub use config::{
    default_root_dir, CertAttrs, CertManagerConfig, DEFAULT_PROBE_HOSTNAME, DEFAULT_PROBE_TIMEOUT,
    DEFAULT_ROOT_DIR_NAME,
};
pub use error::{AuthorityError, CertError, Result};
pub use issuance::{IssuanceCache, IssuanceStats, LeafCertificate};
pub use manager::CertManager;
pub use root::RootCaManager;
pub use store::{
    normalize_hostname, resolve_root_dir, KeyStore, LeafPaths, LEAF_CACHE_DIRNAME,
    ROOT_CA_CERT_FILENAME, ROOT_CA_KEY_FILENAME,
};
pub use trust::TrustVerifier;
