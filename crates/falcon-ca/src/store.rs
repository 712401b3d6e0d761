//! On-disk layout of the certificate root directory.
//!
//! ```text
//! <root>/falcon.key           root CA private key
//! <root>/falcon.crt           root CA certificate
//! <root>/certs/<host>.key     leaf private keys
//! <root>/certs/<host>.crt     leaf certificates
//! ```
//!
//! IPv6 literals are stored with `:` replaced by `+`, a character no DNS name
//! can contain, so `::1` lives at `certs/++1.crt`.
//!
//! Leaf material lives in its own directory so that clearing the leaf cache
//! can never touch the root CA pair.

use std::io;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{default_root_dir, DEFAULT_ROOT_DIR_NAME};
use crate::error::{CertError, Result};

/// Root CA certificate file name.
pub const ROOT_CA_CERT_FILENAME: &str = "falcon.crt";
/// Root CA private key file name.
pub const ROOT_CA_KEY_FILENAME: &str = "falcon.key";
/// Leaf certificate cache directory, relative to the root directory.
pub const LEAF_CACHE_DIRNAME: &str = "certs";

const MAX_HOSTNAME_LEN: usize = 253;

/// Dot-separated labels of `[a-z0-9_-]`, no empty labels, no leading or
/// trailing hyphen. Also accepts dotted IPv4 addresses.
static HOSTNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9_])?(?:\.[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9_])?)*$")
        .expect("hostname pattern is valid")
});

/// Key and certificate paths for one issued leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPaths {
    /// Normalized hostname the paths were derived from.
    pub hostname: String,
    /// Private key file.
    pub key_path: PathBuf,
    /// Certificate file.
    pub cert_path: PathBuf,
}

/// Owns the root directory and maps names to files inside it.
#[derive(Debug, Clone)]
pub struct KeyStore {
    root_dir: PathBuf,
    cache_dir: PathBuf,
}

impl KeyStore {
    /// Resolves the root directory and creates it (and the leaf cache
    /// directory) if missing.
    ///
    /// Creation failures are logged, not returned; a missing directory
    /// surfaces later as a file-not-found error.
    pub fn open(explicit_root: Option<&Path>) -> Self {
        let root_dir = resolve_root_dir(explicit_root);
        let store = Self::new(root_dir);

        for dir in [&store.root_dir, &store.cache_dir] {
            if !dir.exists() {
                if let Err(e) = create_dir_permissive(dir) {
                    tracing::warn!(
                        "Failed to create certificate directory {:?}, please create it manually: {}",
                        dir,
                        e
                    );
                }
            }
        }

        store
    }

    /// Creates a store over `root_dir` without touching the filesystem.
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root_dir = root_dir.as_ref().to_path_buf();
        let cache_dir = root_dir.join(LEAF_CACHE_DIRNAME);
        Self {
            root_dir,
            cache_dir,
        }
    }

    /// Returns the root directory.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Returns the leaf certificate cache directory.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the path to the root CA certificate file.
    pub fn root_cert_path(&self) -> PathBuf {
        self.root_dir.join(ROOT_CA_CERT_FILENAME)
    }

    /// Returns the path to the root CA private key file.
    pub fn root_key_path(&self) -> PathBuf {
        self.root_dir.join(ROOT_CA_KEY_FILENAME)
    }

    /// True iff both root CA files exist. Does not parse them.
    pub fn root_pair_exists(&self) -> bool {
        self.root_cert_path().exists() && self.root_key_path().exists()
    }

    /// Maps a hostname to its leaf key/certificate paths.
    pub fn paths_for(&self, hostname: &str) -> Result<LeafPaths> {
        let hostname = normalize_hostname(hostname)?;
        let stem = hostname.replace(':', "+");
        Ok(LeafPaths {
            key_path: self.cache_dir.join(format!("{}.key", stem)),
            cert_path: self.cache_dir.join(format!("{}.crt", stem)),
            hostname,
        })
    }

    /// Removes every entry of the leaf cache directory, keeping the
    /// directory itself. Returns the number of removed entries.
    pub async fn clear_cache_dir(&self) -> io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&self.cache_dir).await?;
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
            removed += 1;
        }
        Ok(removed)
    }

    /// Deletes the root CA pair. Missing files are not an error.
    pub async fn remove_root_pair(&self) -> io::Result<()> {
        // Certificate first, so the pair is never observed as cert-without-key.
        for path in [self.root_cert_path(), self.root_key_path()] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Returns `explicit_root` if given, else `<home>/.falcon/`.
pub fn resolve_root_dir(explicit_root: Option<&Path>) -> PathBuf {
    if let Some(root) = explicit_root {
        return root.to_path_buf();
    }
    default_root_dir().unwrap_or_else(|| {
        tracing::warn!(
            "Could not determine home directory, using ./{}",
            DEFAULT_ROOT_DIR_NAME
        );
        PathBuf::from(DEFAULT_ROOT_DIR_NAME)
    })
}

/// Lower-cases and validates a hostname for use as a cache key and file name.
///
/// IPv6 literals, bracketed or not, come back in canonical form.
pub fn normalize_hostname(hostname: &str) -> Result<String> {
    let trimmed = hostname.trim();
    if let Some(ip) = parse_ipv6_literal(trimmed) {
        return Ok(ip.to_string());
    }

    // A single trailing dot marks the DNS root; anything more is malformed.
    let normalized = trimmed
        .strip_suffix('.')
        .unwrap_or(trimmed)
        .to_ascii_lowercase();
    if normalized.is_empty()
        || normalized.len() > MAX_HOSTNAME_LEN
        || !HOSTNAME_RE.is_match(&normalized)
    {
        return Err(CertError::InvalidHostname(hostname.to_string()));
    }
    Ok(normalized)
}

/// Parses `::1` or `[::1]`. Zone identifiers are not accepted.
fn parse_ipv6_literal(host: &str) -> Option<Ipv6Addr> {
    let inner = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    inner.parse().ok()
}

/// Writes a key/certificate pair so that the certificate only becomes
/// visible after the key is complete.
pub(crate) async fn write_pair(
    key_path: &Path,
    key: &[u8],
    cert_path: &Path,
    cert: &[u8],
) -> io::Result<()> {
    write_file_atomic(key_path, key).await?;
    write_file_atomic(cert_path, cert).await
}

/// Reads a key/certificate pair, or `None` if either file is missing.
pub(crate) async fn read_pair(
    key_path: &Path,
    cert_path: &Path,
) -> io::Result<Option<(Vec<u8>, Vec<u8>)>> {
    if !tokio::fs::try_exists(key_path).await? || !tokio::fs::try_exists(cert_path).await? {
        return Ok(None);
    }
    let key = tokio::fs::read(key_path).await?;
    let cert = tokio::fs::read(cert_path).await?;
    Ok(Some((key, cert)))
}

async fn write_file_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(unix)]
fn create_dir_permissive(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o777)
        .create(dir)
}

#[cfg(not(unix))]
fn create_dir_permissive(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn store_paths() {
        let store = KeyStore::new("/tmp/falcon");
        assert_eq!(store.root_cert_path(), PathBuf::from("/tmp/falcon/falcon.crt"));
        assert_eq!(store.root_key_path(), PathBuf::from("/tmp/falcon/falcon.key"));
        assert_eq!(store.cache_dir(), Path::new("/tmp/falcon/certs"));

        let paths = store.paths_for("example.localtest.me").unwrap();
        assert_eq!(
            paths.key_path,
            PathBuf::from("/tmp/falcon/certs/example.localtest.me.key")
        );
        assert_eq!(
            paths.cert_path,
            PathBuf::from("/tmp/falcon/certs/example.localtest.me.crt")
        );
    }

    #[test]
    fn open_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("nested").join("falcon");

        let store = KeyStore::open(Some(&root));
        assert_eq!(store.root_dir(), root.as_path());
        assert!(root.is_dir());
        assert!(root.join(LEAF_CACHE_DIRNAME).is_dir());
    }

    #[test]
    fn explicit_root_wins() {
        assert_eq!(
            resolve_root_dir(Some(Path::new("/srv/certs"))),
            PathBuf::from("/srv/certs")
        );
    }

    #[test]
    fn hostnames_are_normalized() {
        assert_eq!(normalize_hostname("Example.COM").unwrap(), "example.com");
        assert_eq!(normalize_hostname(" example.com. ").unwrap(), "example.com");
        assert_eq!(normalize_hostname("127.0.0.1").unwrap(), "127.0.0.1");
        assert_eq!(normalize_hostname("_dmarc.a-b.io").unwrap(), "_dmarc.a-b.io");
    }

    #[test]
    fn ipv6_literals_are_accepted() {
        assert_eq!(normalize_hostname("::1").unwrap(), "::1");
        assert_eq!(normalize_hostname("[::1]").unwrap(), "::1");
        assert_eq!(
            normalize_hostname("2001:DB8:0:0::1").unwrap(),
            "2001:db8::1"
        );
        assert!(normalize_hostname("fe80::1%eth0").is_err());
        assert!(normalize_hostname("[::1").is_err());

        let store = KeyStore::new("/tmp/falcon");
        let paths = store.paths_for("[2001:db8::1]").unwrap();
        assert_eq!(paths.hostname, "2001:db8::1");
        assert_eq!(
            paths.cert_path,
            PathBuf::from("/tmp/falcon/certs/2001+db8++1.crt")
        );
        assert_eq!(
            paths.key_path,
            PathBuf::from("/tmp/falcon/certs/2001+db8++1.key")
        );
    }

    #[test]
    fn traversal_hostnames_are_rejected() {
        for bad in [
            "",
            "..",
            "../etc/passwd",
            "a/b",
            "a\\b",
            ".hidden",
            "a..b",
            "-lead.com",
            "has space.com",
            "nul\0.com",
            "*.example.com",
            "example.com..",
            "example.com. .",
            ".",
        ] {
            assert!(
                matches!(normalize_hostname(bad), Err(CertError::InvalidHostname(_))),
                "{:?} should be rejected",
                bad
            );
        }
        assert!(normalize_hostname(&"a".repeat(254)).is_err());
    }

    #[tokio::test]
    async fn write_then_read_pair() {
        let temp_dir = TempDir::new().unwrap();
        let key = temp_dir.path().join("h.key");
        let cert = temp_dir.path().join("h.crt");

        assert!(read_pair(&key, &cert).await.unwrap().is_none());

        write_pair(&key, b"KEY", &cert, b"CERT").await.unwrap();
        let (k, c) = read_pair(&key, &cert).await.unwrap().unwrap();
        assert_eq!(k, b"KEY");
        assert_eq!(c, b"CERT");
        assert!(!temp_dir.path().join("h.key.tmp").exists());
    }

    #[tokio::test]
    async fn read_pair_requires_both_files() {
        let temp_dir = TempDir::new().unwrap();
        let key = temp_dir.path().join("h.key");
        let cert = temp_dir.path().join("h.crt");
        std::fs::write(&cert, b"CERT").unwrap();

        assert!(read_pair(&key, &cert).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_cache_dir_keeps_root_pair() {
        let temp_dir = TempDir::new().unwrap();
        let store = KeyStore::open(Some(temp_dir.path()));
        std::fs::write(store.root_key_path(), b"k").unwrap();
        std::fs::write(store.root_cert_path(), b"c").unwrap();
        std::fs::write(store.cache_dir().join("a.key"), b"k").unwrap();
        std::fs::write(store.cache_dir().join("a.crt"), b"c").unwrap();
        std::fs::create_dir(store.cache_dir().join("stray")).unwrap();

        assert_eq!(store.clear_cache_dir().await.unwrap(), 3);
        assert_eq!(std::fs::read_dir(store.cache_dir()).unwrap().count(), 0);
        assert!(store.root_pair_exists());
    }

    #[tokio::test]
    async fn clear_cache_dir_recreates_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let store = KeyStore::new(temp_dir.path());

        assert_eq!(store.clear_cache_dir().await.unwrap(), 0);
        assert!(store.cache_dir().is_dir());
    }

    #[tokio::test]
    async fn remove_root_pair_tolerates_missing_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = KeyStore::open(Some(temp_dir.path()));
        std::fs::write(store.root_key_path(), b"k").unwrap();

        store.remove_root_pair().await.unwrap();
        assert!(!store.root_key_path().exists());
        assert!(!store.root_pair_exists());
    }
}
