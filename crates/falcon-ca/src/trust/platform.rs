//! Native trust store probes.

use std::io;
use std::path::Path;

use async_trait::async_trait;

/// Queries the operating system's certificate store directly.
#[async_trait]
pub trait PlatformTrustProbe: Send + Sync {
    /// Returns whether the certificate at `root_cert_path` is a trusted root.
    async fn is_trusted(&self, root_cert_path: &Path) -> io::Result<bool>;
}

/// Asks `certutil -verify` whether the root chains to a trusted anchor.
#[cfg(target_os = "windows")]
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsCertStoreProbe;

#[cfg(target_os = "windows")]
#[async_trait]
impl PlatformTrustProbe for WindowsCertStoreProbe {
    async fn is_trusted(&self, root_cert_path: &Path) -> io::Result<bool> {
        const CREATE_NO_WINDOW: u32 = 0x08000000;

        let output = tokio::process::Command::new("certutil")
            .arg("-verify")
            .arg(root_cert_path)
            .creation_flags(CREATE_NO_WINDOW)
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(output.status.success() && !stdout.contains("CERT_TRUST_IS_UNTRUSTED_ROOT"))
    }
}
