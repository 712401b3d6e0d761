//! Key pair and certificate generation.
//!
//! [`CertAuthority`] is the seam between certificate lifecycle management and
//! the X.509 primitives. [`RcgenAuthority`] is the built-in implementation.

use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};

use crate::config::CertAttrs;
use crate::error::AuthorityError;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// PEM-encoded private key and certificate.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyCertPair {
    /// Private key (PEM).
    pub private_key: String,
    /// Certificate (PEM).
    pub certificate: String,
}

impl std::fmt::Debug for KeyCertPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCertPair")
            .field("private_key", &"<redacted>")
            .field("certificate_len", &self.certificate.len())
            .finish()
    }
}

/// Produces root and leaf key material.
///
/// Implementations are called from blocking worker threads and may be slow.
pub trait CertAuthority: Send + Sync + 'static {
    /// Generates a fresh self-signed root CA for `common_name`.
    fn generate_root(&self, common_name: &str) -> Result<KeyCertPair, AuthorityError>;

    /// Issues a leaf certificate for `hostname`, signed by `root`.
    fn issue_leaf(&self, hostname: &str, root: &KeyCertPair)
        -> Result<KeyCertPair, AuthorityError>;
}

/// [`CertAuthority`] backed by rcgen with ECDSA P-256 keys.
#[derive(Debug, Clone)]
pub struct RcgenAuthority {
    attrs: CertAttrs,
    root_validity: Duration,
    leaf_validity: Duration,
}

impl RcgenAuthority {
    /// Creates an authority with the given subject attributes and validity
    /// periods (in days).
    pub fn new(attrs: CertAttrs, root_validity_days: u32, leaf_validity_days: u32) -> Self {
        Self {
            attrs,
            root_validity: Duration::from_secs(u64::from(root_validity_days) * SECS_PER_DAY),
            leaf_validity: Duration::from_secs(u64::from(leaf_validity_days) * SECS_PER_DAY),
        }
    }

    fn distinguished_name(&self, common_name: &str) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        if let Some(country) = &self.attrs.country {
            dn.push(DnType::CountryName, country.clone());
        }
        if let Some(state) = &self.attrs.state {
            dn.push(DnType::StateOrProvinceName, state.clone());
        }
        if let Some(organization) = &self.attrs.organization {
            dn.push(DnType::OrganizationName, organization.clone());
        }
        if let Some(unit) = &self.attrs.organizational_unit {
            dn.push(DnType::OrganizationalUnitName, unit.clone());
        }
        dn.push(DnType::CommonName, common_name.to_string());
        dn
    }

    fn root_params(&self, common_name: &str) -> CertificateParams {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.distinguished_name = self.distinguished_name(common_name);

        let now = SystemTime::now();
        params.not_before = (now - Duration::from_secs(SECS_PER_DAY)).into();
        params.not_after = (now + self.root_validity).into();
        params
    }

    fn leaf_params(&self, hostname: &str) -> Result<CertificateParams, AuthorityError> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.distinguished_name = self.distinguished_name(hostname);

        if let Ok(ip) = hostname.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(SanType::DnsName(hostname.try_into()?));
        }

        let now = SystemTime::now();
        params.not_before = (now - Duration::from_secs(SECS_PER_DAY)).into();
        params.not_after = (now + self.leaf_validity).into();
        Ok(params)
    }
}

impl Default for RcgenAuthority {
    fn default() -> Self {
        Self::new(CertAttrs::default(), 3650, 825)
    }
}

impl CertAuthority for RcgenAuthority {
    fn generate_root(&self, common_name: &str) -> Result<KeyCertPair, AuthorityError> {
        let key_pair = generate_key_pair()?;
        let cert = self.root_params(common_name).self_signed(&key_pair)?;

        Ok(KeyCertPair {
            private_key: key_pair.serialize_pem(),
            certificate: cert.pem(),
        })
    }

    fn issue_leaf(
        &self,
        hostname: &str,
        root: &KeyCertPair,
    ) -> Result<KeyCertPair, AuthorityError> {
        let root_key =
            KeyPair::from_pem(&root.private_key).map_err(|e| AuthorityError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&root.certificate, root_key)
            .map_err(|e| AuthorityError::Parse(e.to_string()))?;

        let leaf_key = generate_key_pair()?;
        let cert = self.leaf_params(hostname)?.signed_by(&leaf_key, &issuer)?;

        Ok(KeyCertPair {
            private_key: leaf_key.serialize_pem(),
            certificate: cert.pem(),
        })
    }
}

fn generate_key_pair() -> Result<KeyPair, AuthorityError> {
    KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| AuthorityError::KeyGeneration(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_root_produces_pem_pair() {
        let authority = RcgenAuthority::default();
        let root = authority.generate_root("Test Root").unwrap();

        assert!(root.private_key.contains("PRIVATE KEY"));
        assert!(root.certificate.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn issue_leaf_for_dns_name_and_ip() {
        let authority = RcgenAuthority::default();
        let root = authority.generate_root("Test Root").unwrap();

        let leaf = authority.issue_leaf("example.localtest.me", &root).unwrap();
        assert!(leaf.certificate.contains("BEGIN CERTIFICATE"));
        assert_ne!(leaf.private_key, root.private_key);

        let ip_leaf = authority.issue_leaf("127.0.0.1", &root).unwrap();
        assert_ne!(ip_leaf.certificate, leaf.certificate);
    }

    #[test]
    fn issue_leaf_rejects_garbage_root() {
        let authority = RcgenAuthority::default();
        let root = KeyCertPair {
            private_key: "not a key".into(),
            certificate: "not a cert".into(),
        };

        let err = authority.issue_leaf("example.com", &root).unwrap_err();
        assert!(matches!(err, AuthorityError::Parse(_)));
    }

    #[test]
    fn debug_redacts_private_key() {
        let pair = KeyCertPair {
            private_key: "SECRET".into(),
            certificate: "CERT".into(),
        };
        assert!(!format!("{:?}", pair).contains("SECRET"));
    }
}
