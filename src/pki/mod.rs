//! PKI operations for notebook TLS certificates
//!
//! The operator acts as a certificate authority: it generates a CA key
//! pair at startup (or loads one) and signs a fresh server certificate
//! for every notebook that serves HTTPS. Reconciliation keeps an existing
//! secret's certificate only while it still verifies against the current
//! CA, so rotating the CA rotates every notebook certificate.

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use x509_parser::prelude::*;

const ORGANIZATION: &str = "jupyter-operator";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &[u8]) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data)
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// A freshly issued server certificate and its private key, PEM-encoded.
pub struct IssuedCertificate {
    /// Certificate in PEM format.
    pub cert_pem: String,
    /// Private key in PEM format.
    pub key_pem: String,
}

/// Certificate Authority for signing notebook server certificates
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (deserialized per signing operation
    /// since KeyPair isn't Clone)
    ca_key_pem: String,
    /// PEM-encoded CA certificate
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(ORGANIZATION.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        // 10 year validity
        params.not_before = rcgen::date_time_ymd(2025, 1, 1);
        params.not_after = rcgen::date_time_ymd(2035, 1, 1);

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        let ca_cert_pem = cert.pem();

        Ok(Self {
            ca_key_pem,
            ca_cert_pem,
        })
    }

    /// Load CA from PEM strings
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let _ = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        let _ = parse_pem(cert_pem.as_bytes())?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// Get the CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Get the CA private key in PEM format
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Load the key pair from stored PEM
    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Issue a server certificate for a notebook.
    ///
    /// Generates a fresh key pair and signs a certificate with the given
    /// common name and DNS subject alternative names.
    pub fn issue(&self, common_name: &str, dns_names: &[String]) -> Result<IssuedCertificate> {
        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate server key: {}", e))
        })?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(ORGANIZATION.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        // 5 year validity
        params.not_before = rcgen::date_time_ymd(2025, 1, 1);
        params.not_after = rcgen::date_time_ymd(2030, 1, 1);

        for name in dns_names {
            let san = Ia5String::try_from(name.clone()).map_err(|e| {
                PkiError::CertificateGenerationFailed(format!("invalid DNS name {name:?}: {}", e))
            })?;
            params.subject_alt_names.push(SanType::DnsName(san));
        }

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&key_pair, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Check whether a PEM-encoded certificate was signed by this CA.
    ///
    /// Any parse failure counts as "not ours"; the reconciler reacts by
    /// regenerating the certificate.
    pub fn is_issuer_of(&self, cert_pem: &[u8]) -> bool {
        let Ok(ca_der) = parse_pem(self.ca_cert_pem.as_bytes()) else {
            return false;
        };
        let Ok(cert_der) = parse_pem(cert_pem) else {
            return false;
        };
        let Ok((_, ca)) = X509Certificate::from_der(&ca_der) else {
            return false;
        };
        let Ok((_, cert)) = X509Certificate::from_der(&cert_der) else {
            return false;
        };
        cert.verify_signature(Some(ca.public_key())).is_ok()
    }
}
