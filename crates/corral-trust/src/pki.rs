//! PKI operations for cluster certificate authorities
//!
//! This module handles CA generation and CSR signing. The conductor acts
//! as a CA per cluster and signs CSRs submitted by cluster components
//! and users - it never sees their private keys.

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use corral_common::config::KeyProfile;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Invalid CSR
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// CSR public key below the configured strength floor
    #[error("CSR key too weak: {0}")]
    WeakKey(String),

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
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Compute certificate validity from now
fn compute_validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(days))
}

fn generate_key(profile: KeyProfile) -> Result<KeyPair> {
    let result = match profile {
        KeyProfile::P256 => KeyPair::generate(),
        KeyProfile::P384 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384),
    };
    result.map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate key: {}", e)))
}

/// Certificate Authority for one cluster
///
/// The key pair is held serialized as PEM since `KeyPair` is not `Clone`;
/// it is re-parsed for each signing operation.
#[derive(Clone)]
pub struct CertificateAuthority {
    ca_key_pem: String,
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str, profile: KeyProfile, validity_days: i64) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Corral".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(validity_days);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = generate_key(profile)?;
        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a CA from PEM material
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let _ = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        let _ = parse_pem(cert_pem)?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// The CA certificate in PEM format (for distribution)
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// The CA private key in PEM format (for encrypted persistence)
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Generate a server certificate for the cluster API endpoint.
    ///
    /// Returns `(cert_pem, key_pem)`. SANs accept both DNS names and IP
    /// addresses; the API address of a fresh cluster is usually an IP.
    pub fn issue_server_cert(
        &self,
        common_name: &str,
        sans: &[&str],
        profile: KeyProfile,
        validity_days: i64,
    ) -> Result<(String, String)> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Corral".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let (not_before, not_after) = compute_validity(validity_days);
        params.not_before = not_before;
        params.not_after = not_after;

        params.subject_alt_names = sans
            .iter()
            .map(|san| {
                if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(san.to_string())
                        .map(SanType::DnsName)
                        .map_err(|e| {
                            PkiError::CertificateGenerationFailed(format!(
                                "invalid DNS name '{}': {}",
                                san, e
                            ))
                        })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let server_key = generate_key(profile)?;
        let server_key_pem = server_key.serialize_pem();

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
        let server_cert = params.signed_by(&server_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign server cert: {}", e))
        })?;

        Ok((server_cert.pem(), server_key_pem))
    }

    /// Sign a CSR and return the signed certificate in PEM format.
    ///
    /// The subject and validity are overridden by the CA; the requester
    /// only contributes the public key. Key usage is pinned to TLS
    /// client/server authentication regardless of what the CSR asked for.
    pub fn sign_csr(&self, csr_pem: &str, common_name: &str, validity_days: i64) -> Result<String> {
        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Corral".to_string()),
        );
        csr_params.params.distinguished_name = dn;

        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![
            rcgen::ExtendedKeyUsagePurpose::ClientAuth,
            rcgen::ExtendedKeyUsagePurpose::ServerAuth,
        ];

        let (not_before, not_after) = compute_validity(validity_days);
        csr_params.params.not_before = not_before;
        csr_params.params.not_after = not_after;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
        let signed_cert = csr_params.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;

        Ok(signed_cert.pem())
    }
}

/// Validate the strength of the public key carried by a CSR.
///
/// RSA keys must meet `min_rsa_bits`; EC keys on P-256/P-384 pass. The
/// check runs before any signing so weak keys are rejected without
/// touching the CA.
pub fn validate_csr_strength(csr_pem: &str, min_rsa_bits: usize) -> Result<()> {
    let der = parse_pem(csr_pem)?;
    let (_, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;

    let spki = &csr.certification_request_info.subject_pki;
    match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => {
            let bits = rsa.key_size();
            if bits < min_rsa_bits {
                return Err(PkiError::WeakKey(format!(
                    "RSA key is {} bits, minimum is {}",
                    bits, min_rsa_bits
                )));
            }
            Ok(())
        }
        Ok(PublicKey::EC(point)) => {
            // P-256 is the smallest curve we accept
            if point.key_size() < 256 {
                return Err(PkiError::WeakKey(format!(
                    "EC key is {} bits, minimum is 256",
                    point.key_size()
                )));
            }
            Ok(())
        }
        Ok(_) => Err(PkiError::InvalidCsr(
            "unsupported public key algorithm".to_string(),
        )),
        Err(e) => Err(PkiError::InvalidCsr(format!(
            "cannot parse CSR public key: {}",
            e
        ))),
    }
}

/// Verify that `cert_pem` was signed by `ca_cert_pem`.
///
/// Used by tests and by operators checking a returned chain; not on the
/// serving path.
pub fn verify_signed_by(cert_pem: &str, ca_cert_pem: &str) -> Result<bool> {
    let cert_der = parse_pem(cert_pem)?;
    let ca_der = parse_pem(ca_cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
    let (_, ca) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA certificate: {}", e)))?;
    Ok(cert.verify_signature(Some(ca.public_key())).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csr_pem() -> (String, KeyPair) {
        // Generate a CSR the way a cluster component would: locally held
        // key, only the request leaves the node.
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::default();
        let csr = params.serialize_request(&key).unwrap();
        (csr.pem().unwrap(), key)
    }

    #[test]
    fn ca_self_signs() {
        let ca = CertificateAuthority::new("test-cluster", KeyProfile::P256, 3650).unwrap();
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(ca.ca_key_pem().contains("PRIVATE KEY"));
        // Self-signed: the CA verifies its own signature
        assert!(verify_signed_by(ca.ca_cert_pem(), ca.ca_cert_pem()).unwrap());
    }

    #[test]
    fn ca_round_trips_through_pem() {
        let ca = CertificateAuthority::new("test-cluster", KeyProfile::P256, 3650).unwrap();
        let loaded = CertificateAuthority::from_pem(ca.ca_cert_pem(), ca.ca_key_pem()).unwrap();
        assert_eq!(loaded.ca_cert_pem(), ca.ca_cert_pem());
    }

    #[test]
    fn p384_profile_generates() {
        let ca = CertificateAuthority::new("test-cluster", KeyProfile::P384, 3650).unwrap();
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn server_cert_signed_by_ca() {
        let ca = CertificateAuthority::new("test-cluster", KeyProfile::P256, 3650).unwrap();
        let (cert, key) = ca
            .issue_server_cert(
                "api.test-cluster",
                &["192.0.2.10", "api.test-cluster.example"],
                KeyProfile::P256,
                365,
            )
            .unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("PRIVATE KEY"));
        assert!(verify_signed_by(&cert, ca.ca_cert_pem()).unwrap());
    }

    #[test]
    fn csr_signing_round_trip() {
        let ca = CertificateAuthority::new("test-cluster", KeyProfile::P256, 3650).unwrap();
        let (csr, _key) = csr_pem();

        validate_csr_strength(&csr, 2048).unwrap();
        let signed = ca.sign_csr(&csr, "member-of-test-cluster", 30).unwrap();
        assert!(signed.contains("BEGIN CERTIFICATE"));
        assert!(verify_signed_by(&signed, ca.ca_cert_pem()).unwrap());
        // Not signed by an unrelated CA
        let other = CertificateAuthority::new("other", KeyProfile::P256, 3650).unwrap();
        assert!(!verify_signed_by(&signed, other.ca_cert_pem()).unwrap());
    }

    #[test]
    fn garbage_csr_rejected() {
        let err = validate_csr_strength("not a csr", 2048).unwrap_err();
        assert!(matches!(err, PkiError::ParseError(_) | PkiError::InvalidCsr(_)));

        let ca = CertificateAuthority::new("test-cluster", KeyProfile::P256, 3650).unwrap();
        assert!(ca.sign_csr("not a csr", "cn", 30).is_err());
    }
}
