//! CA and TLS server certificate generation
//!
//! Both front-ends that terminate TLS mint their own PKI at startup: the
//! webhook serves the admission endpoint with a certificate whose CA bundle
//! goes into the webhook registration, and the proxy serves loopback TLS with
//! a certificate whose CA lands in the substitute `ca.crt`. Nothing is
//! persisted; a restart simply re-issues and re-publishes the CA.

use std::net::IpAddr;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// A freshly issued server certificate together with its issuing CA
#[derive(Debug, Clone)]
pub struct ServerCertificate {
    /// PEM-encoded server certificate
    pub cert_pem: String,
    /// PEM-encoded server private key
    pub key_pem: String,
    /// PEM-encoded CA certificate to distribute to clients
    pub ca_cert_pem: String,
}

/// Generate a self-signed CA and a server certificate issued by it
///
/// The server certificate carries the given DNS names and IP addresses as
/// SANs and is valid for TLS server auth only.
pub fn generate_server_certificate(
    common_name: &str,
    dns_names: &[&str],
    ip_addresses: &[IpAddr],
) -> Result<ServerCertificate> {
    let ca_key = KeyPair::generate()
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e)))?;

    let mut ca_params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(format!("{} CA", common_name)),
    );
    dn.push(DnType::OrganizationName, DnValue::Utf8String("MCA".to_string()));
    ca_params.distinguished_name = dn;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    // 10 year validity
    ca_params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    ca_params.not_after = rcgen::date_time_ymd(2034, 1, 1);

    let ca_cert = ca_params.self_signed(&ca_key).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
    })?;
    let ca_cert_pem = ca_cert.pem();

    let server_key = KeyPair::generate().map_err(|e| {
        PkiError::KeyGenerationFailed(format!("failed to generate server key: {}", e))
    })?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(DnType::OrganizationName, DnValue::Utf8String("MCA".to_string()));
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    params.not_after = rcgen::date_time_ymd(2034, 1, 1);

    params.subject_alt_names = Vec::with_capacity(dns_names.len() + ip_addresses.len());
    for name in dns_names {
        let ia5 = Ia5String::try_from(name.to_string())
            .map_err(|e| PkiError::ParseError(format!("invalid DNS name '{}': {}", name, e)))?;
        params.subject_alt_names.push(SanType::DnsName(ia5));
    }
    for addr in ip_addresses {
        params.subject_alt_names.push(SanType::IpAddress(*addr));
    }

    let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, &ca_key)
        .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

    let cert = params.signed_by(&server_key, &issuer).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to sign server cert: {}", e))
    })?;

    Ok(ServerCertificate {
        cert_pem: cert.pem(),
        key_pem: server_key.serialize_pem(),
        ca_cert_pem,
    })
}
