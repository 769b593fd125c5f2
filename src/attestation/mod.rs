//! AMD SEV-SNP attestation verification
//!
//! Verifying a document proves three things: the report was produced by
//! genuine AMD hardware (certificate chain + report signature), the
//! hardware is in an acceptable state (policy validation), and the report
//! binds the enclave's transport keys (report data carries the TLS key
//! fingerprint and the HPKE public key).

pub mod chain;
pub mod policy;
pub mod report;
pub mod types;

pub use chain::CertificateChain;
pub use policy::{GuestPolicyRequirement, PlatformInfoRequirement, ValidationOptions};
pub use report::{Report, SigningKey, SnpPlatformInfo, SnpPolicy, TcbVersion};
pub use types::{hash_attestation_document, AttestationDocument, Measurement, PredicateType};

use std::time::SystemTime;

use crate::error::Result;
use crate::util;

/// Outcome of a successful attestation verification.
#[derive(Debug, Clone)]
pub struct AttestationResponse {
    /// Hex SHA-256 of the enclave's TLS public key (report data bytes 0..32).
    pub tls_public_key_fingerprint: String,

    /// Hex of the enclave's HPKE public key (report data bytes 32..64).
    pub hpke_public_key: String,

    /// Launch measurement registers.
    pub measurement: Measurement,
}

/// Verify an attestation document end to end with the default policy.
///
/// Decompresses the body, parses the report, builds and verifies the
/// ARK→ASK→VCEK chain, binds the VCEK to the report (TCB and HWID),
/// verifies the report signature, and validates the report against
/// [`ValidationOptions::default`]. When `vcek_der` is not supplied the
/// VCEK is fetched from the KDS proxy; the ASK chain always comes from
/// the KDS proxy here and is proven under the pinned ARK during chain
/// verification.
pub async fn verify_attestation(
    doc: &AttestationDocument,
    vcek_der: Option<&[u8]>,
) -> Result<AttestationResponse> {
    let report_bytes = util::decode_document_body(&doc.body)?;
    let report = Report::parse(&report_bytes)?;

    let fetched;
    let vcek_der = match vcek_der {
        Some(der) => der,
        None => {
            fetched = crate::fetcher::fetch_vcek_der(&report).await?;
            &fetched
        }
    };

    let cert_chain_pem = crate::fetcher::fetch_cert_chain_pem(&report).await?;
    verify_parsed_report(doc.format, &report, vcek_der, &cert_chain_pem)
}

/// Chain, binding, signature, and policy checks over an already-parsed
/// report. Synchronous; everything needed is in hand.
pub(crate) fn verify_parsed_report(
    format: PredicateType,
    report: &Report,
    vcek_der: &[u8],
    cert_chain_pem: &str,
) -> Result<AttestationResponse> {
    let chain = CertificateChain::from_report(report, vcek_der, cert_chain_pem)?;
    verify_with_chain(format, report, &chain)
}

pub(crate) fn verify_with_chain(
    format: PredicateType,
    report: &Report,
    chain: &CertificateChain,
) -> Result<AttestationResponse> {
    chain.verify(SystemTime::now())?;
    chain.verify_tcb_binding(report)?;
    chain.verify_hwid_binding(report)?;
    chain.verify_report_signature(report)?;

    policy::validate_report(report, &ValidationOptions::default())?;

    let report_data = report.report_data();
    let response = AttestationResponse {
        tls_public_key_fingerprint: hex::encode(&report_data[..32]),
        hpke_public_key: hex::encode(&report_data[32..]),
        measurement: Measurement {
            predicate: format,
            registers: vec![hex::encode(report.measurement())],
        },
    };

    tracing::info!(
        measurement = %response.measurement.fingerprint(),
        "hardware attestation verified"
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn garbage_body_fails_before_any_network_io() {
        let doc = AttestationDocument {
            format: PredicateType::SevGuestV2,
            body: "!!!not-base64!!!".to_string(),
        };
        let err = verify_attestation(&doc, Some(&[0u8; 8])).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Attestation { .. }));
    }

    #[tokio::test]
    async fn truncated_report_fails() {
        let doc = AttestationDocument {
            format: PredicateType::SevGuestV2,
            body: crate::util::encode_document_body(&[0u8; 100]),
        };
        let err = verify_attestation(&doc, Some(&[0u8; 8])).await.unwrap_err();
        assert!(err.to_string().contains("attestation"));
    }
}
