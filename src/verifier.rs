//! Verification orchestrator
//!
//! Sequences the verification steps over an assembled bundle and keeps the
//! audit record: every step's outcome lands in the
//! [`VerificationDocument`], on success and on failure alike, so callers
//! can always answer "what exactly was checked, and where did it stop".

use base64::Engine;
use serde::Serialize;

use crate::attestation::types::{hash_attestation_document, Measurement};
use crate::attestation::{self, AttestationResponse, Report};
use crate::dcode;
use crate::error::{Error, Result};
use crate::fetcher::AttestationBundle;
use crate::sigstore;
use crate::util;
use crate::x509;

/// Trust material the orchestrator verifies against: the pinned AMD root
/// and the Sigstore trusted root. The defaults are the compiled-in
/// production anchors; deployments that pin refreshed material swap the
/// whole record. The ASK is never an anchor: it travels with the bundle
/// and must prove itself under the pinned ARK.
#[derive(Debug, Clone)]
pub struct TrustAnchors {
    pub ark_pem: String,
    pub trusted_root_json: String,
}

impl Default for TrustAnchors {
    fn default() -> Self {
        Self {
            ark_pem: attestation::chain::ARK_GENOA_PEM.to_string(),
            trusted_root_json: sigstore::trusted_root_json().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepState {
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepState {
    fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            error: None,
        }
    }

    fn mark_success(&mut self) {
        self.status = StepStatus::Success;
        self.error = None;
    }

    fn mark_failed(&mut self, error: &Error) {
        self.status = StepStatus::Failed;
        self.error = Some(error.to_string());
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSteps {
    pub fetch_digest: StepState,
    pub verify_code: StepState,
    pub verify_enclave: StepState,
    pub compare_measurements: StepState,
    pub verify_certificate: StepState,
}

/// The audit record of one verification pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationDocument {
    pub config_repo: String,
    pub enclave_host: String,
    pub release_digest: String,
    pub code_measurement: Option<Measurement>,
    pub enclave_measurement: Option<Measurement>,
    pub tls_public_key: String,
    pub hpke_public_key: String,
    pub code_fingerprint: String,
    pub enclave_fingerprint: String,
    pub selected_router_endpoint: Option<String>,
    pub security_verified: bool,
    pub steps: VerificationSteps,
}

impl VerificationDocument {
    fn new(config_repo: &str) -> Self {
        Self {
            config_repo: config_repo.to_string(),
            enclave_host: String::new(),
            release_digest: String::new(),
            code_measurement: None,
            enclave_measurement: None,
            tls_public_key: String::new(),
            hpke_public_key: String::new(),
            code_fingerprint: String::new(),
            enclave_fingerprint: String::new(),
            selected_router_endpoint: None,
            security_verified: false,
            steps: VerificationSteps {
                fetch_digest: StepState::pending(),
                verify_code: StepState::pending(),
                verify_enclave: StepState::pending(),
                compare_measurements: StepState::pending(),
                verify_certificate: StepState::pending(),
            },
        }
    }
}

/// Runs the verification sequence and owns the resulting document.
pub struct Verifier {
    config_repo: String,
    trust: TrustAnchors,
    document: VerificationDocument,
}

impl Verifier {
    pub fn new(config_repo: impl Into<String>) -> Self {
        Self::with_trust_anchors(config_repo, TrustAnchors::default())
    }

    pub fn with_trust_anchors(config_repo: impl Into<String>, trust: TrustAnchors) -> Self {
        let config_repo = config_repo.into();
        let document = VerificationDocument::new(&config_repo);
        Self {
            config_repo,
            trust,
            document,
        }
    }

    pub fn document(&self) -> &VerificationDocument {
        &self.document
    }

    pub(crate) fn set_selected_router(&mut self, endpoint: impl Into<String>) {
        self.document.selected_router_endpoint = Some(endpoint.into());
    }

    /// Record a bundle-assembly failure: verification never started, but
    /// the document still says where things stopped.
    pub(crate) fn mark_fetch_failed(&mut self, error: &Error) {
        self.document.steps.fetch_digest.mark_failed(error);
    }

    /// Verify a bundle, mutating the document as steps progress.
    ///
    /// Order: enclave hardware, code provenance, measurement comparison,
    /// then certificate binding. The first failure finalizes the document
    /// with `security_verified = false` and raises.
    pub fn verify_bundle(&mut self, bundle: &AttestationBundle) -> Result<AttestationResponse> {
        self.document.enclave_host = bundle.domain.clone();
        self.document.release_digest = bundle.digest.clone();
        // The assembler already resolved the digest.
        self.document.steps.fetch_digest.mark_success();

        let enclave = match self.verify_enclave(bundle) {
            Ok(response) => {
                self.document.steps.verify_enclave.mark_success();
                response
            }
            Err(err) => {
                self.document.steps.verify_enclave.mark_failed(&err);
                return Err(err);
            }
        };

        let code_measurement = match self.verify_code(bundle) {
            Ok(measurement) => {
                self.document.steps.verify_code.mark_success();
                measurement
            }
            Err(err) => {
                self.document.steps.verify_code.mark_failed(&err);
                return Err(err);
            }
        };

        if let Err(err) = code_measurement.equals(&enclave.measurement) {
            self.document.steps.compare_measurements.mark_failed(&err);
            return Err(err);
        }
        self.document.steps.compare_measurements.mark_success();

        if let Err(err) = verify_certificate_binding(bundle, &enclave) {
            self.document.steps.verify_certificate.mark_failed(&err);
            return Err(err);
        }
        self.document.steps.verify_certificate.mark_success();

        self.document.tls_public_key = enclave.tls_public_key_fingerprint.clone();
        self.document.hpke_public_key = enclave.hpke_public_key.clone();
        self.document.code_fingerprint = code_measurement.fingerprint();
        self.document.enclave_fingerprint = enclave.measurement.fingerprint();
        self.document.code_measurement = Some(code_measurement);
        self.document.enclave_measurement = Some(enclave.measurement.clone());
        self.document.security_verified = true;

        tracing::info!(
            enclave_host = %self.document.enclave_host,
            digest = %self.document.release_digest,
            "bundle verification complete"
        );
        Ok(enclave)
    }

    fn verify_enclave(&self, bundle: &AttestationBundle) -> Result<AttestationResponse> {
        let document = &bundle.enclave_attestation_report;
        let report_bytes = util::decode_document_body(&document.body)?;
        let report = Report::parse(&report_bytes)?;

        let vcek_der = base64::engine::general_purpose::STANDARD
            .decode(&bundle.vcek)
            .map_err(|e| Error::attestation_caused_by("invalid VCEK encoding in bundle", e))?;

        let chain = attestation::CertificateChain::from_report_with_roots(
            &report,
            &vcek_der,
            &bundle.cert_chain,
            &self.trust.ark_pem,
        )?;
        attestation::verify_with_chain(document.format, &report, &chain)
    }

    fn verify_code(&self, bundle: &AttestationBundle) -> Result<Measurement> {
        let trust = sigstore::load_trusted_root_from_str(&self.trust.trusted_root_json)?;
        sigstore::verify_bundle(
            &bundle.sigstore_bundle,
            &bundle.digest,
            &self.config_repo,
            &trust,
        )
    }
}

/// Bind the attested key material to the enclave's TLS certificate: the
/// bundle domain must match a SAN, the `.hpke.` SANs must decode to the
/// attested HPKE key, and the `.hatt.` SANs must decode to the document
/// hash.
fn verify_certificate_binding(
    bundle: &AttestationBundle,
    enclave: &AttestationResponse,
) -> Result<()> {
    let cert = x509::parse_pem_certificates(&bundle.enclave_cert, "enclave TLS")?
        .into_iter()
        .next()
        .ok_or_else(|| Error::attestation("enclave certificate PEM is empty"))?;

    let sans = x509::san_dns_names(&cert)?;

    if !dcode::domain_matches_sans(&sans, &bundle.domain) {
        return Err(Error::attestation(format!(
            "Certificate domain mismatch: {} is not covered by the certificate SANs",
            bundle.domain
        )));
    }

    let hpke_bytes = dcode::decode_from_sans(&sans, dcode::HPKE_PREFIX)?;
    if hex::encode(&hpke_bytes) != enclave.hpke_public_key {
        return Err(Error::attestation(
            "HPKE key mismatch: certificate SANs do not carry the attested HPKE key",
        ));
    }

    let hash_bytes = dcode::decode_from_sans(&sans, dcode::ATTESTATION_HASH_PREFIX)?;
    let expected_hash = hash_attestation_document(&bundle.enclave_attestation_report);
    if hash_bytes != expected_hash.as_bytes() {
        return Err(Error::attestation(
            "attestation document hash mismatch: certificate SANs do not match the served document",
        ));
    }

    Ok(())
}
