//! Sigstore bundle verification for code provenance
//!
//! Proves that the enclave measurement statement was signed by a GitHub
//! Actions release-tag run of the expected repository:
//! 1. The Fulcio leaf certificate must chain to the compiled-in trust root.
//! 2. The DSSE envelope signature must verify under the leaf key.
//! 3. The leaf identity must satisfy the policy: GitHub's OIDC issuer, the
//!    expected workflow repository, and a `refs/tags/` workflow ref.
//! 4. The Rekor signed entry timestamp must verify under the log key.
//! 5. The in-toto payload must bind the expected release digest and carry
//!    the multiplatform measurement predicate.

use base64::Engine;
use der::asn1::ObjectIdentifier;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use x509_cert::Certificate;

use crate::attestation::types::{Measurement, PredicateType};
use crate::error::{Error, Result};
use crate::x509;

const TRUSTED_ROOT_JSON: &str = include_str!("../assets/trusted_root.json");

const GITHUB_OIDC_ISSUER: &str = "https://token.actions.githubusercontent.com";
const IN_TOTO_PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";
const TAG_REF_PATTERN: &str = "^refs/tags/";

// Fulcio certificate extension OIDs carrying the OIDC claims.
const OID_FULCIO_ISSUER: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.1");
const OID_GITHUB_WORKFLOW_REPOSITORY: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.5");
const OID_GITHUB_WORKFLOW_REF: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.6");

const OID_SIG_ECDSA_SHA256: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const OID_SIG_ECDSA_SHA384: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");

/// Trust material for Sigstore verification: the Fulcio CA certificates
/// and the Rekor transparency-log key.
pub struct TrustedRoot {
    ca_certificates: Vec<Certificate>,
    rekor_key_spki: Vec<u8>,
}

#[derive(Deserialize)]
struct TrustedRootJson {
    #[serde(rename = "certificateAuthorities")]
    certificate_authorities: Vec<CertificateAuthorityJson>,
    tlogs: Vec<TlogJson>,
}

#[derive(Deserialize)]
struct CertificateAuthorityJson {
    #[serde(rename = "certChain")]
    cert_chain: CertChainJson,
}

#[derive(Deserialize)]
struct CertChainJson {
    certificates: Vec<RawBytesJson>,
}

#[derive(Deserialize)]
struct TlogJson {
    #[serde(rename = "publicKey")]
    public_key: RawBytesJson,
}

#[derive(Deserialize)]
struct RawBytesJson {
    #[serde(rename = "rawBytes")]
    raw_bytes: String,
}

/// The compiled-in trust root, avoiding a TUF fetch at verification time.
pub fn load_trusted_root() -> Result<TrustedRoot> {
    load_trusted_root_from_str(TRUSTED_ROOT_JSON)
}

pub(crate) fn trusted_root_json() -> &'static str {
    TRUSTED_ROOT_JSON
}

/// Parse a Sigstore trusted-root JSON document.
pub fn load_trusted_root_from_str(json: &str) -> Result<TrustedRoot> {
    let parsed: TrustedRootJson = serde_json::from_str(json)
        .map_err(|e| Error::attestation_caused_by("failed to parse Sigstore trusted root", e))?;

    let mut ca_certificates = Vec::new();
    for authority in &parsed.certificate_authorities {
        for raw in &authority.cert_chain.certificates {
            let der = decode_b64(&raw.raw_bytes, "trusted root certificate")?;
            ca_certificates.push(x509::parse_der(&der, "trusted root CA")?);
        }
    }
    if ca_certificates.is_empty() {
        return Err(Error::attestation("trusted root contains no certificate authorities"));
    }

    let rekor_key_spki = parsed
        .tlogs
        .first()
        .map(|tlog| decode_b64(&tlog.public_key.raw_bytes, "Rekor public key"))
        .transpose()?
        .ok_or_else(|| Error::attestation("trusted root contains no transparency log"))?;

    Ok(TrustedRoot {
        ca_certificates,
        rekor_key_spki,
    })
}

/// Verify a Sigstore bundle against an expected release digest and GitHub
/// repository, returning the measurement it attests to.
pub fn verify_bundle(
    bundle: &Value,
    expected_digest: &str,
    repo: &str,
    trust: &TrustedRoot,
) -> Result<Measurement> {
    let leaf = extract_leaf_certificate(bundle)?;

    verify_leaf_chains_to_root(&leaf, trust)?;
    verify_certificate_identity(&leaf, repo)?;

    let envelope = extract_envelope(bundle)?;
    let payload = verify_envelope_signature(&x509::spki_der(&leaf)?, &envelope)?;

    verify_rekor_entry(bundle, trust)?;

    if envelope.payload_type != IN_TOTO_PAYLOAD_TYPE {
        return Err(Error::attestation(format!(
            "unsupported DSSE payload type {:?}",
            envelope.payload_type
        )));
    }

    let measurement = extract_measurement(&payload, expected_digest)?;
    tracing::info!(
        repo,
        measurement = %measurement.fingerprint(),
        "sigstore bundle verified"
    );
    Ok(measurement)
}

#[derive(Debug, Deserialize)]
struct DsseEnvelope {
    #[serde(rename = "payloadType")]
    payload_type: String,
    payload: String,
    signatures: Vec<DsseSignature>,
}

#[derive(Debug, Deserialize)]
struct DsseSignature {
    sig: String,
}

/// DSSE Pre-Authentication Encoding:
/// `"DSSEv1" SP LEN(type) SP type SP LEN(body) SP body`.
fn pre_authentication_encoding(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut pae = Vec::with_capacity(payload.len() + payload_type.len() + 32);
    pae.extend_from_slice(b"DSSEv1 ");
    pae.extend_from_slice(payload_type.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload_type.as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload);
    pae
}

fn decode_b64(value: &str, what: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| Error::attestation_caused_by(format!("failed to decode {what}"), e))
}

fn extract_leaf_certificate(bundle: &Value) -> Result<Certificate> {
    let material = bundle
        .get("verificationMaterial")
        .ok_or_else(|| Error::attestation("bundle has no verificationMaterial"))?;

    let raw = material
        .pointer("/certificate/rawBytes")
        .or_else(|| material.pointer("/x509CertificateChain/certificates/0/rawBytes"))
        .and_then(Value::as_str)
        .ok_or_else(|| Error::attestation("bundle has no signing certificate"))?;

    let der = decode_b64(raw, "signing certificate")?;
    x509::parse_der(&der, "Fulcio leaf")
}

fn verify_leaf_chains_to_root(leaf: &Certificate, trust: &TrustedRoot) -> Result<()> {
    let tbs = x509::tbs_der(leaf)?;
    let signature = x509::signature_bytes(leaf);
    let sig_oid = leaf.signature_algorithm.oid;

    for ca in &trust.ca_certificates {
        let ca_spki = x509::spki_der(ca)?;
        let verified = if sig_oid == OID_SIG_ECDSA_SHA384 {
            x509::verify_ecdsa_p384_der(&ca_spki, &tbs, &signature, "Fulcio leaf").is_ok()
        } else if sig_oid == OID_SIG_ECDSA_SHA256 {
            x509::verify_ecdsa_p256(&ca_spki, &tbs, &signature, "Fulcio leaf").is_ok()
        } else {
            false
        };
        if verified {
            return Ok(());
        }
    }

    Err(Error::attestation(
        "signing certificate does not chain to the Sigstore trust root",
    ))
}

fn extension_string(cert: &Certificate, oid: &ObjectIdentifier) -> Option<String> {
    let ext = x509::extension(cert, oid)?;
    String::from_utf8(ext.extn_value.as_bytes().to_vec()).ok()
}

/// Enforce the certificate identity policy:
/// `AllOf(issuer == GitHub OIDC, workflow repository == repo,
/// workflow ref matches ^refs/tags/)`.
fn verify_certificate_identity(cert: &Certificate, repo: &str) -> Result<()> {
    let issuer = extension_string(cert, &OID_FULCIO_ISSUER)
        .ok_or_else(|| Error::attestation("signing certificate has no OIDC issuer extension"))?;
    if issuer != GITHUB_OIDC_ISSUER {
        return Err(Error::attestation(format!(
            "certificate issuer {issuer:?} is not GitHub Actions"
        )));
    }

    let repository = extension_string(cert, &OID_GITHUB_WORKFLOW_REPOSITORY)
        .ok_or_else(|| Error::attestation("signing certificate has no workflow repository"))?;
    if repository != repo {
        return Err(Error::attestation(format!(
            "certificate repository {repository:?} does not match {repo:?}"
        )));
    }

    let workflow_ref = extension_string(cert, &OID_GITHUB_WORKFLOW_REF)
        .ok_or_else(|| Error::attestation("signing certificate has no workflow ref"))?;
    let tag_ref = Regex::new(TAG_REF_PATTERN).expect("static pattern");
    if !tag_ref.is_match(&workflow_ref) {
        return Err(Error::attestation(format!(
            "certificate workflow ref {workflow_ref:?} is not a release tag"
        )));
    }

    Ok(())
}

fn extract_envelope(bundle: &Value) -> Result<DsseEnvelope> {
    let envelope = bundle
        .get("dsseEnvelope")
        .ok_or_else(|| Error::attestation("bundle has no dsseEnvelope"))?;
    serde_json::from_value(envelope.clone())
        .map_err(|e| Error::attestation_caused_by("malformed DSSE envelope", e))
}

/// Verify the envelope signature over the PAE and return the decoded
/// payload bytes.
fn verify_envelope_signature(leaf_spki_der: &[u8], envelope: &DsseEnvelope) -> Result<Vec<u8>> {
    let payload = decode_b64(&envelope.payload, "DSSE payload")?;

    let signature = envelope
        .signatures
        .first()
        .ok_or_else(|| Error::attestation("DSSE envelope has no signatures"))?;
    let signature = decode_b64(&signature.sig, "DSSE signature")?;

    let pae = pre_authentication_encoding(&envelope.payload_type, &payload);
    x509::verify_ecdsa_p256(leaf_spki_der, &pae, &signature, "DSSE envelope")?;

    Ok(payload)
}

/// Verify the Rekor signed entry timestamp: the log key in the trust root
/// must have signed the canonicalized `{body, integratedTime, logID,
/// logIndex}` record.
fn verify_rekor_entry(bundle: &Value, trust: &TrustedRoot) -> Result<()> {
    let entry = bundle
        .pointer("/verificationMaterial/tlogEntries/0")
        .ok_or_else(|| Error::attestation("bundle has no transparency log entry"))?;

    let body = entry
        .get("canonicalizedBody")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::attestation("log entry has no canonicalized body"))?;
    let integrated_time = json_i64(entry.get("integratedTime"))
        .ok_or_else(|| Error::attestation("log entry has no integrated time"))?;
    let log_index = json_i64(entry.get("logIndex"))
        .ok_or_else(|| Error::attestation("log entry has no log index"))?;

    let key_id = entry
        .pointer("/logId/keyId")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::attestation("log entry has no log ID"))?;
    let key_id = decode_b64(key_id, "log key ID")?;
    let expected_key_id = Sha256::digest(&trust.rekor_key_spki);
    if key_id != expected_key_id.as_slice() {
        return Err(Error::attestation("log entry was not issued by the trusted Rekor log"));
    }

    let set = entry
        .pointer("/inclusionPromise/signedEntryTimestamp")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::attestation("log entry has no signed entry timestamp"))?;
    let set = decode_b64(set, "signed entry timestamp")?;

    let payload = canonical_set_payload(body, integrated_time, &hex::encode(key_id), log_index);
    x509::verify_ecdsa_p256(&trust.rekor_key_spki, payload.as_bytes(), &set, "Rekor entry")
}

fn json_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// RFC 8785-style canonical form of the SET payload; serde_json's default
/// map ordering is lexicographic, which matches.
fn canonical_set_payload(body: &str, integrated_time: i64, log_id: &str, log_index: i64) -> String {
    serde_json::to_string(&serde_json::json!({
        "body": body,
        "integratedTime": integrated_time,
        "logID": log_id,
        "logIndex": log_index,
    }))
    .expect("static JSON shape")
}

#[derive(Debug, Deserialize)]
struct InTotoStatement {
    #[serde(rename = "_type")]
    _statement_type: String,
    subject: Vec<InTotoSubject>,
    #[serde(rename = "predicateType")]
    predicate_type: String,
    predicate: Value,
}

#[derive(Debug, Deserialize)]
struct InTotoSubject {
    digest: std::collections::HashMap<String, String>,
}

/// Parse the in-toto statement, bind it to the release digest, and pull
/// out the SNP measurement register.
fn extract_measurement(payload: &[u8], expected_digest: &str) -> Result<Measurement> {
    let statement: InTotoStatement = serde_json::from_slice(payload)
        .map_err(|e| Error::attestation_caused_by("failed to parse in-toto statement", e))?;

    let subject_digest = statement
        .subject
        .first()
        .and_then(|subject| subject.digest.get("sha256"))
        .ok_or_else(|| Error::attestation("in-toto statement has no sha256 subject digest"))?;
    if !subject_digest.eq_ignore_ascii_case(expected_digest) {
        return Err(Error::attestation(format!(
            "statement digest mismatch: expected {expected_digest}, signed {subject_digest}"
        )));
    }

    if statement.predicate_type != PredicateType::SnpTdxMultiplatformV1.as_uri() {
        return Err(Error::attestation(format!(
            "unsupported predicate type {:?}",
            statement.predicate_type
        )));
    }

    let snp_measurement = statement
        .predicate
        .get("snp_measurement")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::attestation("predicate has no snp_measurement"))?;

    Ok(Measurement {
        predicate: PredicateType::SnpTdxMultiplatformV1,
        registers: vec![snp_measurement.to_string()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, CustomExtension, KeyPair, PKCS_ECDSA_P256_SHA256};

    #[test]
    fn pae_matches_the_dsse_spec_vector() {
        let pae = pre_authentication_encoding("http://example.com/HelloWorld", b"hello world");
        assert_eq!(
            pae,
            b"DSSEv1 29 http://example.com/HelloWorld 11 hello world"
        );
    }

    fn fulcio_style_cert(issuer: &str, repository: &str, workflow_ref: &str) -> Certificate {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::default();
        params.custom_extensions = vec![
            CustomExtension::from_oid_content(
                &[1, 3, 6, 1, 4, 1, 57264, 1, 1],
                issuer.as_bytes().to_vec(),
            ),
            CustomExtension::from_oid_content(
                &[1, 3, 6, 1, 4, 1, 57264, 1, 5],
                repository.as_bytes().to_vec(),
            ),
            CustomExtension::from_oid_content(
                &[1, 3, 6, 1, 4, 1, 57264, 1, 6],
                workflow_ref.as_bytes().to_vec(),
            ),
        ];
        let cert = params.self_signed(&key_pair).unwrap();
        x509::parse_der(cert.der(), "test").unwrap()
    }

    #[test]
    fn identity_policy_accepts_a_release_tag_run() {
        let cert = fulcio_style_cert(
            GITHUB_OIDC_ISSUER,
            "tinfoilsh/confidential-inference",
            "refs/tags/v1.2.3",
        );
        verify_certificate_identity(&cert, "tinfoilsh/confidential-inference").unwrap();
    }

    #[test]
    fn identity_policy_rejects_wrong_issuer() {
        let cert = fulcio_style_cert(
            "https://accounts.example.com",
            "tinfoilsh/confidential-inference",
            "refs/tags/v1.2.3",
        );
        let err =
            verify_certificate_identity(&cert, "tinfoilsh/confidential-inference").unwrap_err();
        assert!(err.to_string().contains("issuer"));
    }

    #[test]
    fn identity_policy_rejects_wrong_repository() {
        let cert = fulcio_style_cert(GITHUB_OIDC_ISSUER, "someone/else", "refs/tags/v1.2.3");
        let err =
            verify_certificate_identity(&cert, "tinfoilsh/confidential-inference").unwrap_err();
        assert!(err.to_string().contains("repository"));
    }

    #[test]
    fn identity_policy_rejects_non_tag_refs() {
        let cert = fulcio_style_cert(
            GITHUB_OIDC_ISSUER,
            "tinfoilsh/confidential-inference",
            "refs/heads/main",
        );
        let err =
            verify_certificate_identity(&cert, "tinfoilsh/confidential-inference").unwrap_err();
        assert!(err.to_string().contains("release tag"));
    }

    #[test]
    fn envelope_signature_round_trip() {
        use p256::ecdsa::signature::Signer;
        use p256::ecdsa::{Signature, SigningKey};
        use p256::pkcs8::EncodePublicKey;

        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        let spki = signing_key
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .into_vec();

        let payload = br#"{"hello":"world"}"#;
        let payload_b64 = base64::engine::general_purpose::STANDARD.encode(payload);
        let pae = pre_authentication_encoding(IN_TOTO_PAYLOAD_TYPE, payload);
        let signature: Signature = signing_key.sign(&pae);

        let envelope = DsseEnvelope {
            payload_type: IN_TOTO_PAYLOAD_TYPE.to_string(),
            payload: payload_b64,
            signatures: vec![DsseSignature {
                sig: base64::engine::general_purpose::STANDARD.encode(signature.to_der()),
            }],
        };

        let recovered = verify_envelope_signature(&spki, &envelope).unwrap();
        assert_eq!(recovered, payload);

        let mut tampered = envelope;
        tampered.payload =
            base64::engine::general_purpose::STANDARD.encode(br#"{"hello":"tampered"}"#);
        assert!(verify_envelope_signature(&spki, &tampered).is_err());
    }

    fn statement_json(digest: &str, predicate_type: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "_type": "https://in-toto.io/Statement/v1",
            "subject": [{"name": "tinfoil.eif", "digest": {"sha256": digest}}],
            "predicateType": predicate_type,
            "predicate": {"snp_measurement": "ab".repeat(48)},
        }))
        .unwrap()
    }

    #[test]
    fn statement_digest_comparison_is_case_insensitive() {
        let digest = "AB".repeat(32);
        let payload = statement_json(&digest, PredicateType::SnpTdxMultiplatformV1.as_uri());

        let measurement = extract_measurement(&payload, &digest.to_lowercase()).unwrap();
        assert_eq!(measurement.predicate, PredicateType::SnpTdxMultiplatformV1);
        assert_eq!(measurement.registers, vec!["ab".repeat(48)]);
    }

    #[test]
    fn statement_digest_mismatch_fails() {
        let payload = statement_json(
            &"ab".repeat(32),
            PredicateType::SnpTdxMultiplatformV1.as_uri(),
        );
        let err = extract_measurement(&payload, &"aa".repeat(32)).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[test]
    fn unsupported_predicate_type_fails() {
        let digest = "ab".repeat(32);
        let payload = statement_json(&digest, "https://tinfoil.sh/predicate/sev-snp-guest/v2");
        let err = extract_measurement(&payload, &digest).unwrap_err();
        assert!(err.to_string().contains("predicate type"));
    }

    #[test]
    fn canonical_set_payload_is_key_sorted_and_compact() {
        let payload = canonical_set_payload("Ym9keQ==", 1716000000, "aabb", 42);
        assert_eq!(
            payload,
            r#"{"body":"Ym9keQ==","integratedTime":1716000000,"logID":"aabb","logIndex":42}"#
        );
    }

    #[test]
    fn json_i64_accepts_numbers_and_strings() {
        assert_eq!(json_i64(Some(&serde_json::json!(7))), Some(7));
        assert_eq!(json_i64(Some(&serde_json::json!("7"))), Some(7));
        assert_eq!(json_i64(Some(&serde_json::json!(true))), None);
        assert_eq!(json_i64(None), None);
    }
}
