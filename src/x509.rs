//! X.509 helpers shared by the AMD chain, Sigstore, and TLS binding code
//!
//! Thin layer over `x509-cert`/`der`: distinguished-name access with
//! standard last-CN semantics, extension lookup by OID, inclusive validity
//! windows, TBS re-encoding, and the two signature algorithms this domain
//! uses (RSASSA-PSS/SHA-384 for the AMD CA chain, ECDSA for everything
//! else).

use std::time::SystemTime;

use der::asn1::{ObjectIdentifier, PrintableStringRef, Utf8StringRef};
use der::{Decode, Encode};
use sha2::{Digest, Sha256, Sha384};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::Certificate;

use crate::error::{Error, Result};

pub(crate) const OID_CN: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const OID_COUNTRY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");
const OID_LOCALITY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.7");
const OID_STATE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.8");
const OID_ORG: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
const OID_ORG_UNIT: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.11");

pub(crate) const OID_SUBJECT_ALT_NAME: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.5.29.17");
pub(crate) const OID_SIG_RSASSA_PSS: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.10");
pub(crate) const OID_EC_PUBLIC_KEY: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
pub(crate) const OID_SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

/// Parse a single DER certificate.
pub(crate) fn parse_der(der_bytes: &[u8], what: &str) -> Result<Certificate> {
    Certificate::from_der(der_bytes)
        .map_err(|e| Error::attestation_caused_by(format!("failed to parse {what} certificate"), e))
}

/// Parse every certificate in a PEM bundle, in order.
pub(crate) fn parse_pem_certificates(pem_text: &str, what: &str) -> Result<Vec<Certificate>> {
    let blocks = pem::parse_many(pem_text)
        .map_err(|e| Error::attestation_caused_by(format!("failed to parse {what} PEM"), e))?;

    blocks
        .iter()
        .map(|block| parse_der(block.contents(), what))
        .collect()
}

/// Re-encode the to-be-signed portion; signatures cover these exact bytes.
pub(crate) fn tbs_der(cert: &Certificate) -> Result<Vec<u8>> {
    cert.tbs_certificate
        .to_der()
        .map_err(|e| Error::attestation_caused_by("failed to encode TBS certificate", e))
}

pub(crate) fn signature_bytes(cert: &Certificate) -> Vec<u8> {
    cert.signature.raw_bytes().to_vec()
}

/// DER encoding of the full SubjectPublicKeyInfo.
pub(crate) fn spki_der(cert: &Certificate) -> Result<Vec<u8>> {
    cert.tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| Error::attestation_caused_by("failed to encode SPKI", e))
}

/// Hex SHA-256 over the SPKI DER, the fingerprint the enclave binds into
/// its attestation report.
pub(crate) fn spki_fingerprint_hex(cert: &Certificate) -> Result<String> {
    Ok(hex::encode(Sha256::digest(spki_der(cert)?)))
}

/// Look up an extension by OID.
pub(crate) fn extension<'a>(
    cert: &'a Certificate,
    oid: &ObjectIdentifier,
) -> Option<&'a Extension> {
    cert.tbs_certificate
        .extensions
        .as_ref()?
        .iter()
        .find(|ext| &ext.extn_id == oid)
}

/// Inclusive validity-window check.
pub(crate) fn valid_for_date(cert: &Certificate, now: SystemTime) -> bool {
    let validity = &cert.tbs_certificate.validity;
    validity.not_before.to_system_time() <= now && now <= validity.not_after.to_system_time()
}

fn attribute_string(value: &der::Any) -> Option<String> {
    let der_bytes = value.to_der().ok()?;
    if let Ok(s) = Utf8StringRef::from_der(&der_bytes) {
        return Some(s.as_str().to_string());
    }
    if let Ok(s) = PrintableStringRef::from_der(&der_bytes) {
        return Some(s.as_str().to_string());
    }
    std::str::from_utf8(value.value())
        .ok()
        .map(|s| s.to_string())
}

/// All values for one attribute type, in DN order.
pub(crate) fn dn_values(name: &Name, oid: &ObjectIdentifier) -> Vec<String> {
    let mut values = Vec::new();
    for rdn in name.0.iter() {
        for atv in rdn.0.iter() {
            if &atv.oid == oid {
                if let Some(s) = attribute_string(&atv.value) {
                    values.push(s);
                }
            }
        }
    }
    values
}

/// The last CN in the DN, matching standard X.509 lookup semantics.
pub(crate) fn dn_common_name(name: &Name) -> Option<String> {
    dn_values(name, &OID_CN).pop()
}

/// Whether a DN names AMD's canonical Santa Clara identity.
pub(crate) fn dn_is_amd(name: &Name) -> bool {
    dn_values(name, &OID_COUNTRY) == ["US"]
        && dn_values(name, &OID_LOCALITY) == ["Santa Clara"]
        && dn_values(name, &OID_STATE) == ["CA"]
        && dn_values(name, &OID_ORG) == ["Advanced Micro Devices"]
        && dn_values(name, &OID_ORG_UNIT) == ["Engineering"]
}

/// Extract the SAN DNS names from a certificate, in order.
pub(crate) fn san_dns_names(cert: &Certificate) -> Result<Vec<String>> {
    let Some(ext) = extension(cert, &OID_SUBJECT_ALT_NAME) else {
        return Ok(Vec::new());
    };

    let san = SubjectAltName::from_der(ext.extn_value.as_bytes())
        .map_err(|e| Error::attestation_caused_by("failed to parse subjectAltName", e))?;

    Ok(san
        .0
        .into_iter()
        .filter_map(|general_name| match general_name {
            GeneralName::DnsName(name) => Some(name.to_string()),
            _ => None,
        })
        .collect())
}

/// Verify an RSASSA-PSS SHA-384 signature (the AMD CA chain algorithm).
pub(crate) fn verify_rsa_pss_sha384(
    signer_spki_der: &[u8],
    message: &[u8],
    signature: &[u8],
    context: &str,
) -> Result<()> {
    use rsa::pkcs8::DecodePublicKey;
    use rsa::pss::{Signature, VerifyingKey};
    use rsa::signature::Verifier;
    use rsa::RsaPublicKey;

    let rsa_pubkey = RsaPublicKey::from_public_key_der(signer_spki_der)
        .map_err(|e| Error::attestation_caused_by(format!("invalid RSA key for {context}"), e))?;

    let verifying_key: VerifyingKey<Sha384> = VerifyingKey::new(rsa_pubkey);

    let sig = Signature::try_from(signature).map_err(|e| {
        Error::attestation_caused_by(format!("invalid signature format for {context}"), e)
    })?;

    verifying_key
        .verify(message, &sig)
        .map_err(|e| Error::attestation_caused_by(format!("{context} verification failed"), e))
}

/// Verify a DER-encoded ECDSA P-384/SHA-384 signature.
pub(crate) fn verify_ecdsa_p384_der(
    signer_spki_der: &[u8],
    message: &[u8],
    signature: &[u8],
    context: &str,
) -> Result<()> {
    use p384::ecdsa::signature::Verifier;
    use p384::ecdsa::{Signature, VerifyingKey};
    use p384::pkcs8::DecodePublicKey;

    let verifying_key = VerifyingKey::from_public_key_der(signer_spki_der)
        .map_err(|e| Error::attestation_caused_by(format!("invalid P-384 key for {context}"), e))?;

    let sig = Signature::from_der(signature).map_err(|e| {
        Error::attestation_caused_by(format!("invalid signature format for {context}"), e)
    })?;

    verifying_key
        .verify(message, &sig)
        .map_err(|e| Error::attestation_caused_by(format!("{context} verification failed"), e))
}

/// Verify an ECDSA P-256 signature, accepting DER or raw `r || s` form
/// (Sigstore tooling emits both).
pub(crate) fn verify_ecdsa_p256(
    signer_spki_der: &[u8],
    message: &[u8],
    signature: &[u8],
    context: &str,
) -> Result<()> {
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::{Signature, VerifyingKey};
    use p256::pkcs8::DecodePublicKey;

    let verifying_key = VerifyingKey::from_public_key_der(signer_spki_der)
        .map_err(|e| Error::attestation_caused_by(format!("invalid P-256 key for {context}"), e))?;

    let sig = if signature.first() == Some(&0x30) {
        Signature::from_der(signature)
    } else {
        Signature::from_slice(signature)
    }
    .map_err(|e| {
        Error::attestation_caused_by(format!("invalid signature format for {context}"), e)
    })?;

    verifying_key
        .verify(message, &sig)
        .map_err(|e| Error::attestation_caused_by(format!("{context} verification failed"), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P384_SHA384};

    fn amd_style_params(cn: &str) -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationalUnitName, "Engineering");
        dn.push(DnType::CountryName, "US");
        dn.push(DnType::LocalityName, "Santa Clara");
        dn.push(DnType::StateOrProvinceName, "CA");
        dn.push(DnType::OrganizationName, "Advanced Micro Devices");
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params
    }

    #[test]
    fn dn_accessors_read_amd_identity() {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).unwrap();
        let cert = amd_style_params("ARK-Genoa").self_signed(&key_pair).unwrap();
        let parsed = parse_der(cert.der(), "test").unwrap();

        let subject = &parsed.tbs_certificate.subject;
        assert!(dn_is_amd(subject));
        assert_eq!(dn_common_name(subject).as_deref(), Some("ARK-Genoa"));
    }

    #[test]
    fn non_amd_dn_is_rejected() {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "ARK-Genoa");
        params.distinguished_name = dn;
        let cert = params.self_signed(&key_pair).unwrap();
        let parsed = parse_der(cert.der(), "test").unwrap();

        assert!(!dn_is_amd(&parsed.tbs_certificate.subject));
    }

    #[test]
    fn self_signed_p384_verifies_over_tbs() {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).unwrap();
        let cert = amd_style_params("SEV-VCEK").self_signed(&key_pair).unwrap();
        let parsed = parse_der(cert.der(), "test").unwrap();

        let tbs = tbs_der(&parsed).unwrap();
        let sig = signature_bytes(&parsed);
        let spki = spki_der(&parsed).unwrap();

        verify_ecdsa_p384_der(&spki, &tbs, &sig, "self-signature").unwrap();

        let mut tampered = tbs;
        tampered[0] ^= 0x01;
        assert!(verify_ecdsa_p384_der(&spki, &tampered, &sig, "self-signature").is_err());
    }

    #[test]
    fn san_dns_names_are_extracted_in_order() {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).unwrap();
        let params = CertificateParams::new(vec![
            "a.example.com".to_string(),
            "b.example.com".to_string(),
        ])
        .unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        let parsed = parse_der(cert.der(), "test").unwrap();

        assert_eq!(
            san_dns_names(&parsed).unwrap(),
            vec!["a.example.com", "b.example.com"]
        );
    }

    #[test]
    fn validity_window_is_inclusive_of_now() {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).unwrap();
        let cert = amd_style_params("SEV-Genoa").self_signed(&key_pair).unwrap();
        let parsed = parse_der(cert.der(), "test").unwrap();

        assert!(valid_for_date(&parsed, SystemTime::now()));
        assert!(!valid_for_date(
            &parsed,
            SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(60)
        ));
    }

    #[test]
    fn spki_fingerprint_is_stable() {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).unwrap();
        let cert = amd_style_params("SEV-VCEK").self_signed(&key_pair).unwrap();
        let parsed = parse_der(cert.der(), "test").unwrap();

        let fp1 = spki_fingerprint_hex(&parsed).unwrap();
        let fp2 = spki_fingerprint_hex(&parsed).unwrap();
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 64);
    }
}
