//! AMD SEV-SNP certificate chain: ARK → ASK → VCEK
//!
//! Only the Genoa ARK is compiled in: it is AMD's root of trust and the
//! one certificate whose bytes must be pinned rather than proven. The ASK
//! and the per-chip VCEK arrive with the bundle (or from the KDS proxy)
//! and are authenticated by the chain walk itself: the ASK must verify
//! under the pinned ARK before the VCEK is trusted, and the VCEK in turn
//! signs the attestation report with ECDSA P-384.

use std::time::SystemTime;

use der::asn1::ObjectIdentifier;
use der::Encode;
use x509_cert::Certificate;

use super::report::{Report, SigningKey, TcbVersion};
use crate::error::{Error, Result};
use crate::x509;

pub(crate) const ARK_GENOA_PEM: &str = include_str!("../../assets/ark_genoa.pem");

const PRODUCT_NAME: &str = "Genoa";
const ARK_COMMON_NAME: &str = "ARK-Genoa";
const ASK_COMMON_NAME: &str = "SEV-Genoa";
const VCEK_COMMON_NAME: &str = "SEV-VCEK";

// DER for IA5String "Genoa"; the PRODUCT_NAME extension value must equal
// these bytes exactly.
const PRODUCT_NAME_DER: &[u8] = &[0x16, 0x05, b'G', b'e', b'n', b'o', b'a'];

// VCEK extension OIDs from the AMD KDS certificate specification.
const OID_VCEK_PRODUCT_NAME: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.3704.1.2");
const OID_VCEK_BL_SPL: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.3704.1.3.1");
const OID_VCEK_TEE_SPL: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.3704.1.3.2");
const OID_VCEK_SNP_SPL: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.3704.1.3.3");
const OID_VCEK_UCODE_SPL: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.3704.1.3.8");
const OID_VCEK_HWID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.3704.1.4");
const OID_VCEK_CSP_ID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.3704.1.5");

/// The three-certificate AMD chain for one chip.
#[derive(Debug)]
pub struct CertificateChain {
    ark: Certificate,
    ask: Certificate,
    vcek: Certificate,
}

impl CertificateChain {
    /// Build the chain for a report from the per-chip VCEK and the KDS
    /// certificate chain (ASK first, optionally followed by the ARK),
    /// anchored at the compiled-in Genoa ARK.
    ///
    /// Rejects non-Genoa parts and reports not signed by a VCEK before
    /// touching any certificate material. The supplied ASK earns no trust
    /// here: [`CertificateChain::verify`] must prove it under the pinned
    /// ARK before the chain is usable.
    pub fn from_report(report: &Report, vcek_der: &[u8], cert_chain_pem: &str) -> Result<Self> {
        Self::from_report_with_roots(report, vcek_der, cert_chain_pem, ARK_GENOA_PEM)
    }

    /// Same as [`CertificateChain::from_report`] with a caller-supplied
    /// ARK pin, for deployments tracking a refreshed AMD root.
    pub fn from_report_with_roots(
        report: &Report,
        vcek_der: &[u8],
        cert_chain_pem: &str,
        ark_pem: &str,
    ) -> Result<Self> {
        let product = report.product_name();
        if product != PRODUCT_NAME {
            return Err(Error::attestation(format!(
                "unsupported product {product:?}, only {PRODUCT_NAME} is supported"
            )));
        }

        let signer = report.signer_info()?;
        if signer.signing_key != SigningKey::VcekReportSigner {
            return Err(Error::attestation(format!(
                "report not signed by a VCEK: {:?}",
                signer.signing_key
            )));
        }

        let ark = x509::parse_pem_certificates(ark_pem, "ARK")?
            .into_iter()
            .next()
            .ok_or_else(|| Error::attestation("ARK PEM contains no certificate"))?;

        let mut chain_certs = x509::parse_pem_certificates(cert_chain_pem, "ASK chain")?;
        if chain_certs.is_empty() {
            return Err(Error::attestation("certificate chain contains no ASK"));
        }
        let ask = chain_certs.remove(0);

        // A chain that also carries an ARK must carry the pinned one.
        if let Some(served_ark) = chain_certs.first() {
            let served = served_ark
                .to_der()
                .map_err(|e| Error::attestation_caused_by("failed to encode served ARK", e))?;
            let pinned = ark
                .to_der()
                .map_err(|e| Error::attestation_caused_by("failed to encode pinned ARK", e))?;
            if served != pinned {
                return Err(Error::attestation(
                    "certificate chain ARK does not match the pinned AMD root",
                ));
            }
        }

        let vcek = x509::parse_der(vcek_der, "VCEK")?;

        Ok(Self { ark, ask, vcek })
    }

    pub fn vcek(&self) -> &Certificate {
        &self.vcek
    }

    /// Verify the whole chain at `now`.
    pub fn verify(&self, now: SystemTime) -> Result<()> {
        self.check_profile(now)?;

        // ARK self-signature, then each step down.
        let ark_spki = x509::spki_der(&self.ark)?;
        x509::verify_rsa_pss_sha384(
            &ark_spki,
            &x509::tbs_der(&self.ark)?,
            &x509::signature_bytes(&self.ark),
            "ARK self-signature",
        )?;
        x509::verify_rsa_pss_sha384(
            &ark_spki,
            &x509::tbs_der(&self.ask)?,
            &x509::signature_bytes(&self.ask),
            "ASK signature",
        )?;
        x509::verify_rsa_pss_sha384(
            &x509::spki_der(&self.ask)?,
            &x509::tbs_der(&self.vcek)?,
            &x509::signature_bytes(&self.vcek),
            "VCEK signature",
        )?;

        self.check_vcek_format()?;

        tracing::debug!("AMD certificate chain verified: ARK -> ASK -> VCEK");
        Ok(())
    }

    fn check_profile(&self, now: SystemTime) -> Result<()> {
        let certs = [
            ("ARK", &self.ark, ARK_COMMON_NAME, ARK_COMMON_NAME),
            ("ASK", &self.ask, ASK_COMMON_NAME, ARK_COMMON_NAME),
            ("VCEK", &self.vcek, VCEK_COMMON_NAME, ASK_COMMON_NAME),
        ];

        for (label, cert, subject_cn, issuer_cn) in certs {
            if cert.tbs_certificate.version != x509_cert::certificate::Version::V3 {
                return Err(Error::attestation(format!("{label} is not an X.509 v3 certificate")));
            }

            let subject = &cert.tbs_certificate.subject;
            let issuer = &cert.tbs_certificate.issuer;
            if !x509::dn_is_amd(subject) || !x509::dn_is_amd(issuer) {
                return Err(Error::attestation(format!(
                    "{label} subject or issuer is not AMD's canonical DN"
                )));
            }

            if x509::dn_common_name(subject).as_deref() != Some(subject_cn) {
                return Err(Error::attestation(format!(
                    "{label} subject CN is not {subject_cn:?}"
                )));
            }
            if x509::dn_common_name(issuer).as_deref() != Some(issuer_cn) {
                return Err(Error::attestation(format!(
                    "{label} issuer CN is not {issuer_cn:?}"
                )));
            }

            if !x509::valid_for_date(cert, now) {
                return Err(Error::attestation(format!("{label} is outside its validity period")));
            }
        }

        Ok(())
    }

    fn check_vcek_format(&self) -> Result<()> {
        if self.vcek.signature_algorithm.oid != x509::OID_SIG_RSASSA_PSS {
            return Err(Error::attestation("VCEK signature algorithm is not RSASSA-PSS"));
        }

        let spki = &self.vcek.tbs_certificate.subject_public_key_info;
        if spki.algorithm.oid != x509::OID_EC_PUBLIC_KEY {
            return Err(Error::attestation("VCEK public key is not an EC key"));
        }
        let curve = spki
            .algorithm
            .parameters
            .as_ref()
            .and_then(|params| {
                use der::{Decode, Encode};
                let der_bytes = params.to_der().ok()?;
                ObjectIdentifier::from_der(&der_bytes).ok()
            })
            .ok_or_else(|| Error::attestation("VCEK public key has no named curve"))?;
        if curve != x509::OID_SECP384R1 {
            return Err(Error::attestation("VCEK public key is not on secp384r1"));
        }

        if x509::extension(&self.vcek, &OID_VCEK_CSP_ID).is_some() {
            return Err(Error::attestation(
                "certificate carries a CSP_ID extension: this is a VLEK, not a VCEK",
            ));
        }

        let product = self.vcek_extension_value(&OID_VCEK_PRODUCT_NAME)?;
        if product != PRODUCT_NAME_DER {
            return Err(Error::attestation(format!(
                "VCEK PRODUCT_NAME extension is not IA5String {PRODUCT_NAME:?}"
            )));
        }

        let hwid = self.vcek_hwid()?;
        if hwid.len() != 64 {
            return Err(Error::attestation(format!(
                "VCEK HWID extension is {} bytes, expected 64",
                hwid.len()
            )));
        }

        Ok(())
    }

    fn vcek_extension_value(&self, oid: &ObjectIdentifier) -> Result<&[u8]> {
        x509::extension(&self.vcek, oid)
            .map(|ext| ext.extn_value.as_bytes())
            .ok_or_else(|| Error::attestation(format!("VCEK is missing extension {oid}")))
    }

    /// HWID bytes; some KDS issuances wrap the 64 bytes in an inner
    /// OCTET STRING, others store them raw.
    fn vcek_hwid(&self) -> Result<&[u8]> {
        let value = self.vcek_extension_value(&OID_VCEK_HWID)?;
        if value.len() == 66 && value[0] == 0x04 && value[1] == 64 {
            Ok(&value[2..])
        } else {
            Ok(value)
        }
    }

    fn vcek_spl(&self, oid: &ObjectIdentifier, label: &str) -> Result<u8> {
        let value = self.vcek_extension_value(oid)?;
        der_integer_u8(value)
            .ok_or_else(|| Error::attestation(format!("VCEK {label} extension is not a DER integer")))
    }

    /// The TCB encoded in the VCEK's SPL extensions.
    pub fn vcek_tcb(&self) -> Result<TcbVersion> {
        Ok(TcbVersion {
            bl_spl: self.vcek_spl(&OID_VCEK_BL_SPL, "BL_SPL")?,
            tee_spl: self.vcek_spl(&OID_VCEK_TEE_SPL, "TEE_SPL")?,
            snp_spl: self.vcek_spl(&OID_VCEK_SNP_SPL, "SNP_SPL")?,
            ucode_spl: self.vcek_spl(&OID_VCEK_UCODE_SPL, "UCODE")?,
        })
    }

    /// The VCEK's SPL extensions must equal the report's reported TCB
    /// exactly; the KDS issues one VCEK per (chip, TCB) pair.
    pub fn verify_tcb_binding(&self, report: &Report) -> Result<()> {
        let vcek_tcb = self.vcek_tcb()?;
        let reported = report.reported_tcb();
        if vcek_tcb != reported {
            return Err(Error::attestation(format!(
                "VCEK TCB ({vcek_tcb}) does not match reported TCB ({reported})"
            )));
        }
        Ok(())
    }

    /// With `maskChipKey` set the report must carry an all-zero chip ID;
    /// otherwise the VCEK HWID must equal the chip ID byte-for-byte.
    pub fn verify_hwid_binding(&self, report: &Report) -> Result<()> {
        let signer = report.signer_info()?;
        if signer.mask_chip_key {
            if report.chip_id().iter().any(|&b| b != 0) {
                return Err(Error::attestation(
                    "maskChipKey is set but the report chip ID is not zeroed",
                ));
            }
            return Ok(());
        }

        if self.vcek_hwid()? != report.chip_id() {
            return Err(Error::attestation("VCEK HWID does not match the report chip ID"));
        }
        Ok(())
    }

    /// Verify the report signature against the VCEK public key.
    pub fn verify_report_signature(&self, report: &Report) -> Result<()> {
        if report.signature_algo() != 1 {
            return Err(Error::attestation(format!(
                "unsupported report signature algorithm {}",
                report.signature_algo()
            )));
        }

        let pubkey = self
            .vcek
            .tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .raw_bytes();

        verify_signed_body(report, pubkey)
    }
}

/// ECDSA P-384/SHA-384 verification of a report's signed body against a
/// SEC1-encoded public key.
#[allow(deprecated)]
pub(crate) fn verify_signed_body(report: &Report, sec1_public_key: &[u8]) -> Result<()> {
    use p384::ecdsa::signature::Verifier;
    use p384::ecdsa::{Signature, VerifyingKey};
    use p384::elliptic_curve::generic_array::GenericArray;

    let (r_be, s_be) = report.signature_scalars()?;

    let signature = Signature::from_scalars(
        GenericArray::clone_from_slice(&r_be),
        GenericArray::clone_from_slice(&s_be),
    )
    .map_err(|e| Error::attestation_caused_by("invalid report signature scalars", e))?;

    let verifying_key = VerifyingKey::from_sec1_bytes(sec1_public_key)
        .map_err(|e| Error::attestation_caused_by("invalid VCEK public key", e))?;

    verifying_key
        .verify(report.signed_body(), &signature)
        .map_err(|e| Error::attestation_caused_by("report signature verification failed", e))
}

fn der_integer_u8(value: &[u8]) -> Option<u8> {
    // Minimal INTEGER TLV: 0x02, length, then 1-2 big-endian bytes (a
    // leading zero appears when the high bit is set).
    if value.len() < 3 || value[0] != 0x02 {
        return None;
    }
    let len = value[1] as usize;
    if value.len() != 2 + len || len == 0 || len > 2 {
        return None;
    }
    match len {
        1 => Some(value[2]),
        2 if value[2] == 0 => Some(value[3]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::report::test_support;

    fn dummy_vcek() -> Vec<u8> {
        vec![0u8; 8]
    }

    const FIXTURE_ASK_PEM: &str = include_str!("../../tests/fixtures/ask.pem");
    const FIXTURE_ARK_PEM: &str = include_str!("../../tests/fixtures/ark.pem");

    #[test]
    fn rejects_vlek_signed_reports() {
        let mut raw = test_support::build_report();
        test_support::set_signer_info(&mut raw, 1 << 2);
        let report = Report::parse(&raw).unwrap();

        let err = CertificateChain::from_report(&report, &dummy_vcek(), "").unwrap_err();
        assert!(err.to_string().contains("not signed by a VCEK"));
    }

    #[test]
    fn rejects_non_genoa_products() {
        let mut raw = test_support::build_report();
        raw[0] = 3; // version 3 carries CPUID identity
        raw[0x188] = 0x19;
        raw[0x189] = 0x01; // Milan model range
        let report = Report::parse(&raw).unwrap();

        let err = CertificateChain::from_report(&report, &dummy_vcek(), "").unwrap_err();
        assert!(err.to_string().contains("Milan"));
    }

    #[test]
    fn compiled_in_ark_is_the_genuine_amd_root() {
        let ark = x509::parse_pem_certificates(ARK_GENOA_PEM, "ARK")
            .unwrap()
            .into_iter()
            .next()
            .unwrap();

        let subject = &ark.tbs_certificate.subject;
        let issuer = &ark.tbs_certificate.issuer;
        assert!(x509::dn_is_amd(subject));
        assert!(x509::dn_is_amd(issuer));
        assert_eq!(x509::dn_common_name(subject).as_deref(), Some("ARK-Genoa"));
        assert_eq!(x509::dn_common_name(issuer).as_deref(), Some("ARK-Genoa"));
        assert!(x509::valid_for_date(&ark, SystemTime::now()));

        // The self-signature must verify with the production PSS
        // parameters; anything but AMD's real certificate fails here.
        x509::verify_rsa_pss_sha384(
            &x509::spki_der(&ark).unwrap(),
            &x509::tbs_der(&ark).unwrap(),
            &x509::signature_bytes(&ark),
            "ARK self-signature",
        )
        .unwrap();
    }

    #[test]
    fn served_chain_with_a_foreign_ark_is_rejected() {
        let raw = test_support::build_report();
        let report = Report::parse(&raw).unwrap();

        // An ASK chain whose trailing ARK is not the pinned root.
        let chain_pem = format!("{FIXTURE_ASK_PEM}{FIXTURE_ARK_PEM}");
        let err = CertificateChain::from_report(&report, &dummy_vcek(), &chain_pem).unwrap_err();
        assert!(err.to_string().contains("pinned AMD root"));
    }

    #[test]
    fn served_chain_must_contain_an_ask() {
        let raw = test_support::build_report();
        let report = Report::parse(&raw).unwrap();

        let err = CertificateChain::from_report(&report, &dummy_vcek(), "").unwrap_err();
        assert!(err.to_string().contains("ASK"));
    }

    #[test]
    fn der_integer_parsing() {
        assert_eq!(der_integer_u8(&[0x02, 0x01, 0x07]), Some(0x07));
        assert_eq!(der_integer_u8(&[0x02, 0x02, 0x00, 0xD3]), Some(0xD3));
        assert_eq!(der_integer_u8(&[0x02, 0x02, 0x01, 0x00]), None);
        assert_eq!(der_integer_u8(&[0x04, 0x01, 0x07]), None);
        assert_eq!(der_integer_u8(&[0x02, 0x01]), None);
    }

    #[test]
    fn report_signature_round_trip() {
        use p384::ecdsa::signature::Signer;
        use p384::ecdsa::{Signature, SigningKey};

        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        let mut raw = test_support::build_report();

        let body_len = raw.len() - 512;
        let signature: Signature = signing_key.sign(&raw[..body_len]);
        let (r, s) = signature.split_bytes();
        test_support::set_signature_scalars(&mut raw, r.as_slice(), s.as_slice());

        let report = Report::parse(&raw).unwrap();
        let pubkey = signing_key.verifying_key().to_encoded_point(false);
        verify_signed_body(&report, pubkey.as_bytes()).unwrap();

        // Tampering with the measurement breaks the signature.
        let mut tampered = raw.clone();
        tampered[0x90] ^= 0xFF;
        let tampered_report = Report::parse(&tampered).unwrap();
        assert!(verify_signed_body(&tampered_report, pubkey.as_bytes()).is_err());
    }
}
