//! Attestation document and measurement types

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Attestation predicate formats. The set is closed: a document with any
/// other format fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredicateType {
    /// Deprecated single-register SEV-SNP format.
    #[serde(rename = "https://tinfoil.sh/predicate/sev-snp-guest/v1")]
    SevGuestV1,

    #[serde(rename = "https://tinfoil.sh/predicate/sev-snp-guest/v2")]
    SevGuestV2,

    #[serde(rename = "https://tinfoil.sh/predicate/snp-tdx-multiplatform/v1")]
    SnpTdxMultiplatformV1,
}

impl PredicateType {
    pub fn as_uri(&self) -> &'static str {
        match self {
            PredicateType::SevGuestV1 => "https://tinfoil.sh/predicate/sev-snp-guest/v1",
            PredicateType::SevGuestV2 => "https://tinfoil.sh/predicate/sev-snp-guest/v2",
            PredicateType::SnpTdxMultiplatformV1 => {
                "https://tinfoil.sh/predicate/snp-tdx-multiplatform/v1"
            }
        }
    }
}

/// Raw attestation document as served by the enclave: the `body` is
/// base64-encoded, gzip-compressed report bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationDocument {
    pub format: PredicateType,
    pub body: String,
}

/// Hex SHA-256 over `format || body`; a byte-exact contract shared with
/// the certificate SAN encoding.
pub fn hash_attestation_document(doc: &AttestationDocument) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc.format.as_uri().as_bytes());
    hasher.update(doc.body.as_bytes());
    hex::encode(hasher.finalize())
}

/// Measurement registers extracted from an attestation source.
///
/// For `SnpTdxMultiplatformV1` the first register is the SNP launch
/// measurement; `SevGuestV2` carries a single SNP register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(rename = "type")]
    pub predicate: PredicateType,
    pub registers: Vec<String>,
}

impl Measurement {
    /// Compare two measurements.
    ///
    /// A multiplatform measurement compares on its first (SNP) register
    /// against `SevGuestV2` or another multiplatform record; any other
    /// pairing of distinct formats is a mismatch.
    pub fn equals(&self, other: &Measurement) -> Result<()> {
        use PredicateType::*;

        match (self.predicate, other.predicate) {
            (SnpTdxMultiplatformV1, SnpTdxMultiplatformV1)
            | (SnpTdxMultiplatformV1, SevGuestV2)
            | (SevGuestV2, SnpTdxMultiplatformV1) => {
                let left = self
                    .registers
                    .first()
                    .ok_or_else(|| Error::attestation("measurement has no registers to compare"))?;
                let right = other
                    .registers
                    .first()
                    .ok_or_else(|| Error::attestation("measurement has no registers to compare"))?;
                if left != right {
                    return Err(Error::attestation(format!(
                        "SNP measurement mismatch: {left} != {right}"
                    )));
                }
                Ok(())
            }
            (a, b) if a == b => {
                if self.registers != other.registers {
                    return Err(Error::attestation("measurement registers do not match"));
                }
                Ok(())
            }
            (a, b) => Err(Error::attestation(format!(
                "measurement format mismatch: {} vs {}",
                a.as_uri(),
                b.as_uri()
            ))),
        }
    }

    /// Stable fingerprint: a single register stands for itself, multiple
    /// registers hash as `sha256(type || join(registers))`.
    pub fn fingerprint(&self) -> String {
        if self.registers.len() == 1 {
            return self.registers[0].clone();
        }
        let mut hasher = Sha256::new();
        hasher.update(self.predicate.as_uri().as_bytes());
        hasher.update(self.registers.concat().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snp_measurement(registers: &[&str]) -> Measurement {
        Measurement {
            predicate: PredicateType::SnpTdxMultiplatformV1,
            registers: registers.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn predicate_uris_round_trip_through_serde() {
        let json = "\"https://tinfoil.sh/predicate/snp-tdx-multiplatform/v1\"";
        let parsed: PredicateType = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, PredicateType::SnpTdxMultiplatformV1);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
    }

    #[test]
    fn unknown_predicate_fails_to_parse() {
        let json = "\"https://tinfoil.sh/predicate/tdx-guest/v2\"";
        assert!(serde_json::from_str::<PredicateType>(json).is_err());
    }

    #[test]
    fn compare_is_reflexive() {
        let m = snp_measurement(&["aa", "bb", "cc"]);
        m.equals(&m).unwrap();
    }

    #[test]
    fn multiplatform_compares_first_register_against_sev_v2() {
        let multi = snp_measurement(&["aa", "bb", "cc"]);
        let sev = Measurement {
            predicate: PredicateType::SevGuestV2,
            registers: vec!["aa".to_string()],
        };
        multi.equals(&sev).unwrap();
        sev.equals(&multi).unwrap();

        let other = Measurement {
            predicate: PredicateType::SevGuestV2,
            registers: vec!["dd".to_string()],
        };
        assert!(multi.equals(&other).is_err());
    }

    #[test]
    fn deprecated_v1_never_matches_other_formats() {
        let v1 = Measurement {
            predicate: PredicateType::SevGuestV1,
            registers: vec!["aa".to_string()],
        };
        let v2 = Measurement {
            predicate: PredicateType::SevGuestV2,
            registers: vec!["aa".to_string()],
        };
        let multi = snp_measurement(&["aa"]);

        assert!(v1.equals(&v2).is_err());
        assert!(v1.equals(&multi).is_err());
        v1.equals(&v1.clone()).unwrap();
    }

    #[test]
    fn same_type_requires_identical_registers() {
        let a = Measurement {
            predicate: PredicateType::SevGuestV2,
            registers: vec!["aa".to_string()],
        };
        let b = Measurement {
            predicate: PredicateType::SevGuestV2,
            registers: vec!["bb".to_string()],
        };
        assert!(a.equals(&b).is_err());
    }

    #[test]
    fn fingerprint_of_single_register_is_the_register() {
        let m = Measurement {
            predicate: PredicateType::SevGuestV2,
            registers: vec!["deadbeef".to_string()],
        };
        assert_eq!(m.fingerprint(), "deadbeef");
    }

    #[test]
    fn fingerprint_of_multiple_registers_hashes_type_and_registers() {
        let m = snp_measurement(&["aa", "bb"]);
        let mut hasher = Sha256::new();
        hasher.update(PredicateType::SnpTdxMultiplatformV1.as_uri().as_bytes());
        hasher.update(b"aabb");
        assert_eq!(m.fingerprint(), hex::encode(hasher.finalize()));
    }

    #[test]
    fn document_hash_is_sha256_of_format_and_body() {
        let doc = AttestationDocument {
            format: PredicateType::SevGuestV2,
            body: "SGVsbG8=".to_string(),
        };
        let mut hasher = Sha256::new();
        hasher.update(doc.format.as_uri().as_bytes());
        hasher.update(doc.body.as_bytes());
        assert_eq!(hash_attestation_document(&doc), hex::encode(hasher.finalize()));
    }
}
