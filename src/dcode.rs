//! SAN-embedded byte blobs ("dcode") and certificate domain matching
//!
//! The enclave's TLS certificate carries two byte strings in its Subject
//! Alternative Names: the HPKE public key and the hex SHA-256 of the
//! attestation document. Each blob is chunked into DNS labels of the form
//! `NN<base32-chunk>.<prefix>.<apex>` where `NN` is a two-digit chunk index
//! and the base32 alphabet is RFC 4648 (`A-Z2-7`, padding stripped,
//! case-insensitive).

use data_encoding::BASE32_NOPAD;

use crate::error::{Error, Result};

/// SAN prefix carrying the enclave's HPKE public key.
pub const HPKE_PREFIX: &str = "hpke";

/// SAN prefix carrying the hex SHA-256 of the attestation document.
pub const ATTESTATION_HASH_PREFIX: &str = "hatt";

/// Decode the byte blob embedded under `prefix` in a SAN DNS-name list.
///
/// SAN order does not matter: chunks are sorted by their numeric two-digit
/// index before concatenation.
pub fn decode_from_sans(sans: &[String], prefix: &str) -> Result<Vec<u8>> {
    let needle = format!(".{prefix}.");

    let mut chunks: Vec<(u8, String)> = Vec::new();
    for san in sans {
        if !san.contains(&needle) {
            continue;
        }
        let label = san.split('.').next().unwrap_or_default();
        if label.len() < 2 {
            return Err(Error::attestation(format!(
                "malformed dcode SAN label {san:?}: missing chunk index"
            )));
        }
        let (index, chunk) = label.split_at(2);
        let index: u8 = index.parse().map_err(|_| {
            Error::attestation(format!(
                "malformed dcode SAN label {san:?}: chunk index is not two digits"
            ))
        })?;
        chunks.push((index, chunk.to_string()));
    }

    if chunks.is_empty() {
        return Err(Error::attestation(format!(
            "certificate has no SAN entries with prefix {prefix:?}"
        )));
    }

    chunks.sort_by_key(|(index, _)| *index);

    let joined: String = chunks.into_iter().map(|(_, chunk)| chunk).collect();
    BASE32_NOPAD
        .decode(joined.to_ascii_uppercase().as_bytes())
        .map_err(|e| Error::attestation_caused_by(format!("invalid base32 in {prefix} SANs"), e))
}

/// Whether `domain` is covered by at least one SAN DNS name.
///
/// Wildcards match exactly one label (`*.example.com` matches
/// `sub.example.com` but not `example.com` or `a.b.example.com`).
pub fn domain_matches_sans(sans: &[String], domain: &str) -> bool {
    sans.iter().any(|san| san_matches(san, domain))
}

fn san_matches(pattern: &str, domain: &str) -> bool {
    if let Some(parent) = pattern.strip_prefix("*.") {
        match domain.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(parent),
            None => false,
        }
    } else {
        pattern.eq_ignore_ascii_case(domain)
    }
}

/// Chunk a payload into dcode SAN DNS names. Test-side inverse of
/// [`decode_from_sans`]; the production client only ever decodes.
#[cfg(test)]
pub(crate) fn encode_to_sans(payload: &[u8], prefix: &str, apex: &str) -> Vec<String> {
    const CHUNK_LABEL_LEN: usize = 48;

    let encoded = BASE32_NOPAD.encode(payload);
    encoded
        .as_bytes()
        .chunks(CHUNK_LABEL_LEN)
        .enumerate()
        .map(|(i, chunk)| {
            format!(
                "{:02}{}.{}.{}",
                i,
                std::str::from_utf8(chunk).unwrap(),
                prefix,
                apex
            )
        })
        .collect()
}
