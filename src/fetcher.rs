//! Attestation bundle assembly
//!
//! Gathers the five bundle fields from public infrastructure: the
//! attestation document and TLS certificate from the enclave, the release
//! digest and Sigstore bundle from GitHub (via Tinfoil's proxies), and the
//! VCEK from the AMD KDS proxy. A centralized attestation server can hand
//! out a pre-assembled bundle instead.

use std::collections::HashMap;
use std::sync::Mutex;

use base64::Engine;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::attestation::report::Report;
use crate::attestation::types::AttestationDocument;
use crate::error::{Error, Result};
use crate::util;

/// Repository of the default inference router.
pub const DEFAULT_CONFIG_REPO: &str = "tinfoilsh/confidential-inference-proxy";

const GITHUB_API_PROXY: &str = "https://api-github-proxy.tinfoil.sh";
const GITHUB_DL_PROXY: &str = "https://gh-proxy.tinfoil.sh";
const ATTESTATION_PROXY: &str = "https://gh-attestation-proxy.tinfoil.sh";
const KDS_PROXY: &str = "https://kds-proxy.tinfoil.sh";
const ATC_BASE_URL: &str = "https://atc.tinfoil.sh";

/// Everything needed to verify one enclave, assembled from live fetches
/// and thereafter read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationBundle {
    pub domain: String,
    pub enclave_attestation_report: AttestationDocument,
    /// Hex SHA-256 of the release artifact.
    pub digest: String,
    pub sigstore_bundle: Value,
    /// Base64 DER.
    pub vcek: String,
    /// KDS-served PEM chain, ASK first. Untrusted until the verifier
    /// proves it under the pinned ARK.
    pub cert_chain: String,
    /// PEM.
    pub enclave_cert: String,
}

#[derive(Deserialize)]
struct ReleaseResponse {
    tag_name: String,
    #[serde(default)]
    body: String,
}

#[derive(Deserialize)]
struct AttestationListResponse {
    attestations: Vec<AttestationEntry>,
}

#[derive(Deserialize)]
struct AttestationEntry {
    bundle: Value,
}

#[derive(Deserialize)]
struct CertificateResponse {
    certificate: String,
}

/// Assembles attestation bundles; holds the HTTP client and a VCEK cache
/// keyed by the full KDS URL (the URL encodes chip ID and TCB, so a hit is
/// bit-identical to a fresh fetch).
#[derive(Debug)]
pub struct BundleFetcher {
    client: reqwest::Client,
    vcek_cache: Mutex<HashMap<String, String>>,
}

impl Default for BundleFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            vcek_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Assemble a bundle for one enclave host and repository.
    ///
    /// The three independent fetches run in parallel; the Sigstore bundle
    /// (keyed by digest) and VCEK (keyed by the parsed report) follow.
    pub async fn assemble(&self, enclave_host: &str, repo: &str) -> Result<AttestationBundle> {
        tracing::debug!(enclave_host, repo, "assembling attestation bundle");

        let (document, digest, enclave_cert) = tokio::try_join!(
            self.fetch_attestation_document(enclave_host),
            self.fetch_release_digest(repo),
            self.fetch_enclave_certificate(enclave_host),
        )?;

        let sigstore_bundle = self.fetch_sigstore_bundle(repo, &digest).await?;

        let report_bytes = util::decode_document_body(&document.body)?;
        let report = Report::parse(&report_bytes)?;
        let (vcek, cert_chain) = tokio::try_join!(
            self.fetch_vcek_b64(&report),
            self.fetch_cert_chain(&report),
        )?;

        Ok(AttestationBundle {
            domain: enclave_host.to_string(),
            enclave_attestation_report: document,
            digest,
            sigstore_bundle,
            vcek,
            cert_chain,
            enclave_cert,
        })
    }

    /// Default pre-assembled bundle endpoint on the attestation-trust
    /// coordinator.
    pub fn atc_attestation_url() -> String {
        format!("{ATC_BASE_URL}/attestation")
    }

    /// Fetch a pre-assembled bundle from an attestation-trust coordinator.
    ///
    /// `POST` with an explicit target whenever the caller pinned an enclave
    /// URL or a non-default repo; plain `GET` selects the default.
    pub async fn fetch_from_atc(
        &self,
        atc_url: &str,
        enclave_url: Option<&str>,
        repo: Option<&str>,
    ) -> Result<AttestationBundle> {
        let custom_repo = repo.filter(|r| *r != DEFAULT_CONFIG_REPO);

        let bytes = if enclave_url.is_some() || custom_repo.is_some() {
            let request_body = serde_json::json!({
                "enclaveUrl": enclave_url,
                "repo": repo.unwrap_or(DEFAULT_CONFIG_REPO),
            });
            util::retry_fetch(atc_url, || async {
                let response = self.client.post(atc_url).json(&request_body).send().await?;
                ok_bytes(response).await
            })
            .await?
        } else {
            self.get_bytes(atc_url).await?
        };

        parse_json(&bytes, "attestation bundle")
    }

    /// List SNP routers from the coordinator and pick one uniformly at
    /// random.
    pub async fn pick_router(&self) -> Result<String> {
        use rand::seq::SliceRandom;

        let url = format!("{ATC_BASE_URL}/routers?platform=snp");
        let bytes = self.get_bytes(&url).await?;
        let routers: Vec<String> = parse_json(&bytes, "router list")?;

        routers
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| Error::fetch("router list is empty"))
    }

    async fn fetch_attestation_document(&self, host: &str) -> Result<AttestationDocument> {
        let url = format!("https://{host}/.well-known/tinfoil-attestation");
        let bytes = self.get_bytes(&url).await?;
        parse_json(&bytes, "attestation document")
    }

    async fn fetch_enclave_certificate(&self, host: &str) -> Result<String> {
        let url = format!("https://{host}/.well-known/tinfoil-certificate");
        let bytes = self.get_bytes(&url).await?;
        let response: CertificateResponse = parse_json(&bytes, "enclave certificate")?;
        Ok(response.certificate)
    }

    /// The release digest: parsed from the release notes when present,
    /// otherwise from the `tinfoil.hash` release asset.
    async fn fetch_release_digest(&self, repo: &str) -> Result<String> {
        let url = format!("{GITHUB_API_PROXY}/repos/{repo}/releases/latest");
        let bytes = self.get_bytes(&url).await?;
        let release: ReleaseResponse = parse_json(&bytes, "release metadata")?;

        if let Some(digest) = extract_digest_from_notes(&release.body) {
            return Ok(digest);
        }

        let url = format!(
            "{GITHUB_DL_PROXY}/{repo}/releases/download/{}/tinfoil.hash",
            release.tag_name
        );
        let bytes = self.get_bytes(&url).await?;
        let digest = String::from_utf8(bytes)
            .map_err(|e| Error::fetch_caused_by("release hash asset is not UTF-8", e))?;
        Ok(digest.trim().to_string())
    }

    async fn fetch_sigstore_bundle(&self, repo: &str, digest: &str) -> Result<Value> {
        let url = format!("{ATTESTATION_PROXY}/repos/{repo}/attestations/sha256:{digest}");
        let bytes = self.get_bytes(&url).await?;
        let response: AttestationListResponse = parse_json(&bytes, "attestation list")?;

        response
            .attestations
            .into_iter()
            .next()
            .map(|entry| entry.bundle)
            .ok_or_else(|| Error::fetch(format!("no attestations published for sha256:{digest}")))
    }

    /// Fetch the VCEK for a report, as base64 DER, memoizing per URL.
    /// Cache faults fall back to a live fetch.
    pub(crate) async fn fetch_vcek_b64(&self, report: &Report) -> Result<String> {
        let url = vcek_url(report);

        if let Ok(cache) = self.vcek_cache.lock() {
            if let Some(cached) = cache.get(&url) {
                tracing::debug!(url, "VCEK cache hit");
                return Ok(cached.clone());
            }
        }

        let der = self.get_bytes(&url).await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(der);

        if let Ok(mut cache) = self.vcek_cache.lock() {
            cache.insert(url, encoded.clone());
        }
        Ok(encoded)
    }

    /// Fetch the ASK/ARK certificate chain for a report's product line
    /// from the KDS proxy, as served (PEM, ASK first).
    pub(crate) async fn fetch_cert_chain(&self, report: &Report) -> Result<String> {
        let url = format!("{KDS_PROXY}/vcek/v1/{}/cert_chain", report.product_name());
        let bytes = self.get_bytes(&url).await?;
        String::from_utf8(bytes)
            .map_err(|e| Error::fetch_caused_by("certificate chain is not valid PEM text", e))
    }

    /// GET with the standard retry envelope; response bodies are parsed by
    /// the caller so a malformed body never triggers a retry.
    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        util::retry_fetch(url, || async {
            let response = self.client.get(url).send().await?;
            ok_bytes(response).await
        })
        .await
    }
}

/// Fetch the VCEK DER for a report from the KDS proxy.
pub(crate) async fn fetch_vcek_der(report: &Report) -> Result<Vec<u8>> {
    let encoded = BundleFetcher::new().fetch_vcek_b64(report).await?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::attestation_caused_by("invalid VCEK encoding", e))
}

/// Fetch the KDS certificate chain (ASK first) for a report's product.
pub(crate) async fn fetch_cert_chain_pem(report: &Report) -> Result<String> {
    BundleFetcher::new().fetch_cert_chain(report).await
}

async fn ok_bytes(response: reqwest::Response) -> Result<Vec<u8>> {
    let status = response.status();
    let url = response.url().clone();
    if !status.is_success() {
        return Err(Error::fetch(format!("GET {url} returned HTTP {status}")));
    }
    Ok(response.bytes().await?.to_vec())
}

fn parse_json<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::fetch_caused_by(format!("malformed {what} response"), e))
}

fn vcek_url(report: &Report) -> String {
    let tcb = report.reported_tcb();
    format!(
        "{KDS_PROXY}/vcek/v1/{}/{}?blSPL={}&teeSPL={}&snpSPL={}&ucodeSPL={}",
        report.product_name(),
        hex::encode(report.chip_id()),
        tcb.bl_spl,
        tcb.tee_spl,
        tcb.snp_spl,
        tcb.ucode_spl
    )
}

/// Pull a 64-hex digest out of release notes; releases publish either an
/// `EIF hash:` line or a fenced `` Digest: `...` `` line.
fn extract_digest_from_notes(notes: &str) -> Option<String> {
    let eif = Regex::new(r"EIF hash: ([0-9a-fA-F]{64})").expect("static pattern");
    let fenced = Regex::new("Digest: `([0-9a-fA-F]{64})`").expect("static pattern");

    eif.captures(notes)
        .or_else(|| fenced.captures(notes))
        .map(|captures| captures[1].to_lowercase())
}
