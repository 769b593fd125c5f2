//! # Tinfoil Verifier
//!
//! Client-side attestation verification and encrypted transport for
//! confidential AI inference enclaves.
//!
//! Before a request leaves the process, the client proves three things:
//!
//! 1. **The server is a genuine AMD SEV-SNP enclave.** The attestation
//!    report's certificate chain (ARK → ASK → VCEK) verifies down to the
//!    per-chip VCEK, the VCEK binds the report's chip ID and TCB, and the
//!    report passes the hardware policy floor.
//! 2. **The enclave runs a signed source release.** A Sigstore bundle
//!    (DSSE envelope, Fulcio certificate, Rekor log entry) proves that a
//!    GitHub Actions release-tag run of the expected repository published
//!    the measurement, and that measurement must equal the hardware one.
//! 3. **The transport keys are the attested keys.** The enclave's TLS
//!    certificate carries the HPKE public key and the attestation-document
//!    hash in its SANs, which must match the verified report data.
//!
//! Once verified, requests flow through an encrypted session: either HPKE
//! encrypted bodies (EHBP, the default) or TLS pinned to the attested
//! certificate fingerprint.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tinfoil_verifier::{ClientConfig, RequestInit, SecureClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SecureClient::new(ClientConfig {
//!         enclave_url: Some("https://model.tinfoil.sh".into()),
//!         config_repo: Some("tinfoilsh/confidential-model".into()),
//!         ..Default::default()
//!     })?;
//!
//!     // First fetch attests the enclave, then sends the encrypted request.
//!     let response = client
//!         .fetch(
//!             "chat/completions",
//!             RequestInit {
//!                 method: "POST".into(),
//!                 body: Some(br#"{"model":"llama","messages":[]}"#.to_vec()),
//!                 ..Default::default()
//!             },
//!         )
//!         .await?;
//!
//!     println!("{}", response.text());
//!     println!("{:#?}", client.verification_document());
//!     Ok(())
//! }
//! ```

pub mod attestation;
pub mod client;
pub mod dcode;
pub mod ehbp;
pub mod error;
pub mod fetcher;
pub mod sigstore;
pub mod tls;
pub mod verifier;

mod util;
mod x509;

pub use attestation::{
    hash_attestation_document, verify_attestation, AttestationDocument, AttestationResponse,
    Measurement, PredicateType, ValidationOptions,
};
pub use client::{ClientConfig, SecureClient, TransportMode};
pub use ehbp::{RecoveryToken, RequestInit, Response};
pub use error::{Error, Result};
pub use fetcher::{AttestationBundle, BundleFetcher, DEFAULT_CONFIG_REPO};
pub use verifier::{TrustAnchors, VerificationDocument, Verifier};
