//! TLS transport pinned to the attested server key
//!
//! The attestation report commits to the SHA-256 of the enclave's TLS
//! SubjectPublicKeyInfo. The pinned transport refuses any handshake whose
//! end-entity key hashes differently, before WebPKI even looks at the
//! chain, and disables connection pooling so the check runs for every
//! request rather than only the first one on a kept-alive socket.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::error::{Error, Result};
use crate::x509;

/// The attested SPKI digest a session is locked to.
#[derive(Debug)]
struct SpkiPin {
    attested_hex: String,
}

impl SpkiPin {
    fn check(&self, end_entity: &CertificateDer<'_>) -> std::result::Result<(), rustls::Error> {
        let presented = x509::parse_der(end_entity.as_ref(), "server TLS")
            .and_then(|cert| x509::spki_fingerprint_hex(&cert))
            .map_err(|e| rustls::Error::General(format!("server key digest unavailable: {e}")))?;

        if presented != self.attested_hex {
            return Err(rustls::Error::General(format!(
                "server key is not the attested key: attested {}, presented {presented}",
                self.attested_hex
            )));
        }
        Ok(())
    }
}

/// Certificate verifier for attested sessions: the pin gates the
/// handshake, WebPKI chain validation still applies on top, and handshake
/// signatures go through the provider's own algorithm set.
#[derive(Debug)]
struct AttestedServerVerifier {
    pin: SpkiPin,
    webpki: Arc<WebPkiServerVerifier>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl AttestedServerVerifier {
    fn new(attested_hex: String) -> Result<Self> {
        let provider = rustls::crypto::aws_lc_rs::default_provider();
        let algorithms = provider.signature_verification_algorithms;
        let _ = provider.install_default();

        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let webpki = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::configuration(format!("TLS trust store unavailable: {e}")))?;

        Ok(Self {
            pin: SpkiPin { attested_hex },
            webpki,
            algorithms,
        })
    }
}

impl ServerCertVerifier for AttestedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.pin.check(end_entity)?;
        self.webpki
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Build a reqwest client locked to the attested SPKI fingerprint.
///
/// Keep-alive is off: every request opens a fresh connection, so the pin
/// is enforced on each one.
pub fn pinned_client(attested_fingerprint: &str) -> Result<reqwest::Client> {
    let verifier = AttestedServerVerifier::new(attested_fingerprint.to_string())?;

    let tls = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    reqwest::Client::builder()
        .use_preconfigured_tls(tls)
        .pool_max_idle_per_host(0)
        .build()
        .map_err(|e| Error::configuration(format!("failed to build pinned HTTP client: {e}")))
}
