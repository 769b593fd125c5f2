//! EHBP: encrypted HTTP bodies over HPKE (RFC 9180)
//!
//! The transport seals every request body to the enclave's attested HPKE
//! key using DHKEM(X25519)/HKDF-SHA256/AES-128-GCM in base mode, with the
//! request host bound into the AEAD associated data. The response body
//! comes back sealed under a key derived from the sender context's
//! exporter secret, so a session can be resumed from a
//! [`RecoveryToken`] alone.

use hpke::aead::AesGcm128;
use hpke::kdf::HkdfSha256;
use hpke::kem::X25519HkdfSha256;
use hpke::{Deserializable, Kem as KemTrait, OpModeS, Serializable};
use std::sync::Mutex;

use crate::error::{Error, Result};

type Kem = X25519HkdfSha256;

/// HPKE info string; fixed per the EHBP protocol.
const EHBP_INFO: &[u8] = b"tinfoil-ehbp-v1";

/// Exporter label for the response key material.
const RESPONSE_EXPORT_LABEL: &[u8] = b"ehbp-v1 response";

/// Media type of the server's published HPKE key configuration.
pub const KEYS_MEDIA_TYPE: &str = "application/vnd.tinfoil.ehbp-v1+keys";

/// Media type of an encrypted request or response body.
pub const ENCRYPTED_MEDIA_TYPE: &str = "application/vnd.tinfoil.ehbp-v1+encrypted";

/// Media type the server answers with when the encapsulated key no longer
/// matches a live key config.
pub const KEY_MISMATCH_MEDIA_TYPE: &str = "application/vnd.tinfoil.ehbp-v1+key-mismatch";

const EXPORTED_SECRET_LEN: usize = 32;

/// A server identity: the enclave's attested X25519 public key.
#[derive(Debug)]
pub struct Identity {
    public_key: <Kem as KemTrait>::PublicKey,
}

impl Identity {
    pub fn from_public_key_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| Error::attestation_caused_by("HPKE public key is not valid hex", e))?;
        Self::from_public_key_bytes(&bytes)
    }

    pub fn from_public_key_bytes(bytes: &[u8]) -> Result<Self> {
        let public_key = <Kem as KemTrait>::PublicKey::from_bytes(bytes)
            .map_err(|e| Error::attestation_caused_by("invalid HPKE public key", e))?;
        Ok(Self { public_key })
    }
}

/// Request shape for [`Transport::request`] and [`SecureClient::fetch`].
///
/// [`SecureClient::fetch`]: crate::client::SecureClient::fetch
#[derive(Debug, Clone, Default)]
pub struct RequestInit {
    /// HTTP method; GET when empty.
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// A decrypted response.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Session secrets for one in-flight request, sufficient to decrypt its
/// response after the transport is gone (e.g. across a restart).
#[derive(Debug, Clone)]
pub struct RecoveryToken {
    pub exported_secret: Vec<u8>,
    pub request_enc: Vec<u8>,
}

/// One encrypted-body session against a single request host.
#[derive(Debug)]
pub struct Transport {
    identity: Identity,
    request_host: String,
    client: reqwest::Client,
    last_token: Mutex<Option<RecoveryToken>>,
}

impl Transport {
    pub fn new(identity: Identity, request_host: impl Into<String>) -> Self {
        Self {
            identity,
            request_host: request_host.into(),
            client: reqwest::Client::new(),
            last_token: Mutex::new(None),
        }
    }

    /// Send a request with an encrypted body and decrypt the response.
    ///
    /// Raises [`Error::KeyConfigMismatch`] when the server reports that the
    /// encapsulated key no longer matches a live key config; the request
    /// was not accepted, so resending after re-attestation is safe.
    pub async fn request(&self, url: &str, init: &RequestInit) -> Result<Response> {
        let plaintext = init.body.as_deref().unwrap_or_default();
        let sealed = seal_request(
            &self.identity,
            &self.request_host,
            plaintext,
            &mut rand::rngs::OsRng,
        )?;

        let token = RecoveryToken {
            exported_secret: sealed.exported_secret.to_vec(),
            request_enc: sealed.encapped_key.clone(),
        };
        if let Ok(mut last) = self.last_token.lock() {
            *last = Some(token.clone());
        }

        let method = if init.method.is_empty() {
            reqwest::Method::GET
        } else {
            init.method
                .parse()
                .map_err(|_| Error::configuration(format!("invalid HTTP method {:?}", init.method)))?
        };

        let mut wire_body = sealed.encapped_key.clone();
        wire_body.extend_from_slice(&sealed.ciphertext);

        let mut request = self
            .client
            .request(method, url)
            .header(reqwest::header::CONTENT_TYPE, ENCRYPTED_MEDIA_TYPE)
            .body(wire_body);
        for (name, value) in &init.headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        if is_key_mismatch(status.as_u16(), content_type(&headers)) {
            return Err(Error::KeyConfigMismatch);
        }
        if !status.is_success() {
            return Err(Error::fetch(format!("{url} returned HTTP {status}")));
        }

        let plaintext = open_response_body(&token.exported_secret, &self.request_host, &body)?;
        Ok(Response {
            status: status.as_u16(),
            headers,
            body: plaintext,
        })
    }

    /// Secrets for the most recent request, if any.
    pub fn recovery_token(&self) -> Option<RecoveryToken> {
        self.last_token.lock().ok().and_then(|token| token.clone())
    }

    pub fn request_host(&self) -> &str {
        &self.request_host
    }
}

/// Decrypt a stored response body with a recovery token, e.g. after a
/// restart while the response was pending.
pub fn decrypt_stored_response(
    token: &RecoveryToken,
    request_host: &str,
    stored_body: &[u8],
) -> Result<Vec<u8>> {
    open_response_body(&token.exported_secret, request_host, stored_body)
}

pub(crate) struct SealedRequest {
    pub encapped_key: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub exported_secret: [u8; EXPORTED_SECRET_LEN],
}

/// HPKE base-mode seal of one request body, with the request host as AAD.
pub(crate) fn seal_request<R: rand::CryptoRng + rand::RngCore>(
    identity: &Identity,
    request_host: &str,
    plaintext: &[u8],
    rng: &mut R,
) -> Result<SealedRequest> {
    let (encapped_key, mut sender_ctx) = hpke::setup_sender::<AesGcm128, HkdfSha256, Kem, _>(
        &OpModeS::Base,
        &identity.public_key,
        EHBP_INFO,
        rng,
    )
    .map_err(|e| Error::fetch_caused_by("HPKE sender setup failed", e))?;

    let ciphertext = sender_ctx
        .seal(plaintext, request_host.as_bytes())
        .map_err(|e| Error::fetch_caused_by("request encryption failed", e))?;

    let mut exported_secret = [0u8; EXPORTED_SECRET_LEN];
    sender_ctx
        .export(RESPONSE_EXPORT_LABEL, &mut exported_secret)
        .map_err(|e| Error::fetch_caused_by("HPKE export failed", e))?;

    Ok(SealedRequest {
        encapped_key: encapped_key.to_bytes().to_vec(),
        ciphertext,
        exported_secret,
    })
}

/// Open a response body: AES-128-GCM under the exporter-derived key, with
/// the request host as AAD. The key and nonce are one-shot per request
/// context (key = secret[0..16], nonce = secret[16..28]).
pub(crate) fn open_response_body(
    exported_secret: &[u8],
    request_host: &str,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    use aes_gcm::aead::{Aead, Payload};
    use aes_gcm::{Aes128Gcm, KeyInit, Nonce};

    if exported_secret.len() != EXPORTED_SECRET_LEN {
        return Err(Error::fetch("invalid exported secret length"));
    }

    let cipher = Aes128Gcm::new_from_slice(&exported_secret[..16])
        .map_err(|_| Error::fetch("invalid response key length"))?;
    let nonce = Nonce::from_slice(&exported_secret[16..28]);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: request_host.as_bytes(),
            },
        )
        .map_err(|_| Error::fetch("response decryption failed"))
}

fn content_type(headers: &reqwest::header::HeaderMap) -> &str {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

fn is_key_mismatch(status: u16, content_type: &str) -> bool {
    status == 409 && content_type.starts_with(KEY_MISMATCH_MEDIA_TYPE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::aead::{Aead, Payload};
    use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
    use hpke::OpModeR;

    fn test_keypair() -> (<Kem as KemTrait>::PrivateKey, Identity) {
        let (private_key, public_key) = Kem::gen_keypair(&mut rand::rngs::OsRng);
        let identity = Identity::from_public_key_bytes(&public_key.to_bytes()).unwrap();
        (private_key, identity)
    }

    /// Server side of the protocol, for round-trip tests: open the request
    /// and seal a response under the exporter-derived key.
    fn server_round_trip(
        private_key: &<Kem as KemTrait>::PrivateKey,
        host: &str,
        sealed: &SealedRequest,
        response_plaintext: &[u8],
    ) -> (Vec<u8>, Vec<u8>) {
        let encapped_key =
            <Kem as KemTrait>::EncappedKey::from_bytes(&sealed.encapped_key).unwrap();
        let mut receiver_ctx = hpke::setup_receiver::<AesGcm128, HkdfSha256, Kem>(
            &OpModeR::Base,
            private_key,
            &encapped_key,
            EHBP_INFO,
        )
        .unwrap();

        let request_plaintext = receiver_ctx
            .open(&sealed.ciphertext, host.as_bytes())
            .unwrap();

        let mut secret = [0u8; EXPORTED_SECRET_LEN];
        receiver_ctx.export(RESPONSE_EXPORT_LABEL, &mut secret).unwrap();

        let cipher = Aes128Gcm::new_from_slice(&secret[..16]).unwrap();
        let response_ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&secret[16..28]),
                Payload {
                    msg: response_plaintext,
                    aad: host.as_bytes(),
                },
            )
            .unwrap();

        (request_plaintext, response_ciphertext)
    }

    #[test]
    fn request_and_response_round_trip() {
        let (private_key, identity) = test_keypair();
        let host = "model.tinfoil.sh";

        let sealed =
            seal_request(&identity, host, b"{\"prompt\":\"hi\"}", &mut rand::rngs::OsRng).unwrap();
        let (request_plaintext, response_ciphertext) =
            server_round_trip(&private_key, host, &sealed, b"{\"answer\":\"hello\"}");

        assert_eq!(request_plaintext, b"{\"prompt\":\"hi\"}");

        let response =
            open_response_body(&sealed.exported_secret, host, &response_ciphertext).unwrap();
        assert_eq!(response, b"{\"answer\":\"hello\"}");
    }

    #[test]
    fn host_binding_is_enforced() {
        let (private_key, identity) = test_keypair();

        let sealed =
            seal_request(&identity, "model.tinfoil.sh", b"payload", &mut rand::rngs::OsRng)
                .unwrap();

        let encapped_key =
            <Kem as KemTrait>::EncappedKey::from_bytes(&sealed.encapped_key).unwrap();
        let mut receiver_ctx = hpke::setup_receiver::<AesGcm128, HkdfSha256, Kem>(
            &OpModeR::Base,
            &private_key,
            &encapped_key,
            EHBP_INFO,
        )
        .unwrap();

        // A different host in the AAD must not open.
        assert!(receiver_ctx
            .open(&sealed.ciphertext, b"attacker.example.com")
            .is_err());
    }

    #[test]
    fn recovery_token_decrypts_a_stored_response() {
        let (private_key, identity) = test_keypair();
        let host = "model.tinfoil.sh";

        let sealed = seal_request(&identity, host, b"request", &mut rand::rngs::OsRng).unwrap();
        let (_, response_ciphertext) =
            server_round_trip(&private_key, host, &sealed, b"late response");

        let token = RecoveryToken {
            exported_secret: sealed.exported_secret.to_vec(),
            request_enc: sealed.encapped_key.clone(),
        };

        let recovered = decrypt_stored_response(&token, host, &response_ciphertext).unwrap();
        assert_eq!(recovered, b"late response");
    }

    #[test]
    fn tampered_response_fails_to_open() {
        let (private_key, identity) = test_keypair();
        let host = "model.tinfoil.sh";

        let sealed = seal_request(&identity, host, b"request", &mut rand::rngs::OsRng).unwrap();
        let (_, mut response_ciphertext) =
            server_round_trip(&private_key, host, &sealed, b"response");
        response_ciphertext[0] ^= 0xFF;

        assert!(open_response_body(&sealed.exported_secret, host, &response_ciphertext).is_err());
    }

    #[test]
    fn identity_rejects_malformed_keys() {
        assert!(Identity::from_public_key_hex("zz").is_err());
        assert!(Identity::from_public_key_hex("aabb").is_err());
        assert!(Identity::from_public_key_hex(&"ab".repeat(32)).is_ok());
    }

    #[test]
    fn key_mismatch_requires_status_and_media_type() {
        assert!(is_key_mismatch(409, KEY_MISMATCH_MEDIA_TYPE));
        assert!(is_key_mismatch(
            409,
            &format!("{KEY_MISMATCH_MEDIA_TYPE}; charset=utf-8")
        ));
        assert!(!is_key_mismatch(409, "application/json"));
        assert!(!is_key_mismatch(500, KEY_MISMATCH_MEDIA_TYPE));
    }
}
