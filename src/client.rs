//! Secure client: verified, encrypted transport to an enclave
//!
//! The client is lazy: the first `fetch` (or an explicit `ready`) runs one
//! attestation pass (assemble a bundle, verify it, build the encrypted
//! session) and every request thereafter rides the verified session.
//! Concurrent callers share a single in-flight initialization, and the one
//! transport error that triggers automatic re-attestation is the server's
//! HPKE key-rotation signal.

use std::future::Future;
use std::time::Duration;

use crate::ehbp::{self, RecoveryToken, RequestInit, Response};
use crate::error::{Error, Result};
use crate::fetcher::{AttestationBundle, BundleFetcher, DEFAULT_CONFIG_REPO};
use crate::tls;
use crate::verifier::{VerificationDocument, Verifier};

/// Encrypted transport flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Encrypted HTTP bodies over HPKE.
    #[default]
    Ehbp,
    /// TLS with the attested certificate fingerprint pinned.
    Tls,
}

/// Client configuration. Everything is optional; the defaults attest the
/// default router with the EHBP transport.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Base URL for requests; defaults to `{enclave_url}/v1/`.
    pub base_url: Option<String>,
    /// Explicit enclave; must be `https://`.
    pub enclave_url: Option<String>,
    /// GitHub repository the enclave's code provenance is checked against.
    pub config_repo: Option<String>,
    pub transport: TransportMode,
    /// Pre-assembled bundle endpoint (attestation-trust coordinator).
    pub attestation_bundle_url: Option<String>,
}

#[derive(Debug)]
enum Session {
    Ehbp(ehbp::Transport),
    Tls(reqwest::Client),
}

#[derive(Debug)]
struct SessionState {
    enclave_url: String,
    base_url: String,
    session: Session,
}

#[derive(Debug)]
enum GateState<T> {
    Uninitialized,
    Ready(T),
    Failed,
}

/// Single-flight initialization gate: concurrent callers deduplicate on
/// one pass, a transient failure earns exactly one retry after a fixed
/// delay, and any other error propagates untouched.
#[derive(Debug)]
struct SingleFlight<T> {
    state: tokio::sync::Mutex<GateState<T>>,
}

const INIT_RETRY_DELAY: Duration = Duration::from_secs(1);

impl<T> SingleFlight<T> {
    fn new() -> Self {
        Self {
            state: tokio::sync::Mutex::new(GateState::Uninitialized),
        }
    }

    async fn ready<F, Fut>(&self, mut init: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = self.state.lock().await;
        if matches!(*state, GateState::Ready(_)) {
            return Ok(());
        }

        *state = GateState::Uninitialized;
        match init().await {
            Ok(value) => {
                *state = GateState::Ready(value);
                Ok(())
            }
            Err(err) if err.is_transient_fetch() || matches!(err, Error::Attestation { .. }) => {
                tracing::warn!(error = %err, "initialization failed, retrying once");
                tokio::time::sleep(INIT_RETRY_DELAY).await;
                match init().await {
                    Ok(value) => {
                        *state = GateState::Ready(value);
                        Ok(())
                    }
                    Err(err) => {
                        *state = GateState::Failed;
                        Err(err)
                    }
                }
            }
            Err(err) => {
                *state = GateState::Failed;
                Err(err)
            }
        }
    }

    async fn reset(&self) {
        *self.state.lock().await = GateState::Uninitialized;
    }

    async fn with_ready<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        match &*self.state.lock().await {
            GateState::Ready(value) => Some(f(value)),
            _ => None,
        }
    }
}

/// Retry a request exactly once after re-attestation when the server
/// signals a rotated HPKE key config. That error means the server did not
/// accept the request, so the resend cannot duplicate work.
async fn with_key_rotation_recovery<T, S, FutS, R, FutR>(mut send: S, recover: R) -> Result<T>
where
    S: FnMut() -> FutS,
    FutS: Future<Output = Result<T>>,
    R: FnOnce() -> FutR,
    FutR: Future<Output = Result<()>>,
{
    match send().await {
        Err(Error::KeyConfigMismatch) => {
            tracing::warn!("server rotated its HPKE key config; re-attesting and retrying");
            recover().await?;
            send().await
        }
        other => other,
    }
}

/// Client whose every request is proven to terminate inside a verified
/// enclave.
#[derive(Debug)]
pub struct SecureClient {
    config: ClientConfig,
    fetcher: BundleFetcher,
    gate: SingleFlight<SessionState>,
    last_document: std::sync::Mutex<Option<VerificationDocument>>,
}

impl SecureClient {
    /// Validate the configuration and build a client. No network I/O
    /// happens until [`SecureClient::ready`] or the first fetch.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if let Some(enclave_url) = &config.enclave_url {
            if !enclave_url.starts_with("https://") {
                return Err(Error::configuration(format!(
                    "enclave URL must use https://, got {enclave_url:?}"
                )));
            }
        }

        if config.config_repo.is_some() && config.enclave_url.is_none() {
            return Err(Error::configuration(
                "a custom config repo requires an explicit enclave URL; \
                 the centrally assembled bundle would ignore it",
            ));
        }

        if config.enclave_url.is_some() && config.config_repo.is_none() {
            tracing::warn!(
                "enclave URL set without a config repo; code provenance will be \
                 checked against the default router repository"
            );
        }

        Ok(Self {
            config,
            fetcher: BundleFetcher::new(),
            gate: SingleFlight::new(),
            last_document: std::sync::Mutex::new(None),
        })
    }

    /// Client for the default router with the default transport.
    pub fn default_client() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Run the attestation pass if it has not happened yet. Concurrent
    /// callers share one pass and receive its outcome.
    pub async fn ready(&self) -> Result<()> {
        self.gate.ready(|| self.initialize()).await
    }

    /// Drop the session and verification document; the next `ready`
    /// re-attests from scratch.
    pub async fn reset(&self) {
        self.gate.reset().await;
        if let Ok(mut document) = self.last_document.lock() {
            *document = None;
        }
    }

    /// Issue a request through the verified session. Relative inputs are
    /// resolved against the session base URL.
    pub async fn fetch(&self, input: &str, init: RequestInit) -> Result<Response> {
        with_key_rotation_recovery(
            || self.send(input, &init),
            || async {
                self.reset().await;
                self.ready().await
            },
        )
        .await
    }

    async fn send(&self, input: &str, init: &RequestInit) -> Result<Response> {
        self.ready().await?;

        let state = self.gate.state.lock().await;
        let GateState::Ready(session) = &*state else {
            return Err(Error::configuration("client session is not initialized"));
        };

        let url = resolve_url(&session.base_url, input);
        match &session.session {
            Session::Ehbp(transport) => transport.request(&url, init).await,
            Session::Tls(client) => send_plain(client, &url, init).await,
        }
    }

    async fn initialize(&self) -> Result<SessionState> {
        let repo = self
            .config
            .config_repo
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_REPO.to_string());

        let mut verifier = Verifier::new(&repo);
        let bundle = match self.obtain_bundle(&mut verifier, &repo).await {
            Ok(bundle) => bundle,
            Err(err) => {
                verifier.mark_fetch_failed(&err);
                if let Ok(mut document) = self.last_document.lock() {
                    *document = Some(verifier.document().clone());
                }
                return Err(err);
            }
        };

        let outcome = verifier.verify_bundle(&bundle);
        if let Ok(mut document) = self.last_document.lock() {
            *document = Some(verifier.document().clone());
        }
        let response = outcome?;

        let enclave_url = self
            .config
            .enclave_url
            .clone()
            .unwrap_or_else(|| format!("https://{}", bundle.domain));
        let base_url = self
            .config
            .base_url
            .clone()
            .unwrap_or_else(|| format!("{}/v1/", enclave_url.trim_end_matches('/')));

        let session = match self.config.transport {
            TransportMode::Ehbp => {
                let identity = ehbp::Identity::from_public_key_hex(&response.hpke_public_key)?;
                let request_host = host_of(&base_url)?;
                Session::Ehbp(ehbp::Transport::new(identity, request_host))
            }
            TransportMode::Tls => {
                if !base_url.starts_with("https://") {
                    return Err(Error::configuration(
                        "the pinned TLS transport requires an https:// base URL",
                    ));
                }
                Session::Tls(tls::pinned_client(&response.tls_public_key_fingerprint)?)
            }
        };

        tracing::info!(enclave_url, base_url, "secure session established");
        Ok(SessionState {
            enclave_url,
            base_url,
            session,
        })
    }

    async fn obtain_bundle(
        &self,
        verifier: &mut Verifier,
        repo: &str,
    ) -> Result<AttestationBundle> {
        if let Some(atc_url) = &self.config.attestation_bundle_url {
            return self
                .fetcher
                .fetch_from_atc(
                    atc_url,
                    self.config.enclave_url.as_deref(),
                    self.config.config_repo.as_deref(),
                )
                .await;
        }

        if let Some(enclave_url) = &self.config.enclave_url {
            let host = host_of(enclave_url)?;
            return self.fetcher.assemble(&host, repo).await;
        }

        let router = self.fetcher.pick_router().await?;
        verifier.set_selected_router(&router);
        self.fetcher.assemble(&router, repo).await
    }

    /// The resolved base URL, once a session exists.
    pub async fn base_url(&self) -> Option<String> {
        self.gate.with_ready(|state| state.base_url.clone()).await
    }

    /// The resolved enclave URL, once a session exists.
    pub async fn enclave_url(&self) -> Option<String> {
        self.gate
            .with_ready(|state| state.enclave_url.clone())
            .await
    }

    /// The audit record of the most recent verification attempt, on
    /// success and failure alike.
    pub fn verification_document(&self) -> Option<VerificationDocument> {
        self.last_document.lock().ok().and_then(|doc| doc.clone())
    }

    /// Session recovery token (EHBP transport only).
    pub async fn recovery_token(&self) -> Option<RecoveryToken> {
        self.gate
            .with_ready(|state| match &state.session {
                Session::Ehbp(transport) => transport.recovery_token(),
                Session::Tls(_) => None,
            })
            .await
            .flatten()
    }
}

async fn send_plain(client: &reqwest::Client, url: &str, init: &RequestInit) -> Result<Response> {
    let method = if init.method.is_empty() {
        reqwest::Method::GET
    } else {
        init.method
            .parse()
            .map_err(|_| Error::configuration(format!("invalid HTTP method {:?}", init.method)))?
    };

    let mut request = client.request(method, url);
    for (name, value) in &init.headers {
        request = request.header(name, value);
    }
    if let Some(body) = &init.body {
        request = request.body(body.clone());
    }

    let response = request.send().await?;
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.bytes().await?.to_vec();

    Ok(Response {
        status,
        headers,
        body,
    })
}

fn host_of(url: &str) -> Result<String> {
    let rest = url
        .strip_prefix("https://")
        .ok_or_else(|| Error::configuration(format!("expected an https:// URL, got {url:?}")))?;
    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err(Error::configuration(format!("URL {url:?} has no host")));
    }
    Ok(host.to_string())
}

fn resolve_url(base_url: &str, input: &str) -> String {
    if input.starts_with("https://") || input.starts_with("http://") {
        return input.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        input.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn http_enclave_url_is_rejected_eagerly() {
        let config = ClientConfig {
            enclave_url: Some("http://model.tinfoil.sh".to_string()),
            ..Default::default()
        };
        let err = SecureClient::new(config).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn custom_repo_without_enclave_url_is_rejected() {
        let config = ClientConfig {
            config_repo: Some("me/my-enclave".to_string()),
            ..Default::default()
        };
        let err = SecureClient::new(config).unwrap_err();
        assert!(err.to_string().contains("enclave URL"));
    }

    #[test]
    fn enclave_url_with_repo_is_accepted() {
        let config = ClientConfig {
            enclave_url: Some("https://model.tinfoil.sh".to_string()),
            config_repo: Some("me/my-enclave".to_string()),
            ..Default::default()
        };
        assert!(SecureClient::new(config).is_ok());
    }

    #[tokio::test]
    async fn accessors_are_none_before_ready_and_after_reset() {
        let client = SecureClient::default_client().unwrap();
        assert!(client.base_url().await.is_none());
        assert!(client.enclave_url().await.is_none());
        assert!(client.verification_document().is_none());

        client.reset().await;
        assert!(client.base_url().await.is_none());
        assert!(client.enclave_url().await.is_none());
    }

    #[tokio::test]
    async fn single_flight_runs_one_initialization_for_concurrent_callers() {
        let gate = SingleFlight::<u32>::new();
        let passes = AtomicU32::new(0);

        let init = || {
            passes.fetch_add(1, Ordering::SeqCst);
            async { Ok(7u32) }
        };

        let (a, b, c) = tokio::join!(gate.ready(init), gate.ready(init), gate.ready(init));
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(passes.load(Ordering::SeqCst), 1);
        assert_eq!(gate.with_ready(|v| *v).await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_initialization_failure_retries_once() {
        let gate = SingleFlight::<u32>::new();
        let passes = AtomicU32::new(0);

        gate.ready(|| {
            let n = passes.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::fetch("flaky network"))
                } else {
                    Ok(1u32)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(passes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn attestation_failures_also_earn_one_retry() {
        let gate = SingleFlight::<u32>::new();
        let passes = AtomicU32::new(0);

        let err = gate
            .ready(|| {
                passes.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::attestation("stale bundle")) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Attestation { .. }));
        assert_eq!(passes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn configuration_errors_never_retry() {
        let gate = SingleFlight::<u32>::new();
        let passes = AtomicU32::new(0);

        let err = gate
            .ready(|| {
                passes.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::configuration("bad options")) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(passes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gate_reset_forces_a_fresh_initialization() {
        let gate = SingleFlight::<u32>::new();
        let passes = AtomicU32::new(0);

        let init = || {
            passes.fetch_add(1, Ordering::SeqCst);
            async { Ok(1u32) }
        };

        gate.ready(init).await.unwrap();
        gate.reset().await;
        assert_eq!(gate.with_ready(|v| *v).await, None);

        gate.ready(init).await.unwrap();
        assert_eq!(passes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn key_rotation_triggers_exactly_one_recovery_and_resend() {
        let sends = AtomicU32::new(0);
        let recoveries = AtomicU32::new(0);

        let result = with_key_rotation_recovery(
            || {
                let n = sends.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::KeyConfigMismatch)
                    } else {
                        Ok("delivered")
                    }
                }
            },
            || async {
                recoveries.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert_eq!(result.unwrap(), "delivered");
        assert_eq!(sends.load(Ordering::SeqCst), 2);
        assert_eq!(recoveries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_transport_errors_do_not_re_attest() {
        let sends = AtomicU32::new(0);
        let recoveries = AtomicU32::new(0);

        let result: Result<()> = with_key_rotation_recovery(
            || {
                sends.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::fetch("connection reset")) }
            },
            || async {
                recoveries.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(sends.load(Ordering::SeqCst), 1);
        assert_eq!(recoveries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn persistent_key_mismatch_surfaces_after_the_single_retry() {
        let sends = AtomicU32::new(0);

        let result: Result<()> = with_key_rotation_recovery(
            || {
                sends.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::KeyConfigMismatch) }
            },
            || async { Ok(()) },
        )
        .await;

        assert!(matches!(result, Err(Error::KeyConfigMismatch)));
        assert_eq!(sends.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn url_resolution() {
        assert_eq!(
            resolve_url("https://model.tinfoil.sh/v1/", "chat/completions"),
            "https://model.tinfoil.sh/v1/chat/completions"
        );
        assert_eq!(
            resolve_url("https://model.tinfoil.sh/v1/", "/chat/completions"),
            "https://model.tinfoil.sh/v1/chat/completions"
        );
        assert_eq!(
            resolve_url("https://model.tinfoil.sh/v1/", "https://model.tinfoil.sh/other"),
            "https://model.tinfoil.sh/other"
        );
    }

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://model.tinfoil.sh/v1/").unwrap(), "model.tinfoil.sh");
        assert_eq!(host_of("https://model.tinfoil.sh").unwrap(), "model.tinfoil.sh");
        assert!(host_of("http://model.tinfoil.sh").is_err());
        assert!(host_of("https:///nope").is_err());
    }
}
