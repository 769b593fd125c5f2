//! Error types for the verifier and secure client

use thiserror::Error;

type Cause = Box<dyn std::error::Error + Send + Sync>;

/// Every failure surfaced by this crate falls into one of four classes.
///
/// - [`Error::Configuration`] is raised eagerly for inconsistent caller
///   options and is never retried.
/// - [`Error::Fetch`] covers network failures, non-2xx responses, and
///   malformed response bodies; the bundle assembler retries these.
/// - [`Error::Attestation`] covers every cryptographic, policy, or binding
///   failure and is fatal to the current verification attempt.
/// - [`Error::KeyConfigMismatch`] is the transport sentinel raised when the
///   server has rotated its HPKE key config before accepting the request.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("fetch failed: {message}")]
    Fetch {
        message: String,
        #[source]
        source: Option<Cause>,
    },

    #[error("attestation verification failed: {message}")]
    Attestation {
        message: String,
        #[source]
        source: Option<Cause>,
    },

    #[error("server HPKE key configuration no longer matches the client's encapsulated key")]
    KeyConfigMismatch,
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub fn fetch(message: impl Into<String>) -> Self {
        Error::Fetch {
            message: message.into(),
            source: None,
        }
    }

    pub fn fetch_caused_by(message: impl Into<String>, cause: impl Into<Cause>) -> Self {
        Error::Fetch {
            message: message.into(),
            source: Some(cause.into()),
        }
    }

    pub fn attestation(message: impl Into<String>) -> Self {
        Error::Attestation {
            message: message.into(),
            source: None,
        }
    }

    pub fn attestation_caused_by(message: impl Into<String>, cause: impl Into<Cause>) -> Self {
        Error::Attestation {
            message: message.into(),
            source: Some(cause.into()),
        }
    }

    /// Whether the bundle assembler may retry after this failure.
    ///
    /// Only fetch failures are transient; parse, policy, and crypto failures
    /// are deterministic and retrying them would return the same answer.
    pub fn is_transient_fetch(&self) -> bool {
        matches!(self, Error::Fetch { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::fetch_caused_by(err.to_string(), err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
