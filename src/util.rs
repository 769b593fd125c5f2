//! Shared helpers: bounded retry with backoff, report body decoding

use std::future::Future;
use std::io::Read;
use std::time::Duration;

use base64::Engine;
use flate2::read::GzDecoder;

use crate::error::{Error, Result};

/// Maximum attempts for any single fetch (1 initial + 2 retries).
pub(crate) const MAX_FETCH_ATTEMPTS: u32 = 3;

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);

/// Run `op` up to [`MAX_FETCH_ATTEMPTS`] times with exponential backoff
/// (500ms, 1s, 2s between attempts).
///
/// Only transient fetch failures are retried; any other error returns
/// immediately, so a parse failure makes exactly one attempt.
pub(crate) async fn retry_fetch<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = BACKOFF_INITIAL;
    for attempt in 1..=MAX_FETCH_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient_fetch() && attempt < MAX_FETCH_ATTEMPTS => {
                tracing::warn!(
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient fetch failure, backing off"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("loop returns on the final attempt")
}

/// Decode an attestation document body: base64, then gzip.
pub(crate) fn decode_document_body(body: &str) -> Result<Vec<u8>> {
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| Error::attestation_caused_by("base64 decode of report body failed", e))?;

    let mut decoder = GzDecoder::new(&compressed[..]);
    let mut report_bytes = Vec::new();
    decoder
        .read_to_end(&mut report_bytes)
        .map_err(|e| Error::attestation_caused_by("gzip decompress of report body failed", e))?;

    Ok(report_bytes)
}

#[cfg(test)]
pub(crate) fn encode_document_body(report: &[u8]) -> String {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(report).unwrap();
    let compressed = encoder.finish().unwrap();
    base64::engine::general_purpose::STANDARD.encode(compressed)
}
