//! Full end-to-end verification walkthrough
//!
//! Assembles an attestation bundle for an enclave, runs every verification
//! step, and prints the resulting audit document.

use tinfoil_verifier::{BundleFetcher, Verifier, DEFAULT_CONFIG_REPO};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "inference.tinfoil.sh".to_string());
    let repo = std::env::args()
        .nth(2)
        .unwrap_or_else(|| DEFAULT_CONFIG_REPO.to_string());

    println!("Enclave host: {host}");
    println!("Source repo:  {repo}\n");

    println!("=== Assembling bundle ===");
    let fetcher = BundleFetcher::new();
    let bundle = fetcher.assemble(&host, &repo).await?;
    println!("  release digest: {}", bundle.digest);
    println!(
        "  report format:  {:?}",
        bundle.enclave_attestation_report.format
    );

    println!("\n=== Verifying ===");
    let mut verifier = Verifier::new(&repo);
    match verifier.verify_bundle(&bundle) {
        Ok(response) => {
            println!("  enclave measurement: {}", response.measurement.fingerprint());
            println!("  TLS fingerprint:     {}", response.tls_public_key_fingerprint);
            println!("  HPKE public key:     {}", response.hpke_public_key);
        }
        Err(err) => println!("  verification failed: {err}"),
    }

    println!("\n=== Verification document ===");
    println!("{}", serde_json::to_string_pretty(verifier.document())?);

    Ok(())
}
