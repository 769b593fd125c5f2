//! Encrypted-transport request demo
//!
//! Attests the default router on first use, then sends a chat completion
//! whose body is end-to-end encrypted to the enclave.

use tinfoil_verifier::{ClientConfig, RequestInit, SecureClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = SecureClient::new(ClientConfig::default())?;

    client.ready().await?;
    println!("attested enclave: {}", client.enclave_url().await.unwrap_or_default());

    let body = serde_json::json!({
        "model": "llama3-3-70b",
        "messages": [{"role": "user", "content": "Say hello from inside the enclave."}],
    });

    let response = client
        .fetch(
            "chat/completions",
            RequestInit {
                method: "POST".to_string(),
                headers: vec![("Content-Type".to_string(), "application/json".to_string())],
                body: Some(serde_json::to_vec(&body)?),
            },
        )
        .await?;

    println!("status: {}", response.status);
    println!("{}", response.text());

    if let Some(document) = client.verification_document() {
        println!(
            "\nsecurity verified: {} (digest {})",
            document.security_verified, document.release_digest
        );
    }

    Ok(())
}
