use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;

use crate::telemetry::{metric_inc, CONFIRM_FAILURE, CONFIRM_SUCCESS};
use crate::worker::http_client;

/// Header (and response field) carrying the confirmation secret.
pub const HOOK_SECRET_HEADER: &str = "x-hook-secret";

/// Proves that whoever registers an endpoint also controls it.
///
/// Implementations never fail: every error is reported as `false`.
#[async_trait]
pub trait EndpointConfirmer: Send + Sync {
    async fn confirm(&self, endpoint: &str) -> bool;
}

/// Challenge/response confirmation over HTTP.
///
/// Sends `POST <endpoint>` with an empty body and an `x-hook-secret` header;
/// the endpoint is confirmed iff it answers 2xx with a JSON object echoing
/// the same secret under `x-hook-secret`. One attempt, bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct HttpConfirmer {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpConfirmer {
    pub fn new(timeout: Duration) -> Self {
        Self::with_client(http_client(), timeout)
    }

    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn challenge(&self, endpoint: &str, secret: &str) -> Result<bool, reqwest::Error> {
        let response = self
            .client
            .post(endpoint)
            .header(HOOK_SECRET_HEADER, secret)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::info!(endpoint, status = status.as_u16(), "confirmation rejected by endpoint");
            return Ok(false);
        }

        let body: serde_json::Value = response.json().await?;
        Ok(echoes_secret(&body, secret))
    }
}

#[async_trait]
impl EndpointConfirmer for HttpConfirmer {
    async fn confirm(&self, endpoint: &str) -> bool {
        let secret = generate_secret();
        let confirmed = match self.challenge(endpoint, &secret).await {
            Ok(confirmed) => confirmed,
            Err(err) => {
                tracing::info!(endpoint, error = %err, timeout = err.is_timeout(), "confirmation request failed");
                false
            }
        };

        if confirmed {
            metric_inc(CONFIRM_SUCCESS);
        } else {
            metric_inc(CONFIRM_FAILURE);
        }
        tracing::info!(endpoint, confirmed, "endpoint confirmation finished");
        confirmed
    }
}

/// 32 random bytes from the OS generator, hex encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn echoes_secret(body: &serde_json::Value, secret: &str) -> bool {
    body.as_object()
        .and_then(|object| object.get(HOOK_SECRET_HEADER))
        .and_then(|value| value.as_str())
        .map_or(false, |echoed| echoed == secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn secrets_are_unpredictable() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn only_exact_echo_confirms() {
        assert!(echoes_secret(&json!({ "x-hook-secret": "s3cret" }), "s3cret"));
        assert!(!echoes_secret(&json!({ "x-hook-secret": "other" }), "s3cret"));
        assert!(!echoes_secret(&json!({ "secret": "s3cret" }), "s3cret"));
        assert!(!echoes_secret(&json!(["s3cret"]), "s3cret"));
        assert!(!echoes_secret(&json!({ "x-hook-secret": 1 }), "s3cret"));
    }
}
