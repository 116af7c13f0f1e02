//! Push provider seam.
//!
//! The transport is a black box: hand it a token batch and a message, get a
//! per-token outcome back. `HttpPushProvider` speaks a simple JSON batch API;
//! `NoopPushProvider` stands in when no credentials are configured.

use async_trait::async_trait;
use serde::Deserialize;

use courier_common::error::CourierError;

use crate::message::PushMessage;

/// Per-token result of a provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenOutcome {
    pub token: String,
    pub status: TokenStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    Delivered,
    /// Transient provider-side failure; eligible for the retry queue.
    Retryable(String),
    /// Token rejected as unregistered/invalid; purge it from the directory.
    Invalid(String),
}

/// Classify a provider error code.
///
/// Unknown codes are treated as retryable — the retry queue's attempt ceiling
/// bounds them either way, while misclassifying a live token as invalid would
/// permanently silence the device.
pub fn classify_error_code(code: &str) -> TokenStatus {
    match code.to_ascii_lowercase().as_str() {
        "unregistered" | "invalid-token" | "invalid-registration" | "mismatched-sender" => {
            TokenStatus::Invalid(code.to_string())
        }
        _ => TokenStatus::Retryable(code.to_string()),
    }
}

#[async_trait]
pub trait PushProvider: Send + Sync {
    /// Send one message to a batch of tokens.
    ///
    /// A transport-level failure (connect error, non-2xx response) is an
    /// `Err` — the whole call is retryable. Per-token failures come back as
    /// outcomes and never fail the call.
    async fn send_to_tokens(
        &self,
        tokens: &[String],
        message: &PushMessage,
    ) -> Result<Vec<TokenOutcome>, CourierError>;
}

/// HTTP batch provider client.
pub struct HttpPushProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    results: Vec<ProviderResult>,
}

#[derive(Debug, Deserialize)]
struct ProviderResult {
    token: String,
    success: bool,
    error_code: Option<String>,
}

impl HttpPushProvider {
    pub fn new(endpoint: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl PushProvider for HttpPushProvider {
    async fn send_to_tokens(
        &self,
        tokens: &[String],
        message: &PushMessage,
    ) -> Result<Vec<TokenOutcome>, CourierError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "tokens": tokens,
                "message": message,
            }))
            .send()
            .await
            .map_err(|e| CourierError::PushTransport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CourierError::PushTransport(format!(
                "provider returned {status}"
            )));
        }

        let parsed: ProviderResponse = response
            .json()
            .await
            .map_err(|e| CourierError::PushTransport(e.to_string()))?;

        Ok(parsed
            .results
            .into_iter()
            .map(|r| TokenOutcome {
                status: if r.success {
                    TokenStatus::Delivered
                } else {
                    classify_error_code(r.error_code.as_deref().unwrap_or("unknown"))
                },
                token: r.token,
            })
            .collect())
    }
}

/// Stand-in provider for deployments without push credentials.
/// Reports every token as delivered so nothing queues up behind it.
pub struct NoopPushProvider;

#[async_trait]
impl PushProvider for NoopPushProvider {
    async fn send_to_tokens(
        &self,
        tokens: &[String],
        _message: &PushMessage,
    ) -> Result<Vec<TokenOutcome>, CourierError> {
        tracing::debug!(tokens = tokens.len(), "Push disabled, dropping batch");
        Ok(tokens
            .iter()
            .map(|t| TokenOutcome {
                token: t.clone(),
                status: TokenStatus::Delivered,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_invalid_codes() {
        assert!(matches!(
            classify_error_code("unregistered"),
            TokenStatus::Invalid(_)
        ));
        assert!(matches!(
            classify_error_code("INVALID-TOKEN"),
            TokenStatus::Invalid(_)
        ));
        assert!(matches!(
            classify_error_code("mismatched-sender"),
            TokenStatus::Invalid(_)
        ));
    }

    #[test]
    fn test_classify_transient_codes() {
        for code in ["unavailable", "internal", "quota-exceeded", "something-new"] {
            assert!(
                matches!(classify_error_code(code), TokenStatus::Retryable(_)),
                "{code} should be retryable"
            );
        }
    }
}
