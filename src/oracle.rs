//! Invoice and payment-verification oracle clients.
//!
//! The marketplace never holds funds: invoices come from an external
//! provider and settlement status from an external verifier, both plain
//! HTTP POST endpoints. Calls carry an idempotency header keyed by
//! `requestId|payeeId|amountSats` and retry transient failures with
//! exponential backoff and jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::config::{OracleEndpointConfig, PaymentVerificationConfig};
use crate::proto::PaymentSplit;
use crate::timestamp::UnixMillis;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based), jittered by up to
    /// half the base delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::rng().random_range(0..=self.base_delay_ms / 2 + 1);
        Duration::from_millis(exp.saturating_add(jitter).min(self.max_delay_ms))
    }
}

/// Oracle call failures after retries are exhausted.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("oracle returned status {0}")]
    Status(u16),
    #[error("oracle response could not be decoded: {0}")]
    Decode(String),
}

/// Request body for the invoice provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceRequest {
    pub request_id: String,
    pub payee_id: String,
    pub amount_sats: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splits: Option<Vec<PaymentSplit>>,
}

/// Invoice provider answer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceQuote {
    pub invoice: String,
    #[serde(default)]
    pub payment_hash: Option<String>,
    #[serde(default)]
    pub expires_at_ms: Option<UnixMillis>,
}

/// Request body for the verification oracle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
    pub amount_sats: u64,
    pub payee_id: String,
    pub request_id: String,
}

/// Verification oracle answer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    pub paid: bool,
    #[serde(default)]
    pub settled_at_ms: Option<UnixMillis>,
    #[serde(default)]
    pub detail: Option<String>,
}

async fn post_with_retry<Req: Serialize, Res: for<'de> Deserialize<'de>>(
    http: &reqwest::Client,
    url: &Url,
    timeout: Duration,
    retry: RetryPolicy,
    idempotency_key: &str,
    body: &Req,
) -> Result<Res, OracleError> {
    let mut last_error: Option<OracleError> = None;
    for attempt in 0..retry.max_attempts.max(1) {
        if attempt > 0 {
            tokio::time::sleep(retry.delay(attempt - 1)).await;
        }
        let result = http
            .post(url.clone())
            .timeout(timeout)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(body)
            .send()
            .await;
        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response
                        .json::<Res>()
                        .await
                        .map_err(|e| OracleError::Decode(e.to_string()));
                }
                // 4xx is final: the request itself is wrong.
                if status.is_client_error() {
                    return Err(OracleError::Status(status.as_u16()));
                }
                last_error = Some(OracleError::Status(status.as_u16()));
            }
            Err(e) => last_error = Some(OracleError::Transport(e)),
        }
        tracing::debug!(url = %url, attempt, "oracle call failed, will retry");
    }
    Err(last_error.unwrap_or(OracleError::Status(599)))
}

/// Client for the external invoice provider.
#[derive(Debug, Clone)]
pub struct InvoiceOracle {
    http: reqwest::Client,
    url: Url,
    timeout: Duration,
    retry: RetryPolicy,
}

impl InvoiceOracle {
    pub fn from_config(http: reqwest::Client, config: &OracleEndpointConfig) -> Self {
        InvoiceOracle {
            http,
            url: config.url.inner().clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            retry: RetryPolicy {
                max_attempts: config.retry_max_attempts,
                base_delay_ms: config.retry_base_delay_ms,
                max_delay_ms: config.retry_max_delay_ms,
            },
        }
    }

    pub async fn create_invoice(&self, request: &InvoiceRequest) -> Result<InvoiceQuote, OracleError> {
        let idempotency_key = format!(
            "{}|{}|{}",
            request.request_id, request.payee_id, request.amount_sats
        );
        post_with_retry(
            &self.http,
            &self.url,
            self.timeout,
            self.retry,
            &idempotency_key,
            request,
        )
        .await
    }
}

/// Client for the external payment verification oracle.
#[derive(Debug, Clone)]
pub struct VerifyOracle {
    http: reqwest::Client,
    url: Url,
    timeout: Duration,
    retry: RetryPolicy,
    pub require_preimage: bool,
}

impl VerifyOracle {
    pub fn from_config(http: reqwest::Client, config: &PaymentVerificationConfig) -> Self {
        VerifyOracle {
            http,
            url: config.url.inner().clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            retry: RetryPolicy {
                max_attempts: config.retry_max_attempts,
                base_delay_ms: config.retry_base_delay_ms,
                max_delay_ms: config.retry_max_delay_ms,
            },
            require_preimage: config.require_preimage,
        }
    }

    pub async fn verify(&self, request: &VerifyPaymentRequest) -> Result<VerifyOutcome, OracleError> {
        let idempotency_key = format!(
            "{}|{}|{}",
            request.request_id, request.payee_id, request.amount_sats
        );
        post_with_retry(
            &self.http,
            &self.url,
            self.timeout,
            self.retry,
            &idempotency_key,
            request,
        )
        .await
    }
}
