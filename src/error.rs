//! Stable wire-level error taxonomy.
//!
//! Every failure surfaced to a client carries one of the kinds below,
//! verbatim, in a `{error, details?}` body. Kinds are part of the protocol:
//! clients branch on them to decide whether to retry, pay, or fix their
//! request, so variants are never renamed.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt::Display;

use crate::envelope::EnvelopeError;

/// Error kinds shown verbatim in response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    // Input
    EmptyBody,
    PayloadTooLarge,
    InvalidJson,
    InvalidEnvelope,
    InvalidKeyId,

    // Authentication
    InvalidSignature,
    RouterKeyIdMismatch,
    ActorKeyMismatch,
    KeyIdMismatch,

    // Admission
    RouterBlocked,
    RouterMuted,
    RouterNotFollowed,
    RouterNotAllowed,
    ClientBlocked,
    ClientMuted,
    ClientNotAllowed,
    PromptTooLarge,
    MaxTokensExceeded,
    CapacityExhausted,

    // Replay / time
    NonceDuplicate,
    TsSkew,

    // Payment
    PaymentRequired,
    InvalidPaymentReceipt,
    InvalidPaymentReceiptSignature,
    PaymentAmountInvalid,
    PaymentRequestMismatch,
    PaymentRequestNotFound,
    PaymentAmountMismatch,
    InvoiceMismatch,
    PreimageRequired,
    PaymentProofMissing,
    PaymentVerifyFailed,
    NotPaid,
    InvoiceProviderNotConfigured,
    InvoiceProviderFailed,
    InvoiceMissing,

    // Routing
    NoNodes,
    NoNodesAvailable,
    NoCapableNodes,

    // Node interaction
    NodeError,
    InvalidNodeResponse,
    InvalidMetering,
    NodeResponseSignatureInvalid,
    NodeMeteringSignatureInvalid,

    // Execution
    RunnerTimeout,
    WorkerError,
    RouterPublicKeyMissing,
    InternalError,

    // Federation
    FederationDisabled,
    BidRejected,
    UnknownJob,
    InvalidJobTransition,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Reuse serde to obtain the kebab-case name.
        let json = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", json.trim_matches('"'))
    }
}

/// A terminal request failure: HTTP status plus a stable kind.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: ErrorKind,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: ErrorKind) -> Self {
        ApiError {
            status,
            kind,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<Value>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn bad_request(kind: ErrorKind) -> Self {
        Self::new(StatusCode::BAD_REQUEST, kind)
    }

    pub fn unauthorized(kind: ErrorKind) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, kind)
    }

    pub fn forbidden(kind: ErrorKind) -> Self {
        Self::new(StatusCode::FORBIDDEN, kind)
    }

    pub fn payload_too_large(kind: ErrorKind) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, kind)
    }

    pub fn too_many_requests(kind: ErrorKind) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, kind)
    }

    pub fn bad_gateway(kind: ErrorKind) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, kind)
    }

    pub fn unavailable(kind: ErrorKind) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, kind)
    }

    pub fn gateway_timeout(kind: ErrorKind) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, kind)
    }

    /// Unexpected failure. The detail string stays in the logs, never in the
    /// response body.
    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::InternalError)
    }

    /// Wire body: `{error, details?}`.
    pub fn body(&self) -> Value {
        match &self.details {
            Some(details) => json!({"error": self.kind, "details": details}),
            None => json!({"error": self.kind}),
        }
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status.as_u16(), self.kind)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

impl From<EnvelopeError> for ApiError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::EmptyBody => ApiError::bad_request(ErrorKind::EmptyBody),
            EnvelopeError::InvalidJson(d) => {
                ApiError::bad_request(ErrorKind::InvalidJson).with_details(d)
            }
            EnvelopeError::InvalidEnvelope(d) => {
                ApiError::bad_request(ErrorKind::InvalidEnvelope).with_details(d)
            }
            EnvelopeError::InvalidKeyId(d) => {
                ApiError::bad_request(ErrorKind::InvalidKeyId).with_details(d)
            }
            EnvelopeError::SignatureMissing | EnvelopeError::SignatureInvalid => {
                ApiError::unauthorized(ErrorKind::InvalidSignature)
            }
            EnvelopeError::NonceDuplicate => ApiError::bad_request(ErrorKind::NonceDuplicate),
            EnvelopeError::TsSkew => ApiError::bad_request(ErrorKind::TsSkew),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_render_kebab_case() {
        assert_eq!(ErrorKind::NonceDuplicate.to_string(), "nonce-duplicate");
        assert_eq!(ErrorKind::TsSkew.to_string(), "ts-skew");
        assert_eq!(
            ErrorKind::RouterKeyIdMismatch.to_string(),
            "router-key-id-mismatch"
        );
        assert_eq!(
            ErrorKind::InvalidPaymentReceiptSignature.to_string(),
            "invalid-payment-receipt-signature"
        );
        assert_eq!(
            ErrorKind::NoNodesAvailable.to_string(),
            "no-nodes-available"
        );
    }

    #[test]
    fn body_shape() {
        let plain = ApiError::bad_request(ErrorKind::InvalidEnvelope);
        assert_eq!(plain.body(), json!({"error": "invalid-envelope"}));

        let detailed = ApiError::bad_request(ErrorKind::MaxTokensExceeded).with_details("1025 > 1024");
        assert_eq!(
            detailed.body(),
            json!({"error": "max-tokens-exceeded", "details": "1025 > 1024"})
        );
    }

    #[test]
    fn envelope_errors_map_to_statuses() {
        let e: ApiError = EnvelopeError::EmptyBody.into();
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        let e: ApiError = EnvelopeError::SignatureInvalid.into();
        assert_eq!(e.status, StatusCode::UNAUTHORIZED);
    }
}
