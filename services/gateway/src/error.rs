//! The single place client-facing error bodies are rendered.

use crate::auth::AuthError;
use crate::proxy::{full_body, GatewayBody, UpstreamError};
use crate::ratelimit::RateDecision;
use crate::routing::RouteError;
use crate::CORRELATION_ID_HEADER;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderValue, Response, StatusCode};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Any failure a pipeline stage can short-circuit with.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Route resolution failed: {0}")]
    Route(#[from] RouteError),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Request body exceeds limit of {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// What a client is told about a failure: a stable kind, the status and a
/// fixed message. Never carries upstream bodies, traces or secrets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedError {
    pub kind: &'static str,
    pub http_status: StatusCode,
    pub message: &'static str,
    pub upstream_status: Option<u16>,
    pub retry_after_secs: Option<u64>,
}

impl NormalizedError {
    fn new(kind: &'static str, http_status: StatusCode, message: &'static str) -> Self {
        Self {
            kind,
            http_status,
            message,
            upstream_status: None,
            retry_after_secs: None,
        }
    }

    /// Render the `{success: false, error: {...}}` envelope.
    pub fn into_response(self, correlation_id: &str) -> Response<GatewayBody> {
        let envelope = json!({
            "success": false,
            "error": {
                "kind": self.kind,
                "message": self.message,
                "correlationId": correlation_id,
            }
        });

        let mut response = Response::new(full_body(Bytes::from(envelope.to_string())));
        *response.status_mut() = self.http_status;

        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(correlation_id) {
            headers.insert(CORRELATION_ID_HEADER, value);
        }
        if let Some(secs) = self.retry_after_secs {
            headers.insert(RETRY_AFTER, HeaderValue::from(secs));
        }

        response
    }
}

impl GatewayError {
    pub fn normalize(&self) -> NormalizedError {
        match self {
            GatewayError::Route(RouteError::NotFound(_)) => NormalizedError::new(
                "ROUTE_NOT_FOUND",
                StatusCode::NOT_FOUND,
                "No route matches the requested path",
            ),
            GatewayError::Route(_) | GatewayError::Internal(_) => NormalizedError::new(
                "INTERNAL_ERROR",
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal gateway error",
            ),
            GatewayError::Auth(e) => {
                let (status, message) = match e {
                    AuthError::MissingToken => {
                        (StatusCode::UNAUTHORIZED, "Authentication required")
                    }
                    AuthError::Malformed(_) => {
                        (StatusCode::UNAUTHORIZED, "Malformed authentication token")
                    }
                    AuthError::Expired => {
                        (StatusCode::UNAUTHORIZED, "Authentication token has expired")
                    }
                    AuthError::InvalidSignature(_) => {
                        (StatusCode::UNAUTHORIZED, "Authentication token is not valid")
                    }
                    AuthError::RoleNotAllowed { .. } => (
                        StatusCode::FORBIDDEN,
                        "Your role is not allowed to access this resource",
                    ),
                };
                NormalizedError::new(e.kind(), status, message)
            }
            GatewayError::RateLimited { retry_after } => {
                let mut normalized = NormalizedError::new(
                    "RATE_LIMITED",
                    StatusCode::TOO_MANY_REQUESTS,
                    "Too many requests, retry later",
                );
                normalized.retry_after_secs = RateDecision::Denied {
                    retry_after: *retry_after,
                }
                .retry_after_secs();
                normalized
            }
            GatewayError::BodyTooLarge { .. } => NormalizedError::new(
                "PAYLOAD_TOO_LARGE",
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body exceeds the allowed size",
            ),
            GatewayError::Upstream(e) => {
                let mut normalized = match e {
                    UpstreamError::Timeout(_) => NormalizedError::new(
                        "UPSTREAM_UNAVAILABLE",
                        StatusCode::GATEWAY_TIMEOUT,
                        "The upstream service did not respond in time",
                    ),
                    UpstreamError::Connect(_) | UpstreamError::InvalidResponse { .. } => {
                        NormalizedError::new(
                            "UPSTREAM_UNAVAILABLE",
                            StatusCode::BAD_GATEWAY,
                            "The upstream service is unavailable",
                        )
                    }
                };
                if let UpstreamError::InvalidResponse { status, .. } = e {
                    normalized.upstream_status = Some(*status);
                }
                normalized
            }
        }
    }

    pub fn into_response(self, correlation_id: &str) -> Response<GatewayBody> {
        self.normalize().into_response(correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn envelope(response: Response<GatewayBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn every_kind_maps_to_its_status() {
        let cases: Vec<(GatewayError, &str, u16)> = vec![
            (
                RouteError::NotFound("/x".into()).into(),
                "ROUTE_NOT_FOUND",
                404,
            ),
            (AuthError::MissingToken.into(), "AUTH_MISSING_TOKEN", 401),
            (
                AuthError::Malformed("bad".into()).into(),
                "AUTH_MALFORMED_TOKEN",
                401,
            ),
            (AuthError::Expired.into(), "AUTH_TOKEN_EXPIRED", 401),
            (
                AuthError::InvalidSignature("sig".into()).into(),
                "AUTH_INVALID_SIGNATURE",
                401,
            ),
            (
                AuthError::RoleNotAllowed {
                    role: "MEDICO".into(),
                    prefix: "/pagos".into(),
                }
                .into(),
                "AUTH_ROLE_NOT_ALLOWED",
                403,
            ),
            (
                GatewayError::RateLimited {
                    retry_after: Duration::from_millis(1500),
                },
                "RATE_LIMITED",
                429,
            ),
            (
                GatewayError::BodyTooLarge { limit: 16 },
                "PAYLOAD_TOO_LARGE",
                413,
            ),
            (
                UpstreamError::Connect("refused".into()).into(),
                "UPSTREAM_UNAVAILABLE",
                502,
            ),
            (
                UpstreamError::Timeout(Duration::from_secs(1)).into(),
                "UPSTREAM_UNAVAILABLE",
                504,
            ),
            (
                GatewayError::Internal("boom".into()),
                "INTERNAL_ERROR",
                500,
            ),
        ];

        for (error, kind, status) in cases {
            let normalized = error.normalize();
            assert_eq!(normalized.kind, kind, "{error}");
            assert_eq!(normalized.http_status.as_u16(), status, "{error}");
        }
    }

    #[tokio::test]
    async fn envelope_carries_kind_message_and_correlation_id() {
        let response = GatewayError::from(AuthError::MissingToken).into_response("corr-123");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[CORRELATION_ID_HEADER], "corr-123");
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let body = envelope(response).await;
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"]["kind"], json!("AUTH_MISSING_TOKEN"));
        assert_eq!(body["error"]["correlationId"], json!("corr-123"));
        assert_eq!(body["error"]["message"], json!("Authentication required"));
    }

    #[tokio::test]
    async fn internal_details_never_reach_the_client() {
        let secret_detail = "jwt secret s3cr3t at /etc/keys line 42";
        let errors: Vec<GatewayError> = vec![
            AuthError::Malformed(secret_detail.into()).into(),
            AuthError::InvalidSignature(secret_detail.into()).into(),
            UpstreamError::Connect(secret_detail.into()).into(),
            GatewayError::Internal(secret_detail.into()),
        ];

        for error in errors {
            let body = envelope(error.into_response("c")).await;
            assert!(!body.to_string().contains("s3cr3t"));
        }
    }

    #[test]
    fn rate_limited_sets_retry_after_header() {
        let response = GatewayError::RateLimited {
            retry_after: Duration::from_millis(2100),
        }
        .into_response("corr");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "3");
    }

    #[test]
    fn invalid_upstream_response_keeps_upstream_status() {
        let normalized = GatewayError::from(UpstreamError::InvalidResponse {
            status: 200,
            reason: "bad header".into(),
        })
        .normalize();
        assert_eq!(normalized.http_status, StatusCode::BAD_GATEWAY);
        assert_eq!(normalized.upstream_status, Some(200));
    }
}
