use super::context::{client_ip, correlation_id, ProxyRequestContext};
use super::{full_body, BoxError, GatewayBody, GatewayState};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::ratelimit::RateDecision;
use crate::CORRELATION_ID_HEADER;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderValue, Method, Request, Response};
use http_body::Body;
use serde_json::json;
use std::net::SocketAddr;
use tracing::{debug, info, instrument, warn, Span};

/// Runs every request through resolve -> authenticate -> rate limit ->
/// forward. Each stage either hands its result to the next or stops the
/// pipeline with a `GatewayError`.
pub struct GatewayHandler {
    state: GatewayState,
}

impl GatewayHandler {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        Ok(Self {
            state: GatewayState::new(config)?,
        })
    }

    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Never fails: errors are normalized into the response.
    #[instrument(
        skip(self, req),
        fields(method = %req.method(), path = %req.uri().path(), correlation_id)
    )]
    pub async fn handle<B>(&self, req: Request<B>, peer_addr: SocketAddr) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        self.state.metrics.record_request();

        let correlation_id = correlation_id(req.headers());
        Span::current().record("correlation_id", correlation_id.as_str());

        if req.uri().path() == self.state.config.health_path
            && matches!(*req.method(), Method::GET | Method::HEAD)
        {
            return self.health_response(&correlation_id);
        }

        match self.process(req, peer_addr, &correlation_id).await {
            Ok(mut response) => {
                if let Ok(value) = HeaderValue::from_str(&correlation_id) {
                    response.headers_mut().insert(CORRELATION_ID_HEADER, value);
                }
                self.state.metrics.record_forwarded();
                response
            }
            Err(e) => {
                let normalized = e.normalize();
                self.state.metrics.record_rejection(normalized.kind);
                if normalized.http_status.is_server_error() {
                    warn!(
                        kind = normalized.kind,
                        status = normalized.http_status.as_u16(),
                        upstream_status = ?normalized.upstream_status,
                        error = %e,
                        "Request failed"
                    );
                } else {
                    info!(
                        kind = normalized.kind,
                        status = normalized.http_status.as_u16(),
                        error = %e,
                        "Request rejected"
                    );
                }
                normalized.into_response(&correlation_id)
            }
        }
    }

    async fn process<B>(
        &self,
        req: Request<B>,
        peer_addr: SocketAddr,
        correlation_id: &str,
    ) -> Result<Response<GatewayBody>, GatewayError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        // Resolve first so unknown paths are 404 whatever the credentials.
        let route = self.state.routes.resolve(&path)?;
        debug!(prefix = %route.prefix, target = %route.target_base_url, "Route resolved");

        let ip = client_ip(
            req.headers(),
            peer_addr,
            self.state.config.trust_forwarded_for,
        );
        let identity = self
            .state
            .verifier
            .verify(req.headers().get(AUTHORIZATION), &route)?;
        let ctx = ProxyRequestContext::new(correlation_id.to_string(), route, ip)
            .with_identity(identity);

        if let Some(identity) = &ctx.identity {
            debug!(subject_id = %identity.subject_id, role = %identity.role, "Request authenticated");
        }

        let key = ctx.rate_key();
        if let RateDecision::Denied { retry_after } = self.state.limiter.acquire(&key) {
            debug!(key = %key, retry_after_ms = retry_after.as_millis(), "Rate limited");
            return Err(GatewayError::RateLimited { retry_after });
        }

        let response = self.state.upstream.forward(&ctx, req).await?;

        info!(
            method = %method,
            path = %path,
            prefix = %ctx.route.prefix,
            subject_id = ctx.identity.as_ref().map(|i| i.subject_id.as_str()),
            status = response.status().as_u16(),
            latency_ms = ctx.start_time.elapsed().as_millis(),
            "Request completed"
        );

        Ok(response)
    }

    fn health_response(&self, correlation_id: &str) -> Response<GatewayBody> {
        let body = json!({
            "status": "ok",
            "routes": self.state.routes.len(),
            "rate_limit_buckets": self.state.limiter.len(),
            "metrics": self.state.metrics.snapshot(),
        });

        let mut response = Response::new(full_body(body.to_string()));
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(correlation_id) {
            headers.insert(CORRELATION_ID_HEADER, value);
        }
        response
    }
}
