use super::context::ProxyRequestContext;
use super::error::UpstreamError;
use super::headers::strip_hop_by_hop;
use super::{BoxError, GatewayBody};
use crate::auth::{USER_ID_HEADER, USER_ROLE_HEADER};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;
use crate::CORRELATION_ID_HEADER;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderValue, Method, Request, Response};
use http_body::{Body, Frame};
use http_body_util::{BodyExt, LengthLimitError, Limited, StreamBody};
use reqwest::Client;
use std::error::Error as StdError;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

const FORWARDED_FOR: &str = "x-forwarded-for";
const FORWARDED_PROTO: &str = "x-forwarded-proto";
const FORWARDED_HOST: &str = "x-forwarded-host";

/// Outbound request body. Buffered bodies can be replayed for a retry,
/// streamed ones are sent at most once.
enum OutboundBody {
    Buffered(Bytes),
    Streamed(Option<reqwest::Body>),
}

impl OutboundBody {
    fn take(&mut self) -> Option<reqwest::Body> {
        match self {
            OutboundBody::Buffered(bytes) if bytes.is_empty() => None,
            OutboundBody::Buffered(bytes) => Some(reqwest::Body::from(bytes.clone())),
            OutboundBody::Streamed(body) => body.take(),
        }
    }

    fn replayable(&self) -> bool {
        matches!(self, OutboundBody::Buffered(_))
    }
}

pub struct UpstreamClient {
    http_client: Client,
    timeout: Duration,
    max_body_size_bytes: usize,
    forward_auth_header: bool,
    trust_forwarded_for: bool,
    forwarded_proto: &'static str,
    metrics: Arc<GatewayMetrics>,
}

impl UpstreamClient {
    pub fn new(config: &GatewayConfig, metrics: Arc<GatewayMetrics>) -> anyhow::Result<Self> {
        // The per-call deadline is enforced in `forward`, so the client only
        // bounds connection setup.
        let http_client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(20)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            http_client,
            timeout: config.upstream_timeout(),
            max_body_size_bytes: config.max_body_size_bytes,
            forward_auth_header: config.forward_auth_header,
            trust_forwarded_for: config.trust_forwarded_for,
            forwarded_proto: if config.enable_tls { "https" } else { "http" },
            metrics,
        })
    }

    /// Send `req` to the route's backend and stream the answer back.
    ///
    /// Any status the backend returns is passed through untouched; only
    /// transport failures become errors.
    #[instrument(
        skip(self, ctx, req),
        fields(
            method = %req.method(),
            prefix = %ctx.route.prefix,
            correlation_id = %ctx.correlation_id
        )
    )]
    pub async fn forward<B>(
        &self,
        ctx: &ProxyRequestContext,
        req: Request<B>,
    ) -> Result<Response<GatewayBody>, GatewayError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();

        if let Some(length) = declared_length(&parts.headers) {
            if length > self.max_body_size_bytes as u64 {
                return Err(GatewayError::BodyTooLarge {
                    limit: self.max_body_size_bytes,
                });
            }
        }

        let upstream_url = ctx
            .route
            .upstream_url(parts.uri.path(), parts.uri.query());
        let headers = self.outbound_headers(ctx, &parts.headers)?;

        let limited = Limited::new(body, self.max_body_size_bytes);
        let mut body = if parts.method == Method::GET || parts.method == Method::HEAD {
            let bytes = limited
                .collect()
                .await
                .map_err(|e| self.body_error(&*e))?
                .to_bytes();
            OutboundBody::Buffered(bytes)
        } else {
            OutboundBody::Streamed(Some(reqwest::Body::wrap_stream(
                limited.into_data_stream(),
            )))
        };

        debug!(upstream_url = %upstream_url, "Forwarding request to upstream");

        let start = std::time::Instant::now();
        let deadline = Instant::now() + self.timeout;
        let mut retried = false;

        let upstream_response = loop {
            let mut request = self
                .http_client
                .request(parts.method.clone(), &upstream_url)
                .headers(headers.clone())
                .timeout(deadline.saturating_duration_since(Instant::now()));
            if let Some(outbound) = body.take() {
                request = request.body(outbound);
            }

            let err = match timeout_at(deadline, request.send()).await {
                Ok(Ok(response)) => break response,
                Ok(Err(err)) => err,
                Err(_) => {
                    warn!(timeout_ms = self.timeout.as_millis(), "Upstream timed out");
                    return Err(UpstreamError::Timeout(self.timeout).into());
                }
            };

            if is_body_limit_error(&err) {
                return Err(GatewayError::BodyTooLarge {
                    limit: self.max_body_size_bytes,
                });
            }

            if !retried
                && body.replayable()
                && is_connection_reset(&err)
                && Instant::now() < deadline
            {
                retried = true;
                self.metrics.record_retry();
                warn!(error = %err, "Upstream connection reset, retrying once");
                continue;
            }

            warn!(error = %err, "Upstream request failed");
            return Err(UpstreamError::from_reqwest(err, self.timeout).into());
        };

        let status = upstream_response.status();
        info!(
            status = status.as_u16(),
            latency_ms = start.elapsed().as_millis(),
            retried,
            "Upstream response received"
        );

        if status.is_informational() {
            return Err(UpstreamError::InvalidResponse {
                status: status.as_u16(),
                reason: "informational status as final response".to_string(),
            }
            .into());
        }

        let response_headers = strip_hop_by_hop(upstream_response.headers());
        let stream = upstream_response
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(|e| -> BoxError { Box::new(e) });

        let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }

    fn outbound_headers(
        &self,
        ctx: &ProxyRequestContext,
        inbound: &HeaderMap,
    ) -> Result<HeaderMap, GatewayError> {
        let mut headers = strip_hop_by_hop(inbound);
        let original_host = headers.remove(HOST);

        // Identity is only ever asserted by the gateway.
        headers.remove(USER_ID_HEADER);
        headers.remove(USER_ROLE_HEADER);
        if !self.forward_auth_header {
            headers.remove(AUTHORIZATION);
        }

        headers.insert(CORRELATION_ID_HEADER, header_value(&ctx.correlation_id)?);

        if let Some(identity) = &ctx.identity {
            headers.insert(USER_ID_HEADER, header_value(&identity.subject_id)?);
            headers.insert(USER_ROLE_HEADER, header_value(identity.role.as_str())?);
        }

        if !(self.trust_forwarded_for && headers.contains_key(FORWARDED_FOR)) {
            headers.insert(FORWARDED_FOR, header_value(&ctx.client_ip.to_string())?);
        }
        headers.insert(FORWARDED_PROTO, HeaderValue::from_static(self.forwarded_proto));
        if let Some(host) = original_host {
            headers.insert(FORWARDED_HOST, host);
        }

        Ok(headers)
    }

    fn body_error(&self, err: &(dyn StdError + 'static)) -> GatewayError {
        if err.is::<LengthLimitError>() {
            GatewayError::BodyTooLarge {
                limit: self.max_body_size_bytes,
            }
        } else {
            GatewayError::Internal(format!("Failed to read request body: {}", err))
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue, GatewayError> {
    HeaderValue::from_str(value)
        .map_err(|e| GatewayError::Internal(format!("Invalid outbound header value: {}", e)))
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn error_chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

fn is_body_limit_error(err: &reqwest::Error) -> bool {
    error_chain(err).any(|e| e.is::<LengthLimitError>())
}

/// The connection died under an otherwise healthy request. Refused
/// connections are not included: there is nothing to retry against.
fn is_connection_reset(err: &reqwest::Error) -> bool {
    error_chain(err).any(|e| {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            );
        }
        e.downcast_ref::<hyper::Error>()
            .is_some_and(|h| h.is_incomplete_message())
    })
}
