mod context;
mod error;
pub(crate) mod handler;
mod headers;
mod upstream;

pub use context::{client_ip, correlation_id, ProxyRequestContext};
pub use error::UpstreamError;
pub use handler::GatewayHandler;
pub use upstream::UpstreamClient;

use crate::auth::TokenVerifier;
use crate::config::GatewayConfig;
use crate::metrics::GatewayMetrics;
use crate::ratelimit::RateLimiter;
use crate::routing::RouteTable;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use std::convert::Infallible;
use std::sync::Arc;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the gateway writes, streamed or rendered.
pub type GatewayBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full_body(bytes: impl Into<Bytes>) -> GatewayBody {
    Full::new(bytes.into())
        .map_err(|never: Infallible| -> BoxError { match never {} })
        .boxed_unsync()
}

#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub routes: Arc<RouteTable>,
    pub verifier: Arc<TokenVerifier>,
    pub limiter: Arc<RateLimiter>,
    pub upstream: Arc<UpstreamClient>,
    pub metrics: Arc<GatewayMetrics>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        config.validate()?;

        let routes = Arc::new(
            RouteTable::from_specs(config.routes.iter().cloned())
                .context("Failed to build route table")?,
        );
        let verifier = Arc::new(TokenVerifier::new(&config)?);
        let limiter = Arc::new(RateLimiter::new(
            &config.rate_classes,
            config.rate_limit_max_keys,
        ));
        let metrics = Arc::new(GatewayMetrics::new());
        let upstream = Arc::new(UpstreamClient::new(&config, Arc::clone(&metrics))?);

        Ok(Self {
            config: Arc::new(config),
            routes,
            verifier,
            limiter,
            upstream,
            metrics,
        })
    }
}
