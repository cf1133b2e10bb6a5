use crate::auth::Identity;
use crate::ratelimit::BucketKey;
use crate::routing::RouteSpec;
use crate::CORRELATION_ID_HEADER;
use http::HeaderMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

const MAX_CORRELATION_ID_LEN: usize = 128;
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Per-request state handed from stage to stage.
#[derive(Debug, Clone)]
pub struct ProxyRequestContext {
    pub correlation_id: String,
    pub route: Arc<RouteSpec>,
    pub identity: Option<Identity>,
    pub client_ip: IpAddr,
    pub start_time: Instant,
}

impl ProxyRequestContext {
    pub fn new(correlation_id: String, route: Arc<RouteSpec>, client_ip: IpAddr) -> Self {
        Self {
            correlation_id,
            route,
            identity: None,
            client_ip,
            start_time: Instant::now(),
        }
    }

    pub fn with_identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = identity;
        self
    }

    /// Authenticated callers are limited per subject, everyone else per IP.
    pub fn rate_key(&self) -> BucketKey {
        match &self.identity {
            Some(identity) => BucketKey::for_subject(&identity.subject_id, &self.route.rate_class),
            None => BucketKey::for_ip(self.client_ip, &self.route.rate_class),
        }
    }
}

/// Reuse the caller's correlation id when it is a sane token, otherwise mint one.
pub fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| {
            !id.is_empty()
                && id.len() <= MAX_CORRELATION_ID_LEN
                && id.bytes().all(|b| b.is_ascii_graphic())
        })
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

pub fn client_ip(headers: &HeaderMap, peer_addr: SocketAddr, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer_addr.ip()
}
