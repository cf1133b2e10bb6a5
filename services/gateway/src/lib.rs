//! Clinic API gateway: route resolution, bearer authentication, per-client
//! rate limiting and streaming reverse proxying in front of the clinic's
//! backend services.

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod routing;
pub mod server;

pub use config::GatewayConfig;
pub use error::{GatewayError, NormalizedError};
pub use server::GatewayServer;

/// Header carrying the per-request correlation id, inbound and outbound.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
