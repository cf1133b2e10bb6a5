use crate::ratelimit::RateClassConfig;
use crate::routing::{RouteSpec, RouteTable};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listen host address
    pub host: String,

    /// Listen port
    pub port: u16,

    /// Route table entries, in registration order
    pub routes: Vec<RouteSpec>,

    /// Token bucket parameters per rate class
    pub rate_classes: BTreeMap<String, RateClassConfig>,

    /// Per-call upstream timeout in milliseconds
    pub upstream_timeout_ms: u64,

    /// Upstream TCP connect timeout in milliseconds
    pub upstream_connect_timeout_ms: u64,

    /// Maximum request body size in bytes
    pub max_body_size_bytes: usize,

    /// JWT algorithm (HS256, RS256, ES256, ...)
    pub jwt_algorithm: JwtAlgorithm,

    /// JWT shared secret for HMAC algorithms
    pub jwt_secret: Option<String>,

    /// JWT public key path for RSA/ECDSA algorithms
    pub jwt_public_key_path: Option<PathBuf>,

    /// Expected JWT issuer
    pub jwt_issuer: Option<String>,

    /// Expected JWT audience
    pub jwt_audience: Option<String>,

    /// Allowed clock skew when checking token expiry
    pub jwt_leeway_secs: u64,

    /// Forward Authorization header to upstream
    pub forward_auth_header: bool,

    /// Use the first X-Forwarded-For entry as the client IP
    pub trust_forwarded_for: bool,

    /// Ceiling on live rate-limit buckets before LRU eviction
    pub rate_limit_max_keys: usize,

    /// Path answered by the gateway itself with health and counters
    pub health_path: String,

    /// Terminate TLS on the listener
    pub enable_tls: bool,

    /// TLS certificate path
    pub tls_cert_path: Option<PathBuf>,

    /// TLS private key path
    pub tls_key_path: Option<PathBuf>,

    /// Log level
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum JwtAlgorithm {
    #[default]
    HS256,
    HS384,
    HS512,
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
}

impl JwtAlgorithm {
    pub fn is_hmac(&self) -> bool {
        matches!(
            self,
            JwtAlgorithm::HS256 | JwtAlgorithm::HS384 | JwtAlgorithm::HS512
        )
    }
}

impl std::str::FromStr for JwtAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "HS256" => Ok(JwtAlgorithm::HS256),
            "HS384" => Ok(JwtAlgorithm::HS384),
            "HS512" => Ok(JwtAlgorithm::HS512),
            "RS256" => Ok(JwtAlgorithm::RS256),
            "RS384" => Ok(JwtAlgorithm::RS384),
            "RS512" => Ok(JwtAlgorithm::RS512),
            "ES256" => Ok(JwtAlgorithm::ES256),
            "ES384" => Ok(JwtAlgorithm::ES384),
            _ => anyhow::bail!("Unsupported JWT algorithm: {}", s),
        }
    }
}

/// Shape of the routes file / `GATEWAY_ROUTES` value.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutesDocument {
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub rate_classes: BTreeMap<String, RateClassConfig>,
}

impl RoutesDocument {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid routes document")
    }
}

/// Rate classes every deployment starts with; documents may override them.
pub fn default_rate_classes() -> BTreeMap<String, RateClassConfig> {
    BTreeMap::from([
        (
            crate::routing::DEFAULT_RATE_CLASS.to_string(),
            RateClassConfig {
                capacity: 60,
                refill_per_second: 1.0,
            },
        ),
        (
            "auth".to_string(),
            RateClassConfig {
                capacity: 5,
                refill_per_second: 1.0 / 12.0,
            },
        ),
    ])
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl GatewayConfig {
    /// Defaults for every setting, with the given routes.
    pub fn with_routes(routes: Vec<RouteSpec>) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            routes,
            rate_classes: default_rate_classes(),
            upstream_timeout_ms: 10_000,
            upstream_connect_timeout_ms: 2_000,
            max_body_size_bytes: 10 * 1024 * 1024,
            jwt_algorithm: JwtAlgorithm::default(),
            jwt_secret: None,
            jwt_public_key_path: None,
            jwt_issuer: None,
            jwt_audience: None,
            jwt_leeway_secs: 0,
            forward_auth_header: false,
            trust_forwarded_for: false,
            rate_limit_max_keys: 100_000,
            health_path: "/__gateway/health".to_string(),
            enable_tls: false,
            tls_cert_path: None,
            tls_key_path: None,
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let document = match std::env::var("GATEWAY_ROUTES_FILE").ok() {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read GATEWAY_ROUTES_FILE {}", path))?;
                RoutesDocument::parse(&raw)
                    .with_context(|| format!("Invalid routes file {}", path))?
            }
            None => {
                let raw = std::env::var("GATEWAY_ROUTES")
                    .context("Either GATEWAY_ROUTES_FILE or GATEWAY_ROUTES must be set")?;
                RoutesDocument::parse(&raw).context("Invalid GATEWAY_ROUTES")?
            }
        };

        let mut config = Self::with_routes(document.routes);
        config.rate_classes.extend(document.rate_classes);

        config.host = env_or("GATEWAY_HOST", "0.0.0.0");
        config.port = env_or("GATEWAY_PORT", "8080")
            .parse()
            .context("Invalid GATEWAY_PORT")?;

        config.upstream_timeout_ms = env_or("UPSTREAM_TIMEOUT_MS", "10000")
            .parse()
            .context("Invalid UPSTREAM_TIMEOUT_MS")?;

        config.upstream_connect_timeout_ms = env_or("UPSTREAM_CONNECT_TIMEOUT_MS", "2000")
            .parse()
            .context("Invalid UPSTREAM_CONNECT_TIMEOUT_MS")?;

        config.max_body_size_bytes = env_or("MAX_BODY_SIZE_BYTES", "10485760") // 10MB
            .parse()
            .context("Invalid MAX_BODY_SIZE_BYTES")?;

        config.jwt_algorithm = env_or("JWT_ALGORITHM", "HS256").parse()?;
        config.jwt_secret = std::env::var("JWT_SECRET").ok();
        config.jwt_public_key_path = std::env::var("JWT_PUBLIC_KEY_PATH").ok().map(PathBuf::from);
        config.jwt_issuer = std::env::var("JWT_ISSUER").ok();
        config.jwt_audience = std::env::var("JWT_AUDIENCE").ok();
        config.jwt_leeway_secs = env_or("JWT_LEEWAY_SECS", "0")
            .parse()
            .context("Invalid JWT_LEEWAY_SECS")?;

        config.forward_auth_header = env_or("FORWARD_AUTH_HEADER", "false")
            .parse()
            .context("Invalid FORWARD_AUTH_HEADER")?;

        config.trust_forwarded_for = env_or("TRUST_FORWARDED_FOR", "false")
            .parse()
            .context("Invalid TRUST_FORWARDED_FOR")?;

        config.rate_limit_max_keys = env_or("RATE_LIMIT_MAX_KEYS", "100000")
            .parse()
            .context("Invalid RATE_LIMIT_MAX_KEYS")?;

        config.health_path = env_or("HEALTH_PATH", "/__gateway/health");

        config.enable_tls = env_or("ENABLE_TLS", "false")
            .parse()
            .context("Invalid ENABLE_TLS")?;
        config.tls_cert_path = std::env::var("TLS_CERT_PATH").ok().map(PathBuf::from);
        config.tls_key_path = std::env::var("TLS_KEY_PATH").ok().map(PathBuf::from);

        config.log_level = env_or("LOG_LEVEL", "info");

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.routes.is_empty() {
            anyhow::bail!("At least one route must be configured");
        }

        // Surfaces bad prefixes, bad targets and conflicting duplicates.
        RouteTable::from_specs(self.routes.iter().cloned())
            .context("Invalid route configuration")?;

        for (name, class) in &self.rate_classes {
            class
                .validate()
                .with_context(|| format!("Invalid rate class {}", name))?;
        }

        for route in &self.routes {
            if !self.rate_classes.contains_key(&route.rate_class) {
                anyhow::bail!(
                    "Route {} references unknown rate class {}",
                    route.prefix,
                    route.rate_class
                );
            }
        }

        // Validate JWT configuration
        if self.routes.iter().any(|r| r.requires_auth) {
            if self.jwt_algorithm.is_hmac() {
                if self.jwt_secret.as_deref().map_or(true, str::is_empty) {
                    anyhow::bail!("JWT_SECRET is required for HMAC algorithms (HS256/HS384/HS512)");
                }
            } else {
                match &self.jwt_public_key_path {
                    None => anyhow::bail!("JWT_PUBLIC_KEY_PATH is required for RSA/ECDSA algorithms"),
                    Some(path) if !path.exists() => {
                        anyhow::bail!("JWT public key file not found: {:?}", path)
                    }
                    Some(_) => {}
                }
            }
        }

        // Validate TLS configuration
        if self.enable_tls {
            for (var, path) in [
                ("TLS_CERT_PATH", &self.tls_cert_path),
                ("TLS_KEY_PATH", &self.tls_key_path),
            ] {
                match path {
                    None => anyhow::bail!("{} is required when ENABLE_TLS is true", var),
                    Some(path) if !path.exists() => {
                        anyhow::bail!("{} file not found: {:?}", var, path)
                    }
                    Some(_) => {}
                }
            }
        }

        if self.upstream_timeout_ms == 0 {
            anyhow::bail!("UPSTREAM_TIMEOUT_MS must be greater than 0");
        }

        if self.upstream_connect_timeout_ms == 0 {
            anyhow::bail!("UPSTREAM_CONNECT_TIMEOUT_MS must be greater than 0");
        }

        if self.max_body_size_bytes == 0 {
            anyhow::bail!("MAX_BODY_SIZE_BYTES must be greater than 0");
        }

        if self.rate_limit_max_keys == 0 {
            anyhow::bail!("RATE_LIMIT_MAX_KEYS must be greater than 0");
        }

        if !self.health_path.starts_with('/') {
            anyhow::bail!("HEALTH_PATH must start with '/'");
        }

        // The root catch-all is allowed to sit underneath the health path.
        if let Some(route) = self
            .routes
            .iter()
            .find(|r| r.prefix != "/" && r.matches(&self.health_path))
        {
            anyhow::bail!(
                "Route {} shadows HEALTH_PATH {}; choose another health path",
                route.prefix,
                self.health_path
            );
        }

        Ok(())
    }

    /// Whether key material for the configured algorithm is present
    pub fn has_jwt_key(&self) -> bool {
        if self.jwt_algorithm.is_hmac() {
            self.jwt_secret.is_some()
        } else {
            self.jwt_public_key_path.is_some()
        }
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_connect_timeout_ms)
    }

    /// Get the listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
