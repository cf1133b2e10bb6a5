use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("No route matches path {0}")]
    NotFound(String),

    #[error("Prefix {prefix} registered twice with conflicting policy")]
    ConflictingPrefix { prefix: String },

    #[error("Invalid route prefix {0:?}: must start with '/'")]
    InvalidPrefix(String),

    #[error("Invalid target URL for prefix {prefix}: {reason}")]
    InvalidTarget { prefix: String, reason: String },
}
