use thiserror::Error;

/// Reasons a bearer credential is rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing Authorization header")]
    MissingToken,

    #[error("Malformed bearer token: {0}")]
    Malformed(String),

    #[error("Token expired")]
    Expired,

    #[error("Token signature or issuer not trusted: {0}")]
    InvalidSignature(String),

    #[error("Role {role} is not allowed on route {prefix}")]
    RoleNotAllowed { role: String, prefix: String },
}

impl AuthError {
    /// Stable machine-readable kind rendered in error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "AUTH_MISSING_TOKEN",
            AuthError::Malformed(_) => "AUTH_MALFORMED_TOKEN",
            AuthError::Expired => "AUTH_TOKEN_EXPIRED",
            AuthError::InvalidSignature(_) => "AUTH_INVALID_SIGNATURE",
            AuthError::RoleNotAllowed { .. } => "AUTH_ROLE_NOT_ALLOWED",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature
            | ErrorKind::InvalidIssuer
            | ErrorKind::InvalidAudience
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::ImmatureSignature => AuthError::InvalidSignature(err.to_string()),
            _ => AuthError::Malformed(err.to_string()),
        }
    }
}
