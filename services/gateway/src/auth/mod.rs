mod error;
mod identity;
mod verifier;

pub use error::AuthError;
pub use identity::{Identity, Role};
pub use verifier::{Audience, TokenClaims, TokenVerifier};

pub const BEARER_PREFIX: &str = "Bearer ";

/// Trusted headers injected for downstream services. Inbound copies are
/// always stripped so clients cannot impersonate a subject.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
