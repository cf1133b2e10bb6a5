use super::{AuthError, Identity, Role, BEARER_PREFIX};
use crate::config::{GatewayConfig, JwtAlgorithm};
use crate::routing::RouteSpec;
use anyhow::Context;
use chrono::DateTime;
use http::HeaderValue;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::{debug, warn};

/// Claims the gateway reads from access tokens issued by the auth service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
}

/// `aud` may be a single string or an array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

/// Stateless bearer token verification against the configured key.
pub struct TokenVerifier {
    jwt: Option<(DecodingKey, Validation)>,
}

impl TokenVerifier {
    pub fn new(config: &GatewayConfig) -> anyhow::Result<Self> {
        if !config.has_jwt_key() {
            return Ok(Self { jwt: None });
        }

        let algorithm = match config.jwt_algorithm {
            JwtAlgorithm::HS256 => Algorithm::HS256,
            JwtAlgorithm::HS384 => Algorithm::HS384,
            JwtAlgorithm::HS512 => Algorithm::HS512,
            JwtAlgorithm::RS256 => Algorithm::RS256,
            JwtAlgorithm::RS384 => Algorithm::RS384,
            JwtAlgorithm::RS512 => Algorithm::RS512,
            JwtAlgorithm::ES256 => Algorithm::ES256,
            JwtAlgorithm::ES384 => Algorithm::ES384,
        };

        let decoding_key = if config.jwt_algorithm.is_hmac() {
            let secret = config
                .jwt_secret
                .as_ref()
                .context("JWT secret missing for HMAC algorithm")?;
            DecodingKey::from_secret(secret.as_bytes())
        } else {
            let key_path = config
                .jwt_public_key_path
                .as_ref()
                .context("JWT public key path missing for asymmetric algorithm")?;
            let key_data = fs::read(key_path)
                .with_context(|| format!("Failed to read JWT public key {:?}", key_path))?;
            match config.jwt_algorithm {
                JwtAlgorithm::ES256 | JwtAlgorithm::ES384 => DecodingKey::from_ec_pem(&key_data)?,
                _ => DecodingKey::from_rsa_pem(&key_data)?,
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.algorithms = vec![algorithm];
        validation.leeway = config.jwt_leeway_secs;
        validation.set_required_spec_claims(&["exp", "sub"]);

        if let Some(issuer) = &config.jwt_issuer {
            validation.set_issuer(&[issuer]);
        }

        match &config.jwt_audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Ok(Self {
            jwt: Some((decoding_key, validation)),
        })
    }

    /// Authenticate a request against a route's policy.
    ///
    /// Public routes never fail here: a valid token still yields an identity
    /// so rate limiting can key on the subject, anything else is anonymous.
    pub fn verify(
        &self,
        authorization: Option<&HeaderValue>,
        route: &RouteSpec,
    ) -> Result<Option<Identity>, AuthError> {
        if !route.requires_auth {
            let identity = match authorization {
                Some(header) => match self.authenticate(header) {
                    Ok(identity) => Some(identity),
                    Err(e) => {
                        debug!(error = %e, prefix = %route.prefix, "Ignoring invalid token on public route");
                        None
                    }
                },
                None => None,
            };
            return Ok(identity);
        }

        let header = authorization.ok_or(AuthError::MissingToken)?;
        let identity = self.authenticate(header)?;

        if !route.role_allowed(&identity.role) {
            warn!(
                subject_id = %identity.subject_id,
                role = %identity.role,
                prefix = %route.prefix,
                "Role not allowed on route"
            );
            return Err(AuthError::RoleNotAllowed {
                role: identity.role.to_string(),
                prefix: route.prefix.clone(),
            });
        }

        Ok(Some(identity))
    }

    /// Decode an `Authorization` header value into an identity.
    pub fn authenticate(&self, header: &HeaderValue) -> Result<Identity, AuthError> {
        let raw = header
            .to_str()
            .map_err(|_| AuthError::Malformed("Authorization header is not ASCII".to_string()))?;
        let token = bearer_token(raw)?;
        self.decode_token(token)
    }

    pub fn decode_token(&self, token: &str) -> Result<Identity, AuthError> {
        let (decoding_key, validation) = self
            .jwt
            .as_ref()
            .ok_or_else(|| AuthError::InvalidSignature("No verification key configured".to_string()))?;

        let claims = decode::<TokenClaims>(token, decoding_key, validation)?.claims;

        let role_name = claims
            .role
            .or_else(|| claims.roles.and_then(|roles| roles.into_iter().next()))
            .ok_or_else(|| AuthError::Malformed("Token carries no role".to_string()))?;
        let role: Role = role_name
            .parse()
            .map_err(|e: anyhow::Error| AuthError::Malformed(e.to_string()))?;

        let token_expiry = DateTime::from_timestamp(claims.exp, 0)
            .ok_or_else(|| AuthError::Malformed("Token expiry out of range".to_string()))?;

        if claims.sub.trim().is_empty() {
            return Err(AuthError::Malformed("Token subject is empty".to_string()));
        }
        // The subject is forwarded as X-User-Id.
        if HeaderValue::from_str(&claims.sub).is_err() {
            return Err(AuthError::Malformed(
                "Token subject is not a valid header value".to_string(),
            ));
        }

        Ok(Identity {
            subject_id: claims.sub,
            role,
            token_expiry,
        })
    }
}

fn bearer_token(raw: &str) -> Result<&str, AuthError> {
    let raw = raw.trim();
    let scheme_ok = raw
        .get(..BEARER_PREFIX.len())
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case(BEARER_PREFIX));
    if !scheme_ok {
        return Err(AuthError::Malformed("Expected a Bearer token".to_string()));
    }
    let token = raw[BEARER_PREFIX.len()..].trim();
    if token.is_empty() {
        return Err(AuthError::Malformed("Bearer token is empty".to_string()));
    }
    Ok(token)
}
