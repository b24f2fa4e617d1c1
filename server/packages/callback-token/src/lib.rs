//! Short-lived HS256 tokens that authenticate a sandbox calling back with
//! the output of one execution.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const TOKEN_ISSUER: &str = "session-relay";
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 15 * 60;
const CLOCK_SKEW_LEEWAY_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct TokenClaims {
    sub: String,
    sid: String,
    iss: String,
    iat: i64,
    exp: i64,
}

/// Identity carried by a verified callback token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackClaims {
    pub execution_id: String,
    pub session_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("callback token expired")]
    Expired,
    #[error("callback token signature mismatch")]
    BadSignature,
    #[error("callback token issuer mismatch")]
    BadIssuer,
    #[error("malformed callback token")]
    Malformed,
    #[error("failed to sign callback token: {0}")]
    Signing(String),
}

impl TokenError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Expired => "token_expired",
            Self::BadSignature => "bad_signature",
            Self::BadIssuer => "bad_issuer",
            Self::Malformed => "malformed_token",
            Self::Signing(_) => "signing_failed",
        }
    }
}

#[derive(Clone)]
pub struct CallbackTokenSigner {
    secret: String,
    ttl: Duration,
}

impl std::fmt::Debug for CallbackTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackTokenSigner")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl CallbackTokenSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ttl: Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn sign(&self, execution_id: &str, session_id: &str) -> Result<String, TokenError> {
        self.sign_at(execution_id, session_id, Utc::now())
    }

    pub fn sign_at(
        &self,
        execution_id: &str,
        session_id: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let claims = TokenClaims {
            sub: execution_id.to_string(),
            sid: session_id.to_string(),
            iss: TOKEN_ISSUER.to_string(),
            iat: issued_at.timestamp(),
            exp: (issued_at + self.ttl).timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|err| TokenError::Signing(err.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<CallbackClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = CLOCK_SKEW_LEEWAY_SECS;

        let decoded = decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(map_decode_error)?;

        let claims = decoded.claims;
        if claims.sub.is_empty() || claims.sid.is_empty() {
            return Err(TokenError::Malformed);
        }
        Ok(CallbackClaims {
            execution_id: claims.sub,
            session_id: claims.sid,
            issued_at: claims.iat,
            expires_at: claims.exp,
        })
    }
}

pub fn sign(execution_id: &str, session_id: &str, secret: &str) -> Result<String, TokenError> {
    CallbackTokenSigner::new(secret).sign(execution_id, session_id)
}

pub fn verify(token: &str, secret: &str) -> Result<CallbackClaims, TokenError> {
    CallbackTokenSigner::new(secret).verify(token)
}

/// Returns the credential of a `Bearer` authorization header value.
pub fn extract_bearer(header_value: Option<&str>) -> Option<&str> {
    let raw = header_value?.trim();
    let (scheme, rest) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = rest.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

fn map_decode_error(error: jsonwebtoken::errors::Error) -> TokenError {
    match error.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => TokenError::BadSignature,
        ErrorKind::InvalidIssuer => TokenError::BadIssuer,
        _ => TokenError::Malformed,
    }
}
