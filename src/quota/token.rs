//! Signed usage tokens.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::{Result, SkaldError};

/// Claims carried by a usage token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Account id the token was issued to.
    pub sub: String,
    /// Expiry, seconds since the unix epoch.
    pub exp: u64,
    #[serde(default)]
    pub premium: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_text_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_check_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_quota: Option<usize>,
}

impl Claims {
    /// Claims for `account_id`, valid for `ttl` from now.
    pub fn new(account_id: impl Into<String>, ttl: Duration) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sub: account_id.into(),
            exp: (now + ttl).as_secs(),
            premium: false,
            max_text_length: None,
            max_check_time_ms: None,
            request_quota: None,
        }
    }

    pub fn premium(mut self, premium: bool) -> Self {
        self.premium = premium;
        self
    }

    pub fn max_text_length(mut self, n: usize) -> Self {
        self.max_text_length = Some(n);
        self
    }

    pub fn max_check_time(mut self, limit: Duration) -> Self {
        self.max_check_time_ms = Some(limit.as_millis() as u64);
        self
    }

    pub fn request_quota(mut self, n: usize) -> Self {
        self.request_quota = Some(n);
        self
    }
}

/// Verifies a bearer token and returns its claims.
pub trait TokenVerifier: Send + Sync {
    /// Fails with [`SkaldError::InvalidToken`] on a bad signature, a
    /// malformed token or an expired one.
    fn verify(&self, token: &str) -> Result<Claims>;
}

/// HS256 JWT verifier (and signer, for issuing tokens in tools and tests).
pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::default();
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn sign(&self, claims: &Claims) -> Result<String> {
        encode(&Header::default(), claims, &self.encoding)
            .map_err(|e| SkaldError::Configuration(format!("failed to sign token: {e}")))
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| SkaldError::InvalidToken(e.to_string()))
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let verifier = JwtVerifier::new(b"secret");
        let claims = Claims::new("acct-1", Duration::from_secs(60))
            .premium(true)
            .request_quota(500);
        let token = verifier.sign(&claims).unwrap();
        assert_eq!(verifier.verify(&token).unwrap(), claims);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = JwtVerifier::new(b"one")
            .sign(&Claims::new("acct-1", Duration::from_secs(60)))
            .unwrap();
        let err = JwtVerifier::new(b"two").verify(&token).unwrap_err();
        assert!(matches!(err, SkaldError::InvalidToken(_)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let verifier = JwtVerifier::new(b"secret");
        let mut claims = Claims::new("acct-1", Duration::ZERO);
        claims.exp -= 10;
        let token = verifier.sign(&claims).unwrap();
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(JwtVerifier::new(b"secret").verify("not-a-jwt").is_err());
    }
}
