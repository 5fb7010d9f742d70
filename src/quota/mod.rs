//! Per-request usage limits.
//!
//! [`QuotaResolver::resolve`] picks the first source that applies:
//!
//! 1. A bearer token, verified by a [`TokenVerifier`]. A token that fails
//!    verification degrades the caller to anonymous limits, or fails the
//!    request with [`SkaldError::InvalidToken`] under strict auth.
//! 2. An account id with its api key, looked up through an
//!    [`AccountLimitsLookup`] with a timeout. An account id sent without a
//!    key is ignored. Answers (including "unknown account") are cached per
//!    id and key for `account_cache_ttl`. Lookup failures and timeouts
//!    degrade to anonymous and are not cached.
//! 3. Anonymous defaults from [`QuotaConfig`].

mod account;
mod token;

pub use account::{AccountLimitsLookup, HttpAccountLookup};
pub use token::{Claims, JwtVerifier, TokenVerifier};

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::{debug, instrument, warn};

use crate::types::{CallerIdentity, LimitsSource, UserLimits};
use crate::{Result, SkaldError};

/// Configuration for quota resolution.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Max characters per request for anonymous callers. Default: 20,000.
    pub anonymous_max_text_length: usize,
    /// Check time cap for anonymous callers. Default: none (the
    /// dispatcher's default timeout applies).
    pub anonymous_max_check_duration: Option<Duration>,
    /// Max characters for token holders whose claims set none.
    /// Default: 100,000.
    pub account_max_text_length: usize,
    /// Reject unverifiable tokens instead of degrading. Default: false.
    pub strict_auth: bool,
    /// Upper bound on one account lookup. Default: 2 seconds.
    pub account_lookup_timeout: Duration,
    /// How long account lookup answers are reused. Default: 5 minutes.
    pub account_cache_ttl: Duration,
    /// Accounts kept in the lookup cache. Default: 10,000.
    pub account_cache_max_entries: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            anonymous_max_text_length: 20_000,
            anonymous_max_check_duration: None,
            account_max_text_length: 100_000,
            strict_auth: false,
            account_lookup_timeout: Duration::from_secs(2),
            account_cache_ttl: Duration::from_secs(300),
            account_cache_max_entries: 10_000,
        }
    }
}

impl QuotaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn anonymous_max_text_length(mut self, n: usize) -> Self {
        self.anonymous_max_text_length = n;
        self
    }

    pub fn anonymous_max_check_duration(mut self, limit: Duration) -> Self {
        self.anonymous_max_check_duration = Some(limit);
        self
    }

    pub fn account_max_text_length(mut self, n: usize) -> Self {
        self.account_max_text_length = n;
        self
    }

    pub fn strict_auth(mut self, strict: bool) -> Self {
        self.strict_auth = strict;
        self
    }

    pub fn account_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.account_lookup_timeout = timeout;
        self
    }

    pub fn account_cache_ttl(mut self, ttl: Duration) -> Self {
        self.account_cache_ttl = ttl;
        self
    }
}

/// Derives [`UserLimits`] for a caller.
pub struct QuotaResolver {
    config: QuotaConfig,
    verifier: Option<Arc<dyn TokenVerifier>>,
    lookup: Option<Arc<dyn AccountLimitsLookup>>,
    accounts: Cache<(String, String), Option<UserLimits>>,
}

impl QuotaResolver {
    pub fn new(config: QuotaConfig) -> Self {
        let accounts = Cache::builder()
            .max_capacity(config.account_cache_max_entries)
            .time_to_live(config.account_cache_ttl)
            .build();
        Self {
            config,
            verifier: None,
            lookup: None,
            accounts,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_account_lookup(mut self, lookup: Arc<dyn AccountLimitsLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    pub fn anonymous(&self) -> UserLimits {
        UserLimits::new(
            self.config.anonymous_max_text_length,
            self.config.anonymous_max_check_duration,
        )
    }

    /// Limits for `caller`. `strict` forces strict auth for this request on
    /// top of the configured default.
    #[instrument(name = "quota.resolve", skip_all, fields(has_token = caller.token.is_some()))]
    pub async fn resolve(&self, caller: &CallerIdentity, strict: bool) -> Result<UserLimits> {
        let strict = strict || self.config.strict_auth;

        if let Some(token) = caller.token.as_deref() {
            return match self.verify_token(token) {
                Ok(limits) => Ok(limits),
                Err(e) if strict => Err(e),
                Err(e) => {
                    warn!(error = %e, "token rejected, serving caller as anonymous");
                    Ok(self.anonymous())
                }
            };
        }

        match (caller.account_id.as_deref(), caller.api_key.as_deref()) {
            (Some(account_id), Some(api_key)) => {
                if let Some(limits) = self.lookup_account(account_id, api_key).await {
                    return Ok(limits);
                }
            }
            (Some(account_id), None) => {
                debug!(account_id, "account id without api key, serving as anonymous");
            }
            _ => {}
        }

        Ok(self.anonymous())
    }

    fn verify_token(&self, token: &str) -> Result<UserLimits> {
        let verifier = self.verifier.as_ref().ok_or_else(|| {
            SkaldError::InvalidToken("token verification is not configured".into())
        })?;
        let claims = verifier.verify(token)?;
        Ok(UserLimits::new(
            claims
                .max_text_length
                .unwrap_or(self.config.account_max_text_length),
            claims.max_check_time_ms.map(Duration::from_millis),
        )
        .with_request_quota(claims.request_quota)
        .with_premium(claims.premium)
        .with_account(claims.sub)
        .with_source(LimitsSource::Token))
    }

    async fn lookup_account(&self, account_id: &str, api_key: &str) -> Option<UserLimits> {
        let lookup = self.lookup.as_ref()?;
        let cache_key = (account_id.to_string(), api_key.to_string());
        if let Some(cached) = self.accounts.get(&cache_key).await {
            return cached;
        }

        match tokio::time::timeout(
            self.config.account_lookup_timeout,
            lookup.lookup(account_id, api_key),
        )
        .await
        {
            Ok(Ok(found)) => {
                if found.is_none() {
                    debug!(account_id, "unknown account, serving as anonymous");
                }
                self.accounts.insert(cache_key, found.clone()).await;
                found
            }
            Ok(Err(e)) => {
                warn!(account_id, error = %e, "account lookup failed, serving as anonymous");
                None
            }
            Err(_) => {
                warn!(
                    account_id,
                    timeout = ?self.config.account_lookup_timeout,
                    "account lookup timed out, serving as anonymous"
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for QuotaResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaResolver")
            .field("config", &self.config)
            .field("verifier", &self.verifier.is_some())
            .field("lookup", &self.lookup.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_credentials_means_anonymous() {
        let resolver = QuotaResolver::new(QuotaConfig::new().anonymous_max_text_length(500));
        let limits = resolver.resolve(&CallerIdentity::ip("10.0.0.1"), false).await.unwrap();
        assert_eq!(limits.source(), LimitsSource::Anonymous);
        assert_eq!(limits.max_text_length(), 500);
    }

    struct PremiumForAnyKey;

    #[async_trait::async_trait]
    impl AccountLimitsLookup for PremiumForAnyKey {
        async fn lookup(&self, account_id: &str, _api_key: &str) -> Result<Option<UserLimits>> {
            Ok(Some(
                UserLimits::new(1_000_000, None)
                    .with_premium(true)
                    .with_account(account_id)
                    .with_source(LimitsSource::Account),
            ))
        }
    }

    #[tokio::test]
    async fn account_without_api_key_is_anonymous() {
        let resolver =
            QuotaResolver::new(QuotaConfig::default()).with_account_lookup(Arc::new(PremiumForAnyKey));
        let mut caller = CallerIdentity::ip("10.0.0.1");
        caller.account_id = Some("victim".into());

        let limits = resolver.resolve(&caller, false).await.unwrap();
        assert_eq!(limits.source(), LimitsSource::Anonymous);
        assert!(!limits.is_premium());
        assert_eq!(limits.account_id(), None);

        let limits = resolver
            .resolve(&CallerIdentity::ip("10.0.0.1").account("victim", "key"), false)
            .await
            .unwrap();
        assert!(limits.is_premium());
    }

    #[tokio::test]
    async fn token_without_verifier_degrades_unless_strict() {
        let resolver = QuotaResolver::new(QuotaConfig::default());
        let caller = CallerIdentity::ip("10.0.0.1").token("abc");
        let limits = resolver.resolve(&caller, false).await.unwrap();
        assert_eq!(limits.source(), LimitsSource::Anonymous);
        assert!(matches!(
            resolver.resolve(&caller, true).await,
            Err(SkaldError::InvalidToken(_))
        ));
    }
}
