//! Configuration loading for skaldd.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.skald/config.toml` (user)
//! 3. `/etc/skald/config.toml` (system)
//!
//! Every section is optional; missing keys take the component defaults.
//!
//! Secrets are loaded separately with mandatory permission checks:
//! 1. `~/.skald/secrets.toml` (user, must be 0600)
//! 2. `/etc/skald/secrets.toml` (system, must be 0600)
//! 3. `SKALD_TOKEN_SECRET` environment variable

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditConfig, JsonLinesSink, RetryConfig};
use crate::cache::CacheConfig;
use crate::limiter::LimiterConfig;
use crate::pool::PoolConfig;
use crate::quota::{HttpAccountLookup, QuotaConfig};
use crate::service::SkaldBuilder;
use crate::{Result, SkaldError};

/// Environment variable holding the token signing secret.
pub const TOKEN_SECRET_ENV: &str = "SKALD_TOKEN_SECRET";

/// Daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub pool: PoolSection,
    pub cache: CacheSection,
    pub limits: LimitsSection,
    pub quota: QuotaSection,
    pub audit: AuditSection,
}

/// Request handling limits for the daemon loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Requests served concurrently (default: 100).
    pub max_concurrent_requests: usize,
    /// Engine time budget when limits set none (default: 20).
    pub default_check_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 100,
            default_check_timeout_secs: 20,
        }
    }
}

/// Built-in engine settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Languages to accept; empty accepts all.
    pub languages: Vec<String>,
    /// Pipelines built at startup, one per listed language.
    pub prewarm: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_size: usize,
    pub idle_expiry_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            max_size: defaults.max_size,
            idle_expiry_secs: defaults.idle_expiry.as_secs(),
            sweep_interval_secs: defaults.sweep_interval.as_secs(),
        }
    }
}

impl PoolSection {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig::new()
            .max_size(self.max_size)
            .idle_expiry(Duration::from_secs(self.idle_expiry_secs))
            .sweep_interval(Duration::from_secs(self.sweep_interval_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Default: true.
    pub enabled: bool,
    pub max_entries: u64,
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            enabled: true,
            max_entries: defaults.max_entries,
            ttl_secs: defaults.ttl.as_secs(),
        }
    }
}

impl CacheSection {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .max_entries(self.max_entries)
            .ttl(Duration::from_secs(self.ttl_secs))
    }
}

/// `[limits.request]` and `[limits.error]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub request: LimiterSection,
    pub error: LimiterSection,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            request: LimiterSection::default(),
            error: LimiterSection {
                max_events: 10,
                ..LimiterSection::default()
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimiterSection {
    pub max_events: usize,
    pub window_secs: u64,
    pub max_bytes: Option<u64>,
    pub max_identities: u64,
}

impl Default for LimiterSection {
    fn default() -> Self {
        let defaults = LimiterConfig::default();
        Self {
            max_events: defaults.max_events,
            window_secs: defaults.window.as_secs(),
            max_bytes: defaults.max_bytes,
            max_identities: defaults.max_identities,
        }
    }
}

impl LimiterSection {
    pub fn to_limiter_config(&self) -> LimiterConfig {
        let mut config = LimiterConfig::new(self.max_events, Duration::from_secs(self.window_secs))
            .max_identities(self.max_identities);
        config.max_bytes = self.max_bytes;
        config
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaSection {
    pub anonymous_max_text_length: usize,
    pub anonymous_max_check_time_ms: Option<u64>,
    pub account_max_text_length: usize,
    pub strict_auth: bool,
    /// Base URL of the account service; account lookups are off without it.
    pub account_service_url: Option<String>,
    pub account_lookup_timeout_ms: u64,
    pub account_cache_ttl_secs: u64,
}

impl Default for QuotaSection {
    fn default() -> Self {
        let defaults = QuotaConfig::default();
        Self {
            anonymous_max_text_length: defaults.anonymous_max_text_length,
            anonymous_max_check_time_ms: None,
            account_max_text_length: defaults.account_max_text_length,
            strict_auth: defaults.strict_auth,
            account_service_url: None,
            account_lookup_timeout_ms: defaults.account_lookup_timeout.as_millis() as u64,
            account_cache_ttl_secs: defaults.account_cache_ttl.as_secs(),
        }
    }
}

impl QuotaSection {
    pub fn to_quota_config(&self) -> QuotaConfig {
        let mut config = QuotaConfig::new()
            .anonymous_max_text_length(self.anonymous_max_text_length)
            .account_max_text_length(self.account_max_text_length)
            .strict_auth(self.strict_auth)
            .account_lookup_timeout(Duration::from_millis(self.account_lookup_timeout_ms))
            .account_cache_ttl(Duration::from_secs(self.account_cache_ttl_secs));
        if let Some(ms) = self.anonymous_max_check_time_ms {
            config = config.anonymous_max_check_duration(Duration::from_millis(ms));
        }
        config
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    /// Default: false.
    pub enabled: bool,
    /// JSON-lines file records are appended to.
    pub path: PathBuf,
    pub batch_size: usize,
    pub max_flush_interval_secs: u64,
    pub queue_capacity: usize,
    pub retry_attempts: u32,
    pub retry_initial_delay_ms: u64,
}

impl Default for AuditSection {
    fn default() -> Self {
        let defaults = AuditConfig::default();
        Self {
            enabled: false,
            path: PathBuf::from("audit.jsonl"),
            batch_size: defaults.batch_size,
            max_flush_interval_secs: defaults.max_flush_interval.as_secs(),
            queue_capacity: defaults.queue_capacity,
            retry_attempts: defaults.retry.max_attempts,
            retry_initial_delay_ms: defaults.retry.initial_delay.as_millis() as u64,
        }
    }
}

impl AuditSection {
    pub fn to_audit_config(&self) -> AuditConfig {
        AuditConfig::new()
            .batch_size(self.batch_size)
            .max_flush_interval(Duration::from_secs(self.max_flush_interval_secs))
            .queue_capacity(self.queue_capacity)
            .retry(
                RetryConfig::new()
                    .max_attempts(self.retry_attempts)
                    .initial_delay(Duration::from_millis(self.retry_initial_delay_ms)),
            )
    }
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.skald/config.toml`
    /// 3. `/etc/skald/config.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        Self::load_from_file(&path)
    }

    /// Like [`load`](Self::load), but falls back to defaults when no file
    /// exists in the standard locations. An explicit path must exist.
    pub fn load_or_default(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path) {
            Ok(path) => Self::load_from_file(&path),
            Err(_) if explicit_path.is_none() => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SkaldError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            SkaldError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    /// Resolve the config file path.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(SkaldError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".skald").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/skald/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(SkaldError::Configuration(
            "No config file found. Create ~/.skald/config.toml or /etc/skald/config.toml"
                .to_string(),
        ))
    }

    /// Apply every configured component to `builder`. The engine is left
    /// to the caller.
    pub fn configure(&self, mut builder: SkaldBuilder, secrets: &Secrets) -> SkaldBuilder {
        builder = builder
            .pool(self.pool.to_pool_config())
            .request_limits(self.limits.request.to_limiter_config())
            .error_limits(self.limits.error.to_limiter_config())
            .quota(self.quota.to_quota_config())
            .default_check_timeout(Duration::from_secs(self.server.default_check_timeout_secs));
        if self.cache.enabled {
            builder = builder.result_cache(self.cache.to_cache_config());
        }
        if let Some(secret) = secrets.token_secret() {
            builder = builder.token_secret(secret);
        }
        if let Some(ref url) = self.quota.account_service_url {
            builder = builder.account_lookup(Arc::new(HttpAccountLookup::new(url.clone())));
        }
        if self.audit.enabled {
            builder = builder.audit(
                Arc::new(JsonLinesSink::new(self.audit.path.clone())),
                self.audit.to_audit_config(),
            );
        }
        builder
    }
}

/// Secrets configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    /// HMAC secret for verifying usage tokens.
    #[serde(default)]
    pub token_secret: Option<String>,
}

impl Secrets {
    /// Load secrets from the standard locations with permission checks.
    ///
    /// Resolution order:
    /// 1. `~/.skald/secrets.toml` (if exists, must be 0600)
    /// 2. `/etc/skald/secrets.toml` (if exists, must be 0600)
    ///
    /// Returns empty secrets if no file exists (the secret may come from
    /// the environment).
    pub fn load() -> Result<Self> {
        // Try user secrets first
        if let Some(home) = dirs::home_dir() {
            let user_secrets = home.join(".skald").join("secrets.toml");
            if user_secrets.exists() {
                return Self::load_from_file(&user_secrets);
            }
        }

        // Try system secrets
        let system_secrets = PathBuf::from("/etc/skald/secrets.toml");
        if system_secrets.exists() {
            return Self::load_from_file(&system_secrets);
        }

        Ok(Secrets::default())
    }

    /// Load a secrets file, rejecting it unless only the owner can read it.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        Self::check_permissions(path)?;
        let content = fs::read_to_string(path).map_err(|e| {
            SkaldError::Configuration(format!("Failed to read secrets file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            SkaldError::Configuration(format!("Failed to parse secrets file {path:?}: {e}"))
        })
    }

    /// Check that the secrets file has secure permissions (0600 or 0400).
    #[cfg(unix)]
    fn check_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(path).map_err(|e| {
            SkaldError::Configuration(format!("Failed to stat secrets file {path:?}: {e}"))
        })?;

        let mode = metadata.permissions().mode();
        // Reject if group or other bits are set
        if mode & 0o077 != 0 {
            return Err(SkaldError::Configuration(format!(
                "Secrets file {path:?} has insecure permissions {:o}. Must be 0600 or 0400.",
                mode & 0o777
            )));
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn check_permissions(_path: &Path) -> Result<()> {
        Ok(())
    }

    /// Token secret from the secrets file, falling back to `SKALD_TOKEN_SECRET`.
    pub fn token_secret(&self) -> Option<String> {
        self.token_secret
            .clone()
            .or_else(|| std::env::var(TOKEN_SECRET_ENV).ok())
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_component_defaults() {
        let config = Config::default();
        assert_eq!(config.server.max_concurrent_requests, 100);
        assert_eq!(config.pool.max_size, PoolConfig::default().max_size);
        assert!(config.cache.enabled);
        assert!(!config.audit.enabled);
        assert_eq!(config.limits.error.max_events, 10);
    }

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
            [pool]
            max_size = 4
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.pool.max_size, 4);
        // Defaults preserved
        assert_eq!(config.pool.idle_expiry_secs, 600);
        assert_eq!(config.limits.request.max_events, 60);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [server]
            max_concurrent_requests = 50
            default_check_timeout_secs = 5

            [engine]
            languages = ["en", "de"]
            prewarm = ["en"]

            [pool]
            max_size = 8
            idle_expiry_secs = 120
            sweep_interval_secs = 10

            [cache]
            enabled = false

            [limits.request]
            max_events = 20
            window_secs = 60
            max_bytes = 500000

            [limits.error]
            max_events = 3
            window_secs = 30

            [quota]
            anonymous_max_text_length = 10000
            anonymous_max_check_time_ms = 8000
            account_service_url = "http://accounts.internal"

            [audit]
            enabled = true
            path = "/var/log/skald/audit.jsonl"
            batch_size = 100
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.default_check_timeout_secs, 5);
        assert_eq!(config.engine.languages, vec!["en", "de"]);
        assert_eq!(config.pool.to_pool_config().idle_expiry, Duration::from_secs(120));
        assert!(!config.cache.enabled);

        let request = config.limits.request.to_limiter_config();
        assert_eq!(request.max_bytes, Some(500_000));
        assert_eq!(config.limits.error.to_limiter_config().window, Duration::from_secs(30));

        let quota = config.quota.to_quota_config();
        assert_eq!(quota.anonymous_max_text_length, 10_000);
        assert_eq!(quota.anonymous_max_check_duration, Some(Duration::from_secs(8)));

        let audit = config.audit.to_audit_config();
        assert_eq!(audit.batch_size, 100);
        assert_eq!(config.audit.path, PathBuf::from("/var/log/skald/audit.jsonl"));
    }

    #[test]
    fn parse_secrets() {
        let secrets: Secrets = toml::from_str(r#"token_secret = "hunter2""#).unwrap();
        assert_eq!(secrets.token_secret(), Some("hunter2".to_string()));
    }

    #[test]
    fn config_not_found_returns_error() {
        let result = Config::load(Some(Path::new("/nonexistent/config.toml")));
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Config file not found"));
    }

    #[test]
    fn explicit_missing_path_is_an_error_even_with_defaults() {
        assert!(Config::load_or_default(Some(Path::new("/nonexistent/config.toml"))).is_err());
    }
}
