//! Account limits lookup.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use crate::types::{LimitsSource, UserLimits};
use crate::{Result, SkaldError};

/// External source of per-account limits.
#[async_trait]
pub trait AccountLimitsLookup: Send + Sync {
    /// Limits for `account_id`, or `None` if the account is unknown or
    /// `api_key` does not belong to it.
    async fn lookup(&self, account_id: &str, api_key: &str) -> Result<Option<UserLimits>>;
}

#[derive(Debug, Deserialize)]
struct AccountLimitsBody {
    max_text_length: usize,
    #[serde(default)]
    max_check_time_ms: Option<u64>,
    #[serde(default)]
    request_quota: Option<usize>,
    #[serde(default)]
    premium: bool,
}

/// Looks account limits up over HTTP.
///
/// `GET {base_url}/accounts/{id}/limits` answering
/// `{"max_text_length": 100000, "max_check_time_ms": 20000, "request_quota": 120, "premium": false}`;
/// The api key travels as a bearer credential. `404` means the account
/// does not exist; `401` and `403` mean the key does not match it.
#[derive(Debug, Clone)]
pub struct HttpAccountLookup {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccountLookup {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// `{base_url}/accounts/{id}/limits` with `id` percent-encoded as one
    /// path segment.
    fn limits_url(&self, account_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| SkaldError::Configuration(format!("bad account service url: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| {
                SkaldError::Configuration(format!(
                    "account service url cannot take a path: {}",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(["accounts", account_id, "limits"]);
        Ok(url)
    }
}

#[async_trait]
impl AccountLimitsLookup for HttpAccountLookup {
    async fn lookup(&self, account_id: &str, api_key: &str) -> Result<Option<UserLimits>> {
        // Dot segments would be dropped from the path rather than escaped.
        if account_id.is_empty() || account_id == "." || account_id == ".." {
            return Ok(None);
        }
        let url = self.limits_url(account_id)?;
        let response = self
            .client
            .get(url.clone())
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|e| SkaldError::AccountLookup(format!("request to {url} failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!(account_id, "api key rejected by account service");
                return Ok(None);
            }
            _ => {}
        }
        if !response.status().is_success() {
            return Err(SkaldError::AccountLookup(format!(
                "account service returned HTTP {}",
                response.status()
            )));
        }

        let body: AccountLimitsBody = response
            .json()
            .await
            .map_err(|e| SkaldError::AccountLookup(format!("bad account limits body: {e}")))?;

        Ok(Some(
            UserLimits::new(
                body.max_text_length,
                body.max_check_time_ms.map(Duration::from_millis),
            )
            .with_request_quota(body.request_quota)
            .with_premium(body.premium)
            .with_account(account_id)
            .with_source(LimitsSource::Account),
        ))
    }
}
