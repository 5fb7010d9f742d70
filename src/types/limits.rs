//! Per-request usage limits

use std::time::Duration;

use serde::Serialize;

/// Where a [`UserLimits`] value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitsSource {
    Anonymous,
    Token,
    Account,
}

/// Usage limits for one request.
///
/// Derived fresh for every request and never changed afterwards; the
/// consuming `with_*` methods are for construction only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserLimits {
    max_text_length: usize,
    max_check_duration: Option<Duration>,
    request_quota: Option<usize>,
    premium: bool,
    account_id: Option<String>,
    source: LimitsSource,
}

impl UserLimits {
    /// Anonymous limits with the given caps.
    pub fn new(max_text_length: usize, max_check_duration: Option<Duration>) -> Self {
        Self {
            max_text_length,
            max_check_duration,
            request_quota: None,
            premium: false,
            account_id: None,
            source: LimitsSource::Anonymous,
        }
    }

    pub fn with_request_quota(mut self, quota: Option<usize>) -> Self {
        self.request_quota = quota;
        self
    }

    pub fn with_premium(mut self, premium: bool) -> Self {
        self.premium = premium;
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_source(mut self, source: LimitsSource) -> Self {
        self.source = source;
        self
    }

    pub fn max_text_length(&self) -> usize {
        self.max_text_length
    }

    /// `None` means no cap at this layer; the dispatcher's default applies.
    pub fn max_check_duration(&self) -> Option<Duration> {
        self.max_check_duration
    }

    /// Requests per limiter window for this caller, overriding the global
    /// request limit.
    pub fn request_quota(&self) -> Option<usize> {
        self.request_quota
    }

    pub fn is_premium(&self) -> bool {
        self.premium
    }

    pub fn account_id(&self) -> Option<&str> {
        self.account_id.as_deref()
    }

    pub fn source(&self) -> LimitsSource {
        self.source
    }
}
