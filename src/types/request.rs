//! Check request types

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::key::{CheckOptions, PipelineKey};

/// One piece of annotated text: either checkable text or markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextSegment {
    Text {
        text: String,
    },
    /// Markup is skipped unless `interpret_as` gives a textual stand-in
    /// (e.g. `"\n\n"` for a `<p>` tag).
    Markup {
        markup: String,
        #[serde(default, rename = "interpretAs", skip_serializing_if = "Option::is_none")]
        interpret_as: Option<String>,
    },
}

/// Text submitted for checking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextInput {
    Plain(String),
    Annotated(Vec<TextSegment>),
}

impl TextInput {
    /// The text the engine sees. Markup segments contribute only their
    /// `interpret_as` value.
    pub fn to_plain(&self) -> Cow<'_, str> {
        match self {
            TextInput::Plain(text) => Cow::Borrowed(text),
            TextInput::Annotated(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        TextSegment::Text { text } => out.push_str(text),
                        TextSegment::Markup {
                            interpret_as: Some(s),
                            ..
                        } => out.push_str(s),
                        TextSegment::Markup { .. } => {}
                    }
                }
                Cow::Owned(out)
            }
        }
    }
}

impl From<&str> for TextInput {
    fn from(text: &str) -> Self {
        TextInput::Plain(text.to_string())
    }
}

impl From<String> for TextInput {
    fn from(text: String) -> Self {
        TextInput::Plain(text)
    }
}

/// Per-user settings that change check output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    /// Personal dictionary: words never reported as misspelled.
    #[serde(default)]
    pub dictionary: BTreeSet<String>,
}

impl UserConfig {
    /// Stable fingerprint within this process; `0` when nothing is set, so
    /// users without personal settings share pipelines and cache entries.
    pub fn fingerprint(&self) -> u64 {
        if self.dictionary.is_empty() {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        self.dictionary.hash(&mut hasher);
        hasher.finish()
    }
}

/// Who is calling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Signed token carrying usage limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Credential proving `account_id`. Without one the account is ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl CallerIdentity {
    pub fn ip(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            ..Self::default()
        }
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn account(mut self, account_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self.api_key = Some(api_key.into());
        self
    }
}

/// Everything the dispatcher needs to serve one check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub text: TextInput,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mother_tongue: Option<String>,
    #[serde(default)]
    pub options: CheckOptions,
    #[serde(default)]
    pub user_config: UserConfig,
    #[serde(default)]
    pub caller: CallerIdentity,
    /// Client hint for the latest useful answer, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    /// Reject (rather than degrade) when the token does not verify.
    #[serde(default)]
    pub strict_auth: bool,
}

impl RequestContext {
    pub fn new(text: impl Into<TextInput>, language: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: language.into(),
            mother_tongue: None,
            options: CheckOptions::default(),
            user_config: UserConfig::default(),
            caller: CallerIdentity::default(),
            deadline_ms: None,
            strict_auth: false,
        }
    }

    pub fn mother_tongue(mut self, mother_tongue: impl Into<String>) -> Self {
        self.mother_tongue = Some(mother_tongue.into());
        self
    }

    pub fn options(mut self, options: CheckOptions) -> Self {
        self.options = options;
        self
    }

    pub fn user_config(mut self, user_config: UserConfig) -> Self {
        self.user_config = user_config;
        self
    }

    pub fn caller(mut self, caller: CallerIdentity) -> Self {
        self.caller = caller;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    pub fn strict_auth(mut self, strict: bool) -> Self {
        self.strict_auth = strict;
        self
    }

    /// Pipeline configuration this request needs.
    pub fn pipeline_key(&self) -> PipelineKey {
        let mut key = PipelineKey::new(self.language.clone())
            .with_options(self.options.clone())
            .with_user_config_hash(self.user_config.fingerprint());
        if let Some(ref mt) = self.mother_tongue {
            key = key.with_mother_tongue(mt.clone());
        }
        key
    }
}
