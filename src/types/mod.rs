//! Public types for the Skald API.

mod key;
mod limits;
mod request;
mod response;

pub use key::{CheckLevel, CheckOptions, PipelineKey};
pub use limits::{LimitsSource, UserLimits};
pub use request::{CallerIdentity, RequestContext, TextInput, TextSegment, UserConfig};
pub use response::{CheckResponse, CheckResult, HandledResponse, RuleMatch};
