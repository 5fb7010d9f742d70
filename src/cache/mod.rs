//! Caching subsystem.
//!
//! - [`ResultCache`]: LRU + TTL cache of check results keyed on a content
//!   [`Fingerprint`]. See the [`result`] module docs for keying rules.
//!
//! Account limits looked up over HTTP are cached separately, inside the
//! [`QuotaResolver`](crate::quota::QuotaResolver).

pub mod result;

pub use result::{CacheConfig, Fingerprint, ResultCache};
