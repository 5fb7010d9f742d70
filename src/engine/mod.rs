//! Analysis engine traits.
//!
//! The grammar engine itself lives outside this crate. Skald talks to it
//! through two narrow traits:
//!
//! - [`PipelineEngine`]: builds a handle for a [`PipelineKey`]. Building is
//!   expensive (dictionaries, taggers, rule files), so the pool calls it
//!   on the blocking thread pool and reuses the result.
//! - [`AnalysisHandle`]: a built, non-thread-safe engine instance. The pool
//!   guarantees that at most one caller uses a handle at a time, so the
//!   methods take `&mut self` and the handle only needs to be `Send`.
//!
//! # Cancellation
//!
//! `run_check` receives a [`CancellationFlag`]. Engines should poll it
//! between units of work (sentences, rules) and bail out once it is set.
//! The dispatcher sets it when the check deadline passes; a handle that
//! was cancelled mid-run is never returned to the pool.
//!
//! # Example
//!
//! ```ignore
//! fn run_check(&mut self, text: &str, cancel: &CancellationFlag) -> Result<Vec<RuleMatch>> {
//!     let mut matches = Vec::new();
//!     for sentence in split_sentences(text) {
//!         if cancel.is_cancelled() {
//!             return Err(SkaldError::Engine("cancelled".into()));
//!         }
//!         matches.extend(self.rules.check(sentence));
//!     }
//!     Ok(matches)
//! }
//! ```

pub mod basic;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::Result;
use crate::types::{PipelineKey, RuleMatch};

pub use basic::BasicEngine;

/// Cooperative cancellation signal shared between the dispatcher and a
/// running check.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A built engine instance bound to one configuration.
///
/// Rule toggles are only called while the owning pipeline is being built;
/// afterwards the pipeline is sealed and only `run_check` is used.
pub trait AnalysisHandle: Send {
    fn enable_rule(&mut self, _rule_id: &str) {}

    fn disable_rule(&mut self, _rule_id: &str) {}

    fn enable_category(&mut self, _category: &str) {}

    fn disable_category(&mut self, _category: &str) {}

    /// Restrict the handle to explicitly enabled rules and categories.
    fn set_enabled_only(&mut self, _enabled_only: bool) {}

    /// Analyse `text`. Must return promptly once `cancel` is set.
    fn run_check(&mut self, text: &str, cancel: &CancellationFlag) -> Result<Vec<RuleMatch>>;
}

/// Builds analysis handles.
pub trait PipelineEngine: Send + Sync {
    /// Engine name for logging/debugging.
    fn name(&self) -> &str;

    /// Build a handle for `key`. Expensive; may fail (unknown language,
    /// missing resources).
    fn build_pipeline(&self, key: &PipelineKey) -> Result<Box<dyn AnalysisHandle>>;
}
