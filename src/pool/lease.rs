//! Exclusive checkout of a pooled pipeline.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::{DiscardReason, PoolShared};
use super::pipeline::Pipeline;
use crate::Result;
use crate::engine::CancellationFlag;
use crate::types::RuleMatch;

/// A pipeline checked out of the pool.
///
/// The lease is the only owner of the pipeline until it is dropped. On drop
/// the pipeline goes back to the pool, unless the lease's cancellation flag
/// was set or the thread is panicking; such pipelines are discarded because
/// their internal state can no longer be trusted.
pub struct PipelineLease {
    pipeline: Option<Pipeline>,
    pool: Arc<PoolShared>,
    cancel: CancellationFlag,
}

impl PipelineLease {
    pub(super) fn new(pipeline: Pipeline, pool: Arc<PoolShared>) -> Self {
        Self {
            pipeline: Some(pipeline),
            pool,
            cancel: CancellationFlag::new(),
        }
    }

    /// Flag passed to the engine by [`run_check`](Self::run_check). Setting
    /// it also marks the pipeline for discard.
    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancel
    }

    /// Run the engine, honouring this lease's cancellation flag.
    pub fn run_check(&mut self, text: &str) -> Result<Vec<RuleMatch>> {
        let cancel = self.cancel.clone();
        self.deref_mut().run_check(text, &cancel)
    }

    /// Drop the pipeline instead of returning it to the pool.
    pub fn discard(mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            self.pool.discard(pipeline, DiscardReason::Cancelled);
        }
    }
}

impl Deref for PipelineLease {
    type Target = Pipeline;

    fn deref(&self) -> &Pipeline {
        self.pipeline
            .as_ref()
            .expect("lease holds its pipeline until dropped")
    }
}

impl DerefMut for PipelineLease {
    fn deref_mut(&mut self) -> &mut Pipeline {
        self.pipeline
            .as_mut()
            .expect("lease holds its pipeline until dropped")
    }
}

impl Drop for PipelineLease {
    fn drop(&mut self) {
        let Some(pipeline) = self.pipeline.take() else {
            return;
        };
        if self.cancel.is_cancelled() || std::thread::panicking() {
            self.pool.discard(pipeline, DiscardReason::Cancelled);
        } else {
            self.pool.give_back(pipeline);
        }
    }
}

impl std::fmt::Debug for PipelineLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLease")
            .field("pipeline", &self.pipeline)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
