//! Per-invocation context passed to handlers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Information about the batch being handled, plus the manual commit switch
#[derive(Debug, Clone)]
pub struct HandlerContext {
    binding_id: Arc<str>,
    topic_group: Option<Arc<str>>,
    batch_id: Uuid,
    batch_len: usize,
    attempt: u32,
    commit: Arc<AtomicBool>,
}

impl HandlerContext {
    pub(crate) fn new(
        binding_id: Arc<str>,
        topic_group: Option<Arc<str>>,
        batch_id: Uuid,
        batch_len: usize,
    ) -> Self {
        Self {
            binding_id,
            topic_group,
            batch_id,
            batch_len,
            attempt: 0,
            commit: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn with_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    /// `Consumer::handler` id of the binding
    pub fn binding_id(&self) -> &str {
        &self.binding_id
    }

    /// Topic group the binding was resolved from, if any
    pub fn topic_group(&self) -> Option<&str> {
        self.topic_group.as_deref()
    }

    /// Id of the batch being handled
    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    /// Number of messages in the batch
    pub fn batch_len(&self) -> usize {
        self.batch_len
    }

    /// Retry number of this invocation (0 on the first attempt)
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Request a commit of the current batch.
    ///
    /// Only meaningful under the manual commit strategy. The worker commits
    /// after the handler returns, even if the handler then fails.
    pub fn commit(&self) {
        self.commit.store(true, Ordering::Release);
    }

    /// Whether [`commit`](Self::commit) was called for this batch
    pub fn commit_requested(&self) -> bool {
        self.commit.load(Ordering::Acquire)
    }
}
