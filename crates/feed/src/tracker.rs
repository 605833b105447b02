//! Lock-free holder for the latest acknowledged resume token.

use arc_swap::ArcSwapOption;
use std::sync::Arc;

use rill_core::ResumeToken;

/// Shared between the feed pump (writer) and the reconnect path (reader).
/// Swapped atomically so a reader never observes a torn token.
#[derive(Default)]
pub struct ResumeTracker {
    token: ArcSwapOption<ResumeToken>,
}

impl ResumeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, token: ResumeToken) {
        self.token.store(Some(Arc::new(token)));
    }

    pub fn current(&self) -> Option<ResumeToken> {
        self.token.load_full().map(|t| (*t).clone())
    }
}
