use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative pause signal shared between the orchestrator and whoever
/// asks it to stop. The batch loop checks it before starting each batch.
#[derive(Clone, Debug, Default)]
pub struct PauseToken {
    requested: Arc<AtomicBool>,
}

impl PauseToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}
