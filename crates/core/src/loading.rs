use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Advisory busy indicator shared by everything that awaits the backend.
/// It does not serialize callers; it only tells the UI a call is pending.
#[derive(Debug, Clone, Default)]
pub struct LoadingFlag {
    pending: Arc<AtomicUsize>,
}

impl LoadingFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn begin(&self) -> LoadingGuard {
        self.pending.fetch_add(1, Ordering::SeqCst);
        LoadingGuard {
            pending: Arc::clone(&self.pending),
        }
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }
}

#[derive(Debug)]
pub struct LoadingGuard {
    pending: Arc<AtomicUsize>,
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}
