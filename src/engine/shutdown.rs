//! Process-wide shutdown signal.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Set once; drivers stop at their next wait and scans stop at the next symbol.
#[derive(Debug, Default)]
pub struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Flag checked at symbol boundaries during a scan.
    pub fn flag(&self) -> &AtomicBool {
        &self.flag
    }

    /// Resolves once [`Shutdown::trigger`] has been called.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}
