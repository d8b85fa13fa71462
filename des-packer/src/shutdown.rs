//! Cooperative shutdown signal, same shape as `des-marker`'s: an
//! `AtomicBool` paired with a `Notify` so `wait()` can't miss a
//! concurrent `set()` regardless of which is observed first.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

pub struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub async fn wait(&self) {
        let notified = self.notify.notified();
        if self.is_set() {
            return;
        }
        notified.await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
