use std::sync::atomic::{AtomicBool, Ordering};

/// A semaphore that can be switched off entirely.
///
/// When no limit is configured every acquisition succeeds immediately without
/// touching the underlying tokio semaphore.
pub struct Semaphore {
    enabled: AtomicBool,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            sem: tokio::sync::Semaphore::const_new(0),
        }
    }

    pub fn setup(&self, limit: usize) {
        self.enabled.store(limit > 0, Ordering::Release);
        if limit == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(limit.min(tokio::sync::Semaphore::MAX_PERMITS));
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    pub async fn acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if !self.is_enabled() {
            return None;
        }
        // the semaphore is never closed
        self.sem.acquire().await.ok()
    }

    pub async fn consume(&self) {
        if !self.is_enabled() {
            return;
        }
        if let Ok(permit) = self.sem.acquire().await {
            permit.forget();
        }
    }

    pub async fn run_replenish_thread(&self, replenish: usize, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let curr_permits = self.sem.available_permits();
            if curr_permits < replenish {
                self.sem.add_permits(replenish - curr_permits);
            }
        }
    }
}
