//! System-wide pacing for candidate emission.
//!
//! A timed semaphore: acquired permits are consumed, and a background task
//! releases fresh permits at the timing profile's rate up to the MaxFlow
//! cap. Every worker that publishes into `NewName` or `ResolveName`
//! acquires before emitting.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub struct FlowLimiter {
    sem: Arc<Semaphore>,
    max: usize,
    quit: CancellationToken,
}

impl FlowLimiter {
    pub fn new(max: usize, release_per_sec: f64, quit: CancellationToken) -> Arc<Self> {
        let limiter = Arc::new(Self {
            sem: Arc::new(Semaphore::new(max)),
            max,
            quit,
        });
        let refill = limiter.clone();
        tokio::spawn(async move {
            refill.release_loop(release_per_sec).await;
        });
        limiter
    }

    /// Consume one emission token. Returns false if the engine is shutting
    /// down instead of blocking forever on an empty semaphore.
    pub async fn acquire(&self) -> bool {
        tokio::select! {
            _ = self.quit.cancelled() => false,
            permit = self.sem.acquire() => match permit {
                Ok(p) => {
                    p.forget();
                    true
                }
                Err(_) => false,
            }
        }
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    async fn release_loop(&self, release_per_sec: f64) {
        let tick = Duration::from_secs_f64(1.0 / release_per_sec.max(1.0));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.quit.cancelled() => break,
                _ = interval.tick() => {
                    if self.sem.available_permits() < self.max {
                        self.sem.add_permits(1);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_consumes_tokens() {
        let quit = CancellationToken::new();
        let flow = FlowLimiter::new(3, 1.0, quit.clone());
        assert!(flow.acquire().await);
        assert!(flow.acquire().await);
        assert!(flow.available() <= 1);
        quit.cancel();
    }

    #[tokio::test]
    async fn tokens_refill_over_time() {
        let quit = CancellationToken::new();
        let flow = FlowLimiter::new(2, 100.0, quit.clone());
        assert!(flow.acquire().await);
        assert!(flow.acquire().await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(flow.available() > 0);
        quit.cancel();
    }

    #[tokio::test]
    async fn shutdown_unblocks_waiters() {
        let quit = CancellationToken::new();
        let flow = FlowLimiter::new(1, 0.0, quit.clone());
        assert!(flow.acquire().await);
        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.acquire().await })
        };
        quit.cancel();
        let granted = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter hung")
            .unwrap();
        assert!(!granted);
    }
}
