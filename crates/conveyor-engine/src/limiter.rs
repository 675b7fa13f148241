//! Distributed counting semaphore over the shared-state store.
//!
//! One `acquire` polls the store's atomic compare-increment-set-lease
//! operation until a lease is granted or `wait_timeout` elapses. Leases are
//! TTL-protected against crash leaks; the lease reaper repairs any counter
//! drift from acquires that never released.

use anyhow::Result;
use conveyor_core::StateStore;
use std::sync::Arc;
use std::time::Duration;

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct Limiter {
    state: Arc<dyn StateStore>,
}

impl Limiter {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self { state }
    }

    /// Returns a lease token, or `None` when no capacity was granted within
    /// `wait_timeout`. `Err` means the store itself failed.
    pub async fn acquire(
        &self,
        service: &str,
        limit: u32,
        lease_ttl: Duration,
        wait_timeout: Duration,
    ) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + wait_timeout;
        loop {
            if let Some(token) = self.state.try_acquire(service, limit, lease_ttl).await? {
                return Ok(Some(token));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Idempotent; releasing an expired or already-released lease is a no-op.
    pub async fn release(&self, service: &str, token: &str) -> Result<()> {
        self.state.release(service, token).await?;
        Ok(())
    }
}
