//! Per-application mutual exclusion
//!
//! Every pipeline task holds its application's lease from before its first
//! cluster call until it finishes, so a create and a delete (or two creates)
//! for the same application never interleave. Different applications never
//! contend.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Lease table keyed by application name
#[derive(Clone, Default)]
pub struct AppLeases {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held lease; released on drop
pub struct AppLease {
    application_name: String,
    leases: AppLeases,
    _guard: OwnedMutexGuard<()>,
}

impl AppLeases {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, application_name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(application_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Take the lease without waiting, if it is free
    #[must_use]
    pub fn try_acquire(&self, application_name: &str) -> Option<AppLease> {
        let guard = self.lock_for(application_name).try_lock_owned().ok()?;
        Some(self.lease(application_name, guard))
    }

    /// Wait for the lease
    pub async fn acquire(&self, application_name: &str) -> AppLease {
        let guard = self.lock_for(application_name).lock_owned().await;
        self.lease(application_name, guard)
    }

    #[must_use]
    pub fn is_held(&self, application_name: &str) -> bool {
        self.locks
            .get(application_name)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    fn lease(&self, application_name: &str, guard: OwnedMutexGuard<()>) -> AppLease {
        debug!(app = %application_name, "Acquired application lease");
        AppLease {
            application_name: application_name.to_string(),
            leases: self.clone(),
            _guard: guard,
        }
    }
}

impl AppLease {
    #[must_use]
    pub fn application_name(&self) -> &str {
        &self.application_name
    }
}

impl Drop for AppLease {
    fn drop(&mut self) {
        // Table and guard hold one reference each; anything more is a waiter
        self.leases
            .locks
            .remove_if(&self.application_name, |_, lock| Arc::strong_count(lock) <= 2);
        debug!(app = %self.application_name, "Released application lease");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lease_is_exclusive_per_app() {
        let leases = AppLeases::new();

        let held = leases.acquire("demo").await;
        assert!(leases.is_held("demo"));
        assert!(leases.try_acquire("demo").is_none());

        // Other apps are independent
        assert!(leases.try_acquire("other").is_some());

        drop(held);
        assert!(!leases.is_held("demo"));
        assert!(leases.try_acquire("demo").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_lease_after_release() {
        let leases = AppLeases::new();
        let held = leases.acquire("demo").await;

        let waiter = {
            let leases = leases.clone();
            tokio::spawn(async move {
                let lease = leases.acquire("demo").await;
                lease.application_name().to_string()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap(), "demo");
    }

    #[tokio::test]
    async fn test_released_entries_are_pruned() {
        let leases = AppLeases::new();
        drop(leases.acquire("demo").await);
        assert!(leases.locks.is_empty());
    }
}
