//! Volume-keyed lock registry.
//!
//! Locks are created on demand, reference-counted, and released when the
//! last waiter finishes. The registry's own map is guarded by a
//! short-lived `parking_lot::Mutex` that is never held across an `.await`;
//! the per-volume lock itself is a `tokio::sync::Mutex` held for the
//! duration of the caller's closure, which may itself await.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::errors::{ArbiterError, ArbiterResult};
use crate::types::VolumeId;

struct Entry {
    lock: Arc<AsyncMutex<()>>,
    refcount: usize,
}

/// Serializes all operations against a single volume id.
#[derive(Default)]
pub struct VolumeLockRegistry {
    entries: SyncMutex<HashMap<VolumeId, Entry>>,
}

impl VolumeLockRegistry {
    pub fn new() -> Self {
        Self {
            entries: SyncMutex::new(HashMap::new()),
        }
    }

    fn acquire_handle(&self, volume_id: &VolumeId) -> Arc<AsyncMutex<()>> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(volume_id.clone()).or_insert_with(|| Entry {
            lock: Arc::new(AsyncMutex::new(())),
            refcount: 0,
        });
        entry.refcount += 1;
        entry.lock.clone()
    }

    fn release_handle(&self, volume_id: &VolumeId) {
        let mut entries = self.entries.lock();
        if let std::collections::hash_map::Entry::Occupied(mut occupied) = entries.entry(volume_id.clone()) {
            let entry = occupied.get_mut();
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 {
                occupied.remove();
            }
        }
    }

    /// Run `fn` with the volume's lock held. The handle is released even
    /// if `fn`'s future panics during poll, because the registry never
    /// holds the map lock across the call and the guard is dropped by the
    /// unwinding stack like any other RAII guard.
    pub async fn with_volume_lock<F, Fut, T>(&self, volume_id: &VolumeId, f: F) -> ArbiterResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ArbiterResult<T>>,
    {
        let handle = self.acquire_handle(volume_id);
        let guard = handle.lock().await;
        let result = f().await;
        drop(guard);
        self.release_handle(volume_id);
        result
    }

    /// Like [`with_volume_lock`](Self::with_volume_lock), but fails fast
    /// with `Aborted` instead of waiting if another operation already
    /// holds the lock. Used where contention should surface immediately
    /// as `Aborted` rather than queuing indefinitely.
    pub async fn try_with_volume_lock<F, Fut, T>(
        &self,
        volume_id: &VolumeId,
        f: F,
    ) -> ArbiterResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ArbiterResult<T>>,
    {
        let handle = self.acquire_handle(volume_id);
        let guard = match handle.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                self.release_handle(volume_id);
                return Err(ArbiterError::Aborted(volume_id.clone()));
            }
        };
        let result = f().await;
        drop(guard);
        self.release_handle(volume_id);
        result
    }

    #[cfg(test)]
    pub fn live_lock_count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn serializes_operations_on_the_same_volume() {
        let registry = Arc::new(VolumeLockRegistry::new());
        let volume = VolumeId::from("v1");
        let counter = Arc::new(AtomicUsize::new(0));
        let observed_overlap = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let registry = registry.clone();
            let volume = volume.clone();
            let counter = counter.clone();
            let observed_overlap = observed_overlap.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .with_volume_lock(&volume, || async {
                        let before = counter.fetch_add(1, Ordering::SeqCst);
                        if before != 0 {
                            observed_overlap.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        counter.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(observed_overlap.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn releases_the_lock_after_completion() {
        let registry = VolumeLockRegistry::new();
        let volume = VolumeId::from("v1");
        registry
            .with_volume_lock(&volume, || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(registry.live_lock_count(), 0);
    }

    #[tokio::test]
    async fn different_volumes_do_not_block_each_other() {
        let registry = Arc::new(VolumeLockRegistry::new());
        let v1 = VolumeId::from("v1");
        let v2 = VolumeId::from("v2");

        let r1 = registry.clone();
        let h1 = tokio::spawn(async move {
            r1.with_volume_lock(&v1, || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        let start = tokio::time::Instant::now();
        registry
            .with_volume_lock(&v2, || async { Ok(()) })
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(40));
        h1.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn try_with_volume_lock_aborts_on_contention() {
        let registry = Arc::new(VolumeLockRegistry::new());
        let volume = VolumeId::from("v1");

        let r1 = registry.clone();
        let v1 = volume.clone();
        let h1 = tokio::spawn(async move {
            r1.with_volume_lock(&v1, || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        let result = registry
            .try_with_volume_lock(&volume, || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(ArbiterError::Aborted(_))));
        h1.await.unwrap().unwrap();
    }
}
