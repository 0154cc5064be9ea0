// Per-(guild, user) async locks.
//
// The read-active-case -> create-or-merge sequence and moderator transitions
// run under this lock so one member can never end up with two pending cases.
// Entries are dropped again once nobody holds or waits on them.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type ActorKey = (u64, u64);

#[derive(Default)]
pub struct ActorLocks {
    locks: DashMap<ActorKey, Arc<Mutex<()>>>,
}

impl ActorLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one member's case state.
    pub async fn lock(&self, guild_id: u64, user_id: u64) -> ActorGuard<'_> {
        let key = (guild_id, user_id);
        // Clone out of the map so the shard lock is released before awaiting.
        let mutex = self.locks.entry(key).or_default().clone();
        let guard = mutex.lock_owned().await;

        ActorGuard {
            registry: self,
            key,
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct ActorGuard<'a> {
    registry: &'a ActorLocks,
    key: ActorKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ActorGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.registry
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(ActorLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock(1, 2).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = ActorLocks::new();
        let _a = locks.lock(1, 2).await;
        let _b = tokio::time::timeout(Duration::from_millis(50), locks.lock(1, 3))
            .await
            .expect("different member should not wait");
        assert_eq!(locks.len(), 2);
    }
}
