/// Per-instance leases
///
/// A lease is an exclusive async claim on one instance id. The engine holds it
/// from load to final save, so events for the same instance are applied one at
/// a time in acquisition order while different instances run in parallel.
/// Entries are dropped from the table as soon as nobody holds or awaits them.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LeaseTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Debug, Default, Clone)]
pub struct LeaseManager {
    table: LeaseTable,
}

/// Held lease; released on drop
#[derive(Debug)]
pub struct Lease {
    instance_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    table: LeaseTable,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the instance is free, then claim it
    pub async fn acquire(&self, instance_id: &str) -> Lease {
        let slot = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                table
                    .entry(instance_id.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        let guard = slot.lock_owned().await;
        tracing::trace!("🔒 Lease acquired: {}", instance_id);

        Lease {
            instance_id: instance_id.to_string(),
            guard: Some(guard),
            table: Arc::clone(&self.table),
        }
    }

    /// Number of instance ids currently tracked (held or awaited)
    pub fn tracked(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Lease {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let idle = table
            .get(&self.instance_id)
            .map(|slot| Arc::strong_count(slot) == 1)
            .unwrap_or(false);
        if idle {
            table.remove(&self.instance_id);
        }
        tracing::trace!("🔓 Lease released: {}", self.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_instance_is_serialized() {
        let leases = LeaseManager::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let leases = leases.clone();
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tasks.push(tokio::spawn(async move {
                let _lease = leases.acquire("inst-1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(leases.tracked(), 0);
    }

    #[tokio::test]
    async fn different_instances_do_not_block_each_other() {
        let leases = LeaseManager::new();
        let a = leases.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), leases.acquire("b"))
            .await
            .expect("independent lease");
        assert_eq!(a.instance_id(), "a");
        assert_eq!(b.instance_id(), "b");
        assert_eq!(leases.tracked(), 2);
        drop(a);
        drop(b);
        assert_eq!(leases.tracked(), 0);
    }
}
