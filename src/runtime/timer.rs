/// Durable delayed continuation for waiting instances
///
/// Fast path: an in-process one-shot job on tokio-cron-scheduler per waiting
/// instance. Durable path: the deadline itself is stored on the instance, and a
/// repeated sweep job plus a startup recovery scan re-enqueue anything whose
/// deadline has passed. Either path only enqueues a `Tick`; the engine's
/// terminal/stale guards make duplicate firings harmless.

use crate::error::{StoreError, TimerError};
use crate::instance::store::InstanceStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{mpsc, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// A tick waiting to be applied by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct TimerTick {
    pub instance_id: String,
    pub at: DateTime<Utc>,
}

/// Receipt for a scheduled wake-up
#[derive(Debug, Clone, PartialEq)]
pub struct TimerHandle {
    pub instance_id: String,
    pub fire_at: DateTime<Utc>,
    pub job_id: Option<Uuid>,
}

/// Scheduling contract used by the engine
#[async_trait]
pub trait TimerScheduler: Send + Sync {
    /// Wake `instance_id` at `at`; replaces any earlier wake-up for it
    async fn schedule_at(&self, instance_id: &str, at: DateTime<Utc>) -> Result<TimerHandle, TimerError>;

    async fn cancel(&self, instance_id: &str);
}

/// Small margin added to one-shot delays so a job never fires ahead of the
/// stored deadline because of scheduler rounding
const FIRE_SLACK: Duration = Duration::from_millis(250);

/// tokio-cron-scheduler backed timer service
pub struct TimerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    /// instance_id -> one-shot job currently armed for it
    jobs: Arc<RwLock<HashMap<String, Uuid>>>,
    ticks: mpsc::UnboundedSender<TimerTick>,
}

impl TimerService {
    pub async fn new(ticks: mpsc::UnboundedSender<TimerTick>) -> Result<Self, TimerError> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            ticks,
        })
    }

    pub async fn start(&self) -> Result<(), TimerError> {
        tracing::info!("⏰ Starting timer service");
        let scheduler = self.scheduler.read().await;
        scheduler.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), TimerError> {
        tracing::info!("⏹️ Stopping timer service");
        self.jobs.write().await.clear();
        let mut scheduler = self.scheduler.write().await;
        scheduler.shutdown().await?;
        Ok(())
    }

    /// Number of armed one-shot timers
    pub async fn armed(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Register the repeated job that re-enqueues overdue instances
    pub async fn start_sweeper(&self, store: Arc<dyn InstanceStore>, every: Duration) -> Result<Uuid, TimerError> {
        let ticks = self.ticks.clone();

        let job = Job::new_repeated_async(every, move |_uuid, _l| {
            let store = Arc::clone(&store);
            let ticks = ticks.clone();
            Box::pin(async move {
                match enqueue_due(store.as_ref(), &ticks, Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("🧹 Sweeper re-enqueued {} overdue instances", n),
                    Err(e) => tracing::error!("❌ Timer sweep failed: {}", e),
                }
            })
        })?;

        let scheduler = self.scheduler.write().await;
        let id = scheduler.add(job).await?;
        tracing::info!("🧹 Timer sweeper registered (every {:?})", every);
        Ok(id)
    }

    /// Startup recovery: re-enqueue overdue waits and steps interrupted mid-flight
    pub async fn recover(&self, store: &dyn InstanceStore) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut recovered = enqueue_due(store, &self.ticks, now).await?;

        for instance in store.find_running().await? {
            tracing::warn!("♻️ Resuming instance interrupted mid-step: {} (node {})", instance.id, instance.current_node_id);
            if self.ticks.send(TimerTick { instance_id: instance.id, at: now }).is_ok() {
                recovered += 1;
            }
        }

        tracing::info!("♻️ Recovery enqueued {} instances", recovered);
        Ok(recovered)
    }

    async fn disarm(&self, instance_id: &str) {
        let previous = self.jobs.write().await.remove(instance_id);
        if let Some(job_id) = previous {
            let scheduler = self.scheduler.read().await;
            if let Err(e) = scheduler.remove(&job_id).await {
                tracing::warn!("⚠️ Failed to remove timer job for {}: {}", instance_id, e);
            }
        }
    }
}

#[async_trait]
impl TimerScheduler for TimerService {
    async fn schedule_at(&self, instance_id: &str, at: DateTime<Utc>) -> Result<TimerHandle, TimerError> {
        self.disarm(instance_id).await;

        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO) + FIRE_SLACK;
        let ticks = self.ticks.clone();
        let jobs = Arc::clone(&self.jobs);
        let owner = instance_id.to_string();

        let job = Job::new_one_shot_async(delay, move |job_id, _l| {
            let ticks = ticks.clone();
            let jobs = Arc::clone(&jobs);
            let instance_id = owner.clone();
            Box::pin(async move {
                {
                    let mut armed = jobs.write().await;
                    if armed.get(&instance_id) == Some(&job_id) {
                        armed.remove(&instance_id);
                    }
                }
                tracing::debug!("🔔 Timer fired for instance {}", instance_id);
                if ticks.send(TimerTick { instance_id, at: Utc::now() }).is_err() {
                    tracing::warn!("⚠️ Tick dropped: engine worker is gone (sweeper will retry)");
                }
            })
        })?;

        let job_id = {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await?
        };
        self.jobs.write().await.insert(instance_id.to_string(), job_id);

        tracing::debug!("⏳ Timer armed for {} at {} ({:?})", instance_id, at, delay);
        Ok(TimerHandle {
            instance_id: instance_id.to_string(),
            fire_at: at,
            job_id: Some(job_id),
        })
    }

    async fn cancel(&self, instance_id: &str) {
        self.disarm(instance_id).await;
    }
}

/// Enqueue a tick for every waiting instance whose deadline is at or before `now`
pub async fn enqueue_due(
    store: &dyn InstanceStore,
    ticks: &mpsc::UnboundedSender<TimerTick>,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let due = store.find_due_timers(now).await?;
    let mut sent = 0;
    for instance in due {
        if ticks.send(TimerTick { instance_id: instance.id, at: now }).is_ok() {
            sent += 1;
        }
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::open_memory_pool;
    use crate::instance::{AutomationInstance, InstanceState, SqliteInstanceStore};
    use serde_json::json;

    #[tokio::test]
    async fn overdue_waits_are_enqueued_once_per_sweep() {
        let store = SqliteInstanceStore::new(open_memory_pool().await.unwrap());
        let now = Utc::now();

        let mut overdue = store.create(&AutomationInstance::new("f", "n", "c1", json!({}))).await.unwrap();
        overdue.suspend(InstanceState::WaitingForTimer, Some(now - chrono::Duration::seconds(1)));
        store.save(&overdue, overdue.version).await.unwrap();

        let mut pending = store.create(&AutomationInstance::new("f", "n", "c2", json!({}))).await.unwrap();
        pending.suspend(InstanceState::WaitingForReply, Some(now + chrono::Duration::minutes(5)));
        store.save(&pending, pending.version).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(enqueue_due(&store, &tx, now).await.unwrap(), 1);

        let tick = rx.recv().await.expect("tick enqueued");
        assert_eq!(tick, TimerTick { instance_id: overdue.id, at: now });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rescheduling_replaces_and_cancel_disarms() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let timers = TimerService::new(tx).await.unwrap();
        let later = Utc::now() + chrono::Duration::minutes(10);

        let first = timers.schedule_at("inst-1", later).await.unwrap();
        let second = timers.schedule_at("inst-1", later).await.unwrap();
        assert_ne!(first.job_id, second.job_id);
        assert_eq!(timers.armed().await, 1);

        timers.schedule_at("inst-2", later).await.unwrap();
        assert_eq!(timers.armed().await, 2);

        timers.cancel("inst-1").await;
        timers.cancel("unknown").await;
        assert_eq!(timers.armed().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn armed_timer_delivers_a_tick() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TimerService::new(tx).await.unwrap();
        timers.start().await.unwrap();

        let at = Utc::now();
        timers.schedule_at("inst-9", at).await.unwrap();

        let tick = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timer fired in time")
            .expect("channel open");
        assert_eq!(tick.instance_id, "inst-9");
        assert!(tick.at >= at);
        assert_eq!(timers.armed().await, 0);
    }
}
