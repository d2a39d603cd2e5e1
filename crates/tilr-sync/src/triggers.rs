//! Recurring continue-trigger registries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tilr_storage::ContinuationStore;
use tokio::sync::{mpsc, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SyncError;

/// Continuation key holding the registered trigger interval, in seconds.
pub const CONTINUE_TRIGGER_KEY: &str = "CONTINUE_TRIGGER";

/// Scheduler events feeding the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Start,
    Continue,
}

#[async_trait]
pub trait TriggerRegistry: Send + Sync {
    async fn is_active(&self) -> Result<bool, SyncError>;
    async fn register(&self, every: Duration) -> Result<(), SyncError>;
    async fn deregister(&self) -> Result<(), SyncError>;
}

/// Records the trigger as a continuation key. A host cron calling
/// `tilr continue` honours it.
#[derive(Clone)]
pub struct StoredTriggers {
    store: Arc<dyn ContinuationStore>,
}

impl StoredTriggers {
    pub fn new(store: Arc<dyn ContinuationStore>) -> Self {
        Self { store }
    }

    pub async fn interval(&self) -> Result<Option<Duration>, SyncError> {
        Ok(self
            .store
            .get(CONTINUE_TRIGGER_KEY)
            .await?
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs))
    }
}

#[async_trait]
impl TriggerRegistry for StoredTriggers {
    async fn is_active(&self) -> Result<bool, SyncError> {
        Ok(self.store.get(CONTINUE_TRIGGER_KEY).await?.is_some())
    }

    async fn register(&self, every: Duration) -> Result<(), SyncError> {
        self.store
            .set(CONTINUE_TRIGGER_KEY, &every.as_secs().to_string())
            .await?;
        Ok(())
    }

    async fn deregister(&self) -> Result<(), SyncError> {
        self.store.remove(CONTINUE_TRIGGER_KEY).await?;
        Ok(())
    }
}

/// Repeated scheduler job that sends [`Tick::Continue`] into the daemon queue.
pub struct CronTriggers {
    scheduler: JobScheduler,
    ticks: mpsc::Sender<Tick>,
    job: Mutex<Option<Uuid>>,
}

impl CronTriggers {
    pub fn new(scheduler: JobScheduler, ticks: mpsc::Sender<Tick>) -> Self {
        Self {
            scheduler,
            ticks,
            job: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TriggerRegistry for CronTriggers {
    async fn is_active(&self) -> Result<bool, SyncError> {
        Ok(self.job.lock().await.is_some())
    }

    async fn register(&self, every: Duration) -> Result<(), SyncError> {
        let mut job_id = self.job.lock().await;
        if job_id.is_some() {
            return Ok(());
        }
        let ticks = self.ticks.clone();
        let job = Job::new_repeated_async(every, move |_uuid, _l| {
            let ticks = ticks.clone();
            Box::pin(async move {
                if ticks.send(Tick::Continue).await.is_err() {
                    warn!("tick queue closed; dropping continue trigger");
                }
            })
        })
        .map_err(|err| SyncError::Trigger(format!("creating continue job: {err}")))?;
        let id = self
            .scheduler
            .add(job)
            .await
            .map_err(|err| SyncError::Trigger(format!("adding continue job: {err}")))?;
        info!(every_secs = every.as_secs(), "registered continue trigger");
        *job_id = Some(id);
        Ok(())
    }

    async fn deregister(&self) -> Result<(), SyncError> {
        let mut job_id = self.job.lock().await;
        if let Some(id) = job_id.take() {
            self.scheduler
                .remove(&id)
                .await
                .map_err(|err| SyncError::Trigger(format!("removing continue job: {err}")))?;
            info!("deregistered continue trigger");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilr_storage::MemoryContinuationStore;

    #[tokio::test]
    async fn stored_triggers_round_trip() {
        let triggers = StoredTriggers::new(Arc::new(MemoryContinuationStore::new()));
        assert!(!triggers.is_active().await.expect("active"));

        triggers.register(Duration::from_secs(300)).await.expect("register");
        assert!(triggers.is_active().await.expect("active"));
        assert_eq!(
            triggers.interval().await.expect("interval"),
            Some(Duration::from_secs(300))
        );

        triggers.deregister().await.expect("deregister");
        assert!(!triggers.is_active().await.expect("active"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cron_triggers_register_once() {
        let scheduler = JobScheduler::new().await.expect("scheduler");
        let (tx, _rx) = mpsc::channel(4);
        let triggers = CronTriggers::new(scheduler, tx);

        triggers.register(Duration::from_secs(300)).await.expect("register");
        let first = *triggers.job.lock().await;
        triggers.register(Duration::from_secs(300)).await.expect("register again");
        assert_eq!(*triggers.job.lock().await, first);
        assert!(triggers.is_active().await.expect("active"));

        triggers.deregister().await.expect("deregister");
        assert!(!triggers.is_active().await.expect("active"));
        triggers.deregister().await.expect("idempotent");
    }
}
