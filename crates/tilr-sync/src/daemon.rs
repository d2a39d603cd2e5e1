//! Long-running scheduler host: a daily start job plus the continue trigger,
//! both feeding one tick queue that is drained sequentially.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tilr_core::Phase;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::controller::Controller;
use crate::triggers::{CronTriggers, Tick};

const TICK_QUEUE_DEPTH: usize = 16;

pub struct Daemon {
    scheduler: JobScheduler,
    sender: mpsc::Sender<Tick>,
    receiver: mpsc::Receiver<Tick>,
    triggers: Arc<CronTriggers>,
}

impl Daemon {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let (sender, receiver) = mpsc::channel(TICK_QUEUE_DEPTH);
        let triggers = Arc::new(CronTriggers::new(scheduler.clone(), sender.clone()));
        Ok(Self {
            scheduler,
            sender,
            receiver,
            triggers,
        })
    }

    /// The registry the controller must use so continue triggers land in
    /// this daemon's queue.
    pub fn triggers(&self) -> Arc<CronTriggers> {
        Arc::clone(&self.triggers)
    }

    pub fn sender(&self) -> mpsc::Sender<Tick> {
        self.sender.clone()
    }

    pub async fn run(
        self,
        controller: Controller,
        sync_cron: &str,
        continue_every: Duration,
    ) -> Result<()> {
        self.run_until(controller, sync_cron, continue_every, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler unavailable");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    pub async fn run_until(
        self,
        controller: Controller,
        sync_cron: &str,
        continue_every: Duration,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let Self {
            mut scheduler,
            sender,
            mut receiver,
            ..
        } = self;

        let job = Job::new_async(sync_cron, move |_uuid, _l| {
            let sender = sender.clone();
            Box::pin(async move {
                if sender.send(Tick::Start).await.is_err() {
                    warn!("tick queue closed; dropping daily start");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {sync_cron}"))?;
        scheduler.add(job).await.context("adding daily sync job")?;

        match controller.status().await {
            Ok(state) if state.phase != Phase::Idle => {
                info!(phase = %state.phase, "resuming in-flight cycle");
                controller
                    .triggers()
                    .register(continue_every)
                    .await
                    .context("re-registering continue trigger")?;
            }
            Ok(_) => {}
            Err(err) => warn!(kind = %err.kind(), error = %err, "could not read continuation state"),
        }

        scheduler.start().await.context("starting scheduler")?;
        info!(cron = sync_cron, "daemon started");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                tick = receiver.recv() => {
                    let Some(tick) = tick else { break };
                    let outcome = match tick {
                        Tick::Start => controller.start_cycle().await,
                        Tick::Continue => controller.continue_cycle().await,
                    };
                    info!(?tick, ?outcome, "tick finished");
                }
                () = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        scheduler.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }
}
