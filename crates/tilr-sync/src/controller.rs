//! Phase state machine: one bounded step of work per tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tilr_adapters::{IssueTrackerSource, TicketingSource};
use tilr_core::{ArchivePolicy, ContinuationState, Phase};
use tilr_storage::{ContinuationStore, TabularStore};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{DEFAULT_CHUNK_SIZE, DEFAULT_CONTINUE_EVERY_MINUTES};
use crate::enrich::{run_enrichment, ChunkOutcome};
use crate::error::{ErrorKind, SyncError};
use crate::fetch::run_fetch;
use crate::reconcile::run_reconcile;
use crate::state::{load_state, save_state};
use crate::triggers::TriggerRegistry;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub chunk_size: usize,
    pub continue_every: Duration,
    pub archive_policy: ArchivePolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            continue_every: Duration::from_secs(60 * DEFAULT_CONTINUE_EVERY_MINUTES),
            archive_policy: ArchivePolicy::default(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Advanced { from: Phase, to: Phase },
    /// Work was done but more remains in the same phase.
    Progressed { phase: Phase },
    Skipped,
    /// The step failed; persisted state is unchanged.
    Stalled { phase: Phase, kind: ErrorKind },
}

#[derive(Clone)]
pub struct Controller {
    tables: Arc<dyn TabularStore>,
    continuation: Arc<dyn ContinuationStore>,
    ticketing: Arc<dyn TicketingSource>,
    tracker: Arc<dyn IssueTrackerSource>,
    triggers: Arc<dyn TriggerRegistry>,
    settings: ControllerSettings,
    tick_lock: Arc<Mutex<()>>,
}

impl Controller {
    pub fn new(
        tables: Arc<dyn TabularStore>,
        continuation: Arc<dyn ContinuationStore>,
        ticketing: Arc<dyn TicketingSource>,
        tracker: Arc<dyn IssueTrackerSource>,
        triggers: Arc<dyn TriggerRegistry>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            tables,
            continuation,
            ticketing,
            tracker,
            triggers,
            settings,
            tick_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn tables(&self) -> &Arc<dyn TabularStore> {
        &self.tables
    }

    pub fn triggers(&self) -> &Arc<dyn TriggerRegistry> {
        &self.triggers
    }

    pub async fn status(&self) -> Result<ContinuationState, SyncError> {
        load_state(self.continuation.as_ref()).await
    }

    /// Daily entry point. A cycle already in flight keeps going from its
    /// current phase.
    pub async fn start_cycle(&self) -> TickOutcome {
        let _guard = self.tick_lock.lock().await;
        let state = match self.load().await {
            Ok(state) => state,
            Err(outcome) => return outcome,
        };
        if state.phase != Phase::Idle {
            info!(phase = %state.phase, "cycle already in flight; resuming");
        }
        self.dispatch(state).await
    }

    /// Recurring-trigger entry point. Never starts a new cycle.
    pub async fn continue_cycle(&self) -> TickOutcome {
        let _guard = self.tick_lock.lock().await;
        let state = match self.load().await {
            Ok(state) => state,
            Err(outcome) => return outcome,
        };
        if state.phase == Phase::Idle {
            if let Err(err) = self.triggers.deregister().await {
                warn!(kind = %err.kind(), error = %err, "failed to drop stale continue trigger");
            }
            info!("no cycle in flight; skipping");
            return TickOutcome::Skipped;
        }
        self.dispatch(state).await
    }

    async fn load(&self) -> Result<ContinuationState, TickOutcome> {
        load_state(self.continuation.as_ref()).await.map_err(|err| {
            error!(kind = %err.kind(), error = %err, "reading continuation state failed");
            TickOutcome::Stalled {
                phase: Phase::Idle,
                kind: err.kind(),
            }
        })
    }

    async fn dispatch(&self, state: ContinuationState) -> TickOutcome {
        let phase = state.phase;
        let result = match phase {
            Phase::Idle => self.fetch(&state).await,
            Phase::Running => self.enrich(&state).await,
            Phase::Diff => self.reconcile(&state).await,
        };
        result.unwrap_or_else(|err| {
            error!(
                %phase,
                kind = %err.kind(),
                error = %err,
                "tick failed; continuation state left unchanged"
            );
            TickOutcome::Stalled {
                phase,
                kind: err.kind(),
            }
        })
    }

    async fn fetch(&self, state: &ContinuationState) -> Result<TickOutcome, SyncError> {
        let outcome = run_fetch(
            self.tables.as_ref(),
            self.ticketing.as_ref(),
            state.fetch_cursor,
        )
        .await?;

        if !self.triggers.is_active().await? {
            self.triggers.register(self.settings.continue_every).await?;
        }

        let next = ContinuationState {
            phase: Phase::Running,
            fetch_cursor: outcome.cursor,
            chunk_cursor: 0,
            cycle_id: Some(Uuid::new_v4()),
        };
        save_state(self.continuation.as_ref(), &next).await?;
        Ok(TickOutcome::Advanced {
            from: Phase::Idle,
            to: Phase::Running,
        })
    }

    async fn enrich(&self, state: &ContinuationState) -> Result<TickOutcome, SyncError> {
        let outcome = run_enrichment(
            self.tables.as_ref(),
            self.ticketing.as_ref(),
            self.tracker.as_ref(),
            self.settings.chunk_size,
            state.chunk_cursor,
        )
        .await?;

        let (next, result) = match outcome {
            ChunkOutcome::More { chunk_cursor } => (
                ContinuationState {
                    chunk_cursor,
                    ..state.clone()
                },
                TickOutcome::Progressed {
                    phase: Phase::Running,
                },
            ),
            ChunkOutcome::Drained { chunk_cursor } => (
                ContinuationState {
                    phase: Phase::Diff,
                    chunk_cursor,
                    ..state.clone()
                },
                TickOutcome::Advanced {
                    from: Phase::Running,
                    to: Phase::Diff,
                },
            ),
        };
        save_state(self.continuation.as_ref(), &next).await?;
        Ok(result)
    }

    async fn reconcile(&self, state: &ContinuationState) -> Result<TickOutcome, SyncError> {
        let cycle_id = state.cycle_id.unwrap_or_else(|| {
            warn!("no cycle id recorded; changelog fingerprints fall back to the nil cycle");
            Uuid::nil()
        });
        run_reconcile(
            self.tables.as_ref(),
            &self.settings.archive_policy,
            cycle_id,
            Utc::now(),
        )
        .await?;

        let next = ContinuationState {
            phase: Phase::Idle,
            fetch_cursor: state.fetch_cursor,
            chunk_cursor: 0,
            cycle_id: None,
        };
        save_state(self.continuation.as_ref(), &next).await?;

        // The cycle is complete at this point; a trigger that survives is
        // dropped by the next continue tick.
        if let Err(err) = self.triggers.deregister().await {
            warn!(kind = %err.kind(), error = %err, "failed to deregister continue trigger");
        }
        Ok(TickOutcome::Advanced {
            from: Phase::Diff,
            to: Phase::Idle,
        })
    }
}
