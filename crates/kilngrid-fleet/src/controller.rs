//! Fleet controller — applies scaling plans against the worker store.
//!
//! A tick re-reads everything it needs; nothing is cached between ticks.
//! Individual create/delete failures are logged and counted, never fatal,
//! and a cancelled tick stops before its next action without undoing the
//! ones already applied.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use kilngrid_state::{PoolRef, PoolSpec, PoolStatus, PoolStore, WorkerRecord, WorkerStore};

use crate::classify::{Categories, classify};
use crate::error::FleetResult;
use crate::planner::{Actions, Planner};

/// Length of the random suffix in generated worker names.
const NAME_SUFFIX_LEN: usize = 5;

/// Tunables shared by every pool's tick.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    /// Provisioning workers older than this are stuck.
    pub stuck_threshold: Duration,
    /// Tolerance around scale-down fire times.
    pub schedule_window: Duration,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            stuck_threshold: Duration::from_secs(10 * 60),
            schedule_window: Duration::from_secs(2 * 60),
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub actions: Actions,
    pub deleted: u32,
    pub created: u32,
    /// Planned actions whose store call failed.
    pub failed: u32,
    /// The tick stopped early because it was cancelled.
    pub cancelled: bool,
    /// Status derived from the snapshot this tick planned against.
    pub status: PoolStatus,
}

impl TickOutcome {
    /// Actions planned but neither applied nor failed.
    pub fn skipped(&self) -> u32 {
        let planned = self.actions.delete.len() as u32 + self.actions.create;
        planned.saturating_sub(self.deleted + self.created + self.failed)
    }
}

/// Keeps pools at their idle minimum.
pub struct FleetController<S> {
    store: Arc<S>,
    settings: FleetSettings,
    planner: Planner,
}

impl<S: WorkerStore + PoolStore> FleetController<S> {
    pub fn new(store: Arc<S>, settings: FleetSettings) -> Self {
        let planner = Planner::new(settings.schedule_window);
        Self {
            store,
            settings,
            planner,
        }
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.settings
    }

    /// Run one reconciliation tick for `pool`.
    ///
    /// Returns an error only when the worker snapshot cannot be read; in
    /// that case nothing was applied.
    pub fn reconcile(
        &self,
        pool: &PoolSpec,
        now: DateTime<Utc>,
        cancel: &watch::Receiver<bool>,
    ) -> FleetResult<TickOutcome> {
        let pool_ref = pool.pool_ref();
        let workers = self.snapshot(&pool_ref)?;
        let categories = classify(&workers, now, self.settings.stuck_threshold);
        let actions = self.planner.plan(pool, &categories, now);
        let status = status_from(&categories, &actions);

        if !actions.is_empty() {
            debug!(
                pool = %pool_ref,
                delete = actions.delete.len(),
                create = actions.create,
                scale_to_zero = actions.scale_to_zero,
                "applying fleet plan"
            );
        }

        let mut deleted = 0;
        let mut created = 0;
        let mut failed = 0;
        let mut cancelled = false;

        for deletion in &actions.delete {
            if *cancel.borrow() {
                cancelled = true;
                break;
            }
            match self.store.delete_worker(&deletion.worker) {
                Ok(()) => deleted += 1,
                // Already gone is the state we wanted.
                Err(e) if e.is_not_found() => deleted += 1,
                Err(e) => {
                    warn!(
                        worker = %deletion.worker,
                        reason = ?deletion.reason,
                        error = %e,
                        "worker delete failed"
                    );
                    failed += 1;
                }
            }
        }

        if !cancelled {
            for _ in 0..actions.create {
                if *cancel.borrow() {
                    cancelled = true;
                    break;
                }
                let worker = WorkerRecord::provisioning(worker_name(&pool.name), pool_ref.clone(), now);
                match self.store.create_worker(&worker) {
                    Ok(()) => created += 1,
                    Err(e) => {
                        warn!(worker = %worker.name, pool = %pool_ref, error = %e, "worker create failed");
                        failed += 1;
                    }
                }
            }
        }

        let mut outcome = TickOutcome {
            actions,
            deleted,
            created,
            failed,
            cancelled,
            status,
        };

        if outcome.cancelled {
            info!(pool = %pool_ref, skipped = outcome.skipped(), "fleet tick cancelled");
            return Ok(outcome);
        }

        outcome.status = self.write_status(&pool_ref, outcome.status, now);

        if outcome.deleted + outcome.created + outcome.failed > 0 {
            info!(
                pool = %pool_ref,
                deleted = outcome.deleted,
                created = outcome.created,
                failed = outcome.failed,
                "fleet tick applied"
            );
        }
        Ok(outcome)
    }

    /// Workers owned by `pool`. Records that claim a different owner are
    /// skipped.
    fn snapshot(&self, pool: &PoolRef) -> FleetResult<Vec<WorkerRecord>> {
        let mut workers = self.store.list_workers(pool)?;
        workers.retain(|w| {
            let owned = w.owner == *pool;
            if !owned {
                warn!(pool = %pool, worker = %w.name, owner = %w.owner, "skipping worker with mismatched owner");
            }
            owned
        });
        Ok(workers)
    }

    /// Persist `status` only when the observation changed. Returns the
    /// status as stored.
    fn write_status(&self, pool: &PoolRef, mut status: PoolStatus, now: DateTime<Utc>) -> PoolStatus {
        let previous = match self.store.get_pool_status(pool) {
            Ok(previous) => previous,
            Err(e) => {
                warn!(pool = %pool, error = %e, "failed to read pool status");
                None
            }
        };
        if let Some(previous) = previous
            && previous.same_observation(&status)
        {
            return previous;
        }

        status.last_changed = Some(now);
        if let Err(e) = self.store.put_pool_status(pool, &status) {
            warn!(pool = %pool, error = %e, "failed to write pool status");
        }
        status
    }
}

fn status_from(categories: &Categories, actions: &Actions) -> PoolStatus {
    PoolStatus {
        idle: categories.idle.len() as u32,
        allocated: categories.allocated.len() as u32,
        provisioning: categories.provisioning.len() as u32,
        stuck: categories.stuck.len() as u32,
        failed: categories.failed.len() as u32,
        desired_idle: actions.desired_idle,
        scale_to_zero_active: actions.scale_to_zero,
        last_changed: None,
    }
}

/// `<pool>-<suffix>` with a random lowercase alphanumeric suffix.
fn worker_name(pool: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{pool}-{suffix}")
}
