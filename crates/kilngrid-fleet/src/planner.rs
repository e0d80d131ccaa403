//! Scaling planner — turns classified workers into create/delete actions.
//!
//! Planning is pure: given the pool spec, a classification snapshot and
//! `now`, it always produces the same plan.

use std::time::Duration;

use chrono::{DateTime, Utc};

use kilngrid_state::{PoolSpec, WorkerRecord, WorkerRef};

use crate::classify::Categories;
use crate::schedule::should_scale_to_zero;

/// Why a worker was selected for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionReason {
    Failed,
    Stuck,
    /// Idle while a scale-to-zero window is active.
    ScaleToZero,
    /// One of the oldest idle workers above the minimum.
    ExcessIdle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDeletion {
    pub worker: WorkerRef,
    pub reason: DeletionReason,
}

/// The plan for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actions {
    pub delete: Vec<WorkerDeletion>,
    /// New workers to create, each owned by the pool.
    pub create: u32,
    /// Idle target used for this plan.
    pub desired_idle: u32,
    pub scale_to_zero: bool,
}

impl Actions {
    pub fn is_empty(&self) -> bool {
        self.delete.is_empty() && self.create == 0
    }

    pub fn deletions_for(&self, reason: DeletionReason) -> usize {
        self.delete.iter().filter(|d| d.reason == reason).count()
    }
}

/// Computes scaling plans.
#[derive(Debug, Clone)]
pub struct Planner {
    schedule_window: Duration,
}

impl Planner {
    pub fn new(schedule_window: Duration) -> Self {
        Self { schedule_window }
    }

    pub fn plan(&self, pool: &PoolSpec, categories: &Categories, now: DateTime<Utc>) -> Actions {
        let scale_to_zero = should_scale_to_zero(
            pool.scale_down_schedule.as_deref(),
            now,
            self.schedule_window,
        );
        plan_with_verdict(pool, categories, scale_to_zero)
    }
}

/// Plan for a known scale-to-zero verdict.
pub fn plan_with_verdict(pool: &PoolSpec, categories: &Categories, scale_to_zero: bool) -> Actions {
    let mut actions = Actions {
        scale_to_zero,
        ..Actions::default()
    };

    // Cleanup is unconditional and never counts as capacity.
    push_deletions(&mut actions, &categories.failed, DeletionReason::Failed);
    push_deletions(&mut actions, &categories.stuck, DeletionReason::Stuck);

    // Stuck workers are classified apart from provisioning ones, so this
    // is already net of anything scheduled for deletion above.
    let provisioning = categories.provisioning.len() as u32;

    if scale_to_zero {
        push_deletions(&mut actions, &categories.idle, DeletionReason::ScaleToZero);
        actions.desired_idle = 0;
        return actions;
    }

    let target = pool.min_idle;
    actions.desired_idle = target;

    let idle = categories.idle.len() as u32;
    let effective_idle = if idle > target {
        let excess = (idle - target) as usize;
        let mut oldest_first: Vec<&WorkerRecord> = categories.idle.iter().collect();
        oldest_first.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        for worker in oldest_first.into_iter().take(excess) {
            actions.delete.push(WorkerDeletion {
                worker: worker.worker_ref(),
                reason: DeletionReason::ExcessIdle,
            });
        }
        target
    } else {
        idle
    };

    actions.create = target.saturating_sub(effective_idle + provisioning);
    actions
}

fn push_deletions(actions: &mut Actions, workers: &[WorkerRecord], reason: DeletionReason) {
    actions.delete.extend(workers.iter().map(|w| WorkerDeletion {
        worker: w.worker_ref(),
        reason,
    }));
}
