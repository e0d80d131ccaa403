//! Worker classification.
//!
//! Partitions a snapshot of a pool's workers into disjoint categories from
//! their declared phase and age. Stuck is derived: a worker still
//! provisioning after the stuck threshold never became ready.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use kilngrid_state::{WorkerPhase, WorkerRecord};

/// Category of a worker as seen by the scaling planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerCategory {
    Idle,
    Allocated,
    /// Provisioning and still within the stuck threshold.
    Provisioning,
    /// Provisioning for longer than the stuck threshold.
    Stuck,
    Failed,
}

/// Disjoint partition of a pool's workers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Categories {
    pub idle: Vec<WorkerRecord>,
    pub allocated: Vec<WorkerRecord>,
    pub provisioning: Vec<WorkerRecord>,
    pub stuck: Vec<WorkerRecord>,
    pub failed: Vec<WorkerRecord>,
}

impl Categories {
    pub fn total(&self) -> usize {
        self.idle.len()
            + self.allocated.len()
            + self.provisioning.len()
            + self.stuck.len()
            + self.failed.len()
    }

    pub fn count(&self, category: WorkerCategory) -> usize {
        match category {
            WorkerCategory::Idle => self.idle.len(),
            WorkerCategory::Allocated => self.allocated.len(),
            WorkerCategory::Provisioning => self.provisioning.len(),
            WorkerCategory::Stuck => self.stuck.len(),
            WorkerCategory::Failed => self.failed.len(),
        }
    }
}

/// Categorize a single worker.
pub fn categorize(worker: &WorkerRecord, now: DateTime<Utc>, stuck_threshold: Duration) -> WorkerCategory {
    match worker.phase {
        WorkerPhase::Failed => WorkerCategory::Failed,
        WorkerPhase::Idle => WorkerCategory::Idle,
        WorkerPhase::Allocated => WorkerCategory::Allocated,
        WorkerPhase::Provisioning => {
            let threshold = TimeDelta::from_std(stuck_threshold).unwrap_or(TimeDelta::MAX);
            if now.signed_duration_since(worker.created_at) > threshold {
                WorkerCategory::Stuck
            } else {
                WorkerCategory::Provisioning
            }
        }
    }
}

/// Partition `workers` into categories. Pure over the snapshot given.
pub fn classify(workers: &[WorkerRecord], now: DateTime<Utc>, stuck_threshold: Duration) -> Categories {
    let mut categories = Categories::default();
    for worker in workers {
        let bucket = match categorize(worker, now, stuck_threshold) {
            WorkerCategory::Idle => &mut categories.idle,
            WorkerCategory::Allocated => &mut categories.allocated,
            WorkerCategory::Provisioning => &mut categories.provisioning,
            WorkerCategory::Stuck => &mut categories.stuck,
            WorkerCategory::Failed => &mut categories.failed,
        };
        bucket.push(worker.clone());
    }
    categories
}
