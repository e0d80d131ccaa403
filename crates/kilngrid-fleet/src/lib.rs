//! kilngrid-fleet — keeps each pool's worker fleet sized to its declared
//! minimum.
//!
//! One reconciliation tick per pool reads the pool's workers from the
//! store, classifies them, evaluates the scale-down schedule, and applies
//! a deterministic plan of deletions and creations.
//!
//! # Scaling Algorithm
//!
//! ```text
//! delete  failed ∪ stuck                       (always)
//! if scale-to-zero window active:
//!     delete idle                              (no creation this tick)
//! else:
//!     target = pool.min_idle
//!     delete oldest (idle - target) idle workers when idle > target
//!     create target - (min(idle, target) + provisioning) when positive
//! ```
//!
//! Allocated workers are never deleted by the controller. Nothing is
//! cached between ticks; a partially applied plan is corrected by the
//! next tick.

pub mod classify;
pub mod controller;
pub mod error;
pub mod planner;
pub mod schedule;

pub use classify::{Categories, WorkerCategory, categorize, classify};
pub use controller::{FleetController, FleetSettings, TickOutcome};
pub use error::{FleetError, FleetResult};
pub use planner::{Actions, DeletionReason, Planner, WorkerDeletion};
pub use schedule::{ScheduleError, ScaleDownSchedule, should_scale_to_zero};
