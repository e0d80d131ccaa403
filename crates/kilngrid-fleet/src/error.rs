//! Fleet controller error types.

use thiserror::Error;

/// Errors that abort a fleet tick before any action is applied.
///
/// Failures of individual create/delete actions are not errors; they are
/// logged and counted in the tick outcome.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("state store error: {0}")]
    State(#[from] kilngrid_state::StateError),
}

pub type FleetResult<T> = Result<T, FleetError>;
