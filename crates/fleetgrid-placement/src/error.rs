//! Error types for the allocation engine.

use fleetgrid_state::StateError;
use thiserror::Error;

use crate::resolver::ResolveError;

/// Result type alias for allocation operations.
pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no flavor satisfies the request: {0}")]
    FlavorNotFound(String),

    #[error("out of capacity: requested {requested} nodes, short by {shortfall}")]
    OutOfCapacity { requested: u32, shortfall: u32 },

    #[error("conflict on {hostname}: {detail}")]
    Conflict { hostname: String, detail: String },

    #[error("invalid capacity request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    NameResolution(#[from] ResolveError),

    #[error("paired action failed: {0:#}")]
    SideEffect(anyhow::Error),

    #[error(transparent)]
    State(StateError),
}

impl PlacementError {
    /// Whether a fresh prepare/activate round may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlacementError::Conflict { .. })
    }
}
