//! Error types for the node store.

use thiserror::Error;

use crate::types::NodeState;

/// Result type alias for node store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during node store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("hostname already in use: {0}")]
    DuplicateHostname(String),

    #[error("unknown flavor {flavor} on {hostname}")]
    UnknownFlavor { hostname: String, flavor: String },

    #[error("{parent} ({parent_flavor}) cannot host {child} ({child_flavor})")]
    IncompatibleFlavor {
        parent: String,
        parent_flavor: String,
        child: String,
        child_flavor: String,
    },

    #[error("illegal transition of {hostname} from {from} to {to}")]
    IllegalTransition {
        hostname: String,
        from: NodeState,
        to: NodeState,
    },

    #[error("{0} is not clean: wipe pending or allocation present")]
    NotClean(String),

    #[error("{0} is already reserved")]
    AlreadyReserved(String),

    #[error("capacity invariant violated on {parent}: {detail}")]
    CapacityInvariantViolated { parent: String, detail: String },

    #[error("parent {parent} of {child} cannot carry children in state {state}")]
    ParentNotEligible {
        child: String,
        parent: String,
        state: NodeState,
    },

    #[error("allocation invariant violated on {hostname}: {detail}")]
    AllocationInvariant { hostname: String, detail: String },

    #[error("membership {membership} of {owner} is held by more than one active node")]
    DuplicateMembership { owner: String, membership: String },

    #[error("generation for {key} would regress from {current} to {proposed}")]
    GenerationRegression {
        key: String,
        current: u64,
        proposed: u64,
    },

    #[error("conflict on {hostname}: {detail}")]
    Conflict { hostname: String, detail: String },

    #[error("{hostname} cannot be removed: {detail}")]
    NotRemovable { hostname: String, detail: String },

    #[error("invalid node {hostname}: {detail}")]
    InvalidNode { hostname: String, detail: String },

    #[error("paired action failed: {0:#}")]
    SideEffect(anyhow::Error),
}

impl StateError {
    /// Optimistic-concurrency drift that a caller may resolve by retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict { .. })
    }
}
