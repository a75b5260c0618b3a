//! fleetgrid-state: node repository for FleetGrid.
//!
//! Backed by [redb](https://docs.rs/redb), keeps the authoritative record of
//! every host and container node: identity, addresses, flavor, lifecycle
//! state, allocation and history.
//!
//! # Architecture
//!
//! Node records are JSON-serialized into redb's `&[u8]` value columns keyed
//! by hostname. Cluster generations and store counters live in their own
//! tables; the audit log is keyed by a global sequence number.
//!
//! All writes are [`NodeTransaction`] batches. A batch is applied and
//! validated as a whole inside one redb write transaction; per-node
//! expectations turn concurrent drift into [`StateError::Conflict`].
//!
//! The `NodeStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across threads.

mod batch;
pub mod error;
pub mod history;
pub mod lifecycle;
pub mod list;
pub mod store;
pub mod tables;
pub mod transaction;
pub mod types;

pub use error::{StateError, StateResult};
pub use history::{AuditAction, AuditRecord, History, HistoryEvent};
pub use list::{NodeFilter, NodeList};
pub use store::NodeStore;
pub use transaction::{
    CommitSummary, Expectation, GenerationExpectation, NestedTransaction, NodeOp,
    NodeTransaction, PairedAction,
};
pub use types::*;
