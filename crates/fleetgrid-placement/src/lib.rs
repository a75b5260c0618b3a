//! FleetGrid allocation engine: flavors, placement, activation.
//!
//! This crate decides which nodes serve an application cluster. It never
//! touches node records directly: every decision is committed through the
//! `fleetgrid-state` store as one versioned batch, so concurrent
//! allocations either apply completely or fail with a retryable conflict.
//!
//! # Components
//!
//! - **`request`**: Capacity requests, flavor requests and the allocation policy
//! - **`placer`**: Two-phase engine (`prepare` → `activate`), retirement, removal
//! - **`scorer`**: Candidate ranking (group spread, flavor match, host load)
//! - **`activation`**: Proposal → store batch, activation results
//! - **`resolver`**: IP → hostname lookup for new child nodes
//! - **`events`**: Allocation events and sinks
//! - **`convert`**: Conversions from node store types

pub mod activation;
pub mod convert;
pub mod error;
pub mod events;
pub mod placer;
pub mod proposal;
pub mod request;
pub mod resolver;
pub mod scorer;

pub use activation::{Activation, HostAssignment, activation_result, activation_transaction};
pub use convert::{active_assignments, node_to_assignment};
pub use error::{PlacementError, PlacementResult};
pub use events::{AllocationEvent, EventSink, NodeView, NullSink, RecordingSink, TracingSink};
pub use placer::AllocationEngine;
pub use proposal::{Addition, AdditionTarget, Member, PlacementProposal};
pub use request::{AllocationPolicy, CapacityRequest, FlavorRequest};
pub use resolver::{MemoryNameResolver, NameResolver, ResolveError};
pub use scorer::{Candidate, CandidateSource};
