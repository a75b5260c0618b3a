//! redb table definitions for the node store.
//!
//! Node records are JSON-serialized into `&[u8]` value columns keyed by
//! hostname. The audit log is keyed by a global sequence number so range
//! scans return records in commit order.

use redb::TableDefinition;

/// Nodes keyed by `{hostname}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Cluster generations keyed by `{tenant}:{application}:{instance}#{cluster_id}`.
pub const GENERATIONS: TableDefinition<&str, u64> = TableDefinition::new("generations");

/// Audit records keyed by global sequence number.
pub const AUDIT: TableDefinition<u64, &[u8]> = TableDefinition::new("audit");

/// Store counters keyed by name.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Last issued commit batch id.
pub const TRANSACTION_SEQ: &str = "transaction_seq";

/// Last issued audit sequence number.
pub const AUDIT_SEQ: &str = "audit_seq";
