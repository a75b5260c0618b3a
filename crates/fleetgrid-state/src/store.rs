//! NodeStore: redb-backed repository of every node in the fleet.
//!
//! Reads go through a single redb read transaction and never block writers.
//! Every mutation is a [`NodeTransaction`] applied inside one redb write
//! transaction, so commits are serialized and either land completely or not
//! at all. Optimistic concurrency is expressed through per-node expectations:
//! each commit bumps the version of every node it touches.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use fleet_core::{Agent, ApplicationId, FlavorCatalog, Generation};
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, info, warn};

use crate::batch::{Batch, check_expectations, check_generations};
use crate::error::{StateError, StateResult};
use crate::history::{AuditRecord, History};
use crate::list::{NodeFilter, NodeList};
use crate::tables::*;
use crate::transaction::{CommitSummary, NestedTransaction, NodeTransaction};
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe node store backed by redb.
#[derive(Clone)]
pub struct NodeStore {
    db: Arc<Database>,
    catalog: Arc<FlavorCatalog>,
}

impl NodeStore {
    /// Open (or create) a persistent node store at the given path.
    pub fn open(path: &Path, catalog: FlavorCatalog) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            catalog: Arc::new(catalog),
        };
        store.ensure_tables()?;
        debug!(?path, "node store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory node store.
    pub fn open_in_memory(catalog: FlavorCatalog) -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            catalog: Arc::new(catalog),
        };
        store.ensure_tables()?;
        debug!("in-memory node store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(GENERATIONS).map_err(map_err!(Table))?;
        txn.open_table(AUDIT).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn catalog(&self) -> &FlavorCatalog {
        &self.catalog
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get a node by hostname.
    pub fn get(&self, hostname: &str) -> StateResult<Option<Node>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(hostname).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: Node =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// List nodes matching `filter`, in hostname order.
    pub fn list(&self, filter: &NodeFilter) -> StateResult<Vec<Node>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let nodes = decode_nodes(&table)?;
        Ok(nodes.into_values().filter(|n| filter.matches(n)).collect())
    }

    /// Consistent view of all nodes and generations.
    pub fn snapshot(&self) -> StateResult<NodeList> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let nodes = decode_nodes(&txn.open_table(NODES).map_err(map_err!(Table))?)?;
        let generations =
            decode_generations(&txn.open_table(GENERATIONS).map_err(map_err!(Table))?)?;
        debug!(nodes = nodes.len(), "snapshot read");
        Ok(NodeList::new(nodes, generations))
    }

    /// Current generation of a cluster; [`Generation::INITIAL`] if never activated.
    pub fn generation(&self, owner: &ApplicationId, cluster_id: &str) -> StateResult<Generation> {
        let key = generation_key(owner, cluster_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GENERATIONS).map_err(map_err!(Table))?;
        Ok(table
            .get(key.as_str())
            .map_err(map_err!(Read))?
            .map(|g| Generation(g.value()))
            .unwrap_or(Generation::INITIAL))
    }

    pub fn history(&self, hostname: &str) -> StateResult<History> {
        self.get(hostname)?
            .map(|n| n.history)
            .ok_or_else(|| StateError::NotFound(hostname.to_string()))
    }

    /// Up to `limit` audit records with a sequence number greater than `since`.
    pub fn audit_log(&self, since: u64, limit: usize) -> StateResult<Vec<AuditRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AUDIT).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(since.saturating_add(1)..)
            .map_err(map_err!(Read))?
            .take(limit)
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: AuditRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    // ── Single-node writes ─────────────────────────────────────────

    /// Enrol new nodes. Returns the stored records in input order.
    pub fn add_nodes(&self, nodes: Vec<Node>, agent: Agent) -> StateResult<Vec<Node>> {
        let hostnames: Vec<Hostname> = nodes.iter().map(|n| n.hostname.clone()).collect();
        let mut txn = NodeTransaction::new(agent, "enrolled");
        for node in nodes {
            txn.add(node);
        }
        let summary = self.commit(txn)?;
        Ok(hostnames
            .iter()
            .filter_map(|h| summary.node(h).cloned())
            .collect())
    }

    pub fn transition(
        &self,
        hostname: &str,
        to: NodeState,
        agent: Agent,
        reason: &str,
    ) -> StateResult<Node> {
        let mut txn = NodeTransaction::new(agent, reason);
        txn.transition(hostname, to);
        let summary = self.commit(txn)?;
        changed_node(&summary, hostname)
    }

    /// Move a host and all of its children to `to` in one batch, children first.
    ///
    /// Intended for `failed` and `parked`; children already in `to` or unable
    /// to reach it are left alone.
    pub fn transition_recursively(
        &self,
        hostname: &str,
        to: NodeState,
        agent: Agent,
        reason: &str,
    ) -> StateResult<Vec<Node>> {
        let snapshot = self.snapshot()?;
        let host = snapshot
            .get(hostname)
            .ok_or_else(|| StateError::NotFound(hostname.to_string()))?;
        let mut txn = NodeTransaction::new(agent, reason);
        for child in snapshot.children_of(hostname) {
            if child.state == to || !child.state.can_transition_to(to) {
                continue;
            }
            txn.expect_unchanged(child).transition(&child.hostname, to);
        }
        txn.expect_unchanged(host).transition(hostname, to);
        Ok(self.commit(txn)?.changed)
    }

    pub fn set_allocation(
        &self,
        hostname: &str,
        allocation: Option<Allocation>,
        agent: Agent,
    ) -> StateResult<Node> {
        let mut txn = NodeTransaction::new(agent, "allocation updated");
        txn.set_allocation(hostname, allocation);
        let summary = self.commit(txn)?;
        changed_node(&summary, hostname)
    }

    /// Clear the wipe request of a dirty node.
    pub fn mark_wiped(&self, hostname: &str, agent: Agent) -> StateResult<Node> {
        let mut txn = NodeTransaction::new(agent, "wiped");
        txn.mark_wiped(hostname);
        let summary = self.commit(txn)?;
        changed_node(&summary, hostname)
    }

    /// Delete a decommissioned node that carries no children.
    pub fn remove(&self, hostname: &str, agent: Agent) -> StateResult<()> {
        let mut txn = NodeTransaction::new(agent, "removed");
        txn.remove(hostname);
        self.commit(txn)?;
        Ok(())
    }

    // ── Batch commits ──────────────────────────────────────────────

    pub fn commit(&self, txn: NodeTransaction) -> StateResult<CommitSummary> {
        self.commit_with(txn, &mut NestedTransaction::new())
    }

    /// Apply `txn` atomically, running `nested` before the write becomes durable.
    ///
    /// Nothing is persisted when an expectation fails, an operation or the
    /// end-of-batch validation is rejected, or a paired action fails.
    pub fn commit_with(
        &self,
        txn: NodeTransaction,
        nested: &mut NestedTransaction,
    ) -> StateResult<CommitSummary> {
        let (agent, reason, ops, guards) = txn.into_parts();
        let write = self.db.begin_write().map_err(map_err!(Transaction))?;

        let (nodes, generations, transaction_id, audit_seq) = {
            let nodes = decode_nodes(&write.open_table(NODES).map_err(map_err!(Table))?)?;
            let generations =
                decode_generations(&write.open_table(GENERATIONS).map_err(map_err!(Table))?)?;
            let meta = write.open_table(META).map_err(map_err!(Table))?;
            let transaction_id = read_counter(&meta, TRANSACTION_SEQ)? + 1;
            let audit_seq = read_counter(&meta, AUDIT_SEQ)?;
            (nodes, generations, transaction_id, audit_seq)
        };

        if let Err(e) = check_expectations(&nodes, &guards.nodes)
            .and_then(|()| check_generations(&generations, &guards.generations))
        {
            warn!(transaction = transaction_id, %agent, error = %e, "commit rejected");
            return Err(e);
        }

        let mut batch = Batch::new(
            &self.catalog,
            agent,
            reason,
            transaction_id,
            epoch_millis(),
            nodes,
            generations,
        );
        for op in ops {
            batch.apply(op)?;
        }
        batch.validate()?;
        let output = batch.finish(audit_seq);
        let summary = output.summary;

        {
            let mut table = write.open_table(NODES).map_err(map_err!(Table))?;
            for node in &summary.changed {
                let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
                table
                    .insert(node.hostname.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            for hostname in &summary.removed {
                table.remove(hostname.as_str()).map_err(map_err!(Write))?;
            }
        }
        {
            let mut table = write.open_table(GENERATIONS).map_err(map_err!(Table))?;
            for (owner, cluster_id, generation) in &summary.generations {
                let key = generation_key(owner, cluster_id);
                table
                    .insert(key.as_str(), generation.0)
                    .map_err(map_err!(Write))?;
            }
        }
        let last_audit = output.audit.last().map_or(audit_seq, |r| r.seq);
        {
            let mut table = write.open_table(AUDIT).map_err(map_err!(Table))?;
            for record in &output.audit {
                let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
                table
                    .insert(record.seq, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        {
            let mut table = write.open_table(META).map_err(map_err!(Table))?;
            table
                .insert(TRANSACTION_SEQ, transaction_id)
                .map_err(map_err!(Write))?;
            table
                .insert(AUDIT_SEQ, last_audit)
                .map_err(map_err!(Write))?;
        }

        if let Err(e) = nested.run(&summary) {
            write.abort().map_err(map_err!(Transaction))?;
            warn!(transaction = transaction_id, error = %e, "commit aborted by paired action");
            return Err(StateError::SideEffect(e));
        }
        if let Err(e) = write.commit() {
            nested.undo_applied(&summary);
            return Err(StateError::Transaction(e.to_string()));
        }

        info!(
            transaction = transaction_id,
            %agent,
            changed = summary.changed.len(),
            removed = summary.removed.len(),
            "node batch committed"
        );
        Ok(summary)
    }
}

fn changed_node(summary: &CommitSummary, hostname: &str) -> StateResult<Node> {
    summary
        .node(hostname)
        .cloned()
        .ok_or_else(|| StateError::NotFound(hostname.to_string()))
}

fn decode_nodes<T>(table: &T) -> StateResult<BTreeMap<Hostname, Node>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut nodes = BTreeMap::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let node: Node = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        nodes.insert(key.value().to_string(), node);
    }
    Ok(nodes)
}

fn decode_generations<T>(table: &T) -> StateResult<BTreeMap<String, Generation>>
where
    T: ReadableTable<&'static str, u64>,
{
    let mut generations = BTreeMap::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        generations.insert(key.value().to_string(), Generation(value.value()));
    }
    Ok(generations)
}

fn read_counter<T>(table: &T, key: &str) -> StateResult<u64>
where
    T: ReadableTable<&'static str, u64>,
{
    Ok(table
        .get(key)
        .map_err(map_err!(Read))?
        .map(|g| g.value())
        .unwrap_or(0))
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::AuditAction;
    use fleet_core::{ClusterSpec, ClusterType, Flavor, FlavorKind, Resources};
    use std::net::IpAddr;

    fn catalog() -> FlavorCatalog {
        FlavorCatalog::new(vec![
            Flavor::new("host-large", Resources::new(8.0, 8.0, 8.0), FlavorKind::BareMetal)
                .with_headroom(1),
            Flavor::new("host-small", Resources::new(5.0, 5.0, 5.0), FlavorKind::BareMetal)
                .with_headroom(2),
            Flavor::new("d-1", Resources::new(1.0, 1.0, 1.0), FlavorKind::VirtualContainer),
            Flavor::new("d-2", Resources::new(2.0, 2.0, 2.0), FlavorKind::VirtualContainer),
            Flavor::new("d-3", Resources::new(3.0, 3.0, 3.0), FlavorKind::VirtualContainer),
        ])
        .unwrap()
    }

    fn store() -> NodeStore {
        NodeStore::open_in_memory(catalog()).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn app() -> ApplicationId {
        ApplicationId::new("tenant", "app", "default")
    }

    fn allocation(index: u32) -> Allocation {
        let cluster = ClusterSpec::new(ClusterType::Container, "c0", 1);
        Allocation::new(app(), cluster.membership(index), Generation(1))
    }

    fn ready_host(store: &NodeStore, hostname: &str, flavor: &str, address: &str) -> Node {
        store
            .add_nodes(vec![Node::host(hostname, flavor, [ip(address)])], Agent::System)
            .unwrap();
        store
            .transition(hostname, NodeState::Dirty, Agent::System, "bootstrap")
            .unwrap();
        store
            .transition(hostname, NodeState::Ready, Agent::System, "bootstrap")
            .unwrap()
    }

    fn activation(child: &str, host: &str, address: &str, index: u32) -> NodeTransaction {
        let mut txn = NodeTransaction::new(Agent::Application, "activate");
        txn.add(Node::child(child, host, "d-1", [ip(address)]))
            .transition(child, NodeState::Dirty)
            .transition(child, NodeState::Ready)
            .set_allocation(child, Some(allocation(index)))
            .transition(child, NodeState::Reserved)
            .transition(child, NodeState::Active);
        txn
    }

    #[test]
    fn add_and_get_node() {
        let store = store();
        let added = store
            .add_nodes(vec![Node::host("host1", "host-large", [ip("10.0.0.1")])], Agent::Operator)
            .unwrap();
        assert_eq!(added.len(), 1);

        let node = store.get("host1").unwrap().unwrap();
        assert_eq!(node.state, NodeState::Provisioned);
        assert_eq!(node.version, 1);
        assert_eq!(node.created_by, Agent::Operator);
        assert!(node.created_at > 0);
        assert!(store.get("nope").unwrap().is_none());

        let audit = store.audit_log(0, 10).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::Added);
    }

    #[test]
    fn duplicate_hostname_rejected() {
        let store = store();
        store
            .add_nodes(vec![Node::host("host1", "host-large", [ip("10.0.0.1")])], Agent::System)
            .unwrap();
        let err = store
            .add_nodes(vec![Node::host("host1", "host-large", [ip("10.0.0.2")])], Agent::System)
            .unwrap_err();
        assert!(matches!(err, StateError::DuplicateHostname(h) if h == "host1"));
    }

    #[test]
    fn unknown_flavor_and_duplicate_address_rejected() {
        let store = store();
        let err = store
            .add_nodes(vec![Node::host("host1", "huge", [ip("10.0.0.1")])], Agent::System)
            .unwrap_err();
        assert!(matches!(err, StateError::UnknownFlavor { .. }));

        store
            .add_nodes(vec![Node::host("host1", "host-large", [ip("10.0.0.1")])], Agent::System)
            .unwrap();
        let err = store
            .add_nodes(vec![Node::host("host2", "host-large", [ip("10.0.0.1")])], Agent::System)
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidNode { .. }));
    }

    #[test]
    fn child_needs_eligible_compatible_parent() {
        let store = store();
        store
            .add_nodes(vec![Node::host("host1", "host-large", [ip("10.0.0.1")])], Agent::System)
            .unwrap();

        let err = store
            .add_nodes(vec![Node::child("c1", "host1", "d-1", [ip("10.0.1.1")])], Agent::System)
            .unwrap_err();
        assert!(matches!(err, StateError::ParentNotEligible { state: NodeState::Provisioned, .. }));

        store.transition("host1", NodeState::Dirty, Agent::System, "t").unwrap();
        store.transition("host1", NodeState::Ready, Agent::System, "t").unwrap();

        let err = store
            .add_nodes(
                vec![Node::child("c1", "host1", "host-small", [ip("10.0.1.1")])],
                Agent::System,
            )
            .unwrap_err();
        assert!(matches!(err, StateError::IncompatibleFlavor { .. }));

        let err = store
            .add_nodes(vec![Node::child("c1", "ghost", "d-1", [ip("10.0.1.1")])], Agent::System)
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidNode { .. }));

        store
            .add_nodes(vec![Node::child("c1", "host1", "d-1", [ip("10.0.1.1")])], Agent::System)
            .unwrap();
    }

    #[test]
    fn transition_records_history_and_bumps_version() {
        let store = store();
        let host = ready_host(&store, "host1", "host-large", "10.0.0.1");
        assert_eq!(host.version, 3);
        assert_eq!(host.history.len(), 2);

        let history = store.history("host1").unwrap();
        assert_eq!(history.last().unwrap().to, NodeState::Ready);
        assert_eq!(history.entered(NodeState::Dirty).unwrap().reason, "bootstrap");
    }

    #[test]
    fn illegal_transition_leaves_store_unchanged() {
        let store = store();
        store
            .add_nodes(vec![Node::host("host1", "host-large", [ip("10.0.0.1")])], Agent::System)
            .unwrap();
        let err = store
            .transition("host1", NodeState::Active, Agent::System, "skip ahead")
            .unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition { .. }));

        let node = store.get("host1").unwrap().unwrap();
        assert_eq!(node.state, NodeState::Provisioned);
        assert_eq!(node.version, 1);
        assert_eq!(store.audit_log(0, 10).unwrap().len(), 1);
    }

    #[test]
    fn allocation_requires_allocated_state() {
        let store = store();
        ready_host(&store, "host1", "host-large", "10.0.0.1");
        let err = store
            .set_allocation("host1", Some(allocation(0)), Agent::System)
            .unwrap_err();
        assert!(matches!(err, StateError::AllocationInvariant { .. }));
    }

    #[test]
    fn child_lifecycle_with_wipe() {
        let store = store();
        ready_host(&store, "host1", "host-large", "10.0.0.1");
        let summary = store.commit(activation("c1", "host1", "10.0.1.1", 0)).unwrap();

        let child = summary.node("c1").unwrap();
        assert_eq!(child.state, NodeState::Active);
        assert_eq!(child.version, 1);
        assert_eq!(child.history.len(), 4);
        // The parent is touched by every child it gains.
        assert_eq!(summary.node("host1").unwrap().version, 4);

        let dirty = store
            .transition("c1", NodeState::Dirty, Agent::Application, "released")
            .unwrap();
        assert!(dirty.allocation.is_none());
        assert!(dirty.status.wants_wipe);

        let err = store
            .transition("c1", NodeState::Ready, Agent::System, "reuse")
            .unwrap_err();
        assert!(matches!(err, StateError::NotClean(_)));

        store.mark_wiped("c1", Agent::System).unwrap();
        let ready = store
            .transition("c1", NodeState::Ready, Agent::System, "reuse")
            .unwrap();
        assert!(!ready.status.wants_wipe);
    }

    #[test]
    fn mark_wiped_requires_dirty() {
        let store = store();
        ready_host(&store, "host1", "host-large", "10.0.0.1");
        let err = store.mark_wiped("host1", Agent::System).unwrap_err();
        assert!(matches!(err, StateError::InvalidNode { .. }));
    }

    #[test]
    fn headroom_is_kept_unless_consumed() {
        let store = store();
        ready_host(&store, "host1", "host-small", "10.0.0.1");

        // d-2 plus two d-2 slots of headroom exceeds host-small.
        let err = store
            .add_nodes(vec![Node::child("c1", "host1", "d-2", [ip("10.0.1.1")])], Agent::System)
            .unwrap_err();
        assert!(matches!(err, StateError::CapacityInvariantViolated { .. }));

        let mut txn = NodeTransaction::new(Agent::System, "failover");
        txn.add_consuming_headroom(Node::child("c1", "host1", "d-2", [ip("10.0.1.1")]));
        store.commit(txn).unwrap();
        assert!(store.get("c1").unwrap().is_some());
    }

    #[test]
    fn children_in_one_batch_share_capacity() {
        let store = store();
        ready_host(&store, "host1", "host-large", "10.0.0.1");
        let mut txn = NodeTransaction::new(Agent::System, "pack");
        for i in 0..3 {
            txn.add_consuming_headroom(Node::child(
                &format!("c{i}"),
                "host1",
                "d-3",
                [ip(&format!("10.0.1.{i}"))],
            ));
        }
        let err = store.commit(txn).unwrap_err();
        assert!(matches!(err, StateError::CapacityInvariantViolated { .. }));
        assert_eq!(store.list(&NodeFilter::all()).unwrap().len(), 1);
    }

    #[test]
    fn decommissioned_children_free_host_capacity() {
        let store = store();
        ready_host(&store, "host1", "host-large", "10.0.0.1");
        let child = |name: &str, address: &str| {
            let mut txn = NodeTransaction::new(Agent::System, "pack");
            txn.add_consuming_headroom(Node::child(name, "host1", "d-3", [ip(address)]));
            txn
        };
        store.commit(child("c1", "10.0.1.1")).unwrap();
        store.commit(child("c2", "10.0.1.2")).unwrap();

        // A parked child may return, so it keeps its share.
        store
            .transition("c1", NodeState::Parked, Agent::Operator, "broken disk")
            .unwrap();
        let err = store.commit(child("c3", "10.0.1.3")).unwrap_err();
        assert!(matches!(err, StateError::CapacityInvariantViolated { .. }));

        store
            .transition("c1", NodeState::Decommissioned, Agent::Operator, "retired")
            .unwrap();
        store.commit(child("c3", "10.0.1.3")).unwrap();
        assert_eq!(store.get("c3").unwrap().unwrap().parent_hostname.as_deref(), Some("host1"));
    }

    #[test]
    fn stale_expectation_conflicts_and_persists_nothing() {
        let store = store();
        let host = ready_host(&store, "host1", "host-large", "10.0.0.1");
        store
            .transition("host1", NodeState::Parked, Agent::Operator, "maintenance")
            .unwrap();

        let mut txn = NodeTransaction::new(Agent::System, "stale");
        txn.expect_unchanged(&host)
            .transition("host1", NodeState::Failed);
        let err = store.commit(txn).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get("host1").unwrap().unwrap().state, NodeState::Parked);
    }

    #[test]
    fn side_effect_failure_rolls_back() {
        let store = store();
        ready_host(&store, "host1", "host-large", "10.0.0.1");
        let audit_before = store.audit_log(0, 100).unwrap().len();

        let mut nested = NestedTransaction::new();
        nested.add_fn("publish", |_| anyhow::bail!("config server unreachable"));
        let err = store
            .commit_with(activation("c1", "host1", "10.0.1.1", 0), &mut nested)
            .unwrap_err();
        match err {
            StateError::SideEffect(e) => {
                assert!(format!("{e:#}").contains("config server unreachable"))
            }
            other => panic!("expected SideEffect, got {other:?}"),
        }

        assert!(store.get("c1").unwrap().is_none());
        assert_eq!(store.get("host1").unwrap().unwrap().version, 3);
        assert_eq!(store.audit_log(0, 100).unwrap().len(), audit_before);
    }

    #[test]
    fn generation_must_increase() {
        let store = store();
        let mut txn = NodeTransaction::new(Agent::Application, "activate");
        txn.set_generation(&app(), "c0", Generation(2));
        store.commit(txn).unwrap();
        assert_eq!(store.generation(&app(), "c0").unwrap(), Generation(2));

        let mut txn = NodeTransaction::new(Agent::Application, "activate");
        txn.set_generation(&app(), "c0", Generation(2));
        let err = store.commit(txn).unwrap_err();
        assert!(matches!(err, StateError::GenerationRegression { current: 2, proposed: 2, .. }));
        assert_eq!(store.generation(&app(), "c1").unwrap(), Generation::INITIAL);
    }

    #[test]
    fn stale_generation_is_a_conflict() {
        let store = store();
        let mut first = NodeTransaction::new(Agent::Application, "activate");
        first.expect_generation(&app(), "c0", Generation::INITIAL);
        first.set_generation(&app(), "c0", Generation(1));
        let racing = first.clone();
        store.commit(first).unwrap();

        let err = store.commit(racing).unwrap_err();
        assert!(err.is_conflict());
        match err {
            StateError::Conflict { hostname, detail } => {
                assert_eq!(hostname, "tenant:app:default#c0");
                assert_eq!(detail, "expected generation 0, found 1");
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
        assert_eq!(store.generation(&app(), "c0").unwrap(), Generation(1));

        let mut second = NodeTransaction::new(Agent::Application, "activate");
        second.expect_generation(&app(), "c0", Generation(1));
        second.set_generation(&app(), "c0", Generation(2));
        store.commit(second).unwrap();
        assert_eq!(store.generation(&app(), "c0").unwrap(), Generation(2));
    }

    #[test]
    fn duplicate_active_membership_rejected() {
        let store = store();
        ready_host(&store, "host1", "host-large", "10.0.0.1");
        ready_host(&store, "host2", "host-large", "10.0.0.2");
        store.commit(activation("c1", "host1", "10.0.1.1", 0)).unwrap();

        let err = store
            .commit(activation("c2", "host2", "10.0.1.2", 0))
            .unwrap_err();
        assert!(matches!(err, StateError::DuplicateMembership { .. }));
        store.commit(activation("c2", "host2", "10.0.1.2", 1)).unwrap();
    }

    #[test]
    fn remove_requires_decommissioned_childless_node() {
        let store = store();
        ready_host(&store, "host1", "host-large", "10.0.0.1");
        store
            .add_nodes(vec![Node::child("c1", "host1", "d-1", [ip("10.0.1.1")])], Agent::System)
            .unwrap();

        let err = store.remove("host1", Agent::Operator).unwrap_err();
        assert!(matches!(err, StateError::NotRemovable { .. }));

        store
            .transition_recursively("host1", NodeState::Parked, Agent::Operator, "retire")
            .unwrap();
        store
            .transition_recursively("host1", NodeState::Decommissioned, Agent::Operator, "retire")
            .unwrap();
        match store.remove("host1", Agent::Operator).unwrap_err() {
            StateError::NotRemovable { hostname, detail } => {
                assert_eq!(hostname, "host1");
                assert_eq!(detail, "still carries child c1");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        store.remove("c1", Agent::Operator).unwrap();
        store.remove("host1", Agent::Operator).unwrap();
        assert!(store.list(&NodeFilter::all()).unwrap().is_empty());
        let last = store.audit_log(0, 100).unwrap().pop().unwrap();
        assert_eq!(last.action, AuditAction::Removed);
    }

    #[test]
    fn failing_host_fails_children_first() {
        let store = store();
        ready_host(&store, "host1", "host-large", "10.0.0.1");
        store.commit(activation("c1", "host1", "10.0.1.1", 0)).unwrap();

        let err = store
            .transition("host1", NodeState::Failed, Agent::HealthCheck, "down")
            .unwrap_err();
        assert!(matches!(err, StateError::ParentNotEligible { .. }));

        let changed = store
            .transition_recursively("host1", NodeState::Failed, Agent::HealthCheck, "down")
            .unwrap();
        assert_eq!(changed.len(), 2);
        let child = store.get("c1").unwrap().unwrap();
        assert_eq!(child.state, NodeState::Failed);
        assert!(child.allocation.is_none());
        assert_eq!(child.status.fail_count, 1);
    }

    #[test]
    fn list_and_snapshot_filter_nodes() {
        let store = store();
        ready_host(&store, "host1", "host-large", "10.0.0.1");
        ready_host(&store, "host2", "host-large", "10.0.0.2");
        store.commit(activation("c1", "host1", "10.0.1.1", 0)).unwrap();

        let active = store
            .list(&NodeFilter::all().in_states(&[NodeState::Active]))
            .unwrap();
        assert_eq!(active.len(), 1);
        let members = store.list(&NodeFilter::all().in_cluster(&app(), "c0")).unwrap();
        assert_eq!(members[0].hostname, "c1");

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.children_of("host1").count(), 1);
    }

    #[test]
    fn audit_log_pages_by_sequence() {
        let store = store();
        ready_host(&store, "host1", "host-large", "10.0.0.1");
        let all = store.audit_log(0, 100).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].seq, 1);
        assert!(all.windows(2).all(|w| w[0].transaction < w[1].transaction));

        let page = store.audit_log(1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].seq, 2);
    }

    #[test]
    fn on_disk_store_reopens_with_same_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.redb");
        {
            let store = NodeStore::open(&path, catalog()).unwrap();
            ready_host(&store, "host1", "host-large", "10.0.0.1");
            store.commit(activation("c1", "host1", "10.0.1.1", 0)).unwrap();
            let mut txn = NodeTransaction::new(Agent::Application, "activate");
            txn.set_generation(&app(), "c0", Generation(1));
            store.commit(txn).unwrap();
        }

        let store = NodeStore::open(&path, catalog()).unwrap();
        let child = store.get("c1").unwrap().unwrap();
        assert_eq!(child.state, NodeState::Active);
        assert_eq!(store.generation(&app(), "c0").unwrap(), Generation(1));

        let summary = store
            .commit({
                let mut txn = NodeTransaction::new(Agent::System, "continue");
                txn.transition("c1", NodeState::Inactive);
                txn
            })
            .unwrap();
        assert_eq!(summary.transaction_id, 6);
    }
}
