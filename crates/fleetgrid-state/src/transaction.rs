//! Commit batches and nested transactions.
//!
//! A [`NodeTransaction`] is an ordered batch of node operations guarded by
//! [`Expectation`]s. The store applies it inside one redb write transaction:
//! every expectation is checked first, then the operations run in order, the
//! result is validated as a whole, and only then is anything persisted.
//!
//! A [`NestedTransaction`] lets callers pair external actions with a commit.
//! Its actions run after the batch validated but before the write is made
//! durable; if any action fails the batch is discarded.

use fleet_core::{Agent, ApplicationId, Generation};
use tracing::{debug, warn};

use crate::types::{Allocation, Hostname, Node, NodeState};

/// One mutation within a commit batch.
#[derive(Debug, Clone)]
pub enum NodeOp {
    /// Enrol a new node. Children must leave the parent's headroom free
    /// unless `consume_headroom` is set.
    Add { node: Node, consume_headroom: bool },
    Transition { hostname: Hostname, to: NodeState },
    SetAllocation {
        hostname: Hostname,
        allocation: Option<Allocation>,
    },
    /// Clean/verify step: clears `wants_wipe` on a dirty node.
    MarkWiped { hostname: Hostname },
    Remove { hostname: Hostname },
    SetGeneration {
        owner: ApplicationId,
        cluster_id: String,
        generation: Generation,
    },
}

/// State a node must still be in for the batch to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub hostname: Hostname,
    pub version: u64,
    pub state: NodeState,
}

/// Generation a cluster must still be at for the batch to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationExpectation {
    pub owner: ApplicationId,
    pub cluster_id: String,
    pub generation: Generation,
}

/// Guards checked before any operation of a batch runs.
#[derive(Debug, Clone, Default)]
pub(crate) struct Guards {
    pub nodes: Vec<Expectation>,
    pub generations: Vec<GenerationExpectation>,
}

/// An all-or-nothing batch of node operations.
#[derive(Debug, Clone)]
pub struct NodeTransaction {
    pub agent: Agent,
    pub reason: String,
    ops: Vec<NodeOp>,
    expectations: Vec<Expectation>,
    generation_expectations: Vec<GenerationExpectation>,
}

impl NodeTransaction {
    pub fn new(agent: Agent, reason: impl Into<String>) -> Self {
        Self {
            agent,
            reason: reason.into(),
            ops: Vec::new(),
            expectations: Vec::new(),
            generation_expectations: Vec::new(),
        }
    }

    pub fn push(&mut self, op: NodeOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn add(&mut self, node: Node) -> &mut Self {
        self.push(NodeOp::Add {
            node,
            consume_headroom: false,
        })
    }

    pub fn add_consuming_headroom(&mut self, node: Node) -> &mut Self {
        self.push(NodeOp::Add {
            node,
            consume_headroom: true,
        })
    }

    pub fn transition(&mut self, hostname: &str, to: NodeState) -> &mut Self {
        self.push(NodeOp::Transition {
            hostname: hostname.to_string(),
            to,
        })
    }

    pub fn set_allocation(&mut self, hostname: &str, allocation: Option<Allocation>) -> &mut Self {
        self.push(NodeOp::SetAllocation {
            hostname: hostname.to_string(),
            allocation,
        })
    }

    pub fn mark_wiped(&mut self, hostname: &str) -> &mut Self {
        self.push(NodeOp::MarkWiped {
            hostname: hostname.to_string(),
        })
    }

    pub fn remove(&mut self, hostname: &str) -> &mut Self {
        self.push(NodeOp::Remove {
            hostname: hostname.to_string(),
        })
    }

    pub fn set_generation(
        &mut self,
        owner: &ApplicationId,
        cluster_id: &str,
        generation: Generation,
    ) -> &mut Self {
        self.push(NodeOp::SetGeneration {
            owner: owner.clone(),
            cluster_id: cluster_id.to_string(),
            generation,
        })
    }

    pub fn expect(&mut self, hostname: &str, version: u64, state: NodeState) -> &mut Self {
        self.expectations.push(Expectation {
            hostname: hostname.to_string(),
            version,
            state,
        });
        self
    }

    /// Require `node` to be unchanged since it was read.
    pub fn expect_unchanged(&mut self, node: &Node) -> &mut Self {
        self.expect(&node.hostname, node.version, node.state)
    }

    /// Require the cluster generation to be unchanged since it was read.
    pub fn expect_generation(
        &mut self,
        owner: &ApplicationId,
        cluster_id: &str,
        generation: Generation,
    ) -> &mut Self {
        self.generation_expectations.push(GenerationExpectation {
            owner: owner.clone(),
            cluster_id: cluster_id.to_string(),
            generation,
        });
        self
    }

    pub fn ops(&self) -> &[NodeOp] {
        &self.ops
    }

    pub fn expectations(&self) -> &[Expectation] {
        &self.expectations
    }

    pub fn generation_expectations(&self) -> &[GenerationExpectation] {
        &self.generation_expectations
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Agent, String, Vec<NodeOp>, Guards) {
        let guards = Guards {
            nodes: self.expectations,
            generations: self.generation_expectations,
        };
        (self.agent, self.reason, self.ops, guards)
    }
}

/// Outcome of a validated batch.
#[derive(Debug, Clone)]
pub struct CommitSummary {
    pub transaction_id: u64,
    /// Post-commit records of every node the batch touched.
    pub changed: Vec<Node>,
    pub removed: Vec<Hostname>,
    pub generations: Vec<(ApplicationId, String, Generation)>,
}

impl CommitSummary {
    pub fn node(&self, hostname: &str) -> Option<&Node> {
        self.changed.iter().find(|n| n.hostname == hostname)
    }
}

/// An external action that must succeed or fail together with a commit.
pub trait PairedAction: Send {
    fn name(&self) -> &str;

    fn apply(&mut self, summary: &CommitSummary) -> anyhow::Result<()>;

    /// Revert a successful `apply` after a later action or the commit failed.
    fn undo(&mut self, _summary: &CommitSummary) {}
}

struct FnAction<F> {
    name: String,
    f: F,
}

impl<F> PairedAction for FnAction<F>
where
    F: FnMut(&CommitSummary) -> anyhow::Result<()> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, summary: &CommitSummary) -> anyhow::Result<()> {
        (self.f)(summary)
    }
}

/// Ordered set of paired actions run inside a store commit.
#[derive(Default)]
pub struct NestedTransaction {
    actions: Vec<Box<dyn PairedAction>>,
    applied: usize,
}

impl NestedTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, action: impl PairedAction + 'static) -> &mut Self {
        self.actions.push(Box::new(action));
        self
    }

    /// Pair a closure with the commit.
    pub fn add_fn<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: FnMut(&CommitSummary) -> anyhow::Result<()> + Send + 'static,
    {
        self.add(FnAction {
            name: name.to_string(),
            f,
        })
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Apply every action in order; on failure undo the ones already applied.
    pub(crate) fn run(&mut self, summary: &CommitSummary) -> anyhow::Result<()> {
        self.applied = 0;
        for i in 0..self.actions.len() {
            let result = self.actions[i].apply(summary);
            if let Err(e) = result {
                let name = self.actions[i].name().to_string();
                warn!(action = %name, error = %e, "paired action failed, undoing earlier actions");
                self.undo_applied(summary);
                return Err(e.context(format!("paired action '{name}' failed")));
            }
            self.applied = i + 1;
            debug!(action = self.actions[i].name(), "paired action applied");
        }
        Ok(())
    }

    /// Undo applied actions in reverse order.
    pub(crate) fn undo_applied(&mut self, summary: &CommitSummary) {
        for action in self.actions[..self.applied].iter_mut().rev() {
            action.undo(summary);
        }
        self.applied = 0;
    }
}
