//! In-memory application and validation of a commit batch.
//!
//! The store loads the current node set inside its write transaction, hands
//! it to a [`Batch`], and persists the batch output only when every
//! operation applied and the end-of-batch validation passed.

use std::collections::{BTreeMap, BTreeSet};

use fleet_core::{Agent, ApplicationId, Flavor, FlavorCatalog, Generation, Resources};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::history::{AuditAction, AuditRecord};
use crate::lifecycle::apply_transition;
use crate::transaction::{CommitSummary, Expectation, GenerationExpectation, NodeOp};
use crate::types::{Hostname, Node, NodeState, generation_key};

/// Fail with `Conflict` on the first expectation the stored nodes no longer meet.
pub(crate) fn check_expectations(
    nodes: &BTreeMap<Hostname, Node>,
    expectations: &[Expectation],
) -> StateResult<()> {
    for exp in expectations {
        let detail = match nodes.get(&exp.hostname) {
            None => "node no longer exists".to_string(),
            Some(node) if node.version != exp.version || node.state != exp.state => format!(
                "expected version {} in {}, found version {} in {}",
                exp.version, exp.state, node.version, node.state
            ),
            Some(_) => continue,
        };
        return Err(StateError::Conflict {
            hostname: exp.hostname.clone(),
            detail,
        });
    }
    Ok(())
}

/// Fail with `Conflict` when a cluster generation moved since it was read.
///
/// The conflict is keyed by the generation key rather than a hostname, so a
/// racing activation surfaces as a retryable error instead of a regression.
pub(crate) fn check_generations(
    generations: &BTreeMap<String, Generation>,
    expectations: &[GenerationExpectation],
) -> StateResult<()> {
    for exp in expectations {
        let key = generation_key(&exp.owner, &exp.cluster_id);
        let current = generations.get(&key).copied().unwrap_or(Generation::INITIAL);
        if current != exp.generation {
            return Err(StateError::Conflict {
                hostname: key,
                detail: format!("expected generation {}, found {current}", exp.generation),
            });
        }
    }
    Ok(())
}

/// Everything the store writes for a validated batch.
pub(crate) struct BatchOutput {
    pub summary: CommitSummary,
    pub audit: Vec<AuditRecord>,
}

pub(crate) struct Batch<'a> {
    catalog: &'a FlavorCatalog,
    agent: Agent,
    reason: String,
    transaction: u64,
    at: u64,
    nodes: BTreeMap<Hostname, Node>,
    generations: BTreeMap<String, Generation>,
    touched: BTreeSet<Hostname>,
    added: Vec<(Hostname, bool)>,
    removed: Vec<Hostname>,
    generation_updates: Vec<(ApplicationId, String, Generation)>,
    audit: Vec<(Hostname, AuditAction)>,
}

impl<'a> Batch<'a> {
    pub fn new(
        catalog: &'a FlavorCatalog,
        agent: Agent,
        reason: String,
        transaction: u64,
        at: u64,
        nodes: BTreeMap<Hostname, Node>,
        generations: BTreeMap<String, Generation>,
    ) -> Self {
        Self {
            catalog,
            agent,
            reason,
            transaction,
            at,
            nodes,
            generations,
            touched: BTreeSet::new(),
            added: Vec::new(),
            removed: Vec::new(),
            generation_updates: Vec::new(),
            audit: Vec::new(),
        }
    }

    pub fn apply(&mut self, op: NodeOp) -> StateResult<()> {
        match op {
            NodeOp::Add {
                node,
                consume_headroom,
            } => self.add(node, consume_headroom),
            NodeOp::Transition { hostname, to } => {
                let node = self
                    .nodes
                    .get_mut(&hostname)
                    .ok_or_else(|| StateError::NotFound(hostname.clone()))?;
                let event =
                    apply_transition(node, to, self.agent, &self.reason, self.at, self.transaction)?;
                self.audit.push((
                    hostname.clone(),
                    AuditAction::Transitioned {
                        from: event.from,
                        to: event.to,
                    },
                ));
                self.touched.insert(hostname);
                Ok(())
            }
            NodeOp::SetAllocation {
                hostname,
                allocation,
            } => {
                let node = self
                    .nodes
                    .get_mut(&hostname)
                    .ok_or_else(|| StateError::NotFound(hostname.clone()))?;
                let action = AuditAction::Allocated {
                    membership: allocation.as_ref().map(|a| a.membership.to_string()),
                    generation: allocation.as_ref().map(|a| a.generation),
                };
                node.allocation = allocation;
                self.audit.push((hostname.clone(), action));
                self.touched.insert(hostname);
                Ok(())
            }
            NodeOp::MarkWiped { hostname } => {
                let node = self
                    .nodes
                    .get_mut(&hostname)
                    .ok_or_else(|| StateError::NotFound(hostname.clone()))?;
                if node.state != NodeState::Dirty {
                    return Err(StateError::InvalidNode {
                        hostname,
                        detail: format!("only dirty nodes can be wiped, node is {}", node.state),
                    });
                }
                node.status.wants_wipe = false;
                self.audit.push((hostname.clone(), AuditAction::Wiped));
                self.touched.insert(hostname);
                Ok(())
            }
            NodeOp::Remove { hostname } => self.remove(hostname),
            NodeOp::SetGeneration {
                owner,
                cluster_id,
                generation,
            } => {
                let key = generation_key(&owner, &cluster_id);
                let current = self
                    .generations
                    .get(&key)
                    .copied()
                    .unwrap_or(Generation::INITIAL);
                if generation <= current {
                    return Err(StateError::GenerationRegression {
                        key,
                        current: current.0,
                        proposed: generation.0,
                    });
                }
                self.generations.insert(key, generation);
                self.generation_updates.push((owner, cluster_id, generation));
                Ok(())
            }
        }
    }

    fn add(&mut self, mut node: Node, consume_headroom: bool) -> StateResult<()> {
        let catalog = self.catalog;
        if self.nodes.contains_key(&node.hostname) {
            return Err(StateError::DuplicateHostname(node.hostname));
        }
        let flavor = flavor_of(catalog, &node)?;
        if node.state != NodeState::Provisioned || node.allocation.is_some() {
            return Err(StateError::InvalidNode {
                hostname: node.hostname,
                detail: "new nodes must be provisioned and unallocated".to_string(),
            });
        }
        if let Some(parent_name) = &node.parent_hostname {
            if node.is_host() {
                return Err(StateError::InvalidNode {
                    hostname: node.hostname.clone(),
                    detail: "hosts cannot have a parent".to_string(),
                });
            }
            let parent = self.nodes.get(parent_name).ok_or_else(|| StateError::InvalidNode {
                hostname: node.hostname.clone(),
                detail: format!("parent {parent_name} not found"),
            })?;
            if !parent.is_host() {
                return Err(StateError::InvalidNode {
                    hostname: node.hostname.clone(),
                    detail: format!("parent {parent_name} is not a host"),
                });
            }
            let parent_flavor = flavor_of(catalog, parent)?;
            if !catalog.can_host(parent_flavor, flavor) {
                return Err(StateError::IncompatibleFlavor {
                    parent: parent.hostname.clone(),
                    parent_flavor: parent_flavor.name.clone(),
                    child: node.hostname.clone(),
                    child_flavor: flavor.name.clone(),
                });
            }
            self.touched.insert(parent_name.clone());
        }

        node.created_at = self.at;
        node.created_by = self.agent;
        node.version = 0;
        let hostname = node.hostname.clone();
        self.nodes.insert(hostname.clone(), node);
        self.audit.push((hostname.clone(), AuditAction::Added));
        self.added.push((hostname.clone(), consume_headroom));
        self.touched.insert(hostname);
        Ok(())
    }

    fn remove(&mut self, hostname: Hostname) -> StateResult<()> {
        let node = self
            .nodes
            .get(&hostname)
            .ok_or_else(|| StateError::NotFound(hostname.clone()))?;
        if node.state != NodeState::Decommissioned {
            return Err(StateError::NotRemovable {
                detail: format!("node is {}, not decommissioned", node.state),
                hostname,
            });
        }
        let first_child = self
            .children(&hostname)
            .next()
            .map(|c| c.hostname.clone());
        if let Some(child) = first_child {
            return Err(StateError::NotRemovable {
                detail: format!("still carries child {child}"),
                hostname,
            });
        }
        if let Some(parent) = node.parent_hostname.clone() {
            if self.nodes.contains_key(&parent) {
                self.touched.insert(parent);
            }
        }
        self.nodes.remove(&hostname);
        self.touched.remove(&hostname);
        self.audit.push((hostname.clone(), AuditAction::Removed));
        self.removed.push(hostname);
        Ok(())
    }

    fn children<'s>(&'s self, parent: &'s str) -> impl Iterator<Item = &'s Node> + 's {
        self.nodes
            .values()
            .filter(move |n| n.parent_hostname.as_deref() == Some(parent))
    }

    /// Sum of child resources on `parent`, skipping children `skip` selects.
    /// Resources the children of `parent` hold.
    ///
    /// Failed and parked children keep their share since they may come back.
    /// Decommissioned children are terminal and no longer count.
    fn children_load(&self, parent: &str, skip: impl Fn(&Node) -> bool) -> StateResult<Resources> {
        let mut load = Resources::ZERO;
        for child in self
            .children(parent)
            .filter(|c| !c.state.is_terminal() && !skip(c))
        {
            load += flavor_of(self.catalog, child)?.resources;
        }
        Ok(load)
    }

    /// End-of-batch invariants over every node the batch touched.
    pub fn validate(&self) -> StateResult<()> {
        for hostname in &self.touched {
            let Some(node) = self.nodes.get(hostname) else {
                continue;
            };
            if node.state.is_allocated() != node.allocation.is_some() {
                return Err(StateError::AllocationInvariant {
                    hostname: hostname.clone(),
                    detail: format!(
                        "state {} with{} allocation",
                        node.state,
                        if node.allocation.is_some() { "" } else { "out" }
                    ),
                });
            }
            if node.state.is_live() {
                if let Some(parent_name) = &node.parent_hostname {
                    self.check_parent(node, parent_name)?;
                }
            }
            if node.is_host() && !node.state.accepts_children() {
                if let Some(child) = self.children(hostname).find(|c| c.state.is_live()) {
                    return Err(StateError::ParentNotEligible {
                        child: child.hostname.clone(),
                        parent: hostname.clone(),
                        state: node.state,
                    });
                }
            }
        }
        self.check_addresses()?;
        self.check_headroom()?;
        self.check_host_capacity()?;
        self.check_memberships()
    }

    fn check_parent(&self, child: &Node, parent_name: &str) -> StateResult<()> {
        let parent = self
            .nodes
            .get(parent_name)
            .ok_or_else(|| StateError::InvalidNode {
                hostname: child.hostname.clone(),
                detail: format!("parent {parent_name} not found"),
            })?;
        if !parent.state.accepts_children() {
            return Err(StateError::ParentNotEligible {
                child: child.hostname.clone(),
                parent: parent_name.to_string(),
                state: parent.state,
            });
        }
        Ok(())
    }

    fn check_addresses(&self) -> StateResult<()> {
        for (hostname, _) in &self.added {
            let Some(node) = self.nodes.get(hostname) else {
                continue;
            };
            for ip in &node.ip_addresses {
                if let Some(other) = self
                    .nodes
                    .values()
                    .find(|n| n.hostname != *hostname && n.ip_addresses.contains(ip))
                {
                    return Err(StateError::InvalidNode {
                        hostname: hostname.clone(),
                        detail: format!("address {ip} already used by {}", other.hostname),
                    });
                }
            }
        }
        Ok(())
    }

    /// New children must leave the host's headroom free unless told otherwise.
    fn check_headroom(&self) -> StateResult<()> {
        let added: BTreeSet<&str> = self.added.iter().map(|(h, _)| h.as_str()).collect();
        let mut used: BTreeMap<&str, Resources> = BTreeMap::new();
        for (hostname, consume_headroom) in &self.added {
            let Some(node) = self.nodes.get(hostname) else {
                continue;
            };
            let Some(parent_name) = node.parent_hostname.as_deref() else {
                continue;
            };
            let Some(parent) = self.nodes.get(parent_name) else {
                continue;
            };
            let host_flavor = flavor_of(self.catalog, parent)?;
            let child = flavor_of(self.catalog, node)?.resources;

            let load = match used.get(parent_name) {
                Some(load) => *load,
                None => self.children_load(parent_name, |c| added.contains(c.hostname.as_str()))?,
            };
            let required = if *consume_headroom {
                child
            } else {
                child + host_flavor.headroom_for(&child)
            };
            let free = host_flavor.resources.saturating_sub(&load);
            if !required.fits_within(&free) {
                return Err(StateError::CapacityInvariantViolated {
                    parent: parent_name.to_string(),
                    detail: format!("{hostname} needs {required} but only {free} is free"),
                });
            }
            debug!(parent = parent_name, child = %hostname, %free, "headroom check passed");
            used.insert(parent_name, load + child);
        }
        Ok(())
    }

    fn check_host_capacity(&self) -> StateResult<()> {
        for hostname in &self.touched {
            let Some(host) = self.nodes.get(hostname).filter(|n| n.is_host()) else {
                continue;
            };
            let capacity = flavor_of(self.catalog, host)?.resources;
            let load = self.children_load(hostname, |_| false)?;
            if !load.fits_within(&capacity) {
                return Err(StateError::CapacityInvariantViolated {
                    parent: hostname.clone(),
                    detail: format!("children use {load}, capacity is {capacity}"),
                });
            }
        }
        Ok(())
    }

    /// `(group, index)` is unique among active nodes of a cluster.
    fn check_memberships(&self) -> StateResult<()> {
        let mut seen: BTreeMap<(String, &str, u32, u32), &str> = BTreeMap::new();
        for node in self.nodes.values().filter(|n| n.state == NodeState::Active) {
            let Some(allocation) = &node.allocation else {
                continue;
            };
            let membership = &allocation.membership;
            let key = (
                allocation.owner.to_string(),
                membership.cluster_id.as_str(),
                membership.group,
                membership.index,
            );
            if seen.insert(key, node.hostname.as_str()).is_some() {
                return Err(StateError::DuplicateMembership {
                    owner: allocation.owner.to_string(),
                    membership: membership.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Bump versions of touched nodes and assemble what the store persists.
    pub fn finish(mut self, audit_seq: u64) -> BatchOutput {
        let mut changed = Vec::with_capacity(self.touched.len());
        for hostname in &self.touched {
            if let Some(node) = self.nodes.get_mut(hostname) {
                node.version += 1;
                changed.push(node.clone());
            }
        }

        let audit = self
            .audit
            .into_iter()
            .zip(audit_seq + 1..)
            .map(|((hostname, action), seq)| AuditRecord {
                seq,
                transaction: self.transaction,
                hostname,
                action,
                at: self.at,
                agent: self.agent,
                reason: self.reason.clone(),
            })
            .collect();

        BatchOutput {
            summary: CommitSummary {
                transaction_id: self.transaction,
                changed,
                removed: self.removed,
                generations: self.generation_updates,
            },
            audit,
        }
    }
}

fn flavor_of<'c>(catalog: &'c FlavorCatalog, node: &Node) -> StateResult<&'c Flavor> {
    catalog
        .resolve(&node.flavor)
        .map_err(|_| StateError::UnknownFlavor {
            hostname: node.hostname.clone(),
            flavor: node.flavor.clone(),
        })
}
