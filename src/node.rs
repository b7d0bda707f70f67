//! The resource tree shared by groups, hosts and workers.
//!
//! Every level implements `ResourceNode`. Non-leaf levels embed a `ChildRegistry`,
//! a flat arena of children with an id index and a tombstone per slot. Removed
//! children drop out of every live view but stay in the arena so their worker can
//! still be destroyed when the pass is applied.

use std::collections::HashMap;

use tracing::debug;

use crate::error::AutoscaleError;
use crate::requirement::Requirement;

/// Removal bookkeeping of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub removable: bool,
    removed: bool,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            removable: true,
            removed: false,
        }
    }
}

impl NodeState {
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Tombstones the node. Returns false if it already was.
    pub fn mark_removed(&mut self) -> bool {
        !std::mem::replace(&mut self.removed, true)
    }

    pub fn is_removable(&self) -> bool {
        self.removable && !self.removed
    }
}

/// Caps a single placement has to respect, gathered on the way down the tree.
#[derive(Debug, Clone, Copy)]
pub struct Placement<'a> {
    pub requirement: &'a Requirement,
    pub max_instances_per_worker: usize,
    /// Instances of the workload in the whole group.
    pub group_count: usize,
    /// Instances of the workload on the host being tried.
    pub host_count: usize,
}

impl<'a> Placement<'a> {
    pub fn new(requirement: &'a Requirement, max_instances_per_worker: usize) -> Self {
        Self {
            requirement,
            max_instances_per_worker,
            group_count: 0,
            host_count: 0,
        }
    }

    pub fn workload(&self) -> &'a str {
        &self.requirement.workload
    }
}

pub trait ResourceNode {
    fn id(&self) -> &str;

    fn state(&self) -> &NodeState;

    fn state_mut(&mut self) -> &mut NodeState;

    /// Key siblings are ordered by. Lower keys come first.
    fn sort_key(&self) -> usize;

    /// True if this node or any live descendant carries the workload.
    fn has_workload(&self, workload: &str) -> bool;

    /// Live workload instances carried by this subtree.
    fn assignment_count(&self) -> usize;

    /// Live instances of one workload carried by this subtree.
    fn workload_count(&self, workload: &str) -> usize;

    /// Places `count` instances of the requirement's workload in this subtree.
    fn add_workload(&mut self, placement: Placement<'_>, count: usize) -> Result<(), AutoscaleError>;

    /// Removes one instance of the workload. Returns false if nothing was removed.
    fn remove_workload(&mut self, workload: &str) -> bool;

    /// Removes up to `count` instances of the workload, most loaded nodes first.
    fn remove_workload_count(&mut self, workload: &str, count: usize) -> usize;

    /// Removes up to `count` instances of any workload. Used to trim overloaded nodes.
    fn remove_instances(&mut self, count: usize) -> usize;

    fn is_removed(&self) -> bool {
        self.state().is_removed()
    }

    fn mark_removed(&mut self) -> bool {
        self.state_mut().mark_removed()
    }
}

/// Arena of child nodes owned by a group or a host.
#[derive(Debug, Clone)]
pub struct ChildRegistry<T> {
    nodes: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T> Default for ChildRegistry<T> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: ResourceNode> ChildRegistry<T> {
    /// Adds a child and returns its slot. A child with a known id keeps its slot.
    pub fn insert(&mut self, child: T) -> usize {
        if let Some(&slot) = self.index.get(child.id()) {
            return slot;
        }
        let slot = self.nodes.len();
        self.index.insert(child.id().to_string(), slot);
        self.nodes.push(child);
        slot
    }

    pub fn slot(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get(&self, slot: usize) -> &T {
        &self.nodes[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut T {
        &mut self.nodes[slot]
    }

    pub fn by_id(&self, id: &str) -> Option<&T> {
        self.slot(id).map(|slot| &self.nodes[slot])
    }

    /// Every child, removed ones included.
    pub fn every(&self) -> impl Iterator<Item = &T> {
        self.nodes.iter()
    }

    pub fn live(&self) -> impl Iterator<Item = &T> {
        self.nodes.iter().filter(|node| !node.is_removed())
    }

    pub fn live_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.nodes.iter_mut().filter(|node| !node.is_removed())
    }

    pub fn live_count(&self) -> usize {
        self.live().count()
    }

    /// Slots of live children in insertion order.
    pub fn live_slots(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&slot| !self.nodes[slot].is_removed())
            .collect()
    }

    /// Slots of live children in ascending sort order. Ties keep insertion order.
    pub fn sorted_live(&self) -> Vec<usize> {
        let mut slots = self.live_slots();
        slots.sort_by_key(|&slot| self.nodes[slot].sort_key());
        slots
    }

    pub fn removable_live(&self) -> Vec<usize> {
        let mut slots: Vec<usize> = (0..self.nodes.len())
            .filter(|&slot| self.nodes[slot].state().is_removable())
            .collect();
        slots.sort_by_key(|&slot| self.nodes[slot].sort_key());
        slots
    }

    /// Tombstones the `count` most removal-eligible children, lowest sort key first.
    pub fn mark_for_removal(&mut self, owner: &str, count: usize) -> Result<(), AutoscaleError> {
        for done in 0..count {
            let Some(&slot) = self.removable_live().first() else {
                return Err(AutoscaleError::NoRemovableChildren {
                    node: owner.to_string(),
                    requested: count - done,
                });
            };
            self.nodes[slot].mark_removed();
            debug!(node = owner, child = self.nodes[slot].id(), "Marked child for removal");
        }
        Ok(())
    }

    pub fn has_workload(&self, workload: &str) -> bool {
        self.live().any(|node| node.has_workload(workload))
    }

    pub fn assignment_count(&self) -> usize {
        self.live().map(ResourceNode::assignment_count).sum()
    }

    pub fn workload_count(&self, workload: &str) -> usize {
        self.live().map(|node| node.workload_count(workload)).sum()
    }

    /// Places `count` units one at a time, each on the first child in sort order that
    /// accepts it. The last refusal is escalated when no child accepts a unit.
    ///
    /// `refresh` updates the placement caps before each attempt.
    pub fn add_workload<R>(
        &mut self,
        owner: &str,
        mut placement: Placement<'_>,
        count: usize,
        refresh: R,
    ) -> Result<(), AutoscaleError>
    where
        R: Fn(&Self, &mut Placement<'_>),
    {
        for _ in 0..count {
            let mut last_error = None;
            let mut placed = false;
            for slot in self.sorted_live() {
                refresh(self, &mut placement);
                match self.nodes[slot].add_workload(placement, 1) {
                    Ok(()) => {
                        placed = true;
                        placement.group_count += 1;
                        break;
                    }
                    Err(e) => last_error = Some(e),
                }
            }
            if !placed {
                return Err(last_error.unwrap_or_else(|| AutoscaleError::CapacityExceeded {
                    workload: placement.workload().to_string(),
                    node: owner.to_string(),
                    reason: "no live children".to_string(),
                }));
            }
        }
        Ok(())
    }

    pub fn remove_workload(&mut self, workload: &str) -> bool {
        for slot in self.sorted_live() {
            if self.nodes[slot].has_workload(workload) {
                return self.nodes[slot].remove_workload(workload);
            }
        }
        false
    }

    pub fn remove_workload_count(&mut self, workload: &str, count: usize) -> usize {
        let mut removed = 0;
        while removed < count {
            let target = self
                .sorted_live()
                .into_iter()
                .rev()
                .find(|&slot| self.nodes[slot].has_workload(workload));
            match target {
                Some(slot) if self.nodes[slot].remove_workload_count(workload, 1) == 1 => removed += 1,
                _ => break,
            }
        }
        removed
    }

    pub fn remove_instances(&mut self, count: usize) -> usize {
        let mut removed = 0;
        while removed < count {
            let target = self
                .sorted_live()
                .into_iter()
                .rev()
                .find(|&slot| self.nodes[slot].assignment_count() > 0);
            match target {
                Some(slot) if self.nodes[slot].remove_instances(1) == 1 => removed += 1,
                _ => break,
            }
        }
        removed
    }
}
