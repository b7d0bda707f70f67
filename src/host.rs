//! Hosts group the workers running on one machine.
//!
//! A host is identified by the address its workers share. New child workers can
//! only be placed on a host anchored by a root worker.

use crate::error::AutoscaleError;
use crate::inventory::ObservedWorker;
use crate::node::{ChildRegistry, NodeState, Placement, ResourceNode};
use crate::worker::Worker;

#[derive(Debug, Clone)]
pub struct Host {
    id: String,
    state: NodeState,
    /// Root worker new child workers are spawned from.
    anchor: Option<ObservedWorker>,
    workers: ChildRegistry<Worker>,
}

impl Host {
    pub fn new(id: impl Into<String>, anchor: Option<ObservedWorker>) -> Self {
        Self {
            id: id.into(),
            state: NodeState::default(),
            anchor,
            workers: ChildRegistry::default(),
        }
    }

    pub fn anchor(&self) -> Option<&ObservedWorker> {
        self.anchor.as_ref()
    }

    pub fn has_anchor(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn workers(&self) -> &ChildRegistry<Worker> {
        &self.workers
    }

    pub fn workers_mut(&mut self) -> &mut ChildRegistry<Worker> {
        &mut self.workers
    }

    pub fn add_worker(&mut self, worker: Worker) -> usize {
        self.workers.insert(worker)
    }

    /// Tombstones the `count` least loaded removable workers.
    pub fn remove_workers(&mut self, count: usize) -> Result<(), AutoscaleError> {
        self.workers.mark_for_removal(&self.id, count)
    }
}

impl ResourceNode for Host {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> &NodeState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut NodeState {
        &mut self.state
    }

    /// Hosts are ordered by how many live workers they have.
    fn sort_key(&self) -> usize {
        self.workers.live_count()
    }

    fn has_workload(&self, workload: &str) -> bool {
        self.workers.has_workload(workload)
    }

    fn assignment_count(&self) -> usize {
        self.workers.assignment_count()
    }

    fn workload_count(&self, workload: &str) -> usize {
        self.workers.workload_count(workload)
    }

    fn add_workload(&mut self, placement: Placement<'_>, count: usize) -> Result<(), AutoscaleError> {
        let workload = placement.workload();
        self.workers.add_workload(&self.id, placement, count, |workers, placement| {
            placement.host_count = workers.workload_count(workload);
        })
    }

    fn remove_workload(&mut self, workload: &str) -> bool {
        self.workers.remove_workload(workload)
    }

    fn remove_workload_count(&mut self, workload: &str, count: usize) -> usize {
        self.workers.remove_workload_count(workload, count)
    }

    fn remove_instances(&mut self, count: usize) -> usize {
        self.workers.remove_instances(count)
    }
}
