//! Workers, the leaves of the resource tree.
//!
//! A worker tracks which managed workloads it should carry. Applying a pass turns
//! each worker with a pending change into a `Reconciliation`, an owned unit of
//! work that runs on its own tokio task.

use std::collections::BTreeMap;

use itertools::Itertools;
use tracing::{error, info};

use crate::changes::ChangeSet;
use crate::error::{AutoscaleError, ProvisionError};
use crate::inventory::ObservedWorker;
use crate::node::{NodeState, Placement, ResourceNode};
use crate::provision::{Provisioner, WorkloadCatalog};

#[derive(Debug, Clone)]
pub struct Worker {
    id: String,
    /// Id of the owning host.
    host: String,
    state: NodeState,
    /// None until the worker has been created.
    observed: Option<ObservedWorker>,
    /// Managed workloads. True means assigned, false means to be unassigned.
    assignments: BTreeMap<String, bool>,
}

impl Worker {
    /// Wraps an existing worker. Workloads with requirements count as assigned, other
    /// managed workloads are tracked for removal, and unmanaged ones pin the worker.
    pub fn existing<R, M>(observed: ObservedWorker, host: &str, is_required: R, is_managed: M) -> Self
    where
        R: Fn(&str) -> bool,
        M: Fn(&str) -> bool,
    {
        let mut state = NodeState::default();
        // root workers anchor their host
        if observed.is_root() {
            state.removable = false;
        }
        let mut assignments = BTreeMap::new();
        for workload in &observed.workloads {
            if is_required(workload) {
                assignments.insert(workload.clone(), true);
            } else if is_managed(workload) {
                assignments.insert(workload.clone(), false);
            } else {
                state.removable = false;
            }
        }
        Self {
            id: observed.id.clone(),
            host: host.to_string(),
            state,
            observed: Some(observed),
            assignments,
        }
    }

    /// A worker that has to be created.
    pub fn planned(id: impl Into<String>, host: &str) -> Self {
        Self {
            id: id.into(),
            host: host.to_string(),
            state: NodeState::default(),
            observed: None,
            assignments: BTreeMap::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn observed(&self) -> Option<&ObservedWorker> {
        self.observed.as_ref()
    }

    pub fn exists(&self) -> bool {
        self.observed.is_some()
    }

    pub fn assignments(&self) -> &BTreeMap<String, bool> {
        &self.assignments
    }

    /// Assigned workloads in id order.
    pub fn assigned(&self) -> Vec<&str> {
        self.assignments
            .iter()
            .filter(|(_, &assigned)| assigned)
            .map(|(workload, _)| workload.as_str())
            .collect()
    }

    fn is_stopped(&self) -> bool {
        self.observed.as_ref().map_or(false, |observed| !observed.alive)
    }

    pub fn changes(&self) -> ChangeSet {
        let current = self.observed.iter().flat_map(|observed| observed.workloads.iter());
        ChangeSet::compute(current, &self.assignments)
    }

    pub fn has_pending_change(&self) -> bool {
        if self.is_removed() {
            return self.exists();
        }
        (self.is_stopped() && self.assignment_count() > 0) || !self.changes().is_empty()
    }

    /// Snapshots everything applying this worker's change needs.
    pub fn reconciliation(&self, anchor: Option<ObservedWorker>, dry_run: bool) -> Reconciliation {
        Reconciliation {
            worker: self.id.clone(),
            observed: self.observed.clone(),
            anchor,
            destroy: self.is_removed(),
            changes: self.changes(),
            assigned: self.assignment_count(),
            dry_run,
        }
    }

    fn refuse(&self, placement: &Placement<'_>, reason: String) -> AutoscaleError {
        AutoscaleError::CapacityExceeded {
            workload: placement.workload().to_string(),
            node: self.id.clone(),
            reason,
        }
    }
}

impl ResourceNode for Worker {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> &NodeState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut NodeState {
        &mut self.state
    }

    fn sort_key(&self) -> usize {
        self.assignment_count()
    }

    fn has_workload(&self, workload: &str) -> bool {
        self.assignments.get(workload).copied().unwrap_or(false)
    }

    fn assignment_count(&self) -> usize {
        self.assignments.values().filter(|&&assigned| assigned).count()
    }

    fn workload_count(&self, workload: &str) -> usize {
        usize::from(self.has_workload(workload))
    }

    fn add_workload(&mut self, placement: Placement<'_>, count: usize) -> Result<(), AutoscaleError> {
        if count == 0 {
            return Ok(());
        }
        let req = placement.requirement;
        if self.is_removed() {
            return Err(self.refuse(&placement, "worker is marked for removal".to_string()));
        }
        if count > 1 || self.has_workload(&req.workload) {
            return Err(self.refuse(&placement, "worker already carries it".to_string()));
        }
        if self.assignment_count() >= placement.max_instances_per_worker {
            return Err(self.refuse(
                &placement,
                format!("max instances per worker ({})", placement.max_instances_per_worker),
            ));
        }
        if let Some(cap) = req.maximum_instances_per_host {
            if placement.host_count >= cap as usize {
                return Err(self.refuse(&placement, format!("max instances per host ({})", cap)));
            }
        }
        if let Some(max) = req.maximum_instances {
            if placement.group_count >= max as usize {
                return Err(self.refuse(&placement, format!("max instances ({})", max)));
            }
        }
        self.assignments.insert(req.workload.clone(), true);
        Ok(())
    }

    fn remove_workload(&mut self, workload: &str) -> bool {
        match self.assignments.get_mut(workload) {
            Some(assigned) if *assigned => {
                *assigned = false;
                true
            }
            _ => false,
        }
    }

    fn remove_workload_count(&mut self, workload: &str, count: usize) -> usize {
        usize::from(count > 0 && self.remove_workload(workload))
    }

    fn remove_instances(&mut self, count: usize) -> usize {
        let mut removed = 0;
        for assigned in self.assignments.values_mut().rev() {
            if removed == count {
                break;
            }
            if *assigned {
                *assigned = false;
                removed += 1;
            }
        }
        removed
    }
}

/// What a dispatched reconciliation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing to do by the time the task ran.
    Unchanged { worker: String },
    Destroyed { worker: String },
    Updated {
        worker: String,
        added: Vec<String>,
        removed: Vec<String>,
        started: bool,
    },
    Created { worker: String, workloads: Vec<String> },
    /// Dry run; the action was only logged.
    Planned { worker: String, action: String },
    Failed { worker: String, error: ProvisionError },
}

impl ReconcileOutcome {
    pub fn worker(&self) -> &str {
        match self {
            Self::Unchanged { worker }
            | Self::Destroyed { worker }
            | Self::Updated { worker, .. }
            | Self::Created { worker, .. }
            | Self::Planned { worker, .. }
            | Self::Failed { worker, .. } => worker,
        }
    }
}

/// Owned unit of concurrent work converging one worker.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub worker: String,
    observed: Option<ObservedWorker>,
    anchor: Option<ObservedWorker>,
    destroy: bool,
    changes: ChangeSet,
    assigned: usize,
    dry_run: bool,
}

impl Reconciliation {
    pub async fn run(self, provisioner: &dyn Provisioner, catalog: &dyn WorkloadCatalog) -> ReconcileOutcome {
        let worker = self.worker.clone();
        if self.destroy {
            return match &self.observed {
                Some(observed) => self.destroy(observed, provisioner).await,
                None => ReconcileOutcome::Unchanged { worker },
            };
        }
        let stopped = self.observed.as_ref().map_or(false, |observed| !observed.alive);
        if self.changes.is_empty() && !(stopped && self.assigned > 0) {
            return ReconcileOutcome::Unchanged { worker };
        }
        match &self.observed {
            Some(observed) => self.update(observed, stopped, provisioner, catalog).await,
            None => self.create(provisioner).await,
        }
    }

    async fn destroy(&self, observed: &ObservedWorker, provisioner: &dyn Provisioner) -> ReconcileOutcome {
        let worker = self.worker.clone();
        if self.dry_run {
            info!(worker = worker.as_str(), "Would have removed worker");
            return ReconcileOutcome::Planned {
                worker,
                action: "destroy".to_string(),
            };
        }
        match provisioner.destroy_worker(observed).await {
            Ok(()) => {
                info!(worker = worker.as_str(), "Worker removed");
                ReconcileOutcome::Destroyed { worker }
            }
            Err(e) => {
                error!(worker = worker.as_str(), error = %e, "Couldn't remove worker. This error is ignored.");
                ReconcileOutcome::Failed { worker, error: e }
            }
        }
    }

    async fn update(
        &self,
        observed: &ObservedWorker,
        stopped: bool,
        provisioner: &dyn Provisioner,
        catalog: &dyn WorkloadCatalog,
    ) -> ReconcileOutcome {
        let worker = self.worker.clone();
        let added = self.changes.added.iter().join(", ");
        let removed = self.changes.removed.iter().join(", ");
        if self.dry_run {
            info!(worker = worker.as_str(), %added, %removed, "Would have updated worker");
            return ReconcileOutcome::Planned {
                worker,
                action: "update".to_string(),
            };
        }
        let mut definitions = Vec::with_capacity(self.changes.result.len());
        for workload in &self.changes.result {
            match catalog.resolve(&observed.version, workload) {
                Some(definition) => definitions.push(definition),
                None => error!(
                    worker = worker.as_str(),
                    workload = workload.as_str(),
                    version = observed.version.as_str(),
                    "Workload doesn't exist in the worker's version, can't assign it. This error is ignored."
                ),
            }
        }
        info!(worker = worker.as_str(), %added, %removed, "Updating worker");
        if let Err(e) = provisioner.set_workloads(observed, &definitions).await {
            error!(worker = worker.as_str(), error = %e, "Couldn't update worker. This error is ignored.");
            return ReconcileOutcome::Failed { worker, error: e };
        }
        // only workers carrying managed workloads are started
        let start = stopped && self.assigned > 0;
        if start {
            info!(worker = worker.as_str(), "Starting worker");
            if let Err(e) = provisioner.start_worker(observed).await {
                error!(worker = worker.as_str(), error = %e, "Couldn't start worker. This error is ignored.");
                return ReconcileOutcome::Failed { worker, error: e };
            }
        }
        ReconcileOutcome::Updated {
            worker,
            added: self.changes.added.iter().cloned().collect(),
            removed: self.changes.removed.iter().cloned().collect(),
            started: start,
        }
    }

    async fn create(&self, provisioner: &dyn Provisioner) -> ReconcileOutcome {
        let worker = self.worker.clone();
        let workloads = self.changes.result_list();
        if self.dry_run {
            info!(
                worker = worker.as_str(),
                workloads = workloads.iter().join(", "),
                "Would have created worker"
            );
            return ReconcileOutcome::Planned {
                worker,
                action: "create".to_string(),
            };
        }
        match provisioner
            .create_worker(&worker, &workloads, self.anchor.as_ref())
            .await
        {
            Ok(()) => {
                info!(
                    worker = worker.as_str(),
                    workloads = workloads.iter().join(", "),
                    "Created worker"
                );
                ReconcileOutcome::Created { worker, workloads }
            }
            Err(e) => {
                error!(
                    worker = worker.as_str(),
                    workloads = workloads.iter().join(", "),
                    error = %e,
                    "Couldn't create worker. This error is ignored."
                );
                ReconcileOutcome::Failed { worker, error: e }
            }
        }
    }
}
