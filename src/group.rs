//! The autoscaled group, root of the resource tree.
//!
//! A group is built fresh for every pass from one inventory snapshot. Building it
//! sizes the worker population and places every required workload instance in
//! memory; `apply` then converges the real workers concurrently.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{GroupOptions, Matchers};
use crate::error::AutoscaleError;
use crate::host::Host;
use crate::inventory::ObservedWorker;
use crate::node::{ChildRegistry, NodeState, Placement, ResourceNode};
use crate::provision::{Provisioner, WorkloadCatalog};
use crate::requirement::{prune, Requirement, RequirementSummary};
use crate::worker::{ReconcileOutcome, Worker};

/// Result of one `Group::apply` call.
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Workers whose reconciliation was started.
    pub dispatched: usize,
    /// Workers with pending changes left for a later pass.
    pub remaining: usize,
    /// Outcomes of the reconciliations that finished while waiting.
    pub outcomes: Vec<ReconcileOutcome>,
    /// The wait ran out before every dispatched reconciliation finished.
    pub timed_out: bool,
}

pub struct Group {
    id: String,
    state: NodeState,
    options: GroupOptions,
    matchers: Matchers,
    hosts: ChildRegistry<Host>,
    requirements: BTreeMap<String, Requirement>,
    total_required_instances: usize,
    required_host_count: usize,
    max_instances_per_worker: usize,
    provisioner: Arc<dyn Provisioner>,
    catalog: Arc<dyn WorkloadCatalog>,
}

impl Group {
    /// Builds the tree for one pass and computes the desired assignments.
    ///
    /// Fatal errors always abort. Capacity errors abort unless `ignore_errors` is set.
    pub fn build(
        id: impl Into<String>,
        options: GroupOptions,
        workers: &[ObservedWorker],
        requirements: &[Requirement],
        provisioner: Arc<dyn Provisioner>,
        catalog: Arc<dyn WorkloadCatalog>,
    ) -> Result<Self, AutoscaleError> {
        let matchers = options.matchers()?;
        let pruned = prune(
            requirements,
            |workload| matchers.workload(workload),
            options.inherit_requirements,
        );
        let summary = RequirementSummary::new(pruned, options.default_max_instances_per_host);
        let mut group = Self {
            id: id.into(),
            state: NodeState::default(),
            options,
            matchers,
            hosts: ChildRegistry::default(),
            requirements: summary.requirements,
            total_required_instances: summary.total_required_instances,
            required_host_count: summary.required_host_count,
            max_instances_per_worker: 0,
            provisioner,
            catalog,
        };
        group.add_workers(workers)?;
        group.scale_workers()?;
        group.satisfy_requirements()?;
        Ok(group)
    }

    pub fn options(&self) -> &GroupOptions {
        &self.options
    }

    pub fn requirements(&self) -> &BTreeMap<String, Requirement> {
        &self.requirements
    }

    pub fn total_required_instances(&self) -> usize {
        self.total_required_instances
    }

    pub fn required_host_count(&self) -> usize {
        self.required_host_count
    }

    pub fn max_instances_per_worker(&self) -> usize {
        self.max_instances_per_worker
    }

    pub fn hosts(&self) -> &ChildRegistry<Host> {
        &self.hosts
    }

    /// Live workers across all live hosts.
    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.hosts.live().flat_map(|host| host.workers().live())
    }

    /// Looks a worker up by id, removed workers included.
    pub fn worker(&self, id: &str) -> Option<&Worker> {
        self.hosts.every().find_map(|host| host.workers().by_id(id))
    }

    pub fn live_worker_count(&self) -> usize {
        self.workers().count()
    }

    /// Every worker of every live host whose real state has to change.
    pub fn pending_workers(&self) -> Vec<(&Host, &Worker)> {
        self.hosts
            .live()
            .flat_map(|host| {
                host.workers()
                    .every()
                    .filter(|worker| worker.has_pending_change())
                    .map(move |worker| (host, worker))
            })
            .collect()
    }

    /// Logs and swallows recoverable errors when the options allow it.
    fn recover(&self, error: AutoscaleError, context: &str) -> Result<(), AutoscaleError> {
        if !self.options.ignore_errors || error.is_fatal() {
            return Err(error);
        }
        let mut detail = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            detail.push_str(": ");
            detail.push_str(&cause.to_string());
            source = cause.source();
        }
        error!(group = self.id.as_str(), error = detail.as_str(), "{}. This error is ignored.", context);
        Ok(())
    }

    fn add_workers(&mut self, workers: &[ObservedWorker]) -> Result<(), AutoscaleError> {
        let by_id: HashMap<&str, &ObservedWorker> =
            workers.iter().map(|worker| (worker.id.as_str(), worker)).collect();
        for observed in workers {
            let root = match &observed.parent {
                None => observed,
                Some(parent) => match by_id.get(parent.as_str()) {
                    Some(root) => *root,
                    None => {
                        warn!(
                            group = self.id.as_str(),
                            worker = observed.id.as_str(),
                            parent = parent.as_str(),
                            "Root worker isn't in the inventory, skipping worker"
                        );
                        continue;
                    }
                },
            };
            if !self.matchers.root_worker(&root.id) {
                continue;
            }
            let host_slot = match self.hosts.slot(&root.address) {
                Some(slot) => slot,
                None => self.hosts.insert(Host::new(root.address.clone(), Some(root.clone()))),
            };
            let included = self.matchers.worker(&observed.id) && (self.options.scale_workers || observed.alive);
            if !included {
                continue;
            }
            let worker = Worker::existing(
                observed.clone(),
                &root.address,
                |workload| self.requirements.contains_key(workload),
                |workload| self.matchers.workload(workload),
            );
            let removable = worker.state().removable;
            let max_workers = self.options.max_workers_per_host;
            let host = self.hosts.get_mut(host_slot);
            let slot = host.add_worker(worker);
            debug!(group = self.id.as_str(), worker = observed.id.as_str(), host = host.id(), "Included an existing worker");
            if removable && max_workers > 0 && host.workers().live_count() > max_workers {
                debug!(
                    group = self.id.as_str(),
                    worker = observed.id.as_str(),
                    host = host.id(),
                    max_workers,
                    "Max workers per host exceeded, marking worker for removal"
                );
                host.workers_mut().get_mut(slot).mark_removed();
            }
        }
        let available = self.live_worker_count();
        if !self.options.scale_workers && available < self.options.minimum_worker_count {
            return Err(AutoscaleError::NotEnoughWorkers {
                available,
                required: self.options.minimum_worker_count,
            });
        }
        Ok(())
    }

    fn scale_workers(&mut self) -> Result<(), AutoscaleError> {
        if !self.options.scale_workers {
            return Ok(());
        }
        let average = self.options.average_instances_per_worker;
        if average < 1 {
            return Err(AutoscaleError::InvalidAverage(average));
        }
        let required_workers =
            required_worker_count(self.total_required_instances, self.required_host_count, average as usize);
        let worker_delta = required_workers as i64 - self.live_worker_count() as i64;
        let host_delta = self.required_host_count as i64 - self.hosts.live_count() as i64;
        debug!(group = self.id.as_str(), worker_delta, host_delta, "Scaling workers");
        if worker_delta > 0 {
            for i in 0..worker_delta {
                if let Err(e) = self.add_planned_worker(i < host_delta) {
                    self.recover(e, "Failed to add a new worker")?;
                }
            }
        } else if worker_delta < 0 {
            for _ in worker_delta..0 {
                let removed = self
                    .hosts
                    .sorted_live()
                    .into_iter()
                    .rev()
                    .any(|slot| self.hosts.get_mut(slot).remove_workers(1).is_ok());
                if !removed {
                    debug!(group = self.id.as_str(), "No more removable workers available");
                    break;
                }
            }
        }
        Ok(())
    }

    fn add_planned_worker(&mut self, new_host: bool) -> Result<(), AutoscaleError> {
        let id = self.next_worker_id()?;
        let host_slot = if new_host {
            // any unique id will do until the host really exists
            self.hosts.insert(Host::new(Uuid::new_v4().to_string(), None))
        } else {
            self.hosts
                .sorted_live()
                .into_iter()
                .find(|&slot| self.hosts.get(slot).has_anchor())
                .ok_or(AutoscaleError::NoRootHostAvailable)?
        };
        let host = self.hosts.get_mut(host_slot);
        debug!(group = self.id.as_str(), worker = id.as_str(), host = host.id(), new_host, "Requested a new worker");
        let worker = Worker::planned(id, host.id());
        host.add_worker(worker);
        Ok(())
    }

    /// Lowest unused `prefix + N` with N starting at 1.
    fn next_worker_id(&self) -> Result<String, AutoscaleError> {
        let prefix = &self.options.worker_prefix;
        if !self.matchers.worker(prefix) {
            return Err(AutoscaleError::InvalidPrefix(prefix.clone()));
        }
        let taken: HashSet<&str> = self
            .hosts
            .every()
            .flat_map(|host| host.workers().every())
            .map(|worker| worker.id())
            .collect();
        let id = (1..)
            .map(|n| format!("{}{}", prefix, n))
            .find(|id| !taken.contains(id.as_str()))
            .unwrap_or_else(|| prefix.clone());
        Ok(id)
    }

    fn satisfy_requirements(&mut self) -> Result<(), AutoscaleError> {
        let workers = self.live_worker_count();
        if workers == 0 && self.total_required_instances > 0 && self.options.average_instances_per_worker < 0 {
            self.recover(
                AutoscaleError::NoWorkerCapacity(self.total_required_instances),
                "Can't size workers",
            )?;
        }
        self.max_instances_per_worker = max_instances_per_worker(
            workers,
            self.total_required_instances,
            self.options.average_instances_per_worker,
            self.options.max_deviation,
        );
        self.trim_overloaded_workers();
        let requirements: Vec<Requirement> = self.requirements.values().cloned().collect();
        for req in &requirements {
            self.trim_per_host(req);
            self.trim_per_group(req);
            let Some(min) = req.minimum_instances.filter(|_| req.has_minimum()) else {
                continue;
            };
            let shortfall = (min as usize).saturating_sub(self.workload_count(&req.workload));
            if shortfall == 0 {
                continue;
            }
            let placement = Placement::new(req, self.max_instances_per_worker);
            if let Err(e) = self.add_workload(placement, shortfall) {
                let unsatisfied = AutoscaleError::RequirementUnsatisfied {
                    workload: req.workload.clone(),
                    source: Box::new(e),
                };
                self.recover(unsatisfied, "Couldn't satisfy requirements")?;
            }
        }
        Ok(())
    }

    fn trim_overloaded_workers(&mut self) {
        let max = self.max_instances_per_worker;
        for host in self.hosts.live_mut() {
            for worker in host.workers_mut().live_mut() {
                let excess = worker.assignment_count().saturating_sub(max);
                if excess > 0 {
                    debug!(worker = worker.id(), excess, max, "Trimming overloaded worker");
                    worker.remove_instances(excess);
                }
            }
        }
    }

    fn trim_per_host(&mut self, req: &Requirement) {
        let Some(cap) = req.maximum_instances_per_host else {
            return;
        };
        for host in self.hosts.live_mut() {
            let excess = host.workload_count(&req.workload).saturating_sub(cap as usize);
            if excess > 0 {
                host.remove_workload_count(&req.workload, excess);
            }
        }
    }

    fn trim_per_group(&mut self, req: &Requirement) {
        let Some(max) = req.maximum_instances else {
            return;
        };
        let excess = self.workload_count(&req.workload).saturating_sub(max as usize);
        for _ in 0..excess {
            let target = self
                .sorted_workers()
                .into_iter()
                .rev()
                .find(|&(host, worker)| self.hosts.get(host).workers().get(worker).has_workload(&req.workload));
            match target {
                Some((host, worker)) => {
                    self.hosts
                        .get_mut(host)
                        .workers_mut()
                        .get_mut(worker)
                        .remove_workload(&req.workload);
                }
                None => break,
            }
        }
    }

    /// (host slot, worker slot) of every live worker, least loaded first.
    fn sorted_workers(&self) -> Vec<(usize, usize)> {
        let mut slots: Vec<(usize, usize)> = self
            .hosts
            .live_slots()
            .into_iter()
            .flat_map(|host| {
                self.hosts
                    .get(host)
                    .workers()
                    .live_slots()
                    .into_iter()
                    .map(move |worker| (host, worker))
            })
            .collect();
        slots.sort_by_key(|&(host, worker)| self.hosts.get(host).workers().get(worker).sort_key());
        slots
    }

    /// Runs the reconciliation of every worker with a pending change, at most
    /// `max_changes_per_pass` of them, each on its own task.
    ///
    /// With a non-zero `max_wait` this waits for the tasks to finish or the time to run
    /// out. Running out only stops the waiting; the tasks keep going.
    pub async fn apply(&self, max_wait: Duration) -> ApplyReport {
        let pending = self.pending_workers();
        if pending.is_empty() {
            debug!(group = self.id.as_str(), "No changes to apply");
            return ApplyReport::default();
        }
        info!(group = self.id.as_str(), "{} worker(s) have pending changes", pending.len());
        let limit = self.options.max_changes_per_pass;
        let batch = if limit > 0 && limit < pending.len() {
            limit
        } else {
            pending.len()
        };

        let (outcome_tx, outcome_rx) = flume::bounded(batch);
        let mut tasks = Vec::with_capacity(batch);
        for (host, worker) in pending.iter().take(batch) {
            let reconciliation = worker.reconciliation(host.anchor().cloned(), self.options.dry_run);
            let provisioner = Arc::clone(&self.provisioner);
            let catalog = Arc::clone(&self.catalog);
            let outcome_tx = outcome_tx.clone();
            let span = info_span!("reconcile", group = self.id.as_str(), worker = worker.id());
            tasks.push(tokio::spawn(
                async move {
                    let outcome = reconciliation.run(provisioner.as_ref(), catalog.as_ref()).await;
                    let _ = outcome_tx.send(outcome);
                }
                .instrument(span),
            ));
        }
        drop(outcome_tx);

        let timed_out = if max_wait.is_zero() {
            false
        } else {
            tokio::time::timeout(max_wait, join_all(tasks)).await.is_err()
        };
        let report = ApplyReport {
            dispatched: batch,
            remaining: pending.len() - batch,
            outcomes: outcome_rx.try_iter().collect(),
            timed_out,
        };
        info!(
            group = self.id.as_str(),
            timed_out,
            "Applied changes to {} worker(s). {} worker(s) remaining.",
            report.dispatched,
            report.remaining
        );
        report
    }
}

impl ResourceNode for Group {
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
        0
    }

    fn has_workload(&self, workload: &str) -> bool {
        self.hosts.has_workload(workload)
    }

    fn assignment_count(&self) -> usize {
        self.hosts.assignment_count()
    }

    fn workload_count(&self, workload: &str) -> usize {
        self.hosts.workload_count(workload)
    }

    /// Places units one at a time on the least loaded worker of the whole group
    /// that accepts them.
    fn add_workload(&mut self, mut placement: Placement<'_>, count: usize) -> Result<(), AutoscaleError> {
        let workload = placement.workload();
        for _ in 0..count {
            let mut last_error = None;
            let mut placed = false;
            for (host, worker) in self.sorted_workers() {
                placement.group_count = self.workload_count(workload);
                placement.host_count = self.hosts.get(host).workload_count(workload);
                let worker = self.hosts.get_mut(host).workers_mut().get_mut(worker);
                match worker.add_workload(placement, 1) {
                    Ok(()) => {
                        placed = true;
                        break;
                    }
                    Err(e) => last_error = Some(e),
                }
            }
            if !placed {
                return Err(last_error.unwrap_or_else(|| AutoscaleError::CapacityExceeded {
                    workload: workload.to_string(),
                    node: self.id.clone(),
                    reason: "no live workers".to_string(),
                }));
            }
        }
        Ok(())
    }

    fn remove_workload(&mut self, workload: &str) -> bool {
        self.hosts.remove_workload(workload)
    }

    fn remove_workload_count(&mut self, workload: &str, count: usize) -> usize {
        self.hosts.remove_workload_count(workload, count)
    }

    fn remove_instances(&mut self, count: usize) -> usize {
        self.hosts.remove_instances(count)
    }
}

/// Workers needed so every host-capped requirement fits and the average load
/// stays at `average`.
fn required_worker_count(total_instances: usize, required_hosts: usize, average: usize) -> usize {
    let by_load = if total_instances > 0 && average > 0 {
        (total_instances + average - 1) / average
    } else {
        0
    };
    by_load.max(required_hosts)
}

/// `average + round(|deviation| * average)`, where a negative configured average
/// is derived from the load. Saturates at `usize::MAX`.
fn max_instances_per_worker(workers: usize, total_instances: usize, average: i64, deviation: f64) -> usize {
    let average = if average >= 0 {
        average as usize
    } else if workers > 0 {
        (total_instances + workers - 1) / workers
    } else {
        0
    };
    // float to int casts saturate
    let spread = (deviation.abs() * average as f64).round() as usize;
    average.saturating_add(spread)
}
