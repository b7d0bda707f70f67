//! End-to-end tests for autoscaling passes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use workload_autoscaler::{
    ApplyReport, AutoscaleError, Group, GroupOptions, ObservedWorker, ProvisionError, Provisioner,
    ReconcileOutcome, Requirement, ResourceNode, StaticCatalog, WorkloadCatalog, WorkloadDefinition,
};

/// Record of a provisioner call for testing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create {
        name: String,
        workloads: Vec<String>,
        anchor: Option<String>,
    },
    SetWorkloads {
        worker: String,
        workloads: Vec<String>,
    },
    Start(String),
    Destroy(String),
}

/// Mock cluster that applies provisioner calls to an in-memory inventory.
pub struct MockCluster {
    inventory: Mutex<Vec<ObservedWorker>>,
    calls: Mutex<Vec<Call>>,
    fail_creates: bool,
    delay_ms: u64,
}

impl MockCluster {
    pub fn new(inventory: Vec<ObservedWorker>) -> Self {
        Self {
            inventory: Mutex::new(inventory),
            calls: Mutex::new(Vec::new()),
            fail_creates: false,
            delay_ms: 0,
        }
    }

    pub fn failing_creates(mut self) -> Self {
        self.fail_creates = true;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub async fn inventory(&self) -> Vec<ObservedWorker> {
        self.inventory.lock().await.clone()
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    async fn record(&self, call: Call) {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        self.calls.lock().await.push(call);
    }
}

#[async_trait]
impl Provisioner for MockCluster {
    async fn create_worker(
        &self,
        name: &str,
        workloads: &[String],
        anchor: Option<&ObservedWorker>,
    ) -> Result<(), ProvisionError> {
        self.record(Call::Create {
            name: name.to_string(),
            workloads: workloads.to_vec(),
            anchor: anchor.map(|anchor| anchor.id.clone()),
        })
        .await;
        if self.fail_creates {
            return Err(ProvisionError::Rejected {
                worker: name.to_string(),
                reason: "out of capacity".to_string(),
            });
        }
        let mut inventory = self.inventory.lock().await;
        // a worker without an anchor lands on a fresh machine
        let created = match anchor {
            Some(anchor) => ObservedWorker::child(name, anchor),
            None => ObservedWorker::root(name, format!("10.0.1.{}", inventory.len())),
        };
        inventory.push(created.with_workloads(workloads.iter().cloned()));
        Ok(())
    }

    async fn set_workloads(
        &self,
        worker: &ObservedWorker,
        workloads: &[WorkloadDefinition],
    ) -> Result<(), ProvisionError> {
        let ids: Vec<String> = workloads.iter().map(|def| def.id.clone()).collect();
        self.record(Call::SetWorkloads {
            worker: worker.id.clone(),
            workloads: ids.clone(),
        })
        .await;
        let mut inventory = self.inventory.lock().await;
        match inventory.iter_mut().find(|observed| observed.id == worker.id) {
            Some(observed) => {
                observed.workloads = ids;
                Ok(())
            }
            None => Err(ProvisionError::Unavailable(worker.id.clone())),
        }
    }

    async fn start_worker(&self, worker: &ObservedWorker) -> Result<(), ProvisionError> {
        self.record(Call::Start(worker.id.clone())).await;
        let mut inventory = self.inventory.lock().await;
        if let Some(observed) = inventory.iter_mut().find(|observed| observed.id == worker.id) {
            observed.alive = true;
        }
        Ok(())
    }

    async fn destroy_worker(&self, worker: &ObservedWorker) -> Result<(), ProvisionError> {
        self.record(Call::Destroy(worker.id.clone())).await;
        self.inventory.lock().await.retain(|observed| observed.id != worker.id);
        Ok(())
    }
}

/// Builds a group from the cluster's current inventory.
async fn build(
    cluster: &Arc<MockCluster>,
    options: &GroupOptions,
    requirements: &[Requirement],
) -> Result<Group, AutoscaleError> {
    build_with_catalog(cluster, options, requirements, StaticCatalog::default()).await
}

async fn build_with_catalog(
    cluster: &Arc<MockCluster>,
    options: &GroupOptions,
    requirements: &[Requirement],
    catalog: StaticCatalog,
) -> Result<Group, AutoscaleError> {
    let provisioner: Arc<dyn Provisioner> = cluster.clone();
    let catalog: Arc<dyn WorkloadCatalog> = Arc::new(catalog);
    Group::build(
        "test",
        options.clone(),
        &cluster.inventory().await,
        requirements,
        provisioner,
        catalog,
    )
}

/// Runs one full pass: build from the current inventory, then apply.
async fn run_pass(cluster: &Arc<MockCluster>, options: &GroupOptions, requirements: &[Requirement]) -> ApplyReport {
    let group = build(cluster, options, requirements).await.unwrap();
    group.apply(Duration::from_secs(5)).await
}

/// One root worker with the given children on `address`.
fn machine(root: &str, address: &str, children: &[(&str, &[&str])]) -> Vec<ObservedWorker> {
    let root = ObservedWorker::root(root, address);
    let mut workers = vec![root.clone()];
    for (id, workloads) in children {
        workers.push(ObservedWorker::child(*id, &root).with_workloads(workloads.iter().copied()));
    }
    workers
}

fn fixed(count: usize) -> GroupOptions {
    GroupOptions {
        scale_workers: false,
        minimum_worker_count: count,
        ..Default::default()
    }
}

fn scaling(average: i64) -> GroupOptions {
    GroupOptions {
        average_instances_per_worker: average,
        ..Default::default()
    }
}

// =============================================================================
// E2E Tests for Sizing Scenarios
// =============================================================================

#[tokio::test]
async fn test_e2e_new_host_splits_instances() {
    let cluster = Arc::new(MockCluster::new(machine("root1", "10.0.0.1", &[("auto1", &[])])));
    let requirements = vec![Requirement::new("a-auto").minimum(2).per_host(1)];
    let options = scaling(10);

    let group = build(&cluster, &options, &requirements).await.unwrap();
    assert_eq!(group.required_host_count(), 2);
    assert_eq!(group.hosts().live_count(), 2);
    assert_eq!(group.live_worker_count(), 2);
    for host in group.hosts().live() {
        assert_eq!(host.workload_count("a-auto"), 1);
    }
    let planned = group.worker("auto2").unwrap();
    assert!(!planned.exists());
    assert!(!group.hosts().by_id(planned.host()).unwrap().has_anchor());

    let report = group.apply(Duration::from_secs(5)).await;
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.remaining, 0);
    let calls = cluster.calls().await;
    assert_eq!(calls.len(), 2);
    assert!(calls.contains(&Call::Create {
        name: "auto2".to_string(),
        workloads: vec!["a-auto".to_string()],
        anchor: None,
    }));
    assert!(calls.contains(&Call::SetWorkloads {
        worker: "auto1".to_string(),
        workloads: vec!["a-auto".to_string()],
    }));
}

#[tokio::test]
async fn test_e2e_too_few_workers_is_fatal() {
    let cluster = Arc::new(MockCluster::new(machine(
        "root1",
        "10.0.0.1",
        &[("auto1", &[]), ("auto2", &[])],
    )));
    let err = build(&cluster, &fixed(3), &[]).await.err().unwrap();
    assert!(matches!(err, AutoscaleError::NotEnoughWorkers { available: 2, required: 3 }));
    assert!(err.is_fatal());
    assert!(cluster.calls().await.is_empty());
}

#[tokio::test]
async fn test_e2e_orphaned_workload_is_unassigned() {
    let cluster = Arc::new(MockCluster::new(machine(
        "root1",
        "10.0.0.1",
        &[("auto1", &["a-auto", "x-auto"])],
    )));
    let requirements = vec![Requirement::new("a-auto").minimum(1)];

    let report = run_pass(&cluster, &fixed(1), &requirements).await;
    assert_eq!(
        report.outcomes,
        vec![ReconcileOutcome::Updated {
            worker: "auto1".to_string(),
            added: vec![],
            removed: vec!["x-auto".to_string()],
            started: false,
        }]
    );
    let inventory = cluster.inventory().await;
    let auto1 = inventory.iter().find(|worker| worker.id == "auto1").unwrap();
    assert_eq!(auto1.workloads, vec!["a-auto".to_string()]);
}

#[tokio::test]
async fn test_e2e_changes_per_pass_are_capped() {
    let cluster = Arc::new(MockCluster::new(machine(
        "root1",
        "10.0.0.1",
        &[("auto1", &["stale-auto"]), ("auto2", &["stale-auto"]), ("auto3", &["stale-auto"])],
    )));
    let options = GroupOptions {
        max_changes_per_pass: 1,
        ..fixed(1)
    };

    for remaining in [2, 1, 0] {
        let report = run_pass(&cluster, &options, &[]).await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.remaining, remaining);
    }
    let report = run_pass(&cluster, &options, &[]).await;
    assert_eq!(report.dispatched, 0);

    let updated: Vec<String> = cluster
        .calls()
        .await
        .into_iter()
        .map(|call| match call {
            Call::SetWorkloads { worker, workloads } => {
                assert!(workloads.is_empty());
                worker
            }
            other => panic!("unexpected call {:?}", other),
        })
        .collect();
    assert_eq!(updated, vec!["auto1", "auto2", "auto3"]);
}

#[tokio::test]
async fn test_e2e_dry_run_makes_no_calls() {
    let cluster = Arc::new(MockCluster::new(machine(
        "root1",
        "10.0.0.1",
        &[("auto1", &[]), ("auto2", &["stale-auto"])],
    )));
    let requirements = vec![Requirement::new("a-auto").minimum(1)];
    let options = GroupOptions {
        dry_run: true,
        ..scaling(1)
    };
    let before = cluster.inventory().await;

    let report = run_pass(&cluster, &options, &requirements).await;
    // auto1 is removed and auto2 swaps its workload
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.outcomes.len(), 2);
    assert!(report
        .outcomes
        .iter()
        .all(|outcome| matches!(outcome, ReconcileOutcome::Planned { .. })));
    assert!(cluster.calls().await.is_empty());
    assert_eq!(cluster.inventory().await, before);
}

// =============================================================================
// E2E Tests for Convergence
// =============================================================================

#[tokio::test]
async fn test_e2e_second_pass_is_a_no_op() {
    let cluster = Arc::new(MockCluster::new(machine("root1", "10.0.0.1", &[("auto1", &[])])));
    let requirements = vec![
        Requirement::new("a-auto").minimum(2).per_host(1),
        Requirement::new("b-auto").minimum(1),
    ];
    let options = scaling(10);

    let first = run_pass(&cluster, &options, &requirements).await;
    assert!(first.dispatched > 0);
    let calls = cluster.calls().await.len();

    let group = build(&cluster, &options, &requirements).await.unwrap();
    assert!(group.pending_workers().is_empty());
    let second = group.apply(Duration::from_secs(5)).await;
    assert_eq!(second.dispatched, 0);
    assert_eq!(cluster.calls().await.len(), calls);
}

#[tokio::test]
async fn test_e2e_scale_down_destroys_idle_workers() {
    let cluster = Arc::new(MockCluster::new(machine(
        "root1",
        "10.0.0.1",
        &[("auto1", &[]), ("auto2", &[]), ("auto3", &[])],
    )));
    let requirements = vec![Requirement::new("a-auto").minimum(1)];
    let options = scaling(10);

    let report = run_pass(&cluster, &options, &requirements).await;
    assert_eq!(report.dispatched, 3);
    let calls = cluster.calls().await;
    assert!(calls.contains(&Call::Destroy("auto1".to_string())));
    assert!(calls.contains(&Call::Destroy("auto2".to_string())));
    assert!(calls.contains(&Call::SetWorkloads {
        worker: "auto3".to_string(),
        workloads: vec!["a-auto".to_string()],
    }));

    let ids: Vec<String> = cluster.inventory().await.into_iter().map(|worker| worker.id).collect();
    assert_eq!(ids, vec!["root1", "auto3"]);
    let report = run_pass(&cluster, &options, &requirements).await;
    assert_eq!(report.dispatched, 0);
}

#[tokio::test]
async fn test_e2e_new_worker_is_anchored_by_root() {
    let cluster = Arc::new(MockCluster::new(machine("root1", "10.0.0.1", &[("auto1", &[])])));
    let requirements = vec![Requirement::new("a-auto").minimum(1), Requirement::new("b-auto").minimum(1)];

    let report = run_pass(&cluster, &scaling(1), &requirements).await;
    assert_eq!(report.dispatched, 2);
    assert!(cluster.calls().await.contains(&Call::Create {
        name: "auto2".to_string(),
        workloads: vec!["b-auto".to_string()],
        anchor: Some("root1".to_string()),
    }));
    let inventory = cluster.inventory().await;
    let auto2 = inventory.iter().find(|worker| worker.id == "auto2").unwrap();
    assert_eq!(auto2.parent.as_deref(), Some("root1"));
    assert_eq!(auto2.address, "10.0.0.1");
}

// =============================================================================
// E2E Tests for Capacity Limits
// =============================================================================

#[tokio::test]
async fn test_e2e_caps_hold_after_a_pass() {
    let mut inventory = machine("root1", "10.0.0.1", &[("auto1", &[]), ("auto2", &[])]);
    inventory.extend(machine("root2", "10.0.0.2", &[("auto3", &[]), ("auto4", &[])]));
    let cluster = Arc::new(MockCluster::new(inventory));
    let requirements = vec![
        Requirement::new("a-auto").minimum(4).per_host(2),
        Requirement::new("b-auto").minimum(2).per_host(1),
        Requirement::new("c-auto").minimum(3).per_host(2),
    ];

    let group = build(&cluster, &fixed(1), &requirements).await.unwrap();
    let max = group.max_instances_per_worker();
    for worker in group.workers() {
        assert!(worker.assignment_count() <= max);
    }
    for req in &requirements {
        let cap = req.maximum_instances_per_host.unwrap() as usize;
        for host in group.hosts().live() {
            assert!(host.workload_count(&req.workload) <= cap);
        }
        assert_eq!(group.workload_count(&req.workload), req.minimum_instances.unwrap() as usize);
    }
}

#[tokio::test]
async fn test_e2e_unplaceable_instances_are_best_effort() {
    let cluster = Arc::new(MockCluster::new(machine(
        "root1",
        "10.0.0.1",
        &[("auto1", &[]), ("auto2", &[])],
    )));
    // two instances on a single host with a per-host cap of one
    let requirements = vec![Requirement::new("a-auto").minimum(2)];

    let group = build(&cluster, &fixed(1), &requirements).await.unwrap();
    assert_eq!(group.workload_count("a-auto"), 1);

    let strict = GroupOptions {
        ignore_errors: false,
        ..fixed(1)
    };
    let err = build(&cluster, &strict, &requirements).await.err().unwrap();
    assert!(matches!(err, AutoscaleError::RequirementUnsatisfied { ref workload, .. } if workload == "a-auto"));
}

// =============================================================================
// E2E Tests for Requirement Pruning
// =============================================================================

#[tokio::test]
async fn test_e2e_dependencies_inherit_minimum() {
    let mut inventory = machine("root1", "10.0.0.1", &[("auto1", &[])]);
    inventory.extend(machine("root2", "10.0.0.2", &[("auto2", &[])]));
    let cluster = Arc::new(MockCluster::new(inventory));
    let requirements = vec![Requirement::new("a-auto").minimum(2).depends_on(["b-auto"])];

    let group = build(&cluster, &fixed(1), &requirements).await.unwrap();
    assert_eq!(group.requirements()["b-auto"].minimum_instances, Some(2));
    assert_eq!(group.workload_count("b-auto"), 2);

    let options = GroupOptions {
        inherit_requirements: false,
        ..fixed(1)
    };
    let group = build(&cluster, &options, &requirements).await.unwrap();
    assert!(!group.requirements().contains_key("b-auto"));
    assert_eq!(group.workload_count("b-auto"), 0);
}

#[tokio::test]
async fn test_e2e_unmatched_workloads_are_left_alone() {
    let cluster = Arc::new(MockCluster::new(machine(
        "root1",
        "10.0.0.1",
        &[("auto1", &["legacy"]), ("auto2", &[])],
    )));
    let requirements = vec![Requirement::new("a-auto").minimum(2).depends_on(["legacy"])];
    let options = GroupOptions {
        default_max_instances_per_host: 2,
        ..fixed(1)
    };

    let group = build(&cluster, &options, &requirements).await.unwrap();
    assert!(!group.requirements().contains_key("legacy"));
    assert!(!group.worker("auto1").unwrap().state().removable);

    group.apply(Duration::from_secs(5)).await;
    let inventory = cluster.inventory().await;
    let auto1 = inventory.iter().find(|worker| worker.id == "auto1").unwrap();
    assert_eq!(auto1.workloads, vec!["a-auto".to_string(), "legacy".to_string()]);
}

// =============================================================================
// E2E Tests for Collaborator Failures
// =============================================================================

#[tokio::test]
async fn test_e2e_catalog_miss_skips_one_workload() {
    let root = ObservedWorker {
        version: "1.0".to_string(),
        ..ObservedWorker::root("root1", "10.0.0.1")
    };
    let cluster = Arc::new(MockCluster::new(vec![root.clone(), ObservedWorker::child("auto1", &root)]));
    let requirements = vec![Requirement::new("a-auto").minimum(1), Requirement::new("b-auto").minimum(1)];
    let mut catalog = StaticCatalog::default();
    catalog.insert("1.0", "a-auto");

    let group = build_with_catalog(&cluster, &fixed(1), &requirements, catalog).await.unwrap();
    let report = group.apply(Duration::from_secs(5)).await;
    assert!(matches!(&report.outcomes[..], [ReconcileOutcome::Updated { .. }]));
    assert_eq!(
        cluster.calls().await,
        vec![Call::SetWorkloads {
            worker: "auto1".to_string(),
            workloads: vec!["a-auto".to_string()],
        }]
    );
}

#[tokio::test]
async fn test_e2e_failed_creation_does_not_abort_the_batch() {
    let cluster = Arc::new(MockCluster::new(machine("root1", "10.0.0.1", &[("auto1", &[])])).failing_creates());
    let requirements = vec![Requirement::new("a-auto").minimum(1), Requirement::new("b-auto").minimum(1)];

    let report = run_pass(&cluster, &scaling(1), &requirements).await;
    assert_eq!(report.dispatched, 2);
    assert!(report.outcomes.iter().any(|outcome| matches!(
        outcome,
        ReconcileOutcome::Failed { worker, error: ProvisionError::Rejected { .. } } if worker == "auto2"
    )));
    assert!(report
        .outcomes
        .iter()
        .any(|outcome| matches!(outcome, ReconcileOutcome::Updated { worker, .. } if worker == "auto1")));
    assert!(!cluster.inventory().await.iter().any(|worker| worker.id == "auto2"));
}

#[tokio::test]
async fn test_e2e_stopped_worker_is_started() {
    let root = ObservedWorker::root("root1", "10.0.0.1");
    let cluster = Arc::new(MockCluster::new(vec![
        root.clone(),
        ObservedWorker::child("auto1", &root).with_workloads(["a-auto"]).stopped(),
    ]));
    let requirements = vec![Requirement::new("a-auto").minimum(1)];

    let report = run_pass(&cluster, &scaling(10), &requirements).await;
    assert_eq!(
        report.outcomes,
        vec![ReconcileOutcome::Updated {
            worker: "auto1".to_string(),
            added: vec![],
            removed: vec![],
            started: true,
        }]
    );
    assert_eq!(
        cluster.calls().await,
        vec![
            Call::SetWorkloads {
                worker: "auto1".to_string(),
                workloads: vec!["a-auto".to_string()],
            },
            Call::Start("auto1".to_string()),
        ]
    );
    assert!(cluster.inventory().await.iter().all(|worker| worker.alive));
}

#[tokio::test]
async fn test_e2e_timeout_does_not_cancel_reconciliations() {
    let cluster = Arc::new(
        MockCluster::new(machine("root1", "10.0.0.1", &[("auto1", &["stale-auto"])])).with_delay_ms(200),
    );
    let group = build(&cluster, &fixed(1), &[]).await.unwrap();

    let report = group.apply(Duration::from_millis(10)).await;
    assert!(report.timed_out);
    assert_eq!(report.dispatched, 1);
    assert!(report.outcomes.is_empty());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(cluster.calls().await.len(), 1);
}
