//! Collaborators that touch the outside world.
//!
//! The engine never creates, changes or destroys workers itself. Every side
//! effect goes through a `Provisioner`, which lets the same plan be applied to a
//! real runtime, printed, or recorded in tests.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use colored::*;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;
use crate::inventory::ObservedWorker;

/// A workload resolved for a specific worker version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadDefinition {
    pub id: String,
    pub version: String,
}

pub trait WorkloadCatalog: Send + Sync {
    fn resolve(&self, version: &str, workload: &str) -> Option<WorkloadDefinition>;
}

/// Workload ids known per version. An empty catalog resolves any workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticCatalog(BTreeMap<String, BTreeSet<String>>);

impl StaticCatalog {
    pub fn insert(&mut self, version: impl Into<String>, workload: impl Into<String>) {
        self.0.entry(version.into()).or_default().insert(workload.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl WorkloadCatalog for StaticCatalog {
    fn resolve(&self, version: &str, workload: &str) -> Option<WorkloadDefinition> {
        let known = self.0.is_empty()
            || self
                .0
                .get(version)
                .map_or(false, |workloads| workloads.contains(workload));
        known.then(|| WorkloadDefinition {
            id: workload.to_string(),
            version: version.to_string(),
        })
    }
}

/// Brings workers into existence and changes what they run.
///
/// Implementations must be safe to call concurrently for distinct workers.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Creates a worker anchored by a root worker. New hosts have no anchor yet.
    async fn create_worker(
        &self,
        name: &str,
        workloads: &[String],
        anchor: Option<&ObservedWorker>,
    ) -> Result<(), ProvisionError>;

    async fn set_workloads(
        &self,
        worker: &ObservedWorker,
        workloads: &[WorkloadDefinition],
    ) -> Result<(), ProvisionError>;

    async fn start_worker(&self, worker: &ObservedWorker) -> Result<(), ProvisionError>;

    async fn destroy_worker(&self, worker: &ObservedWorker) -> Result<(), ProvisionError>;
}

/// Prints the actions it is asked to perform instead of performing them.
#[derive(Debug, Default)]
pub struct PlanPrinter;

impl PlanPrinter {
    fn print(&self, action: ColoredString, worker: &str, detail: String) {
        println!("{} {} {}", action, worker.bold(), detail);
    }
}

#[async_trait]
impl Provisioner for PlanPrinter {
    async fn create_worker(
        &self,
        name: &str,
        workloads: &[String],
        anchor: Option<&ObservedWorker>,
    ) -> Result<(), ProvisionError> {
        let anchor = anchor.ok_or_else(|| ProvisionError::NoAnchor(name.to_string()))?;
        self.print(
            "[create]".green(),
            name,
            format!("under {} with [{}]", anchor.id, workloads.iter().join(", ")),
        );
        Ok(())
    }

    async fn set_workloads(
        &self,
        worker: &ObservedWorker,
        workloads: &[WorkloadDefinition],
    ) -> Result<(), ProvisionError> {
        self.print(
            "[assign]".cyan(),
            &worker.id,
            format!("[{}]", workloads.iter().map(|def| &def.id).join(", ")),
        );
        Ok(())
    }

    async fn start_worker(&self, worker: &ObservedWorker) -> Result<(), ProvisionError> {
        self.print("[start]".yellow(), &worker.id, String::new());
        Ok(())
    }

    async fn destroy_worker(&self, worker: &ObservedWorker) -> Result<(), ProvisionError> {
        self.print("[destroy]".red(), &worker.id, String::new());
        Ok(())
    }
}
