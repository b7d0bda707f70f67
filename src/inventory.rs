//! Observed cluster state.
//!
//! A pass works on one snapshot taken up front. Nothing here is queried again
//! while the pass is computed.

use std::fs::File;

use serde::{Deserialize, Serialize};

use crate::error::AutoscaleError;
use crate::provision::StaticCatalog;
use crate::requirement::Requirement;
use crate::serde::string_or_mapping;

/// A worker process as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedWorker {
    pub id: String,
    /// Network address of the machine the worker runs on.
    pub address: String,
    /// Root worker this one was spawned from. Root workers have none.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default = "default_alive")]
    pub alive: bool,
    /// Version the worker's workload definitions are resolved against.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub workloads: Vec<String>,
}

fn default_alive() -> bool {
    true
}

impl ObservedWorker {
    pub fn root(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            parent: None,
            alive: true,
            version: String::new(),
            workloads: Vec::new(),
        }
    }

    pub fn child(id: impl Into<String>, parent: &ObservedWorker) -> Self {
        Self {
            parent: Some(parent.id.clone()),
            version: parent.version.clone(),
            ..Self::root(id, parent.address.clone())
        }
    }

    pub fn with_workloads<I, S>(mut self, workloads: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.workloads = workloads.into_iter().map(Into::into).collect();
        self
    }

    pub fn stopped(mut self) -> Self {
        self.alive = false;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

#[derive(Debug, Deserialize)]
struct RequirementSpec(#[serde(deserialize_with = "string_or_mapping")] Requirement);

#[derive(Debug, Deserialize)]
struct SnapshotFile {
    #[serde(default)]
    workers: Vec<ObservedWorker>,
    #[serde(default)]
    requirements: Vec<RequirementSpec>,
    #[serde(default)]
    catalog: StaticCatalog,
}

/// Everything one pass needs to know about the cluster.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub workers: Vec<ObservedWorker>,
    pub requirements: Vec<Requirement>,
    pub catalog: StaticCatalog,
}

impl Snapshot {
    pub fn load(path: &str) -> Result<Self, AutoscaleError> {
        let load_error = |reason: String| AutoscaleError::Load {
            path: path.to_string(),
            reason,
        };
        let file = File::open(path).map_err(|e| load_error(e.to_string()))?;
        let parsed: SnapshotFile = serde_yaml::from_reader(file).map_err(|e| load_error(e.to_string()))?;
        Ok(Self {
            workers: parsed.workers,
            requirements: parsed.requirements.into_iter().map(|RequirementSpec(req)| req).collect(),
            catalog: parsed.catalog,
        })
    }
}
