//! Workload requirements and dependency pruning.
//!
//! Only requirements with an explicit minimum seed a dependency walk, so the pruned
//! set stays bounded by actual demand instead of the whole requirement graph.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use void::Void;

/// Desired replica bounds and dependencies of one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    /// Workload id.
    pub workload: String,
    pub minimum_instances: Option<u32>,
    pub maximum_instances: Option<u32>,
    pub maximum_instances_per_host: Option<u32>,
    /// Workloads that must run whenever this one runs.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Requirement {
    pub fn new(workload: impl Into<String>) -> Self {
        Self {
            workload: workload.into(),
            minimum_instances: None,
            maximum_instances: None,
            maximum_instances_per_host: None,
            dependencies: Vec::new(),
        }
    }

    pub fn minimum(mut self, instances: u32) -> Self {
        self.minimum_instances = Some(instances);
        self
    }

    pub fn maximum(mut self, instances: u32) -> Self {
        self.maximum_instances = Some(instances);
        self
    }

    pub fn per_host(mut self, instances: u32) -> Self {
        self.maximum_instances_per_host = Some(instances);
        self
    }

    pub fn depends_on<I, S>(mut self, workloads: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = workloads.into_iter().map(Into::into).collect();
        self
    }

    /// A zero minimum counts as no minimum.
    pub fn has_minimum(&self) -> bool {
        self.minimum_instances.map_or(false, |min| min > 0)
    }

    /// Units of demand this requirement adds to the group. A dependency placeholder
    /// without a minimum still counts as one.
    pub fn demand(&self) -> usize {
        match self.minimum_instances {
            Some(min) if min > 0 => min as usize,
            _ => 1,
        }
    }
}

impl FromStr for Requirement {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

/// Filters requirements by the workload pattern and resolves their dependencies.
///
/// Returns the pruned requirements in discovery order, each workload at most once.
pub fn prune<F>(requirements: &[Requirement], matches: F, inherit_requirements: bool) -> Vec<Requirement>
where
    F: Fn(&str) -> bool,
{
    let mut index: HashMap<String, Requirement> = requirements
        .iter()
        .map(|req| (req.workload.clone(), req.clone()))
        .collect();
    let mut pruner = Pruner {
        matches,
        inherit_requirements,
        seen: HashSet::new(),
        pruned: Vec::new(),
    };
    for root in requirements.iter().filter(|req| req.has_minimum()) {
        pruner.visit(&root.workload, &mut index);
    }
    pruner.pruned
}

struct Pruner<F> {
    matches: F,
    inherit_requirements: bool,
    seen: HashSet<String>,
    pruned: Vec<Requirement>,
}

impl<F: Fn(&str) -> bool> Pruner<F> {
    fn visit(&mut self, workload: &str, index: &mut HashMap<String, Requirement>) {
        if !(self.matches)(workload) || self.seen.contains(workload) {
            return;
        }
        let parent = match index.get(workload) {
            Some(parent) => parent.clone(),
            None => return,
        };
        self.seen.insert(workload.to_string());
        self.pruned.push(parent.clone());
        // placeholders don't pull in their own dependencies
        if !parent.has_minimum() {
            return;
        }
        for dependency in &parent.dependencies {
            if !(self.matches)(dependency) {
                warn!(
                    dependency = dependency.as_str(),
                    workload,
                    "Dependency doesn't match the workload pattern, skipping it"
                );
                continue;
            }
            if !self.resolve(dependency, &parent, index) {
                continue;
            }
            self.visit(dependency, index);
        }
    }

    /// Makes sure the dependency has usable bounds. Returns false when it must be skipped.
    fn resolve(
        &self,
        dependency: &str,
        parent: &Requirement,
        index: &mut HashMap<String, Requirement>,
    ) -> bool {
        match index.get_mut(dependency) {
            None if self.inherit_requirements => {
                debug!(dependency, workload = parent.workload.as_str(), "Inheriting requirements");
                let mut inherited = Requirement::new(dependency);
                inherited.minimum_instances = parent.minimum_instances;
                inherited.maximum_instances = parent.maximum_instances;
                index.insert(dependency.to_string(), inherited);
                true
            }
            Some(existing) if self.inherit_requirements && !existing.has_minimum() => {
                existing.minimum_instances = parent.minimum_instances;
                if let (Some(max), Some(min)) = (existing.maximum_instances, existing.minimum_instances) {
                    if max < min {
                        existing.maximum_instances = parent.maximum_instances;
                    }
                }
                true
            }
            None => {
                warn!(
                    dependency,
                    workload = parent.workload.as_str(),
                    "Dependency is missing requirements, skipping it"
                );
                false
            }
            Some(existing) if !existing.has_minimum() => {
                warn!(
                    dependency,
                    workload = parent.workload.as_str(),
                    "Dependency has no instances, skipping it"
                );
                false
            }
            Some(_) => true,
        }
    }
}

/// Pruned requirements plus the totals the sizing math needs.
#[derive(Debug, Clone, Default)]
pub struct RequirementSummary {
    pub requirements: BTreeMap<String, Requirement>,
    pub total_required_instances: usize,
    pub required_host_count: usize,
}

impl RequirementSummary {
    /// Fills missing per-host caps and computes total demand and the host count
    /// needed to honor every per-host cap.
    pub fn new(pruned: Vec<Requirement>, default_max_instances_per_host: u32) -> Self {
        let mut summary = Self::default();
        for mut req in pruned {
            let per_host = *req
                .maximum_instances_per_host
                .get_or_insert(default_max_instances_per_host);
            if req.has_minimum() && per_host > 0 {
                let min = req.demand();
                let per_host = per_host as usize;
                summary.required_host_count = summary.required_host_count.max((min + per_host - 1) / per_host);
            }
            summary.total_required_instances += req.demand();
            summary.requirements.insert(req.workload.clone(), req);
        }
        summary
    }
}
