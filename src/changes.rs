use std::collections::{BTreeMap, BTreeSet};

/// Difference between the workloads a worker runs and the ones it should run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Workloads the worker carries once the change is applied.
    pub result: BTreeSet<String>,
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl ChangeSet {
    /// Diffs observed workloads against desired assignments. Workloads missing from
    /// `assignments` are not managed and stay as they are.
    pub fn compute<'a, I>(current: I, assignments: &BTreeMap<String, bool>) -> Self
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut result: BTreeSet<String> = current.into_iter().cloned().collect();
        let mut added = BTreeSet::new();
        let mut removed = BTreeSet::new();
        for (workload, &assigned) in assignments {
            if assigned {
                if result.insert(workload.clone()) {
                    added.insert(workload.clone());
                }
            } else if result.remove(workload) {
                removed.insert(workload.clone());
            }
        }
        Self {
            result,
            added,
            removed,
        }
    }

    pub fn change_count(&self) -> usize {
        self.added.len() + self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.change_count() == 0
    }

    /// Sorted workload ids the worker should end up with.
    pub fn result_list(&self) -> Vec<String> {
        self.result.iter().cloned().collect()
    }
}
