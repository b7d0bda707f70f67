//! Workload autoscaler: sizes a group of workers and spreads workload instances over them.

// Serde helper module.
mod serde;
// Command line arguments and group options.
pub mod config;
// Error handling.
pub mod error;
// Workload requirements and dependency pruning.
pub mod requirement;
// The resource tree shared by all levels.
pub mod node;
// Assignment diffing.
pub mod changes;
// Workers, the leaves of the tree.
pub mod worker;
// Hosts, one per machine.
pub mod host;
// The autoscaled group and its apply loop.
pub mod group;
// Observed state loaded from snapshots.
pub mod inventory;
// Side-effecting collaborators.
pub mod provision;

pub use changes::ChangeSet;
pub use config::{Config, GroupOptions, Matchers};
pub use error::{AutoscaleError, ErrorKind, ProvisionError};
pub use group::{ApplyReport, Group};
pub use host::Host;
pub use inventory::{ObservedWorker, Snapshot};
pub use node::{ChildRegistry, NodeState, Placement, ResourceNode};
pub use provision::{PlanPrinter, Provisioner, StaticCatalog, WorkloadCatalog, WorkloadDefinition};
pub use requirement::{prune, Requirement, RequirementSummary};
pub use worker::{ReconcileOutcome, Reconciliation, Worker};
