use thiserror::Error;

/// How a pass should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Aborts the pass no matter what.
    Fatal,
    /// Logged and skipped when `ignore_errors` is set, otherwise aborts the pass.
    Recoverable,
}

#[derive(Error, Debug)]
pub enum AutoscaleError {
    #[error("Invalid {name} pattern: {source}")]
    InvalidPattern {
        name: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("Average instances per worker must be at least 1 when scaling workers, got {0}")]
    InvalidAverage(i64),
    #[error("Worker prefix '{0}' doesn't match the worker pattern")]
    InvalidPrefix(String),
    #[error("Not enough workers available ({available}), {required} required")]
    NotEnoughWorkers { available: usize, required: usize },
    #[error("Failed to load {path}: {reason}")]
    Load { path: String, reason: String },
    #[error("Can't assign {workload} to {node}: {reason}")]
    CapacityExceeded {
        workload: String,
        node: String,
        reason: String,
    },
    #[error("Can't add a child worker, no host with a root worker available")]
    NoRootHostAvailable,
    #[error("No more removable children available for {node} ({requested} removals requested)")]
    NoRemovableChildren { node: String, requested: usize },
    #[error("Couldn't satisfy requirements for workload {workload}")]
    RequirementUnsatisfied {
        workload: String,
        #[source]
        source: Box<AutoscaleError>,
    },
    #[error("No workers to carry {0} required instances")]
    NoWorkerCapacity(usize),
}

impl AutoscaleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPattern { .. }
            | Self::InvalidAverage(_)
            | Self::InvalidPrefix(_)
            | Self::NotEnoughWorkers { .. }
            | Self::Load { .. } => ErrorKind::Fatal,
            Self::CapacityExceeded { .. }
            | Self::NoRootHostAvailable
            | Self::NoRemovableChildren { .. }
            | Self::RequirementUnsatisfied { .. }
            | Self::NoWorkerCapacity(_) => ErrorKind::Recoverable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

/// Failure reported by an external collaborator. Never aborts a pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("No root worker available to anchor {0}")]
    NoAnchor(String),
    #[error("Worker {worker} rejected the request: {reason}")]
    Rejected { worker: String, reason: String },
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}
