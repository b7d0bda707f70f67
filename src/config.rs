//! Configuration for the autoscaler.
//!
//! `Config` holds the clap structs for the `autoscale` binary. `GroupOptions`
//! is the per-pass policy of one group and is usually loaded from a YAML file.

use std::fs::File;
use std::time::Duration;

use clap::Parser;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AutoscaleError;

#[derive(Parser, Debug)]
#[command(version, author)]
pub struct Config {
    /// Snapshot file with the current workers and workload requirements
    #[arg(long, default_value = "snapshot.yaml")]
    pub snapshot: String,

    /// Group options file. Built-in defaults are used when the file is missing
    #[arg(long, default_value = "options.yaml")]
    pub options: String,

    /// Id of the autoscaled group
    #[arg(long, default_value = "default")]
    pub group: String,

    /// Don't terminate after one pass; reload the files and run again every poll period
    #[arg(long, short)]
    pub daemon: bool,

    /// Seconds between passes in daemon mode
    #[arg(long, short, default_value = "15")]
    pub poll_period: u64,

    /// How long a daemon pass waits for dispatched changes to finish. Giving 0 won't wait.
    /// A single pass always waits for all of them
    #[arg(long, default_value = "5000")]
    pub max_wait_ms: u64,

    /// Only log the computed plan, whatever the options file says
    #[arg(long)]
    pub dry_run: bool,
}

impl Config {
    /// How long `apply` waits in this mode. The runtime is shut down after a single
    /// pass, which would drop unfinished reconciliations, so that pass waits for all.
    pub fn max_wait(&self) -> Duration {
        if self.daemon {
            Duration::from_millis(self.max_wait_ms)
        } else {
            Duration::MAX
        }
    }
}

/// Policy of one autoscaled group. Immutable during a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GroupOptions {
    /// Workers with matching ids are autoscaled.
    pub worker_pattern: String,
    /// Workloads with matching ids are autoscaled.
    pub workload_pattern: String,
    /// Only workers anchored by a matching root worker are included.
    pub root_worker_pattern: String,
    /// Allow creating, starting and removing workers.
    pub scale_workers: bool,
    /// Dependencies inherit bounds from their parent when their own are not set.
    pub inherit_requirements: bool,
    /// A worker may carry `average + max_deviation * average` instances.
    pub max_deviation: f64,
    /// Desired average instance count per worker. Negative means derive it from the load.
    pub average_instances_per_worker: i64,
    /// Prefix for new worker ids. Must match `worker_pattern`.
    pub worker_prefix: String,
    /// Minimum number of live workers needed when `scale_workers` is off.
    pub minimum_worker_count: usize,
    /// Per-host cap for requirements that don't define one.
    pub default_max_instances_per_host: u32,
    /// Log capacity errors and carry on with a best-effort plan.
    pub ignore_errors: bool,
    /// Maximum number of autoscaled workers per host. 0 disables the check.
    pub max_workers_per_host: usize,
    /// Log intended changes without applying them.
    pub dry_run: bool,
    /// How many workers may be changed per pass. 0 = unlimited.
    pub max_changes_per_pass: usize,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            worker_pattern: "^auto.*".to_string(),
            workload_pattern: "^.*-auto".to_string(),
            root_worker_pattern: ".*".to_string(),
            scale_workers: true,
            inherit_requirements: true,
            max_deviation: 1.0,
            average_instances_per_worker: -1,
            worker_prefix: "auto".to_string(),
            minimum_worker_count: 1,
            default_max_instances_per_host: 1,
            ignore_errors: true,
            max_workers_per_host: 3,
            dry_run: false,
            max_changes_per_pass: 0,
        }
    }
}

impl GroupOptions {
    /// Loads options from a YAML file. A missing file yields the defaults.
    pub fn load(path: &str) -> Result<Self, AutoscaleError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(AutoscaleError::Load {
                    path: path.to_string(),
                    reason: e.to_string(),
                })
            }
        };
        let mut options: Self = serde_yaml::from_reader(file).map_err(|e| AutoscaleError::Load {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        if options.max_deviation < 0.0 {
            options.max_deviation = 1.0;
        }
        Ok(options)
    }

    pub fn matchers(&self) -> Result<Matchers, AutoscaleError> {
        Ok(Matchers {
            worker: full_match("worker", &self.worker_pattern)?,
            workload: full_match("workload", &self.workload_pattern)?,
            root_worker: full_match("root worker", &self.root_worker_pattern)?,
        })
    }
}

/// Compiled name patterns. Every pattern must match the whole id.
#[derive(Debug, Clone)]
pub struct Matchers {
    worker: Regex,
    workload: Regex,
    root_worker: Regex,
}

impl Matchers {
    pub fn worker(&self, id: &str) -> bool {
        self.worker.is_match(id)
    }

    pub fn workload(&self, id: &str) -> bool {
        self.workload.is_match(id)
    }

    pub fn root_worker(&self, id: &str) -> bool {
        self.root_worker.is_match(id)
    }
}

fn full_match(name: &'static str, pattern: &str) -> Result<Regex, AutoscaleError> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|source| AutoscaleError::InvalidPattern { name, source })
}
