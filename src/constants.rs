//! # Pipeline Constants
//!
//! Well-known location names, file naming conventions and defaults shared
//! across engines.

use std::time::Duration;

/// Execution location names
pub mod locations {
    /// In-process execution on the web/worker host
    pub const LOCAL: &str = "local";

    /// Suffix of the queue lane consumed by generic remote worker processes
    pub const WORKER_LANE_SUFFIX: &str = ":worker";

    /// Queue lane for remote workers serving `location`
    pub fn worker_lane(location: &str) -> String {
        format!("{location}{WORKER_LANE_SUFFIX}")
    }
}

/// Serialized job snapshot conventions
pub mod snapshot {
    /// Format version written into every snapshot document
    pub const FORMAT_VERSION: u32 = 1;

    /// Extension replacing the log file extension for snapshot files
    pub const FILE_EXTENSION: &str = "job.json";

    /// Scheme of the job URI handed to remote schedulers
    pub const URI_SCHEME: &str = "uuid";
}

/// Cluster output file extensions
pub mod cluster_output {
    pub const STDOUT_EXTENSION: &str = "cluster.out";
    pub const STDERR_EXTENSION: &str = "cluster.err";
}

/// Parameter names read from a job's parameter group
pub mod parameters {
    pub const CLUSTER_QUEUE: &str = "cluster queue";
    pub const CLUSTER_LOCATION: &str = "cluster location";
    pub const CLUSTER_MAX_CPU_TIME: &str = "cluster max cpu time";
    pub const CLUSTER_MAX_WALL_TIME: &str = "cluster max wall time";
    pub const CLUSTER_MAX_TIME: &str = "cluster max time";
    pub const CLUSTER_MAX_MEMORY: &str = "cluster max memory";

    /// Fully qualified key, e.g. `"XTandem, cluster queue"`
    pub fn grouped(group: &str, name: &str) -> String {
        format!("{group}, {name}")
    }
}

/// Default wall-clock TTL for cached queue positions
pub const DEFAULT_QUEUE_POSITION_TTL: Duration = Duration::from_secs(5);

/// Namespace for PostgreSQL advisory locks taken per execution location
pub const LOCATION_LOCK_NAMESPACE: i32 = 0x5049_5045; // "PIPE"

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_lane_naming() {
        assert_eq!(locations::worker_lane("mzxml"), "mzxml:worker");
    }

    #[test]
    fn test_grouped_parameter_key() {
        assert_eq!(
            parameters::grouped("XTandem", parameters::CLUSTER_QUEUE),
            "XTandem, cluster queue"
        );
    }
}
