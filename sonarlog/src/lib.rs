// This library handles a tree of sonar log files.  It finds files and parses them, and it knows how
// to append new records to the tree in the canonical layout:
//
//   <root>/<cluster>/<yyyy>/<mm>/<dd>/<host>.csv
//   <root>/<cluster>/<yyyy>/<mm>/<dd>/sysinfo-<host>.json
//
// where month and day are always zero-padded to two digits.  Only the tagged (free-CSV) format is
// handled; every field is `name=value`.

mod configs;
mod dates;
mod freecsv;
mod gpuset;
mod hosts;
mod jobs;
mod load;
mod logfile;
mod logtree;
mod records;
mod store;

use chrono::prelude::DateTime;
use chrono::Utc;

pub type Timestamp = DateTime<Utc>;

// Time utilities used throughout.

pub use dates::{
    add_day, add_hour, date_range, now, parse_rfc3339, timestamp_from_ymdhms, truncate_to_day,
    truncate_to_hour,
};

// Compute a set of plausible log file names within a directory tree, for a date range and a set of
// included host names; or find every file with a particular name in the date range.

pub use logtree::{find_files_named, find_logfiles};

// Parse a log file into a set of LogEntry structures.

pub use logfile::{parse_logfile, parse_logfile_from};

// Free-form CSV, the `name=value` dialect used by sonar and by the joblog and state files.

pub use freecsv::{parse_free_csv, write_free_csv, FreeCsvRow, Getter};

// Host name matching for --host.

pub use hosts::HostFilter;

// Sets of GPU cards.

pub use gpuset::GpuSet;

// Cluster configuration, ie, per-node hardware descriptions.

pub use configs::{read_cluster_config, System};

// Wire records: sample, heartbeat and sysinfo data in their JSON form, and encoders to free-CSV.

pub use records::{clean_float, HeartbeatRecord, JsonTime, SampleRecord, HEARTBEAT_CMD, HEARTBEAT_USER};

// Appending to the store.

pub use store::{
    append_record, cluster_dir, is_store_name, sample_file_name, store_dir, sysinfo_file_name,
    StoreError,
};

/// The LogEntry structure holds slightly processed data from a log record: Percentages have been
/// normalized to the range [0.0,1.0] (except that the CPU and GPU percentages are relative to one
/// core or card and can exceed 1.0), and memory sizes have been normalized to GB.

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Format "major.minor.bugfix"
    pub version: String,

    /// The time is common to all records created by the same sonar invocation.  It has no subsecond
    /// precision.
    pub timestamp: Timestamp,

    /// Fully qualified domain name.
    pub hostname: String,

    /// Number of cores on the node.  This may be zero if sonar did not report it.
    pub num_cores: u32,

    /// Unix user name, or "_zombie_something" or "_unknown_", or "_sonar_" for heartbeats.
    pub user: String,

    /// Process ID, zero for rolled-up records.
    pub pid: u32,

    /// The job_id is ideally never zero, but sometimes it will be if no job ID can be computed.
    pub job_id: u32,

    /// The command contains at least the executable name.  It may contain spaces and other special
    /// characters.
    pub command: String,

    /// For CPU usage, 1.0 means 1 full core's worth.
    pub cpu_pct: f64,

    /// Main memory used by the job on the node (the memory is shared by all cores on the node).
    pub mem_gb: f64,

    /// Resident anonymous memory, GB.
    pub rssanon_gb: f64,

    /// The set of GPUs used by the job on the node.
    pub gpus: GpuSet,

    /// Percent of the sum of the capacity of all GPUs in `gpus`, 1.0 means 1 full card.
    pub gpu_pct: f64,

    /// Percent of the sum of the capacity of all GPUs in `gpus`.  Note this is not always
    /// reliable.
    pub gpu_mem_pct: f64,

    /// Memory usage across all GPUs in `gpus`.  Note this is not always reliable.
    pub gpu_mem_gb: f64,

    /// Nonzero if some GPU reported a failure.
    pub gpu_fail: u32,

    /// Accumulated CPU time for the process since it started.
    pub cputime_sec: f64,

    /// The number of additional processes with the same job and command that were rolled into this
    /// record.
    pub rolledup: u32,
}

impl LogEntry {
    pub fn is_heartbeat(&self) -> bool {
        self.command == HEARTBEAT_CMD && self.user == HEARTBEAT_USER
    }
}

// Create a map from (host, job ID) to a vector of all the records for the job sorted ascending by
// timestamp, and return that map along with metadata about the unfiltered records.

pub use jobs::{compute_jobs, JobKey};

// Create a vector of (host, per-timestamp buckets of records) sorted ascending by host name and
// time.

pub use load::{compute_load, HostLoad};
