/// Utilities for handling "jobs": sets of log entries with a shared job ID
use crate::{LogEntry, Timestamp};

use std::collections::HashMap;

/// (host, job ID); the host is empty when jobs are merged across hosts.

pub type JobKey = (String, u32);

/// Given the records read from a set of log files, return a hashmap that maps the JobKey to a
/// vector of the job records for the JobKey sorted by ascending time, along with the count of
/// unfiltered records and the earliest and latest timestamp seen across all records before
/// filtering.
///
/// Unless `merge_across_hosts` is true the JobKey distinguishes by host name and job ID.  Heartbeats
/// and records with job ID zero are never part of a job.

pub fn compute_jobs<F>(
    entries: Vec<LogEntry>,
    filter: F,
    merge_across_hosts: bool,
) -> (HashMap<JobKey, Vec<LogEntry>>, usize, Timestamp, Timestamp)
where
    F: Fn(&LogEntry) -> bool,
{
    let num_records = entries.len();
    let earliest = entries.iter().map(|e| e.timestamp).min().unwrap_or_default();
    let latest = entries.iter().map(|e| e.timestamp).max().unwrap_or_default();

    let mut joblog = HashMap::<JobKey, Vec<LogEntry>>::new();
    for entry in entries {
        if entry.job_id == 0 || entry.is_heartbeat() || !filter(&entry) {
            continue;
        }
        let host = if merge_across_hosts {
            String::new()
        } else {
            entry.hostname.clone()
        };
        joblog.entry((host, entry.job_id)).or_default().push(entry);
    }

    // Sort each job's records by ascending timestamp to get an idea of the duration of the job.
    joblog.values_mut().for_each(|job| job.sort_by_key(|j| j.timestamp));

    (joblog, num_records, earliest, latest)
}

#[cfg(test)]
const TEST_LOG: &str = "\
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml8,user=joe,job=10,pid=10,cmd=python,cpu%=100,cpukib=1000
v=0.7.0,time=2023-08-15T10:05:00Z,host=ml8,user=joe,job=10,pid=10,cmd=python,cpu%=200,cpukib=1000
v=0.7.0,time=2023-08-15T09:55:00Z,host=ml3,user=joe,job=10,pid=77,cmd=python,cpu%=50,cpukib=1000
v=0.7.0,time=2023-08-15T10:05:00Z,host=ml8,user=ann,job=11,pid=11,cmd=bash,cpu%=1,cpukib=10
v=0.7.0,time=2023-08-15T10:10:00Z,host=ml8,user=root,job=0,pid=1,cmd=systemd,cpu%=1,cpukib=10
v=0.8.0,time=2023-08-15T10:12:00Z,host=ml8,user=_sonar_,cmd=_heartbeat_
";

#[test]
fn test_compute_jobs1() {
    let entries = crate::parse_logfile_from(TEST_LOG.as_bytes()).unwrap();
    let (jobs, numrec, earliest, latest) = compute_jobs(entries, |_e| true, false);
    assert!(numrec == 6);
    assert!(earliest == crate::timestamp_from_ymdhms(2023, 8, 15, 9, 55, 0).unwrap());
    assert!(latest == crate::timestamp_from_ymdhms(2023, 8, 15, 10, 12, 0).unwrap());
    assert!(jobs.len() == 3);
    let j = &jobs[&("ml8".to_string(), 10)];
    assert!(j.len() == 2);
    assert!(j[0].timestamp < j[1].timestamp);
}

#[test]
fn test_compute_jobs2() {
    // Merged across hosts, and filtered by user.  The earliest/latest are not affected by the
    // filter.
    let entries = crate::parse_logfile_from(TEST_LOG.as_bytes()).unwrap();
    let (jobs, _numrec, earliest, _latest) = compute_jobs(entries, |e| e.user == "joe", true);
    assert!(jobs.len() == 1);
    let j = &jobs[&(String::new(), 10)];
    assert!(j.len() == 3);
    assert!(j[0].hostname == "ml3");
    assert!(earliest == j[0].timestamp);
}
