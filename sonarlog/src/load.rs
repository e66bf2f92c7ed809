// Utilities for handling "system load": sets of log entries with a shared host and timestamp

use crate::{LogEntry, Timestamp};

use std::collections::HashMap;

/// A host name and that host's records bucketed by timestamp, ascending.

pub type HostLoad = (String, Vec<(Timestamp, Vec<LogEntry>)>);

/// Return a vector of pairs from hostname to a vector of pairs from timestamp to the LogEntry
/// records with that timestamp on that host.  The vectors are sorted ascending by host name and
/// time respectively.  All timestamps in the innermost vector-of-records are the same, but the
/// timestamp is included explicitly anyway.  Heartbeats are dropped.

pub fn compute_load<F>(entries: Vec<LogEntry>, filter: F) -> Vec<HostLoad>
where
    F: Fn(&LogEntry) -> bool,
{
    // In principle the sonar log is already broken down by hostname so the hashmap and bucketing
    // should not be necessary, but there is utility in being able to catenate log files without any
    // concern about that.  Each record contains timestamp and host name, and is self-contained.

    let mut loadlog = HashMap::<String, Vec<LogEntry>>::new();
    for entry in entries {
        if entry.is_heartbeat() || !filter(&entry) {
            continue;
        }
        loadlog.entry(entry.hostname.clone()).or_default().push(entry);
    }

    let mut by_host = loadlog
        .into_iter()
        .map(|(host, mut records)| {
            records.sort_by_key(|r| r.timestamp);
            let mut buckets: Vec<(Timestamp, Vec<LogEntry>)> = vec![];
            for r in records {
                match buckets.last_mut() {
                    Some((t, bucket)) if *t == r.timestamp => bucket.push(r),
                    _ => buckets.push((r.timestamp, vec![r])),
                }
            }
            (host, buckets)
        })
        .collect::<Vec<HostLoad>>();
    by_host.sort_by(|a, b| a.0.cmp(&b.0));
    by_host
}

#[test]
fn test_compute_load() {
    let text = "\
v=0.7.0,time=2023-08-15T10:05:00Z,host=ml8,user=joe,job=10,cmd=python,cpu%=200
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml8,user=joe,job=10,cmd=python,cpu%=100
v=0.7.0,time=2023-08-15T10:05:00Z,host=ml8,user=ann,job=11,cmd=bash,cpu%=1
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml3,user=joe,job=12,cmd=python,cpu%=50
v=0.8.0,time=2023-08-15T10:12:00Z,host=ml3,user=_sonar_,cmd=_heartbeat_
";
    let entries = crate::parse_logfile_from(text.as_bytes()).unwrap();
    let load = compute_load(entries, |_| true);
    assert!(load.len() == 2);
    assert!(load[0].0 == "ml3");
    assert!(load[0].1.len() == 1);
    assert!(load[1].0 == "ml8");
    assert!(load[1].1.len() == 2);
    assert!(load[1].1[0].0 < load[1].1[1].0);
    assert!(load[1].1[1].1.len() == 2);
}
