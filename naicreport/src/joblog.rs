// Read and clean up job log files, as produced periodically by the cpuhog analysis and similar.
// These logs have overlapping and partly redundant records for the same job.
//
// The records are partitioned by host and bucketed by their `now` timestamp, and the buckets are
// sorted newest first.  If a job id is present in two consecutive buckets then it is the same job,
// otherwise those are two different jobs with a reused id.  That holds only if the analysis that
// produces the logs runs often enough that no id is reused on a host between two consecutive runs;
// this is a requirement on the deployment and is not checked here.
//
// The result is a list of hosts sorted ascending by name, and for each host a list of jobs sorted
// descending by last-seen time.  Job ids may repeat within that list.  The first (most recent)
// record with a given id is live, the others have `expired` set.

use anyhow::Result;
use sonarlog::{FreeCsvRow, Timestamp};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io;

/// A job record read from a job log.  The parser must set `last_seen` to the record's `now` and
/// leave it unexpired.

pub trait Job {
    fn id(&self) -> u32;
    fn host(&self) -> &str;
    fn last_seen(&self) -> Timestamp;
    fn set_expired(&mut self, flag: bool);

    /// Fold the values of an older record for the same job into this one.
    fn integrate(&mut self, older: &Self);
}

#[derive(Debug)]
pub struct JobsByHost<T> {
    pub host: String,
    pub jobs: Vec<T>,
}

/// The files named `file_name` in the log tree at `data_path` for the dates in the window.

pub fn find_joblog_files(
    data_path: &str,
    file_name: &str,
    from: Timestamp,
    to: Timestamp,
) -> Result<Vec<String>> {
    sonarlog::find_files_named(data_path, file_name, from, to)
}

/// Read and integrate the records of `files`.  A file that can't be opened or parsed is skipped;
/// a record for which `parse` returns None is dropped.

pub fn read_joblog_files<T, F>(
    files: &[String],
    verbose: bool,
    stderr: &mut dyn io::Write,
    parse: F,
) -> Result<Vec<JobsByHost<T>>>
where
    T: Job,
    F: Fn(&FreeCsvRow) -> Option<T>,
{
    if verbose {
        writeln!(stderr, "{} files", files.len())?;
    }

    // host -> now -> records.  Buckets with the same timestamp are merged here, across files.
    let mut hosts: BTreeMap<String, BTreeMap<Timestamp, Vec<T>>> = BTreeMap::new();
    for file_name in files {
        let rows = match File::open(file_name)
            .map_err(anyhow::Error::from)
            .and_then(|f| sonarlog::parse_free_csv(f))
        {
            Ok(rows) => rows,
            Err(e) => {
                if verbose {
                    writeln!(stderr, "Skipping {file_name}: {e}")?;
                }
                continue;
            }
        };
        for row in &rows {
            if let Some(job) = parse(row) {
                hosts
                    .entry(job.host().to_string())
                    .or_default()
                    .entry(job.last_seen())
                    .or_default()
                    .push(job);
            }
        }
    }

    Ok(hosts
        .into_iter()
        .map(|(host, buckets)| JobsByHost {
            host,
            jobs: process_host(buckets.into_values().rev().collect()),
        })
        .collect())
}

// `buckets` are for one host, sorted descending by timestamp, with no two buckets having the same
// timestamp.  A record taken from a bucket is folded into the newer record it belongs to and
// removed, so it is not seen again when its own bucket comes up.

fn process_host<T: Job>(mut buckets: Vec<Vec<T>>) -> Vec<T> {
    let mut results = vec![];
    for i in 0..buckets.len() {
        let bucket = std::mem::take(&mut buckets[i]);
        for mut record in bucket {
            for older in buckets[i + 1..].iter_mut() {
                // At most one hit per bucket; no hit ends the chain.
                let Some(ix) = older.iter().position(|r| r.id() == record.id()) else {
                    break;
                };
                let prev = older.swap_remove(ix);
                record.integrate(&prev);
            }
            results.push(record);
        }
    }

    results.sort_by(|a, b| b.last_seen().cmp(&a.last_seen()));

    let mut seen = HashSet::new();
    for job in results.iter_mut() {
        if !seen.insert(job.id()) {
            job.set_expired(true);
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonarlog::Getter;

    #[derive(Debug, Clone)]
    struct TestJob {
        id: u32,
        host: String,
        last_seen: Timestamp,
        expired: bool,
        user: String,
        first_seen: Timestamp,
        start: Timestamp,
        end: Timestamp,
    }

    impl Job for TestJob {
        fn id(&self) -> u32 {
            self.id
        }
        fn host(&self) -> &str {
            &self.host
        }
        fn last_seen(&self) -> Timestamp {
            self.last_seen
        }
        fn set_expired(&mut self, flag: bool) {
            self.expired = flag
        }
        fn integrate(&mut self, older: &Self) {
            self.last_seen = self.last_seen.max(older.last_seen);
            self.first_seen = self.first_seen.min(older.first_seen);
            self.start = self.start.min(older.start);
            self.end = self.end.max(older.end);
        }
    }

    fn parse_test_job(row: &FreeCsvRow) -> Option<TestJob> {
        let mut g = Getter::new(row);
        let tag = g.string("tag");
        let now = g.common_datetime("now");
        let job = TestJob {
            id: g.job_mark("jobm"),
            host: g.string("host"),
            last_seen: now,
            expired: false,
            user: g.string("user"),
            first_seen: now,
            start: g.common_datetime("start"),
            end: g.common_datetime("end"),
        };
        (g.success && tag == "mytag").then_some(job)
    }

    fn t(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Timestamp {
        sonarlog::timestamp_from_ymdhms(y, mo, d, h, mi, 0).unwrap()
    }

    fn find(log: &[JobsByHost<TestJob>], host: &str, id: u32) -> Vec<TestJob> {
        log.iter()
            .filter(|h| h.host == host)
            .flat_map(|h| h.jobs.iter().filter(|j| j.id == id).cloned())
            .collect()
    }

    fn read(root: &str, from: Timestamp, to: Timestamp) -> Vec<JobsByHost<TestJob>> {
        let files = find_joblog_files(root, "jobdata.csv", from, to).unwrap();
        read_joblog_files(&files, false, &mut io::sink(), parse_test_job).unwrap()
    }

    #[test]
    fn test_read_joblog_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        for (dir, text) in [
            ("2023/09/03", FILE_2023_09_03),
            ("2023/09/06", FILE_2023_09_06),
            ("2023/09/07", FILE_2023_09_07),
        ] {
            std::fs::create_dir_all(tmp.path().join(dir)).unwrap();
            std::fs::write(tmp.path().join(dir).join("jobdata.csv"), text).unwrap();
        }
        let root = tmp.path().to_str().unwrap();

        // One file, one record.
        let log = read(root, t(2023, 9, 3, 0, 0), t(2023, 9, 4, 0, 0));
        assert!(log.len() == 1);
        let xs = find(&log, "ml6", 2166356);
        assert!(xs.len() == 1);
        let x = &xs[0];
        assert!(x.user == "user3");
        assert!(x.first_seen == t(2023, 9, 3, 20, 0));
        assert!(x.last_seen == t(2023, 9, 3, 20, 0));
        assert!(x.start == t(2023, 9, 3, 15, 10));
        assert!(x.end == t(2023, 9, 3, 16, 50));

        // Jobs spanning two files.
        let log = read(root, t(2023, 9, 6, 0, 0), t(2023, 9, 8, 0, 0));
        assert!(log.iter().map(|h| h.host.as_str()).collect::<Vec<&str>>() == vec!["ml6", "ml8"]);
        let xs = find(&log, "ml8", 2253420);
        assert!(xs.len() == 1);
        let x = &xs[0];
        assert!(x.user == "user1");
        assert!(!x.expired);
        assert!(x.first_seen == t(2023, 9, 5, 22, 0));
        assert!(x.last_seen == t(2023, 9, 7, 14, 0));
        assert!(x.start == t(2023, 9, 5, 16, 5));
        assert!(x.end == t(2023, 9, 6, 16, 30));

        // There is a gap for 2712710 on Sept 7 at 12:00, so it's two jobs, newest first, and the
        // older one is expired.
        let xs = find(&log, "ml6", 2712710);
        assert!(xs.len() == 2);
        assert!(xs[0].last_seen > xs[1].last_seen);
        assert!(xs[0].last_seen == t(2023, 9, 7, 14, 0));
        assert!(xs[1].last_seen == t(2023, 9, 7, 10, 0));
        assert!(xs[1].first_seen == t(2023, 9, 6, 12, 0));
        assert!(!xs[0].expired);
        assert!(xs[1].expired);

        // Jobs for a host are sorted descending by last-seen.
        for h in &log {
            assert!(h.jobs.windows(2).all(|w| w[0].last_seen >= w[1].last_seen));
        }
    }

    // Real cpuhog data, anonymized, with the tag changed.
    const FILE_2023_09_03: &str = "\
now=2023-09-03 20:00,jobm=2166356,user=user3,duration=0d 1h40m,host=ml6,cpu-peak=2615,gpu-peak=0,rcpu-avg=3,rcpu-peak=41,rmem-avg=12,rmem-peak=14,start=2023-09-03 15:10,end=2023-09-03 16:50,cmd=python3.9,tag=mytag
";

    const FILE_2023_09_06: &str = "\
now=2023-09-05 22:00,jobm=2253420>,user=user1,duration=0d 5h50m,host=ml8,cpu-peak=13877,gpu-peak=0,rcpu-avg=29,rcpu-peak=73,rmem-avg=53,rmem-peak=54,start=2023-09-05 16:05,end=2023-09-05 21:55,cmd=python3,tag=mytag
now=2023-09-06 00:00,jobm=2253420,user=user1,duration=0d 7h50m,host=ml8,cpu-peak=14421,gpu-peak=0,rcpu-avg=40,rcpu-peak=76,rmem-avg=53,rmem-peak=54,start=2023-09-05 16:05,end=2023-09-05 23:55,cmd=python3,tag=mytag
now=2023-09-06 02:00,jobm=2253420>,user=user1,duration=0d 9h50m,host=ml8,cpu-peak=14421,gpu-peak=0,rcpu-avg=41,rcpu-peak=76,rmem-avg=53,rmem-peak=54,start=2023-09-05 16:05,end=2023-09-06 01:55,cmd=python3,tag=mytag
now=2023-09-06 04:00,jobm=2253420>,user=user1,duration=0d11h50m,host=ml8,cpu-peak=14421,gpu-peak=0,rcpu-avg=40,rcpu-peak=76,rmem-avg=53,rmem-peak=54,start=2023-09-05 16:05,end=2023-09-06 03:55,cmd=python3,tag=mytag
now=2023-09-06 06:00,jobm=2253420>,user=user1,duration=0d13h50m,host=ml8,cpu-peak=14421,gpu-peak=0,rcpu-avg=43,rcpu-peak=76,rmem-avg=53,rmem-peak=54,start=2023-09-05 16:05,end=2023-09-06 05:55,cmd=python3,tag=mytag
now=2023-09-06 08:00,jobm=2253420,user=user1,duration=0d15h50m,host=ml8,cpu-peak=14421,gpu-peak=0,rcpu-avg=42,rcpu-peak=76,rmem-avg=53,rmem-peak=54,start=2023-09-05 16:05,end=2023-09-06 07:55,cmd=python3,tag=mytag
now=2023-09-06 10:00,jobm=2253420,user=user1,duration=0d17h50m,host=ml8,cpu-peak=14421,gpu-peak=0,rcpu-avg=40,rcpu-peak=76,rmem-avg=53,rmem-peak=54,start=2023-09-05 16:05,end=2023-09-06 09:55,cmd=python3,tag=mytag
now=2023-09-06 12:00,jobm=2253420,user=user1,duration=0d19h50m,host=ml8,cpu-peak=14421,gpu-peak=0,rcpu-avg=43,rcpu-peak=76,rmem-avg=53,rmem-peak=54,start=2023-09-05 16:05,end=2023-09-06 11:55,cmd=python3,tag=mytag
now=2023-09-06 12:00,jobm=2712710,user=user2,duration=0d 4h20m,host=ml6,cpu-peak=1274,gpu-peak=0,rcpu-avg=3,rcpu-peak=20,rmem-avg=1,rmem-peak=2,start=2023-09-06 07:35,end=2023-09-06 11:55,cmd=kited,tag=mytag
now=2023-09-06 14:00,jobm=2253420,user=user1,duration=0d21h50m,host=ml8,cpu-peak=14421,gpu-peak=0,rcpu-avg=42,rcpu-peak=76,rmem-avg=54,rmem-peak=54,start=2023-09-05 16:05,end=2023-09-06 13:55,cmd=python3,tag=mytag
now=2023-09-06 14:00,jobm=2712710,user=user2,duration=0d 6h20m,host=ml6,cpu-peak=1274,gpu-peak=0,rcpu-avg=2,rcpu-peak=20,rmem-avg=1,rmem-peak=2,start=2023-09-06 07:35,end=2023-09-06 13:55,cmd=kited,tag=mytag
now=2023-09-06 16:00,jobm=2253420>,user=user1,duration=0d23h50m,host=ml8,cpu-peak=14421,gpu-peak=0,rcpu-avg=40,rcpu-peak=76,rmem-avg=54,rmem-peak=54,start=2023-09-05 16:05,end=2023-09-06 15:55,cmd=python3,tag=mytag
now=2023-09-06 16:00,jobm=2712710>,user=user2,duration=0d 8h20m,host=ml6,cpu-peak=1274,gpu-peak=0,rcpu-avg=2,rcpu-peak=20,rmem-avg=2,rmem-peak=2,start=2023-09-06 07:35,end=2023-09-06 15:55,cmd=kited,tag=mytag
now=2023-09-06 18:00,jobm=2253420,user=user1,duration=0d22h30m,host=ml8,cpu-peak=14421,gpu-peak=0,rcpu-avg=40,rcpu-peak=76,rmem-avg=54,rmem-peak=54,start=2023-09-05 18:00,end=2023-09-06 16:30,cmd=python3,tag=mytag
now=2023-09-06 18:00,jobm=2712710,user=user2,duration=0d10h20m,host=ml6,cpu-peak=1274,gpu-peak=0,rcpu-avg=2,rcpu-peak=20,rmem-avg=2,rmem-peak=2,start=2023-09-06 07:35,end=2023-09-06 17:55,cmd=kited,tag=mytag
now=2023-09-06 20:00,jobm=2253420,user=user1,duration=0d20h25m,host=ml8,cpu-peak=14421,gpu-peak=0,rcpu-avg=42,rcpu-peak=76,rmem-avg=54,rmem-peak=54,start=2023-09-05 20:05,end=2023-09-06 16:30,cmd=python3,tag=mytag
now=2023-09-06 20:00,jobm=2712710>,user=user2,duration=0d12h25m,host=ml6,cpu-peak=1274,gpu-peak=0,rcpu-avg=1,rcpu-peak=20,rmem-avg=2,rmem-peak=2,start=2023-09-06 07:35,end=2023-09-06 20:00,cmd=kited,tag=mytag
";

    const FILE_2023_09_07: &str = "\
now=2023-09-06 22:00,jobm=2253420,user=user1,duration=0d18h30m,host=ml8,cpu-peak=14421,gpu-peak=0,rcpu-avg=42,rcpu-peak=76,rmem-avg=54,rmem-peak=54,start=2023-09-05 22:00,end=2023-09-06 16:30,cmd=python3,tag=mytag
now=2023-09-06 22:00,jobm=2712710>,user=user2,duration=0d14h20m,host=ml6,cpu-peak=1274,gpu-peak=0,rcpu-avg=1,rcpu-peak=20,rmem-avg=2,rmem-peak=2,start=2023-09-06 07:35,end=2023-09-06 21:55,cmd=kited,tag=mytag
now=2023-09-07 00:00,jobm=2253420,user=user1,duration=0d16h30m,host=ml8,cpu-peak=14240,gpu-peak=0,rcpu-avg=39,rcpu-peak=75,rmem-avg=54,rmem-peak=54,start=2023-09-06 00:00,end=2023-09-06 16:30,cmd=python3,tag=mytag
now=2023-09-07 00:00,jobm=2712710,user=user2,duration=0d16h20m,host=ml6,cpu-peak=1274,gpu-peak=0,rcpu-avg=1,rcpu-peak=20,rmem-avg=2,rmem-peak=2,start=2023-09-06 07:35,end=2023-09-06 23:55,cmd=kited,tag=mytag
now=2023-09-07 02:00,jobm=2253420,user=user1,duration=0d14h30m,host=ml8,cpu-peak=14240,gpu-peak=0,rcpu-avg=38,rcpu-peak=75,rmem-avg=54,rmem-peak=54,start=2023-09-06 02:00,end=2023-09-06 16:30,cmd=python3,tag=mytag
now=2023-09-07 02:00,jobm=2712710,user=user2,duration=0d18h20m,host=ml6,cpu-peak=1274,gpu-peak=0,rcpu-avg=1,rcpu-peak=20,rmem-avg=2,rmem-peak=2,start=2023-09-06 07:35,end=2023-09-07 01:55,cmd=kited,tag=mytag
now=2023-09-07 04:00,jobm=2253420,user=user1,duration=0d12h30m,host=ml8,cpu-peak=14240,gpu-peak=0,rcpu-avg=38,rcpu-peak=75,rmem-avg=54,rmem-peak=54,start=2023-09-06 04:00,end=2023-09-06 16:30,cmd=python3,tag=mytag
now=2023-09-07 04:00,jobm=2712710,user=user2,duration=0d20h20m,host=ml6,cpu-peak=1274,gpu-peak=0,rcpu-avg=1,rcpu-peak=20,rmem-avg=2,rmem-peak=2,start=2023-09-06 07:35,end=2023-09-07 03:55,cmd=kited,tag=mytag
now=2023-09-07 06:00,jobm=2253420,user=user1,duration=0d10h30m,host=ml8,cpu-peak=14240,gpu-peak=0,rcpu-avg=34,rcpu-peak=75,rmem-avg=54,rmem-peak=54,start=2023-09-06 06:00,end=2023-09-06 16:30,cmd=python3,tag=mytag
now=2023-09-07 06:00,jobm=2712710>,user=user2,duration=0d22h20m,host=ml6,cpu-peak=1274,gpu-peak=0,rcpu-avg=1,rcpu-peak=20,rmem-avg=2,rmem-peak=2,start=2023-09-06 07:35,end=2023-09-07 05:55,cmd=kited,tag=mytag
now=2023-09-07 08:00,jobm=2253420,user=user1,duration=0d 8h30m,host=ml8,cpu-peak=14240,gpu-peak=0,rcpu-avg=33,rcpu-peak=75,rmem-avg=54,rmem-peak=54,start=2023-09-06 08:00,end=2023-09-06 16:30,cmd=python3,tag=mytag
now=2023-09-07 08:00,jobm=2712710,user=user2,duration=0d23h55m,host=ml6,cpu-peak=1274,gpu-peak=0,rcpu-avg=1,rcpu-peak=20,rmem-avg=2,rmem-peak=2,start=2023-09-06 08:05,end=2023-09-07 08:00,cmd=kited,tag=mytag
now=2023-09-07 08:00,jobm=3043187,user=user3,duration=0d 0h10m,host=ml6,cpu-peak=1519,gpu-peak=0,rcpu-avg=8,rcpu-peak=24,rmem-avg=3,rmem-peak=3,start=2023-09-07 07:50,end=2023-09-07 08:00,cmd=python3.9,tag=mytag
now=2023-09-07 10:00,jobm=2712710,user=user2,duration=0d23h55m,host=ml6,cpu-peak=1274,gpu-peak=0,rcpu-avg=1,rcpu-peak=20,rmem-avg=2,rmem-peak=2,start=2023-09-06 10:00,end=2023-09-07 09:55,cmd=kited,tag=mytag
now=2023-09-07 10:00,jobm=2253420,user=user1,duration=0d 6h30m,host=ml8,cpu-peak=14240,gpu-peak=0,rcpu-avg=36,rcpu-peak=75,rmem-avg=53,rmem-peak=54,start=2023-09-06 10:00,end=2023-09-06 16:30,cmd=python3,tag=mytag
now=2023-09-07 10:00,jobm=3043187,user=user3,duration=0d 0h20m,host=ml6,cpu-peak=1519,gpu-peak=0,rcpu-avg=5,rcpu-peak=24,rmem-avg=3,rmem-peak=3,start=2023-09-07 07:50,end=2023-09-07 08:10,cmd=python3.9,tag=mytag
now=2023-09-07 12:00,jobm=2253420,user=user1,duration=0d 4h30m,host=ml8,cpu-peak=13528,gpu-peak=0,rcpu-avg=22,rcpu-peak=71,rmem-avg=53,rmem-peak=54,start=2023-09-06 12:00,end=2023-09-06 16:30,cmd=python3,tag=mytag
now=2023-09-07 12:00,jobm=3043187,user=user3,duration=0d 0h20m,host=ml6,cpu-peak=1519,gpu-peak=0,rcpu-avg=5,rcpu-peak=24,rmem-avg=3,rmem-peak=3,start=2023-09-07 07:50,end=2023-09-07 08:10,cmd=python3.9,tag=mytag
now=2023-09-07 14:00,jobm=2253420,user=user1,duration=0d 2h30m,host=ml8,cpu-peak=8423,gpu-peak=0,rcpu-avg=16,rcpu-peak=44,rmem-avg=53,rmem-peak=54,start=2023-09-06 14:00,end=2023-09-06 16:30,cmd=python3,tag=mytag
now=2023-09-07 14:00,jobm=2712710,user=user2,duration=0d23h55m,host=ml6,cpu-peak=761,gpu-peak=0,rcpu-avg=1,rcpu-peak=12,rmem-avg=2,rmem-peak=2,start=2023-09-06 14:00,end=2023-09-07 13:55,cmd=kited,tag=mytag
now=2023-09-07 14:00,jobm=3043187,user=user3,duration=0d 0h20m,host=ml6,cpu-peak=1519,gpu-peak=0,rcpu-avg=5,rcpu-peak=24,rmem-avg=3,rmem-peak=3,start=2023-09-07 07:50,end=2023-09-07 08:10,cmd=python3.9,tag=mytag
now=2023-09-07 14:00,jobm=3129396,user=user3,duration=0d 0h55m,host=ml6,cpu-peak=3756,gpu-peak=0,rcpu-avg=13,rcpu-peak=59,rmem-avg=3,rmem-peak=3,start=2023-09-07 13:00,end=2023-09-07 13:55,cmd=python3.9,tag=mytag
now=2023-09-07 21:27,jobm=3043187,user=user3,duration=0d 0h20m,host=ml6,cpu-peak=1519,gpu-peak=0,rcpu-avg=5,rcpu-peak=24,rmem-avg=3,rmem-peak=3,start=2023-09-07 07:50,end=2023-09-07 08:10,cmd=python3.9,tag=mytag
";
}
