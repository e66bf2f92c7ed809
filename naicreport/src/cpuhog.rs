// The `ml-cpuhog` report: jobs that use a lot of CPU and no GPU on the ML nodes.
//
// The cpuhog analysis runs periodically and appends its findings to `cpuhog.csv` in the log tree.
// This reads those logs for the window, merges them with the saved state so that each job is
// reported only once, and prints the new reports.  The state is saved in `cpuhog-state.csv`.

use crate::joblog::{self, Job};
use crate::jobstate::JobDatabase;
use crate::options::{self, LogArgs, DATETIME_FORMAT};

use anyhow::Result;
use chrono::Duration;
use clap::Args;
use serde::Serialize;
use sonarlog::{FreeCsvRow, Getter, Timestamp};
use std::io;

pub const STATE_FILENAME: &str = "cpuhog-state.csv";
pub const DATA_FILENAME: &str = "cpuhog.csv";

#[derive(Args, Debug, Default, Clone)]
pub struct CpuhogArgs {
    #[command(flatten)]
    pub log: LogArgs,

    /// Store the report state in this file, default <state-dir>/cpuhog-state.csv
    #[arg(long)]
    pub state_file: Option<String>,

    /// The present time, "YYYY-MM-DD HH:MM", for testing
    #[arg(long)]
    pub now: Option<String>,

    /// Format output as JSON
    #[arg(long, conflicts_with = "summary")]
    pub json: bool,

    /// One line per new job, for testing
    #[arg(long)]
    pub summary: bool,

    /// Print diagnostics to stderr
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct CpuhogJob {
    id: u32,
    host: String,
    last_seen: Timestamp,
    expired: bool,
    user: String,
    cmd: String,
    first_seen: Timestamp,
    start: Timestamp,
    end: Timestamp,
    // This and the following are the max across all records for the job, as the analysis has a
    // limited window and its view changes over time.
    cpu_peak: f64,
    gpu_peak: f64,
    rcpu_avg: f64,
    rcpu_peak: f64,
    rmem_avg: f64,
    rmem_peak: f64,
}

impl Job for CpuhogJob {
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
        self.expired = flag;
    }

    fn integrate(&mut self, older: &CpuhogJob) {
        self.last_seen = self.last_seen.max(older.last_seen);
        self.first_seen = self.first_seen.min(older.first_seen);
        self.start = self.start.min(older.start);
        self.end = self.end.max(older.end);
        self.cpu_peak = self.cpu_peak.max(older.cpu_peak);
        self.gpu_peak = self.gpu_peak.max(older.gpu_peak);
        self.rcpu_avg = self.rcpu_avg.max(older.rcpu_avg);
        self.rcpu_peak = self.rcpu_peak.max(older.rcpu_peak);
        self.rmem_avg = self.rmem_avg.max(older.rmem_avg);
        self.rmem_peak = self.rmem_peak.max(older.rmem_peak);
    }
}

fn parse_cpuhog_record(row: &FreeCsvRow) -> Option<CpuhogJob> {
    let mut g = Getter::new(row);
    let tag = g.string("tag");
    let now = g.common_datetime("now");
    let job = CpuhogJob {
        id: g.job_mark("jobm"),
        host: g.string("host"),
        last_seen: now,
        expired: false,
        user: g.string("user"),
        cmd: g.string("cmd"),
        first_seen: now,
        start: g.common_datetime("start"),
        end: g.common_datetime("end"),
        cpu_peak: g.f64("cpu-peak"),
        gpu_peak: g.f64("gpu-peak"),
        rcpu_avg: g.f64("rcpu-avg"),
        rcpu_peak: g.f64("rcpu-peak"),
        rmem_avg: g.f64("rmem-avg"),
        rmem_peak: g.f64("rmem-peak"),
    };
    (g.success && tag == "cpuhog").then_some(job)
}

#[derive(Serialize, Debug, Clone, PartialEq)]
struct PerJobReport {
    #[serde(rename = "hostname")]
    host: String,
    id: u32,
    user: String,
    cmd: String,
    #[serde(rename = "started-on-or-before")]
    started_on_or_before: String,
    #[serde(rename = "first-violation")]
    first_violation: String,
    #[serde(rename = "last-seen")]
    last_seen: String,
    #[serde(rename = "cpu-peak")]
    cpu_peak: u32,
    #[serde(rename = "rcpu-avg")]
    rcpu_avg: u32,
    #[serde(rename = "rcpu-peak")]
    rcpu_peak: u32,
    #[serde(rename = "rmem-avg")]
    rmem_avg: u32,
    #[serde(rename = "rmem-peak")]
    rmem_peak: u32,
}

pub fn run(args: &CpuhogArgs, stdout: &mut dyn io::Write, stderr: &mut dyn io::Write) -> Result<()> {
    let verbose = args.verbose;
    let (from, to) = args.log.window()?;
    let state_file = args.log.state_file(args.state_file.as_deref(), STATE_FILENAME)?;
    let files = args.log.log_files(DATA_FILENAME, from, to)?;
    let now = options::parse_now(args.now.as_deref())?;

    let mut db = JobDatabase::<CpuhogJob>::read_or_empty(&state_file)?;
    if verbose {
        writeln!(stderr, "{}+{} records in database", db.active.len(), db.expired.len())?;
    }

    let logs = joblog::read_joblog_files(&files, verbose, stderr, parse_cpuhog_record)?;
    if verbose {
        writeln!(stderr, "{} hosts in log", logs.len())?;
        for l in &logs {
            writeln!(stderr, " {}: {} records", l.host, l.jobs.len())?;
        }
    }

    let mut new_jobs = 0;
    for job in logs.into_iter().flat_map(|h| h.jobs) {
        let (id, host, start, last_seen, expired) =
            (job.id, job.host.clone(), job.start, job.last_seen, job.expired);
        if db.ensure_job(id, &host, start, now, last_seen, expired, job) {
            new_jobs += 1;
        }
    }
    if verbose {
        writeln!(stderr, "{new_jobs} new jobs")?;
    }

    // This couples the purging to the window, so differently-windowed runs may purge differently.
    let purged = db.purge_jobs_before(from.min(to - Duration::days(2)));
    if verbose {
        writeln!(stderr, "{purged} jobs purged")?;
    }

    if args.json {
        let reports = create_report(&mut db, true, false);
        writeln!(stdout, "{}", serde_json::to_string(&reports)?)?;
    } else if args.summary {
        for r in create_report(&mut db, false, true) {
            writeln!(stdout, "{},{},{},{}", r.user, r.id, r.host, r.cpu_peak)?;
        }
    } else {
        for r in create_report(&mut db, false, true) {
            write_report(stdout, &r)?;
        }
    }

    db.write(&state_file)
}

// Reports for the jobs that have data from this run, sorted by host and id.  With `all_jobs` the
// jobs already reported are included.  With `mark` the jobs are marked as reported.
fn create_report(db: &mut JobDatabase<CpuhogJob>, all_jobs: bool, mark: bool) -> Vec<PerJobReport> {
    let mut reports = vec![];
    for state in db.states_mut() {
        if !all_jobs && state.is_reported {
            continue;
        }
        let Some(ref job) = state.aux else {
            continue;
        };
        reports.push(PerJobReport {
            host: state.host.clone(),
            id: state.id,
            user: job.user.clone(),
            cmd: job.cmd.clone(),
            started_on_or_before: state.started_on_or_before.format(DATETIME_FORMAT).to_string(),
            first_violation: state.first_violation.format(DATETIME_FORMAT).to_string(),
            last_seen: state.last_seen.format(DATETIME_FORMAT).to_string(),
            cpu_peak: (job.cpu_peak / 100.0) as u32,
            rcpu_avg: job.rcpu_avg as u32,
            rcpu_peak: job.rcpu_peak as u32,
            rmem_avg: job.rmem_avg as u32,
            rmem_peak: job.rmem_peak as u32,
        });
        if mark {
            state.is_reported = true;
        }
    }
    reports.sort_by(|a, b| (&a.host, a.id, &a.last_seen).cmp(&(&b.host, b.id, &b.last_seen)));
    reports
}

fn write_report(out: &mut dyn io::Write, r: &PerJobReport) -> Result<()> {
    write!(
        out,
        r#"New CPU hog detected (uses a lot of CPU and no GPU) on host "{}":
  Job#: {}
  User: {}
  Command: {}
  Started on or before: {}
  Violation first detected: {}
  Last Seen: {}
  Observed data:
    CPU peak = {} cores
    CPU utilization avg/peak = {}%, {}%
    Memory utilization avg/peak = {}%, {}%

"#,
        r.host,
        r.id,
        r.user,
        r.cmd,
        r.started_on_or_before,
        r.first_violation,
        r.last_seen,
        r.cpu_peak,
        r.rcpu_avg,
        r.rcpu_peak,
        r.rmem_avg,
        r.rmem_peak
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPUHOG_CSV: &str = "\
now=2023-09-06 12:00,jobm=100,user=joe,host=ml6,cmd=kited,cpu-peak=1274,gpu-peak=0,rcpu-avg=3,rcpu-peak=20,rmem-avg=1,rmem-peak=2,start=2023-09-06 07:35,end=2023-09-06 11:55,tag=cpuhog
now=2023-09-06 14:00,jobm=100>,user=joe,host=ml6,cmd=kited,cpu-peak=1500,gpu-peak=0,rcpu-avg=4,rcpu-peak=25,rmem-avg=1,rmem-peak=3,start=2023-09-06 07:35,end=2023-09-06 13:55,tag=cpuhog
now=2023-09-06 14:00,jobm=200,user=ann,host=ml3,cmd=python,cpu-peak=2615,gpu-peak=0,rcpu-avg=3,rcpu-peak=41,rmem-avg=12,rmem-peak=14,start=2023-09-06 12:10,end=2023-09-06 13:50,tag=cpuhog
now=2023-09-06 14:00,jobm=300,user=ann,host=ml3,cmd=python,cpu-peak=2615,gpu-peak=0,rcpu-avg=3,rcpu-peak=41,rmem-avg=12,rmem-peak=14,start=2023-09-06 12:10,end=2023-09-06 13:50,tag=deadweight
now=2023-09-06 14:00,jobm=400,user=ann,host=ml3,tag=cpuhog
";

    fn setup() -> (tempfile::TempDir, String) {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("2023/09/06");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(DATA_FILENAME), CPUHOG_CSV).unwrap();
        let root = tmp.path().to_str().unwrap().to_string();
        (tmp, root)
    }

    fn args(root: &str) -> CpuhogArgs {
        CpuhogArgs {
            log: LogArgs {
                state_dir: Some(root.to_string()),
                from: "2023-09-06".to_string(),
                to: Some("2023-09-07".to_string()),
                files: vec![],
            },
            now: Some("2023-09-07 15:00".to_string()),
            ..Default::default()
        }
    }

    fn run_to_string(args: &CpuhogArgs) -> String {
        let mut out = vec![];
        run(args, &mut out, &mut io::sink()).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_plain_report() {
        let (_tmp, root) = setup();
        let out = run_to_string(&args(&root));
        let expected_ml6 = r#"New CPU hog detected (uses a lot of CPU and no GPU) on host "ml6":
  Job#: 100
  User: joe
  Command: kited
  Started on or before: 2023-09-06 07:35
  Violation first detected: 2023-09-07 15:00
  Last Seen: 2023-09-06 14:00
  Observed data:
    CPU peak = 15 cores
    CPU utilization avg/peak = 4%, 25%
    Memory utilization avg/peak = 1%, 3%

"#;
        assert!(out.starts_with(r#"New CPU hog detected (uses a lot of CPU and no GPU) on host "ml3":"#));
        assert!(out.ends_with(expected_ml6));
        assert!(out.matches("New CPU hog").count() == 2);

        // Everything has been reported, so a second run has nothing to say.
        assert!(run_to_string(&args(&root)) == "");

        let state = std::fs::read_to_string(std::path::Path::new(&root).join(STATE_FILENAME)).unwrap();
        assert!(state.lines().count() == 2);
        assert!(state.lines().all(|l| l.contains("isReported=true")));
    }

    #[test]
    fn test_summary_and_json() {
        let (_tmp, root) = setup();
        let json = CpuhogArgs { json: true, ..args(&root) };
        let out = run_to_string(&json);
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        let jobs = v.as_array().unwrap();
        assert!(jobs.len() == 2);
        assert!(jobs[0]["hostname"] == "ml3");
        assert!(jobs[0]["cpu-peak"] == 26);
        assert!(jobs[1]["id"] == 100);
        assert!(jobs[1]["started-on-or-before"] == "2023-09-06 07:35");

        // JSON output does not mark anything as reported.
        let summary = CpuhogArgs { summary: true, ..args(&root) };
        assert_eq!(run_to_string(&summary), "ann,200,ml3,26\njoe,100,ml6,15\n");
        assert_eq!(run_to_string(&summary), "");

        // But it does include reported jobs.
        let out = run_to_string(&json);
        assert!(serde_json::from_str::<serde_json::Value>(&out).unwrap().as_array().unwrap().len() == 2);
    }

    #[test]
    fn test_explicit_files() {
        let (tmp, root) = setup();
        let file = format!("{root}/2023/09/06/{DATA_FILENAME}");
        let state_file = tmp.path().join("elsewhere.csv");
        let a = CpuhogArgs {
            log: LogArgs {
                state_dir: None,
                from: "2023-09-06".to_string(),
                to: Some("2023-09-07".to_string()),
                files: vec![file],
            },
            state_file: Some(state_file.to_str().unwrap().to_string()),
            summary: true,
            now: Some("2023-09-07 15:00".to_string()),
            ..Default::default()
        };
        assert_eq!(run_to_string(&a), "ann,200,ml3,26\njoe,100,ml6,15\n");
        assert!(state_file.exists());

        let a = CpuhogArgs { state_file: None, ..a };
        let e = run(&a, &mut io::sink(), &mut io::sink()).unwrap_err();
        assert!(e.to_string() == "If --state-file is not present then --state-dir must be");

        let a = CpuhogArgs { now: Some("yesterday".to_string()), ..args(&root) };
        assert!(run(&a, &mut io::sink(), &mut io::sink()).is_err());
    }
}
