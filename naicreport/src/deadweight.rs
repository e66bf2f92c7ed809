// The `ml-deadweight` report: zombie, defunct and hung jobs on the ML nodes.
//
// The deadweight analysis runs often and over a window longer than its interval, so the same job
// shows up in `deadweight.csv` many times.  As for `ml-cpuhog`, the logs are merged with the saved
// state in `deadweight-state.csv` so that each job is reported once.

use crate::joblog::{self, Job};
use crate::jobstate::JobDatabase;
use crate::options::{self, LogArgs, DATETIME_FORMAT};

use anyhow::Result;
use chrono::Duration;
use clap::Args;
use serde::Serialize;
use sonarlog::{FreeCsvRow, Getter, Timestamp};
use std::io;

pub const STATE_FILENAME: &str = "deadweight-state.csv";
pub const DATA_FILENAME: &str = "deadweight.csv";

#[derive(Args, Debug, Default, Clone)]
pub struct DeadweightArgs {
    #[command(flatten)]
    pub log: LogArgs,

    /// Store the report state in this file, default <state-dir>/deadweight-state.csv
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
pub struct DeadweightJob {
    id: u32,
    host: String,
    last_seen: Timestamp,
    expired: bool,
    user: String,
    cmd: String,
    first_seen: Timestamp,
    start: Timestamp,
    end: Timestamp,
}

impl Job for DeadweightJob {
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

    fn integrate(&mut self, older: &DeadweightJob) {
        self.last_seen = self.last_seen.max(older.last_seen);
        self.first_seen = self.first_seen.min(older.first_seen);
        self.start = self.start.min(older.start);
        self.end = self.end.max(older.end);
    }
}

// Older logs use the tag "bughunt".
fn parse_deadweight_record(row: &FreeCsvRow) -> Option<DeadweightJob> {
    let mut g = Getter::new(row);
    let tag = g.string("tag");
    let now = g.common_datetime("now");
    let job = DeadweightJob {
        id: g.job_mark("jobm"),
        host: g.string("host"),
        last_seen: now,
        expired: false,
        user: g.string("user"),
        cmd: g.string("cmd"),
        first_seen: now,
        start: g.common_datetime("start"),
        end: g.common_datetime("end"),
    };
    (g.success && (tag == "deadweight" || tag == "bughunt")).then_some(job)
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
}

pub fn run(args: &DeadweightArgs, stdout: &mut dyn io::Write, stderr: &mut dyn io::Write) -> Result<()> {
    let verbose = args.verbose;
    let (from, to) = args.log.window()?;
    let state_file = args.log.state_file(args.state_file.as_deref(), STATE_FILENAME)?;
    let files = args.log.log_files(DATA_FILENAME, from, to)?;
    let now = options::parse_now(args.now.as_deref())?;

    let mut db = JobDatabase::<DeadweightJob>::read_or_empty(&state_file)?;
    if verbose {
        writeln!(stderr, "{}+{} records in database", db.active.len(), db.expired.len())?;
    }

    let logs = joblog::read_joblog_files(&files, verbose, stderr, parse_deadweight_record)?;
    if verbose {
        writeln!(stderr, "{} hosts in log", logs.len())?;
    }

    let mut new_jobs = 0;
    for job in logs.into_iter().flat_map(|h| h.jobs) {
        let (id, host, start, last_seen, expired) =
            (job.id, job.host.clone(), job.start, job.last_seen, job.expired);
        if db.ensure_job(id, &host, start, now, last_seen, expired, job) {
            new_jobs += 1;
        }
    }
    let purged = db.purge_jobs_before(from.min(to - Duration::days(2)));
    if verbose {
        writeln!(stderr, "{new_jobs} new jobs, {purged} jobs purged")?;
    }

    if args.json {
        let reports = create_report(&mut db, true, false);
        writeln!(stdout, "{}", serde_json::to_string(&reports)?)?;
    } else if args.summary {
        for r in create_report(&mut db, false, true) {
            writeln!(stdout, "{},{},{}", r.user, r.id, r.host)?;
        }
    } else {
        for r in create_report(&mut db, false, true) {
            write!(
                stdout,
                r#"New pointless job detected (zombie, defunct, or hung) on host "{}":
  Job#: {}
  User: {}
  Command: {}
  Started on or before: {}
  Violation first detected: {}
  Last seen: {}

"#,
                r.host, r.id, r.user, r.cmd, r.started_on_or_before, r.first_violation, r.last_seen
            )?;
        }
    }

    db.write(&state_file)
}

fn create_report(db: &mut JobDatabase<DeadweightJob>, all_jobs: bool, mark: bool) -> Vec<PerJobReport> {
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
        });
        if mark {
            state.is_reported = true;
        }
    }
    reports.sort_by(|a, b| (&a.host, a.id, &a.last_seen).cmp(&(&b.host, b.id, &b.last_seen)));
    reports
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADWEIGHT_CSV: &str = "\
now=2023-09-06 12:00,jobm=500<,user=joe,host=ml6,cmd=sleep,start=2023-09-06 07:35,end=2023-09-06 11:55,tag=deadweight
now=2023-09-06 14:00,jobm=600,user=ann,host=ml3,cmd=python,start=2023-09-06 12:10,end=2023-09-06 13:50,tag=bughunt
now=2023-09-06 14:00,jobm=700,user=ann,host=ml3,cmd=python,start=2023-09-06 12:10,end=2023-09-06 13:50,tag=cpuhog
now=2023-09-06 14:00,jobm=800,host=ml3,tag=deadweight
";

    const LATER_CSV: &str = "\
now=2023-09-07 09:00,jobm=500<,user=joe,host=ml6,cmd=sleep,start=2023-09-06 07:30,end=2023-09-07 08:55,tag=deadweight
";

    fn setup() -> (tempfile::TempDir, String) {
        let tmp = tempfile::TempDir::new().unwrap();
        for (day, text) in [("2023/09/06", DEADWEIGHT_CSV), ("2023/09/07", LATER_CSV)] {
            let dir = tmp.path().join(day);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(DATA_FILENAME), text).unwrap();
        }
        let root = tmp.path().to_str().unwrap().to_string();
        (tmp, root)
    }

    fn args(root: &str) -> DeadweightArgs {
        DeadweightArgs {
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

    fn run_to_string(args: &DeadweightArgs) -> String {
        let mut out = vec![];
        run(args, &mut out, &mut io::sink()).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_plain_report() {
        let (_tmp, root) = setup();
        let out = run_to_string(&args(&root));
        let expected_ml6 = r#"New pointless job detected (zombie, defunct, or hung) on host "ml6":
  Job#: 500
  User: joe
  Command: sleep
  Started on or before: 2023-09-06 07:30
  Violation first detected: 2023-09-07 15:00
  Last seen: 2023-09-07 09:00

"#;
        assert!(out.starts_with(r#"New pointless job detected (zombie, defunct, or hung) on host "ml3":"#));
        assert!(out.contains("  Job#: 600\n"));
        assert!(out.ends_with(expected_ml6));
        assert!(out.matches("New pointless job").count() == 2);
        assert!(run_to_string(&args(&root)) == "");

        let state_file = std::path::Path::new(&root).join(STATE_FILENAME);
        let state = std::fs::read_to_string(state_file).unwrap();
        assert!(state.lines().count() == 2);
        assert!(state.lines().all(|l| l.contains("isReported=true")));
    }

    #[test]
    fn test_summary_and_json() {
        let (_tmp, root) = setup();
        let json = DeadweightArgs { json: true, ..args(&root) };
        let v: serde_json::Value = serde_json::from_str(&run_to_string(&json)).unwrap();
        let jobs = v.as_array().unwrap();
        assert!(jobs.len() == 2);
        assert!(jobs[0]["hostname"] == "ml3");
        assert!(jobs[0]["cmd"] == "python");
        assert!(jobs[1]["id"] == 500);
        assert!(jobs[1]["last-seen"] == "2023-09-07 09:00");

        let summary = DeadweightArgs { summary: true, ..args(&root) };
        assert_eq!(run_to_string(&summary), "ann,600,ml3\njoe,500,ml6\n");
        assert_eq!(run_to_string(&summary), "");
    }

    #[test]
    fn test_explicit_files() {
        let (tmp, root) = setup();
        let state_file = tmp.path().join("dw.csv");
        let a = DeadweightArgs {
            log: LogArgs {
                state_dir: None,
                from: "2023-09-06".to_string(),
                to: Some("2023-09-07".to_string()),
                files: vec![format!("{root}/2023/09/06/{DATA_FILENAME}")],
            },
            state_file: Some(state_file.to_str().unwrap().to_string()),
            summary: true,
            now: Some("2023-09-07 15:00".to_string()),
            ..Default::default()
        };
        assert_eq!(run_to_string(&a), "ann,600,ml3\njoe,500,ml6\n");
        assert!(state_file.exists());
        assert!(!std::path::Path::new(&root).join(STATE_FILENAME).exists());
    }
}
