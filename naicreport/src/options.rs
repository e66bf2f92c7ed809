// Options shared by the report commands: where the job logs are and the window of time to look at.

use crate::joblog;

use anyhow::{bail, Result};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::Args;
use sonarlog::Timestamp;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// The format of times in the job logs and the reports.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Args, Debug, Default, Clone)]
pub struct LogArgs {
    /// Root directory of the job logs and the state file
    #[arg(long, alias = "data-path")]
    pub state_dir: Option<String>,

    /// Start date of the log window, YYYY-MM-DD or Nd (days ago) or Nw (weeks ago)
    #[arg(long, short, default_value = "1d")]
    pub from: String,

    /// End date of the log window, same syntax, default today
    #[arg(long, short)]
    pub to: Option<String>,

    /// Explicit job log files, instead of searching the state directory
    #[arg(last = true)]
    pub files: Vec<String>,
}

impl LogArgs {
    /// The window `[from, to)`, where `to` is rounded up to the start of the next day so that all of
    /// the end date is included.

    pub fn window(&self) -> Result<(Timestamp, Timestamp)> {
        let from = match parse_relative_date(&self.from) {
            Ok(t) => t,
            Err(_) => bail!("Invalid --from argument {}", self.from),
        };
        let to = match self.to {
            Some(ref s) => match parse_relative_date(s) {
                Ok(t) => t,
                Err(_) => bail!("Invalid --to argument {s}"),
            },
            None => sonarlog::now(),
        };
        let to = sonarlog::truncate_to_day(to + Duration::days(1));
        if from > to {
            bail!("The --from time is greater than the --to time");
        }
        Ok((from, to))
    }

    /// The report's state file: `explicit` if present, otherwise `name` in the state directory.

    pub fn state_file(&self, explicit: Option<&str>, name: &str) -> Result<PathBuf> {
        match (explicit, &self.state_dir) {
            (Some(f), _) => Ok(PathBuf::from(f)),
            (None, Some(d)) => Ok(Path::new(d).join(name)),
            (None, None) => bail!("If --state-file is not present then --state-dir must be"),
        }
    }

    /// The explicit job log files, or else the files called `name` in the state directory for the
    /// window.

    pub fn log_files(&self, name: &str, from: Timestamp, to: Timestamp) -> Result<Vec<String>> {
        if !self.files.is_empty() {
            return Ok(self.files.clone());
        }
        let Some(ref d) = self.state_dir else {
            bail!("No file arguments provided")
        };
        match joblog::find_joblog_files(d, name, from, to) {
            Ok(files) => Ok(files),
            Err(e) => bail!("Could not enumerate files: {e}"),
        }
    }
}

/// The argument to --now if present, otherwise the actual time.

pub fn parse_now(now: Option<&str>) -> Result<Timestamp> {
    match now {
        Some(s) => match NaiveDateTime::parse_from_str(s, DATETIME_FORMAT) {
            Ok(t) => Ok(Utc.from_utc_datetime(&t)),
            Err(_) => bail!("Argument to --now could not be parsed: {s}"),
        },
        None => Ok(sonarlog::now()),
    }
}

// YYYY-MM-DD, or Nd, or Nw.
pub fn parse_relative_date(s: &str) -> Result<Timestamp> {
    if let Some(n) = s.strip_suffix('d') {
        let Ok(k) = i64::from_str(n) else {
            bail!("Invalid date")
        };
        return Ok(sonarlog::truncate_to_day(sonarlog::now() - Duration::days(k)));
    }
    if let Some(n) = s.strip_suffix('w') {
        let Ok(k) = i64::from_str(n) else {
            bail!("Invalid date")
        };
        return Ok(sonarlog::truncate_to_day(sonarlog::now() - Duration::weeks(k)));
    }
    let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") else {
        bail!("Invalid date syntax")
    };
    match sonarlog::timestamp_from_ymdhms(d.year(), d.month(), d.day(), 0, 0, 0) {
        Some(t) => Ok(t),
        None => bail!("Invalid date"),
    }
}

#[test]
fn test_window() {
    let args = LogArgs {
        from: "2023-09-06".to_string(),
        to: Some("2023-09-07".to_string()),
        ..Default::default()
    };
    let (from, to) = args.window().unwrap();
    assert!(from == sonarlog::timestamp_from_ymdhms(2023, 9, 6, 0, 0, 0).unwrap());
    assert!(to == sonarlog::timestamp_from_ymdhms(2023, 9, 8, 0, 0, 0).unwrap());

    let args = LogArgs {
        from: "3d".to_string(),
        ..Default::default()
    };
    let (from, to) = args.window().unwrap();
    assert!(to - from == Duration::days(4));

    let args = LogArgs {
        from: "2023-13-01".to_string(),
        ..Default::default()
    };
    assert!(args.window().unwrap_err().to_string() == "Invalid --from argument 2023-13-01");
    assert!(parse_relative_date("xd").is_err());
}

#[test]
fn test_state_file_and_now() {
    let args = LogArgs { state_dir: Some("/s".to_string()), ..Default::default() };
    assert!(args.state_file(None, "x.csv").unwrap() == Path::new("/s/x.csv"));
    assert!(args.state_file(Some("/t/y.csv"), "x.csv").unwrap() == Path::new("/t/y.csv"));
    let e = LogArgs::default().state_file(None, "x.csv").unwrap_err();
    assert!(e.to_string() == "If --state-file is not present then --state-dir must be");
    assert!(LogArgs::default().log_files("x.csv", sonarlog::now(), sonarlog::now()).is_err());

    let t = parse_now(Some("2023-09-07 15:00")).unwrap();
    assert!(t == sonarlog::timestamp_from_ymdhms(2023, 9, 7, 15, 0, 0).unwrap());
    assert!(parse_now(Some("yesterday")).is_err());
}
