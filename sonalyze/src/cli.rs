// Command line definitions for `sonalyze`.  The same definitions parse the command lines the daemon
// builds from query strings, so everything here must be usable without a terminal.

use crate::ini::Ini;

use anyhow::{bail, Result};
use chrono::{Datelike, NaiveDate};
use clap::{Args, Parser, Subcommand};
use sonarlog::Timestamp;
use std::str::FromStr;
use std::time;

#[derive(Parser, Debug)]
#[command(name = "sonalyze", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print information about jobs
    Jobs(JobArgs),

    /// Print information about system load
    Load(LoadArgs),

    /// Print information about when nodes were up and down
    Uptime(UptimeArgs),

    /// Print the per-process profile of a single job
    Profile(ProfileArgs),

    /// Print the sample records, after filtering
    Parse(ParseArgs),

    /// Print information about the log files and the records in them
    Metadata(MetadataArgs),

    /// Add sample or sysinfo data from stdin to the store
    Add(AddArgs),

    /// Serve analysis queries and data uploads over HTTP
    Daemon(DaemonArgs),
}

impl Commands {
    /// The data source arguments, for the verbs that read the store.

    pub fn source_args_mut(&mut self) -> Option<&mut SourceArgs> {
        match self {
            Commands::Jobs(a) => Some(&mut a.source),
            Commands::Load(a) => Some(&mut a.source),
            Commands::Uptime(a) => Some(&mut a.source),
            Commands::Profile(a) => Some(&mut a.source),
            Commands::Parse(a) => Some(&mut a.source),
            Commands::Metadata(a) => Some(&mut a.source),
            Commands::Add(_) | Commands::Daemon(_) => None,
        }
    }
}

#[derive(Args, Debug, Default, Clone)]
pub struct SourceArgs {
    /// Select a remote `sonalyze daemon` to run the query, eg https://naic-monitor.uio.no
    #[arg(long)]
    pub remote: Option<String>,

    /// Select the cluster to query, with --remote
    #[arg(long)]
    pub cluster: Option<String>,

    /// File with a single `user:password` line for the remote [default: $SONALYZE_AUTH]
    #[arg(long)]
    pub auth_file: Option<String>,

    /// Select the root directory for log files of a cluster [default: $SONAR_ROOT]
    #[arg(long, alias = "data-dir")]
    pub data_path: Option<String>,

    /// Select records by this time and later.  Format can be YYYY-MM-DD, or Nd or Nw
    /// signifying N days or weeks ago [default: 1d, ie 1 day ago]
    #[arg(long, short)]
    pub from: Option<String>,

    /// Select records by this time and earlier.  Format can be YYYY-MM-DD, or Nd or Nw
    /// signifying N days or weeks ago [default: now]
    #[arg(long, short)]
    pub to: Option<String>,

    /// Select this host name or host pattern (repeatable) [default: all]
    #[arg(long)]
    pub host: Vec<String>,

    /// Log file names (overrides --data-path)
    #[arg(last = true)]
    pub logfiles: Vec<String>,
}

impl SourceArgs {
    /// True if the command is to be run by a remote daemon.

    pub fn is_remote(&self) -> bool {
        self.remote.is_some() || self.cluster.is_some()
    }

    /// Fill in missing data source settings from the [data-source] section of the user's defaults
    /// and check that the result is consistent.  Explicit log files or data path select local data;
    /// explicit remoting arguments select remote data; otherwise the defaults decide, but they
    /// can't name both.

    pub fn apply_defaults(&mut self, ini: Option<&Ini>, env_auth: bool) -> Result<()> {
        const S: &str = "data-source";
        let get = |name: &str| ini.and_then(|ini| ini.get(S, name)).map(|s| s.to_string());
        let fill = |slot: &mut Option<String>, name: &str| {
            if slot.is_none() {
                *slot = get(name);
            }
        };
        if !self.logfiles.is_empty() || self.data_path.is_some() {
            // Local
        } else if self.is_remote() || self.auth_file.is_some() || env_auth {
            fill(&mut self.remote, "remote");
            if !env_auth {
                fill(&mut self.auth_file, "auth-file");
            }
            fill(&mut self.cluster, "cluster");
        } else {
            let remoting_defaults =
                get("remote").is_some() || get("auth-file").is_some() || get("cluster").is_some();
            if remoting_defaults && get("data-dir").is_some() {
                bail!("No data source, but defaults for both remoting and data directory");
            }
            fill(&mut self.data_path, "data-dir");
            if self.data_path.is_none() {
                fill(&mut self.remote, "remote");
                if !env_auth {
                    fill(&mut self.auth_file, "auth-file");
                }
                fill(&mut self.cluster, "cluster");
            }
        }
        fill(&mut self.from, "from");
        fill(&mut self.to, "to");

        if self.is_remote() {
            if self.remote.is_none() || self.cluster.is_none() {
                bail!("--remote and --cluster must be used together");
            }
            if self.data_path.is_some() {
                bail!("--data-path may not be used with --remote or --cluster");
            }
            if !self.logfiles.is_empty() {
                bail!("-- logfile ... may not be used with --remote or --cluster");
            }
        }
        Ok(())
    }

    /// The inclusive time window, defaulting to the last day.

    pub fn window(&self) -> Result<(Timestamp, Timestamp)> {
        let from = match self.from {
            Some(ref s) => match parse_time(s, false) {
                Ok(t) => t,
                Err(_) => bail!("Invalid --from argument {s}"),
            },
            None => sonarlog::now() - chrono::Duration::days(1),
        };
        let to = match self.to {
            Some(ref s) => match parse_time(s, true) {
                Ok(t) => t,
                Err(_) => bail!("Invalid --to argument {s}"),
            },
            None => sonarlog::now(),
        };
        if from > to {
            bail!("The --from time is greater than the --to time");
        }
        Ok((from, to))
    }
}

#[derive(Args, Debug, Default, Clone)]
pub struct RecordFilterArgs {
    /// Select records for this user, "-" for all (repeatable) [default: command dependent]
    #[arg(long, short)]
    pub user: Vec<String>,

    /// Exclude records where the user name equals this string (repeatable) [default: none]
    #[arg(long)]
    pub exclude_user: Vec<String>,

    /// Select records with this command name (repeatable) [default: all]
    #[arg(long)]
    pub command: Vec<String>,

    /// Exclude records where the command name equals this string (repeatable) [default: none]
    #[arg(long)]
    pub exclude_command: Vec<String>,

    /// Select this job (repeatable) [default: all]
    #[arg(long, short)]
    pub job: Vec<String>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct ConfigArgs {
    /// File containing JSON data with system information, for when we want to print or use
    /// system-relative values [default: none]
    #[arg(long)]
    pub config_file: Option<String>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct QueryArgs {
    /// Select rows by this query expression, eg `user = "joe" and CpuAvgPct > 50` (see --fmt=help
    /// for the fields)
    #[arg(long = "query", alias = "q")]
    pub query: Option<String>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct FormatArgs {
    /// Select fields and output format, or `help` for help [default: command dependent]
    #[arg(long)]
    pub fmt: Option<String>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct MetaArgs {
    /// Print useful statistics about the input to stderr, then terminate
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,

    /// Turn off default filtering, and print unformatted data (for developers)
    #[arg(long, default_value_t = false)]
    pub raw: bool,
}

#[derive(Args, Debug, Default, Clone)]
pub struct JobArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[command(flatten)]
    pub records: RecordFilterArgs,

    #[command(flatten)]
    pub filter: JobFilterArgs,

    #[command(flatten)]
    pub query: QueryArgs,

    #[command(flatten)]
    pub config: ConfigArgs,

    /// Print at most these many most recent jobs per user [default: all]
    #[arg(long, short)]
    pub numjobs: Option<usize>,

    #[command(flatten)]
    pub format: FormatArgs,

    #[command(flatten)]
    pub meta: MetaArgs,
}

#[derive(Args, Debug, Clone)]
pub struct JobFilterArgs {
    /// The data come from a batch system and jobs may span multiple hosts
    #[arg(long, short, default_value_t = false)]
    pub batch: bool,

    /// Select only jobs with at least this many samples [default: 2]
    #[arg(long)]
    pub min_samples: Option<usize>,

    /// Select only jobs with at least this much average CPU use (100=1 full CPU)
    #[arg(long, default_value_t = 0)]
    pub min_cpu_avg: usize,

    /// Select only jobs with at least this much peak CPU use (100=1 full CPU)
    #[arg(long, default_value_t = 0)]
    pub min_cpu_peak: usize,

    /// Select only jobs with at most this much average CPU use (100=1 full CPU)
    #[arg(long, default_value_t = 100000000)]
    pub max_cpu_avg: usize,

    /// Select only jobs with at most this much peak CPU use (100=1 full CPU)
    #[arg(long, default_value_t = 100000000)]
    pub max_cpu_peak: usize,

    /// Select only jobs with at least this much relative average CPU use (100=all cpus)
    #[arg(long, default_value_t = 0)]
    pub min_rcpu_avg: usize,

    /// Select only jobs with at least this much relative peak CPU use (100=all cpus)
    #[arg(long, default_value_t = 0)]
    pub min_rcpu_peak: usize,

    /// Select only jobs with at most this much relative average CPU use (100=all cpus)
    #[arg(long, default_value_t = 100)]
    pub max_rcpu_avg: usize,

    /// Select only jobs with at most this much relative peak CPU use (100=all cpus)
    #[arg(long, default_value_t = 100)]
    pub max_rcpu_peak: usize,

    /// Select only jobs with at least this much average main memory use (GB)
    #[arg(long, default_value_t = 0)]
    pub min_mem_avg: usize,

    /// Select only jobs with at least this much peak main memory use (GB)
    #[arg(long, default_value_t = 0)]
    pub min_mem_peak: usize,

    /// Select only jobs with at least this much relative average main memory use (100=all memory)
    #[arg(long, default_value_t = 0)]
    pub min_rmem_avg: usize,

    /// Select only jobs with at least this much relative peak main memory use (100=all memory)
    #[arg(long, default_value_t = 0)]
    pub min_rmem_peak: usize,

    /// Select only jobs with at least this much average GPU use (100=1 full GPU card)
    #[arg(long, default_value_t = 0)]
    pub min_gpu_avg: usize,

    /// Select only jobs with at least this much peak GPU use (100=1 full GPU card)
    #[arg(long, default_value_t = 0)]
    pub min_gpu_peak: usize,

    /// Select only jobs with at most this much average GPU use (100=1 full GPU card)
    #[arg(long, default_value_t = 100000000)]
    pub max_gpu_avg: usize,

    /// Select only jobs with at most this much peak GPU use (100=1 full GPU card)
    #[arg(long, default_value_t = 100000000)]
    pub max_gpu_peak: usize,

    /// Select only jobs with at least this much relative average GPU use (100=all cards)
    #[arg(long, default_value_t = 0)]
    pub min_rgpu_avg: usize,

    /// Select only jobs with at least this much relative peak GPU use (100=all cards)
    #[arg(long, default_value_t = 0)]
    pub min_rgpu_peak: usize,

    /// Select only jobs with at most this much relative average GPU use (100=all cards)
    #[arg(long, default_value_t = 100)]
    pub max_rgpu_avg: usize,

    /// Select only jobs with at most this much relative peak GPU use (100=all cards)
    #[arg(long, default_value_t = 100)]
    pub max_rgpu_peak: usize,

    /// Select only jobs with at least this much average GPU memory use (GB)
    #[arg(long, default_value_t = 0)]
    pub min_gpumem_avg: usize,

    /// Select only jobs with at least this much peak GPU memory use (GB)
    #[arg(long, default_value_t = 0)]
    pub min_gpumem_peak: usize,

    /// Select only jobs with at least this much relative average GPU memory use (100=all cards)
    #[arg(long, default_value_t = 0)]
    pub min_rgpumem_avg: usize,

    /// Select only jobs with at least this much relative peak GPU memory use (100=all cards)
    #[arg(long, default_value_t = 0)]
    pub min_rgpumem_peak: usize,

    /// Select only jobs with at least this much runtime, format `WwDdHhMm`, all parts optional [default: 0m]
    #[arg(long, value_parser = run_time)]
    pub min_runtime: Option<chrono::Duration>,

    /// Select only jobs with no GPU use
    #[arg(long, default_value_t = false)]
    pub no_gpu: bool,

    /// Select only jobs with some GPU use
    #[arg(long, default_value_t = false)]
    pub some_gpu: bool,

    /// Select only jobs that have run to completion
    #[arg(long, default_value_t = false)]
    pub completed: bool,

    /// Select only jobs that are still running
    #[arg(long, default_value_t = false)]
    pub running: bool,

    /// Select only zombie jobs (usually these are still running)
    #[arg(long, default_value_t = false)]
    pub zombie: bool,
}

impl Default for JobFilterArgs {
    fn default() -> Self {
        JobFilterArgs {
            batch: false,
            min_samples: None,
            min_cpu_avg: 0,
            min_cpu_peak: 0,
            max_cpu_avg: 100000000,
            max_cpu_peak: 100000000,
            min_rcpu_avg: 0,
            min_rcpu_peak: 0,
            max_rcpu_avg: 100,
            max_rcpu_peak: 100,
            min_mem_avg: 0,
            min_mem_peak: 0,
            min_rmem_avg: 0,
            min_rmem_peak: 0,
            min_gpu_avg: 0,
            min_gpu_peak: 0,
            max_gpu_avg: 100000000,
            max_gpu_peak: 100000000,
            min_rgpu_avg: 0,
            min_rgpu_peak: 0,
            max_rgpu_avg: 100,
            max_rgpu_peak: 100,
            min_gpumem_avg: 0,
            min_gpumem_peak: 0,
            min_rgpumem_avg: 0,
            min_rgpumem_peak: 0,
            min_runtime: None,
            no_gpu: false,
            some_gpu: false,
            completed: false,
            running: false,
            zombie: false,
        }
    }
}

#[derive(Args, Debug, Default, Clone)]
pub struct LoadArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[command(flatten)]
    pub records: RecordFilterArgs,

    /// Bucket and average records hourly, cf --daily and --none [default]
    #[arg(long)]
    pub hourly: bool,

    /// Bucket and average records daily
    #[arg(long)]
    pub daily: bool,

    /// Do not bucket and average records
    #[arg(long)]
    pub none: bool,

    /// Print records for all times (after bucketing), cf --last [default]
    #[arg(long)]
    pub all: bool,

    /// Print records for the last time instant (after bucketing)
    #[arg(long)]
    pub last: bool,

    #[command(flatten)]
    pub query: QueryArgs,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub format: FormatArgs,

    #[command(flatten)]
    pub meta: MetaArgs,
}

#[derive(Args, Debug, Default, Clone)]
pub struct UptimeArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// The sampling interval in minutes; a gap of more than twice this is downtime [default: 5]
    #[arg(long)]
    pub interval: Option<u64>,

    /// Show only times when systems are up
    #[arg(long)]
    pub only_up: bool,

    /// Show only times when systems are down
    #[arg(long)]
    pub only_down: bool,

    #[command(flatten)]
    pub query: QueryArgs,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub format: FormatArgs,

    #[command(flatten)]
    pub meta: MetaArgs,
}

#[derive(Args, Debug, Default, Clone)]
pub struct ProfileArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[command(flatten)]
    pub records: RecordFilterArgs,

    #[command(flatten)]
    pub format: FormatArgs,

    #[command(flatten)]
    pub meta: MetaArgs,
}

#[derive(Args, Debug, Default, Clone)]
pub struct ParseArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[command(flatten)]
    pub records: RecordFilterArgs,

    #[command(flatten)]
    pub query: QueryArgs,

    #[command(flatten)]
    pub format: FormatArgs,

    #[command(flatten)]
    pub meta: MetaArgs,
}

#[derive(Args, Debug, Default, Clone)]
pub struct MetadataArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Print the names of the files that would be read
    #[arg(long)]
    pub files: bool,

    /// Print the earliest and latest record time for each host
    #[arg(long)]
    pub bounds: bool,

    #[command(flatten)]
    pub format: FormatArgs,

    #[command(flatten)]
    pub meta: MetaArgs,
}

#[derive(Args, Debug, Default, Clone)]
pub struct AddArgs {
    /// The input is sonar free-CSV sample data
    #[arg(long)]
    pub sample: bool,

    /// The input is a sysinfo JSON object
    #[arg(long)]
    pub sysinfo: bool,

    /// Select a remote `sonalyze daemon` to receive the data
    #[arg(long)]
    pub remote: Option<String>,

    /// Select the cluster to add to, with --remote
    #[arg(long)]
    pub cluster: Option<String>,

    /// File with a single `user:password` line for the remote [default: $SONALYZE_AUTH]
    #[arg(long)]
    pub auth_file: Option<String>,

    /// Select the root directory for log files of a cluster
    #[arg(long, alias = "data-dir")]
    pub data_path: Option<String>,

    #[command(flatten)]
    pub meta: MetaArgs,
}

#[derive(Args, Debug, Default, Clone)]
pub struct DaemonArgs {
    /// The directory holding data/, scripts/ and cluster-aliases.json
    #[arg(long, alias = "jobanalyzer-path")]
    pub jobanalyzer_dir: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8087)]
    pub port: u16,

    /// Password file (`user:password` per line) for analysis queries [default: no authentication]
    #[arg(long, alias = "password-file")]
    pub analysis_auth: Option<String>,

    /// Password file (`user:password` per line) for data uploads [default: no authentication]
    #[arg(long)]
    pub upload_auth: Option<String>,

    /// Require the upload user name to equal the cluster name
    #[arg(long)]
    pub match_user_and_cluster: bool,

    /// Cache parsed log files up to this size, eg 512M or 4G [default: no cache]
    #[arg(long, value_parser = cache_size)]
    pub cache: Option<usize>,

    /// Consume data from this Kafka broker, eg localhost:9092
    #[arg(long)]
    pub kafka: Option<String>,

    /// Log more
    #[arg(long, short)]
    pub verbose: bool,
}

// The command arg parsers don't need to include the string being parsed because the error generated
// by clap includes that.

// YYYY-MM-DD, but with a little (too much?) flexibility.  Or Nd, Nw.
pub fn parse_time(s: &str, end_of_day: bool) -> Result<Timestamp> {
    if let Some(n) = s.strip_suffix('d') {
        if let Ok(k) = usize::from_str(n) {
            Ok(sonarlog::now() - chrono::Duration::days(k as i64))
        } else {
            bail!("Invalid date")
        }
    } else if let Some(n) = s.strip_suffix('w') {
        if let Ok(k) = usize::from_str(n) {
            Ok(sonarlog::now() - chrono::Duration::weeks(k as i64))
        } else {
            bail!("Invalid date")
        }
    } else {
        let parts = s.split('-').map(usize::from_str).collect::<Result<Vec<usize>, _>>();
        let Ok(vals) = parts else {
            bail!("Invalid date syntax");
        };
        if vals.len() != 3 {
            bail!("Invalid date syntax");
        }
        let Some(d) = NaiveDate::from_ymd_opt(vals[0] as i32, vals[1] as u32, vals[2] as u32) else {
            bail!("Invalid date");
        };
        let (h, m, s) = if end_of_day { (23, 59, 59) } else { (0, 0, 0) };
        match sonarlog::timestamp_from_ymdhms(d.year(), d.month(), d.day(), h, m, s) {
            Some(t) => Ok(t),
            None => bail!("Invalid date"),
        }
    }
}

// This is WwDdHhMm with all parts optional but at least one part required.  There is possibly too
// much flexibility here, as the parts can be in any order.
pub fn run_time(s: &str) -> Result<chrono::Duration> {
    let mut weeks = 0u64;
    let mut days = 0u64;
    let mut hours = 0u64;
    let mut minutes = 0u64;
    let mut have_weeks = false;
    let mut have_days = false;
    let mut have_hours = false;
    let mut have_minutes = false;
    let mut ds = "".to_string();
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            ds.push(ch);
        } else {
            if ds.is_empty()
                || (ch != 'd' && ch != 'h' && ch != 'm' && ch != 'w')
                || (ch == 'd' && have_days)
                || (ch == 'h' && have_hours)
                || (ch == 'm' && have_minutes)
                || (ch == 'w' && have_weeks)
            {
                bail!("Bad suffix")
            }
            let Ok(val) = u64::from_str(&ds) else {
                bail!("Bad number")
            };
            ds.clear();
            if ch == 'd' {
                have_days = true;
                days = val;
            } else if ch == 'h' {
                have_hours = true;
                hours = val;
            } else if ch == 'm' {
                have_minutes = true;
                minutes = val;
            } else if ch == 'w' {
                have_weeks = true;
                weeks = val;
            }
        }
    }
    if !ds.is_empty() || (!have_days && !have_hours && !have_minutes && !have_weeks) {
        bail!("Inconsistent")
    }

    days += weeks * 7;
    hours += days * 24;
    minutes += hours * 60;
    let seconds = minutes * 60;
    Ok(chrono::Duration::from_std(time::Duration::from_secs(seconds))?)
}

// Sizes for --cache: a number with a suffix M (megabytes) or G (gigabytes).
fn cache_size(s: &str) -> Result<usize> {
    let (n, scale) = if let Some(n) = s.strip_suffix(['M', 'm']) {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix(['G', 'g']) {
        (n, 1024 * 1024 * 1024)
    } else {
        bail!("Size must have suffix M or G")
    };
    let Ok(k) = usize::from_str(n) else {
        bail!("Bad size")
    };
    Ok(k * scale)
}

#[test]
fn test_run_time() {
    // This is illegal as of now, we might want to change this?
    assert!(run_time("3").is_err());

    // Years (and other things) are not supported
    assert!(run_time("3y").is_err());
    assert!(run_time("d").is_err());

    let x = run_time("3m").unwrap();
    assert!(x.num_minutes() == 3);
    assert!(x.num_minutes() == x.num_seconds() / 60);
    assert!(x.num_hours() == 0);

    let x = run_time("4h7m").unwrap();
    assert!(x.num_minutes() == 4 * 60 + 7);
    assert!(x.num_hours() == 4);

    let x = run_time("2d4h7m").unwrap();
    assert!(x.num_minutes() == (2 * 24 + 4) * 60 + 7);

    let x = run_time("1w").unwrap();
    assert!(x.num_seconds() == 7 * 24 * 60 * 60);
}

#[test]
fn test_parse_time() {
    let t = parse_time("2023-11-14", false).unwrap();
    assert!(t == sonarlog::timestamp_from_ymdhms(2023, 11, 14, 0, 0, 0).unwrap());
    let t = parse_time("2023-11-14", true).unwrap();
    assert!(t == sonarlog::timestamp_from_ymdhms(2023, 11, 14, 23, 59, 59).unwrap());
    let t = parse_time("2d", false).unwrap();
    let d = sonarlog::now() - t;
    assert!(d.num_hours() >= 47 && d.num_hours() <= 48);
    assert!(parse_time("2023-13-01", false).is_err());
    assert!(parse_time("2023-11", false).is_err());
    assert!(parse_time("xd", false).is_err());
}

#[test]
fn test_cache_size() {
    assert!(cache_size("512M").unwrap() == 512 * 1024 * 1024);
    assert!(cache_size("2G").unwrap() == 2 * 1024 * 1024 * 1024);
    assert!(cache_size("12").is_err());
}

#[test]
fn test_apply_defaults() {
    let ini = Ini::parse(
        "[data-source]\nremote = http://localhost:8087\ncluster = ml\nauth-file = a.txt\nfrom = 3d\n",
    )
    .unwrap();

    // Nothing given, so the remoting defaults apply
    let mut s = SourceArgs::default();
    s.apply_defaults(Some(&ini), false).unwrap();
    assert!(s.is_remote());
    assert!(s.remote.as_deref() == Some("http://localhost:8087"));
    assert!(s.auth_file.as_deref() == Some("a.txt"));
    assert!(s.from.as_deref() == Some("3d"));

    // A data path selects local data and the remoting defaults are not applied
    let mut s = SourceArgs { data_path: Some("/data/ml".to_string()), ..Default::default() };
    s.apply_defaults(Some(&ini), false).unwrap();
    assert!(!s.is_remote());
    assert!(s.auth_file.is_none());

    // Remote without cluster is an error
    let mut s = SourceArgs { remote: Some("http://x".to_string()), ..Default::default() };
    assert!(s.apply_defaults(None, false).is_err());

    // Both kinds of defaults is an error
    let both = Ini::parse("[data-source]\nremote = http://x\ndata-dir = /data\n").unwrap();
    let mut s = SourceArgs::default();
    assert!(s.apply_defaults(Some(&both), false).is_err());
}

#[test]
fn test_cli_parse() {
    let cli = Cli::try_parse_from([
        "sonalyze", "jobs", "--data-path", "/d", "-u", "-", "--from", "2d", "--query", "user = x",
        "--some-gpu", "--fmt", "csv,job",
    ])
    .unwrap();
    let Commands::Jobs(a) = cli.command else { panic!("Expected jobs") };
    assert!(a.source.data_path.as_deref() == Some("/d"));
    assert!(a.records.user == vec!["-".to_string()]);
    assert!(a.filter.some_gpu);
    assert!(a.query.query.as_deref() == Some("user = x"));

    let cli = Cli::try_parse_from(["sonalyze", "load", "--data-dir", "/d", "--q", "cpu > 1"]).unwrap();
    let Commands::Load(a) = cli.command else { panic!("Expected load") };
    assert!(a.source.data_path.as_deref() == Some("/d"));
    assert!(a.query.query.as_deref() == Some("cpu > 1"));
}
