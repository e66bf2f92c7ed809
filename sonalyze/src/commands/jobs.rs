// Compute jobs aggregates from a set of log entries.

use crate::cache::ClusterConfig;
use crate::cli::{JobArgs, JobFilterArgs};
use crate::commands::{print_rows, read_records, wants_help, RecordFilter};
use crate::dispatch::Context;
use crate::table::{Kind, Table, Value};

use anyhow::Result;
use sonarlog::{GpuSet, JobKey, LogEntry, Timestamp};
use std::collections::{BTreeSet, HashMap};
use std::io;

pub const DEFAULT_FIELDS: &str =
    "jobm,user,duration,cpu-avg,cpu-peak,mem-avg,mem-peak,gpu-avg,gpu-peak,gpumem-avg,gpumem-peak,host,cmd";

pub fn run(
    ctx: &Context,
    args: &JobArgs,
    output: &mut dyn io::Write,
    stderr: &mut dyn io::Write,
) -> Result<()> {
    let table = jobs_table();
    if wants_help(&args.format.fmt) {
        return table.help(output, DEFAULT_FIELDS);
    }

    let (from, to) = args.source.window()?;
    let filter = RecordFilter::new(
        ctx,
        &args.records,
        &args.source.host,
        from,
        to,
        args.filter.zombie,
        args.meta.raw,
    )?;
    let files = ctx.logfiles(&args.source, &filter.hosts, from, to)?;
    let entries = read_records(ctx, &files, args.meta.verbose, stderr)?;
    let config = ctx.read_config(&args.config.config_file)?;

    let (joblog, _, earliest, latest) =
        sonarlog::compute_jobs(entries, |e| filter.matches(e), args.filter.batch);
    if args.meta.verbose {
        writeln!(stderr, "Number of jobs after input filtering: {}", joblog.len())?;
    }

    let mut jobvec = aggregate_and_filter_jobs(config.as_deref(), &args.filter, joblog, earliest, latest);
    if args.meta.verbose {
        writeln!(stderr, "Number of jobs after aggregation filtering: {}", jobvec.len())?;
    }

    // And sort ascending by lowest beginning timestamp, and if those are equal (which happens when
    // we start reading logs at some arbitrary date), by job number.
    jobvec.sort_by(|a, b| {
        if a.0.first == b.0.first {
            a.1[0].job_id.cmp(&b.1[0].job_id)
        } else {
            a.0.first.cmp(&b.0.first)
        }
    });

    // Select a number of jobs per user, if applicable.  This means working from the bottom up
    // in the vector and marking the n first per user.
    if let Some(n) = args.numjobs {
        let mut counts: HashMap<String, usize> = HashMap::new();
        jobvec.iter_mut().rev().for_each(|(aggregate, job)| {
            let c = counts.entry(job[0].user.clone()).or_insert(0);
            if *c < n {
                *c += 1;
            } else {
                aggregate.selected = false;
            }
        })
    }
    let selected = jobvec
        .into_iter()
        .filter(|(aggregate, _)| aggregate.selected)
        .collect::<Vec<(JobAggregate, Vec<LogEntry>)>>();

    if args.meta.verbose {
        writeln!(stderr, "Number of jobs after output filtering: {}", selected.len())?;
        return Ok(());
    }

    if args.meta.raw {
        for (aggregate, job) in &selected {
            writeln!(
                output,
                "{} job records\n\n{:?}\n\n{:?}\n",
                job.len(),
                &job[0..usize::min(5, job.len())],
                aggregate
            )?;
        }
        return Ok(());
    }

    let now = sonarlog::now();
    let rows = selected
        .into_iter()
        .map(|(aggregate, job)| JobSummary::new(aggregate, job, now))
        .collect::<Vec<JobSummary>>();
    print_rows(output, &table, &args.format.fmt, DEFAULT_FIELDS, &args.query.query, rows)
}

/// One printable job: the aggregate, the job's records, and the text fields computed from them.

pub struct JobSummary {
    aggregate: JobAggregate,
    job: Vec<LogEntry>,
    hosts: String,
    commands: String,
    gpus: GpuSet,
    gpu_fail: u32,
    now: Timestamp,
}

impl JobSummary {
    fn new(aggregate: JobAggregate, job: Vec<LogEntry>, now: Timestamp) -> JobSummary {
        // Short host names, sorted.
        let hosts = job
            .iter()
            .map(|j| j.hostname.split('.').next().unwrap_or_default().to_string())
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect::<Vec<String>>()
            .join(",");

        // Commands in order of first appearance.
        let mut names = vec![];
        for entry in &job {
            if !names.contains(&entry.command) {
                names.push(entry.command.clone());
            }
        }

        let gpus = job.iter().fold(GpuSet::Empty, |acc, j| acc.union(&j.gpus));
        let gpu_fail = job.iter().map(|j| j.gpu_fail).max().unwrap_or(0);
        JobSummary { aggregate, job, hosts, commands: names.join(", "), gpus, gpu_fail, now }
    }

    fn job_mark(&self) -> String {
        let c = self.aggregate.classification;
        let mark = if c & (LIVE_AT_START | LIVE_AT_END) == LIVE_AT_START | LIVE_AT_END {
            "!"
        } else if c & LIVE_AT_START != 0 {
            "<"
        } else if c & LIVE_AT_END != 0 {
            ">"
        } else {
            ""
        };
        format!("{}{}", self.job[0].job_id, mark)
    }
}

pub fn jobs_table() -> Table<JobSummary> {
    Table::<JobSummary>::new()
        .field("JobAndMark", Kind::Str, "Job ID with mark: < started before the window, > still running at its end, ! both", |j| {
            Value::Str(j.job_mark())
        })
        .field("Job", Kind::UInt, "Job ID", |j| Value::UInt(j.job[0].job_id as u64))
        .field("User", Kind::Str, "Name of user running the job", |j| Value::Str(j.job[0].user.clone()))
        .field("Duration", Kind::Duration, "Time of last observation minus time of first", |j| {
            Value::Duration(j.aggregate.duration)
        })
        .field("Start", Kind::Time, "Time of first observation", |j| Value::Time(j.aggregate.first))
        .field("End", Kind::Time, "Time of last observation", |j| Value::Time(j.aggregate.last))
        .field("CpuAvgPct", Kind::Float, "Average CPU utilization in percent (100% = 1 core)", |j| {
            Value::Float(j.aggregate.cpu_avg)
        })
        .field("CpuPeakPct", Kind::Float, "Peak CPU utilization in percent (100% = 1 core)", |j| {
            Value::Float(j.aggregate.cpu_peak)
        })
        .field("RelativeCpuAvgPct", Kind::Float, "Average CPU utilization in percent (100% = all cores)", |j| {
            Value::Float(j.aggregate.rcpu_avg)
        })
        .field("RelativeCpuPeakPct", Kind::Float, "Peak CPU utilization in percent (100% = all cores)", |j| {
            Value::Float(j.aggregate.rcpu_peak)
        })
        .field("MemAvgGB", Kind::Float, "Average main memory use in GB", |j| Value::Float(j.aggregate.mem_avg))
        .field("MemPeakGB", Kind::Float, "Peak main memory use in GB", |j| Value::Float(j.aggregate.mem_peak))
        .field("RelativeMemAvgPct", Kind::Float, "Average main memory use in percent of all memory", |j| {
            Value::Float(j.aggregate.rmem_avg)
        })
        .field("RelativeMemPeakPct", Kind::Float, "Peak main memory use in percent of all memory", |j| {
            Value::Float(j.aggregate.rmem_peak)
        })
        .field("GpuAvgPct", Kind::Float, "Average GPU utilization in percent (100% = 1 card)", |j| {
            Value::Float(j.aggregate.gpu_avg)
        })
        .field("GpuPeakPct", Kind::Float, "Peak GPU utilization in percent (100% = 1 card)", |j| {
            Value::Float(j.aggregate.gpu_peak)
        })
        .field("RelativeGpuAvgPct", Kind::Float, "Average GPU utilization in percent (100% = all cards)", |j| {
            Value::Float(j.aggregate.rgpu_avg)
        })
        .field("RelativeGpuPeakPct", Kind::Float, "Peak GPU utilization in percent (100% = all cards)", |j| {
            Value::Float(j.aggregate.rgpu_peak)
        })
        .field("GpuMemAvgGB", Kind::Float, "Average GPU memory use in GB", |j| Value::Float(j.aggregate.gpumem_avg))
        .field("GpuMemPeakGB", Kind::Float, "Peak GPU memory use in GB", |j| Value::Float(j.aggregate.gpumem_peak))
        .field("RelativeGpuMemAvgPct", Kind::Float, "Average GPU memory use in percent of all GPU memory", |j| {
            Value::Float(j.aggregate.rgpumem_avg)
        })
        .field("RelativeGpuMemPeakPct", Kind::Float, "Peak GPU memory use in percent of all GPU memory", |j| {
            Value::Float(j.aggregate.rgpumem_peak)
        })
        .field("Gpus", Kind::Gpus, "GPU cards used by the job", |j| Value::Gpus(j.gpus.clone()))
        .field("GpuFail", Kind::UInt, "Nonzero if a GPU failed during the job", |j| Value::UInt(j.gpu_fail as u64))
        .field("Cmd", Kind::Str, "The commands invoking the job's processes", |j| Value::Str(j.commands.clone()))
        .field("Host", Kind::Str, "The hosts the job ran on", |j| Value::Str(j.hosts.clone()))
        .field("Now", Kind::Time, "The time of the report", |j| Value::Time(j.now))
        .alias("jobm", &["JobAndMark"])
        .alias("job", &["Job"])
        .alias("user", &["User"])
        .alias("duration", &["Duration"])
        .alias("start", &["Start"])
        .alias("end", &["End"])
        .alias("cpu-avg", &["CpuAvgPct"])
        .alias("cpu-peak", &["CpuPeakPct"])
        .alias("rcpu-avg", &["RelativeCpuAvgPct"])
        .alias("rcpu-peak", &["RelativeCpuPeakPct"])
        .alias("mem-avg", &["MemAvgGB"])
        .alias("mem-peak", &["MemPeakGB"])
        .alias("rmem-avg", &["RelativeMemAvgPct"])
        .alias("rmem-peak", &["RelativeMemPeakPct"])
        .alias("gpu-avg", &["GpuAvgPct"])
        .alias("gpu-peak", &["GpuPeakPct"])
        .alias("rgpu-avg", &["RelativeGpuAvgPct"])
        .alias("rgpu-peak", &["RelativeGpuPeakPct"])
        .alias("gpumem-avg", &["GpuMemAvgGB"])
        .alias("gpumem-peak", &["GpuMemPeakGB"])
        .alias("rgpumem-avg", &["RelativeGpuMemAvgPct"])
        .alias("rgpumem-peak", &["RelativeGpuMemPeakPct"])
        .alias("gpus", &["Gpus"])
        .alias("gpufail", &["GpuFail"])
        .alias("cmd", &["Cmd"])
        .alias("host", &["Host"])
        .alias("now", &["Now"])
        .alias("std", &["jobm", "user", "duration", "host"])
        .alias("cpu", &["cpu-avg", "cpu-peak"])
        .alias("rcpu", &["rcpu-avg", "rcpu-peak"])
        .alias("mem", &["mem-avg", "mem-peak"])
        .alias("rmem", &["rmem-avg", "rmem-peak"])
        .alias("gpu", &["gpu-avg", "gpu-peak"])
        .alias("rgpu", &["rgpu-avg", "rgpu-peak"])
        .alias("gpumem", &["gpumem-avg", "gpumem-peak"])
        .alias("rgpumem", &["rgpumem-avg", "rgpumem-peak"])
}

fn aggregate_and_filter_jobs(
    system_config: Option<&ClusterConfig>,
    filter_args: &JobFilterArgs,
    joblog: HashMap<JobKey, Vec<LogEntry>>,
    earliest: Timestamp,
    latest: Timestamp,
) -> Vec<(JobAggregate, Vec<LogEntry>)> {
    // Convert the aggregation filter options to a useful form.

    let min_cpu_avg = filter_args.min_cpu_avg as f64;
    let min_cpu_peak = filter_args.min_cpu_peak as f64;
    let max_cpu_avg = filter_args.max_cpu_avg as f64;
    let max_cpu_peak = filter_args.max_cpu_peak as f64;
    let min_rcpu_avg = filter_args.min_rcpu_avg as f64;
    let min_rcpu_peak = filter_args.min_rcpu_peak as f64;
    let max_rcpu_avg = filter_args.max_rcpu_avg as f64;
    let max_rcpu_peak = filter_args.max_rcpu_peak as f64;
    let min_mem_avg = filter_args.min_mem_avg as f64;
    let min_mem_peak = filter_args.min_mem_peak as f64;
    let min_rmem_avg = filter_args.min_rmem_avg as f64;
    let min_rmem_peak = filter_args.min_rmem_peak as f64;
    let min_gpu_avg = filter_args.min_gpu_avg as f64;
    let min_gpu_peak = filter_args.min_gpu_peak as f64;
    let max_gpu_avg = filter_args.max_gpu_avg as f64;
    let max_gpu_peak = filter_args.max_gpu_peak as f64;
    let min_rgpu_avg = filter_args.min_rgpu_avg as f64;
    let min_rgpu_peak = filter_args.min_rgpu_peak as f64;
    let max_rgpu_avg = filter_args.max_rgpu_avg as f64;
    let max_rgpu_peak = filter_args.max_rgpu_peak as f64;
    let min_samples = filter_args.min_samples.unwrap_or(2);
    let min_runtime = filter_args.min_runtime.map(|d| d.num_seconds()).unwrap_or(0);
    let min_gpumem_avg = filter_args.min_gpumem_avg as f64;
    let min_gpumem_peak = filter_args.min_gpumem_peak as f64;
    let min_rgpumem_avg = filter_args.min_rgpumem_avg as f64;
    let min_rgpumem_peak = filter_args.min_rgpumem_peak as f64;

    // Get the vectors of jobs back into a vector, aggregate data, and filter the jobs.

    joblog
        .into_values()
        .filter(|job| job.len() >= min_samples)
        .map(|job| (aggregate_job(system_config, &job, earliest, latest), job))
        .filter(|(aggregate, job)| {
            aggregate.cpu_avg >= min_cpu_avg
                && aggregate.cpu_peak >= min_cpu_peak
                && aggregate.cpu_avg <= max_cpu_avg
                && aggregate.cpu_peak <= max_cpu_peak
                && aggregate.mem_avg >= min_mem_avg
                && aggregate.mem_peak >= min_mem_peak
                && aggregate.gpu_avg >= min_gpu_avg
                && aggregate.gpu_peak >= min_gpu_peak
                && aggregate.gpu_avg <= max_gpu_avg
                && aggregate.gpu_peak <= max_gpu_peak
                && aggregate.gpumem_avg >= min_gpumem_avg
                && aggregate.gpumem_peak >= min_gpumem_peak
                && aggregate.duration >= min_runtime
                && (system_config.is_none()
                    || (aggregate.rcpu_avg >= min_rcpu_avg
                        && aggregate.rcpu_peak >= min_rcpu_peak
                        && aggregate.rcpu_avg <= max_rcpu_avg
                        && aggregate.rcpu_peak <= max_rcpu_peak
                        && aggregate.rmem_avg >= min_rmem_avg
                        && aggregate.rmem_peak >= min_rmem_peak
                        && aggregate.rgpu_avg >= min_rgpu_avg
                        && aggregate.rgpu_peak >= min_rgpu_peak
                        && aggregate.rgpu_avg <= max_rgpu_avg
                        && aggregate.rgpu_peak <= max_rgpu_peak
                        && aggregate.rgpumem_avg >= min_rgpumem_avg
                        && aggregate.rgpumem_peak >= min_rgpumem_peak))
                && (!filter_args.no_gpu || !aggregate.uses_gpu)
                && (!filter_args.some_gpu || aggregate.uses_gpu)
                && (!filter_args.completed || (aggregate.classification & LIVE_AT_END) == 0)
                && (!filter_args.running || (aggregate.classification & LIVE_AT_END) != 0)
                && (!filter_args.zombie || job[0].user.starts_with("_zombie_"))
        })
        .collect::<Vec<(JobAggregate, Vec<LogEntry>)>>()
}

/// Bit values for JobAggregate::classification

const LIVE_AT_END: u32 = 1; // Latest timestamp coincides with latest record read
const LIVE_AT_START: u32 = 2; // Ditto earliest/earliest

// The JobAggregate structure holds aggregated data for a single job.  The view of the job may be
// partial, as job records may have been filtered out for the job for various reasons, including
// filtering by date range.
//
// Note the *_r* fields are only valid if there is a system_config present, otherwise they will be
// zero and should not be used.

#[derive(Debug)]
struct JobAggregate {
    first: Timestamp, // Earliest timestamp seen for job
    last: Timestamp,  // Latest ditto
    duration: i64,    // Duration in seconds

    uses_gpu: bool, // True if there's reason to believe a GPU was ever used by the job

    cpu_avg: f64,   // Average CPU utilization, 1 core == 100%
    cpu_peak: f64,  // Peak CPU utilization ditto
    rcpu_avg: f64,  // Average CPU utilization, all cores == 100%
    rcpu_peak: f64, // Peak CPU utilization ditto

    gpu_avg: f64,   // Average GPU utilization, 1 card == 100%
    gpu_peak: f64,  // Peak GPU utilization ditto
    rgpu_avg: f64,  // Average GPU utilization, all cards == 100%
    rgpu_peak: f64, // Peak GPU utilization ditto

    mem_avg: f64,   // Average main memory utilization, GiB
    mem_peak: f64,  // Peak memory utilization ditto
    rmem_avg: f64,  // Average main memory utilization, all memory = 100%
    rmem_peak: f64, // Peak memory utilization ditto

    // If a system config is present and conf.gpu_mem_pct is true then *_gpumem_gb are derived from
    // the recorded percentage figure, otherwise *_rgpumem are derived from the recorded absolute
    // figures.  If a system config is not present then all fields will represent the recorded
    // values (*_rgpumem the recorded percentages).
    gpumem_avg: f64,   // Average GPU memory utilization, GiB
    gpumem_peak: f64,  // Peak memory utilization ditto
    rgpumem_avg: f64,  // Average GPU memory utilization, all cards == 100%
    rgpumem_peak: f64, // Peak GPU memory utilization ditto

    selected: bool,      // Initially true, it can be used to deselect the record before printing
    classification: u32, // Bitwise OR of flags above
}

// Given a list of log entries for a job, sorted ascending by timestamp, and the earliest and
// latest timestamps from all records read, return a JobAggregate for the job.
//
// gpu_mem_pct is taken from the config of the first host of the job, though in principle a job
// can span hosts with different cards.

fn aggregate_job(
    system_config: Option<&ClusterConfig>,
    job: &[LogEntry],
    earliest: Timestamp,
    latest: Timestamp,
) -> JobAggregate {
    let first = job[0].timestamp;
    let last = job[job.len() - 1].timestamp;
    let host = &job[0].hostname;
    let n = job.len() as f64;

    let uses_gpu = job.iter().any(|jr| !jr.gpus.is_empty());

    let cpu_avg = job.iter().fold(0.0, |acc, jr| acc + jr.cpu_pct * 100.0) / n;
    let cpu_peak = job.iter().fold(0.0, |acc, jr| f64::max(acc, jr.cpu_pct * 100.0));
    let mut rcpu_avg = 0.0;
    let mut rcpu_peak = 0.0;

    let gpu_avg = job.iter().fold(0.0, |acc, jr| acc + jr.gpu_pct * 100.0) / n;
    let gpu_peak = job.iter().fold(0.0, |acc, jr| f64::max(acc, jr.gpu_pct * 100.0));
    let mut rgpu_avg = 0.0;
    let mut rgpu_peak = 0.0;

    let mem_avg = job.iter().fold(0.0, |acc, jr| acc + jr.mem_gb) / n;
    let mem_peak = job.iter().fold(0.0, |acc, jr| f64::max(acc, jr.mem_gb));
    let mut rmem_avg = 0.0;
    let mut rmem_peak = 0.0;

    let mut gpumem_avg = job.iter().fold(0.0, |acc, jr| acc + jr.gpu_mem_gb) / n;
    let mut gpumem_peak = job.iter().fold(0.0, |acc, jr| f64::max(acc, jr.gpu_mem_gb));
    let gpumem_avg_pct = job.iter().fold(0.0, |acc, jr| acc + jr.gpu_mem_pct * 100.0) / n;
    let gpumem_peak_pct = job.iter().fold(0.0, |acc, jr| f64::max(acc, jr.gpu_mem_pct * 100.0));
    let mut rgpumem_avg = gpumem_avg_pct;
    let mut rgpumem_peak = gpumem_peak_pct;

    if let Some(conf) = system_config.and_then(|confs| confs.get(host)) {
        let cpu_cores = conf.cpu_cores as f64;
        let mem = conf.mem_gb as f64;
        let gpu_cards = conf.gpu_cards as f64;
        let gpumem = conf.gpu_mem_gb as f64;

        rcpu_avg = cpu_avg / cpu_cores;
        rcpu_peak = cpu_peak / cpu_cores;

        rmem_avg = mem_avg * 100.0 / mem;
        rmem_peak = mem_peak * 100.0 / mem;

        if gpu_cards > 0.0 {
            rgpu_avg = gpu_avg / gpu_cards;
            rgpu_peak = gpu_peak / gpu_cards;

            if conf.gpu_mem_pct {
                gpumem_avg = (gpumem_avg_pct / 100.0) * gpumem;
                gpumem_peak = (gpumem_peak_pct / 100.0) * gpumem;
            } else if gpumem > 0.0 {
                rgpumem_avg = gpumem_avg * 100.0 / gpumem;
                rgpumem_peak = gpumem_peak * 100.0 / gpumem;
            }
        }
    }

    let mut classification = 0;
    if first == earliest {
        classification |= LIVE_AT_START;
    }
    if last == latest {
        classification |= LIVE_AT_END;
    }
    JobAggregate {
        first,
        last,
        duration: (last - first).num_seconds(),
        uses_gpu,
        cpu_avg: cpu_avg.ceil(),
        cpu_peak: cpu_peak.ceil(),
        rcpu_avg: rcpu_avg.ceil(),
        rcpu_peak: rcpu_peak.ceil(),
        gpu_avg: gpu_avg.ceil(),
        gpu_peak: gpu_peak.ceil(),
        rgpu_avg: rgpu_avg.ceil(),
        rgpu_peak: rgpu_peak.ceil(),
        mem_avg: mem_avg.ceil(),
        mem_peak: mem_peak.ceil(),
        rmem_avg: rmem_avg.ceil(),
        rmem_peak: rmem_peak.ceil(),
        gpumem_avg: gpumem_avg.ceil(),
        gpumem_peak: gpumem_peak.ceil(),
        rgpumem_avg: rgpumem_avg.ceil(),
        rgpumem_peak: rgpumem_peak.ceil(),
        selected: true,
        classification,
    }
}

#[cfg(test)]
const TEST_LOG: &str = "\
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml8.hpc.uio.no,user=joe,job=10,pid=10,cmd=python,cpu%=100,cpukib=2097152
v=0.7.0,time=2023-08-15T10:30:00Z,host=ml8.hpc.uio.no,user=joe,job=10,pid=10,cmd=python,cpu%=300,cpukib=4194304,gpus=0,gpu%=50
v=0.7.0,time=2023-08-15T11:00:00Z,host=ml8.hpc.uio.no,user=joe,job=10,pid=12,cmd=python,cpu%=200,cpukib=2097152
v=0.7.0,time=2023-08-15T10:15:00Z,host=ml8.hpc.uio.no,user=ann,job=20,pid=20,cmd=R,cpu%=50,cpukib=1048576
v=0.7.0,time=2023-08-15T10:45:00Z,host=ml8.hpc.uio.no,user=ann,job=20,pid=20,cmd=R,cpu%=50,cpukib=1048576
v=0.7.0,time=2023-08-15T10:20:00Z,host=ml8.hpc.uio.no,user=ann,job=30,pid=30,cmd=julia,cpu%=50,cpukib=1048576
";

#[test]
fn test_aggregate_job() {
    let entries = crate::commands::test_entries(TEST_LOG);
    let (joblog, _, earliest, latest) = sonarlog::compute_jobs(entries, |_| true, false);
    let job = &joblog[&("ml8.hpc.uio.no".to_string(), 10)];
    let a = aggregate_job(None, job, earliest, latest);
    assert!(a.cpu_avg == 200.0);
    assert!(a.cpu_peak == 300.0);
    assert!(a.mem_peak == 4.0);
    assert!(a.gpu_peak == 50.0);
    assert!(a.uses_gpu);
    assert!(a.duration == 3600);
    assert!(a.classification == LIVE_AT_START | LIVE_AT_END);
    assert!(a.rcpu_avg == 0.0);

    let mut config = ClusterConfig::new();
    config.insert(
        "ml8.hpc.uio.no".to_string(),
        sonarlog::System { hostname: "ml8.hpc.uio.no".to_string(), cpu_cores: 4, mem_gb: 8, ..Default::default() },
    );
    let a = aggregate_job(Some(&config), job, earliest, latest);
    assert!(a.rcpu_avg == 50.0);
    assert!(a.rcpu_peak == 75.0);
    assert!(a.rmem_peak == 50.0);
}

#[test]
fn test_jobs_command() {
    let tmp = tempfile::TempDir::new().unwrap();
    let file = tmp.path().join("ml8.csv");
    std::fs::write(&file, TEST_LOG).unwrap();
    let f = file.to_str().unwrap();
    let ctx = Context::default();
    let run = |extra: &[&str]| {
        let mut args = vec!["jobs", "-u", "-", "--from", "2023-08-15", "--to", "2023-08-15"];
        args.extend_from_slice(extra);
        args.extend_from_slice(&["--", f]);
        crate::dispatch::run_for_test(&ctx, &args).unwrap().0
    };

    // Job 30 has only one sample and is dropped by default.
    let out = run(&["--fmt", "csv,job,user,duration,cpu,host,cmd"]);
    assert_eq!(out, "10,joe,0d 1h 0m,200,300,ml8,python\n20,ann,0d 0h30m,50,50,ml8,R\n");

    let out = run(&["--fmt", "csv,jobm", "--min-samples", "1"]);
    assert_eq!(out, "10!\n20\n30\n");

    let out = run(&["--fmt", "csv,job", "--some-gpu"]);
    assert_eq!(out, "10\n");

    let out = run(&["--fmt", "csv,job", "--query", "user = ann"]);
    assert_eq!(out, "20\n");

    let out = run(&["--fmt", "csv,job", "--query", "CpuPeakPct > 100 or Duration < 40m"]);
    assert_eq!(out, "10\n20\n");

    let out = run(&["--fmt", "csv,job", "--numjobs", "1", "--min-samples", "1"]);
    assert_eq!(out, "10\n30\n");

    let out = run(&["--fmt", "help"]);
    assert!(out.contains("CpuAvgPct"));
}
