// Compute system load aggregates from a set of log entries.
//
// We read and filter sonar records, bucket by host, sort by ascending timestamp, and then bucket by
// timestamp.  The buckets can then be aggregated into a "load" value for each time, which can in
// turn be averaged for a span of times.
//
// Note that GPU memory is tricky.  On NVidia, the "percentage" is unreliable, while on AMD, the
// absolute value is unobtainable (on our current systems).  RelativeVmemGB and RelativeVmemPct
// represent the same value computed in two different ways from different base data, and though they
// should be the same they are usually not.

use crate::cli::LoadArgs;
use crate::commands::{print_rows, read_records, wants_help, RecordFilter};
use crate::dispatch::Context;
use crate::table::{Kind, Table, Value};

use anyhow::{bail, Result};
use sonarlog::{GpuSet, LogEntry, System, Timestamp};
use std::io;

pub const DEFAULT_FIELDS: &str = "host,datetime,cpu,mem,gpu,vmem,gpus";

#[derive(PartialEq, Clone, Copy)]
enum BucketOpt {
    None,
    Hourly,
    Daily,
}

#[derive(Debug, Clone, PartialEq)]
struct LoadAggregate {
    cpu_pct: usize,
    mem_gb: usize,
    gpu_pct: usize,
    gpu_mem_pct: usize,
    gpu_mem_gb: usize,
    gpus: GpuSet,
}

/// The load on one host at one time, or averaged over an hour or a day starting at that time.

pub struct LoadRow {
    host: String,
    time: Timestamp,
    load: LoadAggregate,
    conf: Option<System>,
}

pub fn run(
    ctx: &Context,
    args: &LoadArgs,
    output: &mut dyn io::Write,
    stderr: &mut dyn io::Write,
) -> Result<()> {
    let table = load_table();
    if wants_help(&args.format.fmt) {
        return table.help(output, DEFAULT_FIELDS);
    }

    let (fields, _) = table.parse_spec(args.format.fmt.as_deref().unwrap_or(DEFAULT_FIELDS))?;
    let relative = fields.iter().any(|f| table.get(f).name.starts_with("Relative"));
    if relative && args.config.config_file.is_none() {
        bail!("Relative values requested without config file");
    }

    let bucket_opt = if args.daily {
        BucketOpt::Daily
    } else if args.none {
        BucketOpt::None
    } else {
        BucketOpt::Hourly // Default
    };

    let (from, to) = args.source.window()?;
    let filter =
        RecordFilter::new(ctx, &args.records, &args.source.host, from, to, true, args.meta.raw)?;
    let files = ctx.logfiles(&args.source, &filter.hosts, from, to)?;
    let entries = read_records(ctx, &files, args.meta.verbose, stderr)?;
    let config = ctx.read_config(&args.config.config_file)?;

    // by_host is sorted ascending by hostname (outer string) and time (inner timestamp)
    let by_host = sonarlog::compute_load(entries, |e| filter.matches(e));
    if args.meta.verbose {
        writeln!(stderr, "Number of hosts after filtering: {}", by_host.len())?;
        return Ok(());
    }

    let mut rows = vec![];
    for (host, records) in by_host {
        let conf = config.as_ref().and_then(|c| c.get(&host)).cloned();
        let mut loads = if bucket_opt == BucketOpt::None {
            records
                .iter()
                .map(|(t, entries)| (*t, aggregate_load(entries)))
                .collect::<Vec<(Timestamp, LoadAggregate)>>()
        } else {
            aggregate_by_timeslot(bucket_opt, &records)
        };
        if args.last {
            let n = loads.len();
            loads.drain(0..n.saturating_sub(1));
        }
        if args.meta.raw {
            for (t, entries) in &records {
                writeln!(output, "{host} {t}")?;
                for le in entries {
                    writeln!(
                        output,
                        "   {} {} {} {} {} {} {} {}",
                        le.cpu_pct, le.mem_gb, le.gpu_pct, le.gpu_mem_gb, le.gpu_mem_pct, le.gpus, le.user, le.command
                    )?;
                }
            }
            continue;
        }
        for (time, load) in loads {
            rows.push(LoadRow { host: host.clone(), time, load, conf: conf.clone() });
        }
    }

    print_rows(output, &table, &args.format.fmt, DEFAULT_FIELDS, &args.query.query, rows)
}

// Relative values are percentages of the host's capacity, or zero if the host is not in the
// configuration.
fn relative(r: &LoadRow, value: usize, capacity: impl Fn(&System) -> usize) -> Value {
    match r.conf {
        Some(ref s) if capacity(s) > 0 => {
            Value::Float(((value as f64) / (capacity(s) as f64) * 100.0).round())
        }
        _ => Value::Float(0.0),
    }
}

pub fn load_table() -> Table<LoadRow> {
    Table::<LoadRow>::new()
        .field("Host", Kind::Str, "Name of the host", |r| Value::Str(r.host.clone()))
        .field("Date", Kind::Str, "Date of the bucket, YYYY-MM-DD", |r| {
            Value::Str(r.time.format("%Y-%m-%d").to_string())
        })
        .field("Time", Kind::Str, "Time of the bucket, HH:MM", |r| Value::Str(r.time.format("%H:%M").to_string()))
        .field("DateTime", Kind::Time, "Date and time of the bucket", |r| Value::Time(r.time))
        .field("Cpu", Kind::UInt, "Summed CPU utilization in percent (100 = 1 core)", |r| {
            Value::UInt(r.load.cpu_pct as u64)
        })
        .field("RelativeCpu", Kind::Float, "Summed CPU utilization in percent of all cores", |r| {
            relative(r, r.load.cpu_pct, |s| s.cpu_cores * 100)
        })
        .field("Mem", Kind::UInt, "Summed main memory use in GB", |r| Value::UInt(r.load.mem_gb as u64))
        .field("RelativeMem", Kind::Float, "Summed main memory use in percent of all memory", |r| {
            relative(r, r.load.mem_gb, |s| s.mem_gb)
        })
        .field("Gpu", Kind::UInt, "Summed GPU utilization in percent (100 = 1 card)", |r| {
            Value::UInt(r.load.gpu_pct as u64)
        })
        .field("RelativeGpu", Kind::Float, "Summed GPU utilization in percent of all cards", |r| {
            relative(r, r.load.gpu_pct, |s| s.gpu_cards * 100)
        })
        .field("VmemGB", Kind::UInt, "Summed GPU memory use in GB", |r| Value::UInt(r.load.gpu_mem_gb as u64))
        .field("VmemPct", Kind::UInt, "Summed GPU memory use in percent (100 = 1 card)", |r| {
            Value::UInt(r.load.gpu_mem_pct as u64)
        })
        .field("RelativeVmemGB", Kind::Float, "GPU memory use in GB in percent of all GPU memory", |r| {
            relative(r, r.load.gpu_mem_gb, |s| s.gpu_mem_gb)
        })
        .field("RelativeVmemPct", Kind::Float, "GPU memory use percentage in percent of all cards", |r| {
            relative(r, r.load.gpu_mem_pct, |s| s.gpu_cards * 100)
        })
        .field("Gpus", Kind::Gpus, "GPU cards in use", |r| Value::Gpus(r.load.gpus.clone()))
        .alias("host", &["Host"])
        .alias("date", &["Date"])
        .alias("time", &["Time"])
        .alias("datetime", &["DateTime"])
        .alias("cpu", &["Cpu"])
        .alias("rcpu", &["RelativeCpu"])
        .alias("mem", &["Mem"])
        .alias("rmem", &["RelativeMem"])
        .alias("gpu", &["Gpu"])
        .alias("rgpu", &["RelativeGpu"])
        .alias("vmem", &["VmemGB", "VmemPct"])
        .alias("rvmem", &["RelativeVmemGB", "RelativeVmemPct"])
        .alias("gpus", &["Gpus"])
}

fn aggregate_by_timeslot(
    bucket_opt: BucketOpt,
    records: &[(Timestamp, Vec<LogEntry>)],
) -> Vec<(Timestamp, LoadAggregate)> {
    // Aggregate each instant, with a timestamp rounded down to the start of the hour or day, and
    // then collect runs of equal rounded timestamps.  The result is sorted by time because
    // `records` is.
    let mut by_timeslot: Vec<(Timestamp, Vec<LoadAggregate>)> = vec![];
    for (t, entries) in records {
        let rounded_t = if bucket_opt == BucketOpt::Hourly {
            sonarlog::truncate_to_hour(*t)
        } else {
            sonarlog::truncate_to_day(*t)
        };
        let agg = aggregate_load(entries);
        match by_timeslot.last_mut() {
            Some((slot, bucket)) if *slot == rounded_t => bucket.push(agg),
            _ => by_timeslot.push((rounded_t, vec![agg])),
        }
    }

    // Compute averages.
    by_timeslot
        .into_iter()
        .map(|(timestamp, aggs)| {
            let n = aggs.len();
            (
                timestamp,
                LoadAggregate {
                    cpu_pct: aggs.iter().fold(0, |acc, a| acc + a.cpu_pct) / n,
                    mem_gb: aggs.iter().fold(0, |acc, a| acc + a.mem_gb) / n,
                    gpu_pct: aggs.iter().fold(0, |acc, a| acc + a.gpu_pct) / n,
                    gpu_mem_pct: aggs.iter().fold(0, |acc, a| acc + a.gpu_mem_pct) / n,
                    gpu_mem_gb: aggs.iter().fold(0, |acc, a| acc + a.gpu_mem_gb) / n,
                    gpus: aggs.iter().fold(GpuSet::Empty, |acc, a| acc.union(&a.gpus)),
                },
            )
        })
        .collect::<Vec<(Timestamp, LoadAggregate)>>()
}

fn aggregate_load(entries: &[LogEntry]) -> LoadAggregate {
    let mut cpu_pct = 0.0;
    let mut mem_gb = 0.0;
    let mut gpu_pct = 0.0;
    let mut gpu_mem_pct = 0.0;
    let mut gpu_mem_gb = 0.0;
    let mut gpus = GpuSet::Empty;
    for entry in entries {
        cpu_pct += entry.cpu_pct;
        mem_gb += entry.mem_gb;
        gpu_pct += entry.gpu_pct;
        gpu_mem_pct += entry.gpu_mem_pct;
        gpu_mem_gb += entry.gpu_mem_gb;
        gpus = gpus.union(&entry.gpus);
    }
    LoadAggregate {
        cpu_pct: (cpu_pct * 100.0).ceil() as usize,
        mem_gb: mem_gb.ceil() as usize,
        gpu_pct: (gpu_pct * 100.0).ceil() as usize,
        gpu_mem_pct: (gpu_mem_pct * 100.0).ceil() as usize,
        gpu_mem_gb: gpu_mem_gb.ceil() as usize,
        gpus,
    }
}

#[cfg(test)]
const TEST_LOG: &str = "\
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml8,user=joe,job=10,pid=10,cmd=python,cpu%=100,cpukib=1048576
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml8,user=ann,job=11,pid=11,cmd=R,cpu%=50,cpukib=1048576,gpus=1,gpu%=30
v=0.7.0,time=2023-08-15T10:30:00Z,host=ml8,user=joe,job=10,pid=10,cmd=python,cpu%=300,cpukib=3145728
v=0.7.0,time=2023-08-15T11:10:00Z,host=ml8,user=joe,job=10,pid=10,cmd=python,cpu%=100,cpukib=1048576
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml3,user=joe,job=12,pid=12,cmd=python,cpu%=200,cpukib=1048576
";

#[test]
fn test_aggregate_by_timeslot() {
    let entries = crate::commands::test_entries(TEST_LOG);
    let by_host = sonarlog::compute_load(entries, |_| true);
    let (host, records) = &by_host[1];
    assert!(host == "ml8");
    let hourly = aggregate_by_timeslot(BucketOpt::Hourly, records);
    assert!(hourly.len() == 2);
    // (150 + 300) / 2, (2 + 3) / 2
    assert!(hourly[0].1.cpu_pct == 225);
    assert!(hourly[0].1.mem_gb == 2);
    assert!(hourly[0].1.gpus.to_string() == "1");
    assert!(hourly[1].0 == sonarlog::timestamp_from_ymdhms(2023, 8, 15, 11, 0, 0).unwrap());
    let daily = aggregate_by_timeslot(BucketOpt::Daily, records);
    assert!(daily.len() == 1);
    assert!(daily[0].1.cpu_pct == (150 + 300 + 100) / 3);
}

#[test]
fn test_load_command() {
    let tmp = tempfile::TempDir::new().unwrap();
    let file = tmp.path().join("log.csv");
    std::fs::write(&file, TEST_LOG).unwrap();
    let config = tmp.path().join("config.json");
    std::fs::write(&config, r#"[{"hostname":"ml8","cpu_cores":4,"mem_gb":10}]"#).unwrap();
    let f = file.to_str().unwrap();
    let ctx = Context::default();
    let run = |extra: &[&str]| {
        let mut args = vec!["load", "--from", "2023-08-15", "--to", "2023-08-15"];
        args.extend_from_slice(extra);
        args.extend_from_slice(&["--", f]);
        crate::dispatch::run_for_test(&ctx, &args)
    };

    let out = run(&["--fmt", "csv,host,datetime,cpu,mem"]).unwrap().0;
    assert_eq!(out, "ml3,2023-08-15 10:00,200,1\nml8,2023-08-15 10:00,225,2\nml8,2023-08-15 11:00,100,1\n");

    let out = run(&["--none", "--last", "--fmt", "csv,host,time,cpu"]).unwrap().0;
    assert_eq!(out, "ml3,10:00,200\nml8,11:10,100\n");

    let out = run(&["--daily", "--host", "ml8", "--fmt", "csv,cpu,gpus"]).unwrap().0;
    assert_eq!(out, "183,1\n");

    let e = run(&["--fmt", "rcpu"]).unwrap_err().to_string();
    assert!(e == "Relative values requested without config file");

    let c = config.to_str().unwrap();
    let out = run(&["--config-file", c, "--fmt", "csv,host,rcpu,rmem"]).unwrap().0;
    assert_eq!(out, "ml3,0,0\nml8,56,20\nml8,25,10\n");
}
