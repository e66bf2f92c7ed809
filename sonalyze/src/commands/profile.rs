// Print the samples of a single job over time, one row per process and sample time, across all the
// hosts the job ran on.

use crate::cli::ProfileArgs;
use crate::commands::{print_rows, read_records, wants_help, RecordFilter};
use crate::dispatch::Context;
use crate::table::{Kind, Table, Value};

use anyhow::{bail, Result};
use sonarlog::LogEntry;
use std::io;

pub const DEFAULT_FIELDS: &str = "time,host,pid,cpu,mem,gpu,gpumem,cmd";

pub fn run(
    ctx: &Context,
    args: &ProfileArgs,
    output: &mut dyn io::Write,
    stderr: &mut dyn io::Write,
) -> Result<()> {
    let table = profile_table();
    if wants_help(&args.format.fmt) {
        return table.help(output, DEFAULT_FIELDS);
    }
    if args.records.job.len() != 1 {
        bail!("Exactly one job number must be specified");
    }

    let (from, to) = args.source.window()?;
    let filter = RecordFilter::new(
        ctx,
        &args.records,
        &args.source.host,
        from,
        to,
        true,
        args.meta.raw,
    )?;
    let files = ctx.logfiles(&args.source, &filter.hosts, from, to)?;
    let entries = read_records(ctx, &files, args.meta.verbose, stderr)?;

    let mut rows = entries
        .into_iter()
        .filter(|e| !e.is_heartbeat() && filter.matches(e))
        .collect::<Vec<LogEntry>>();
    rows.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.hostname.cmp(&b.hostname))
            .then_with(|| a.pid.cmp(&b.pid))
    });

    if args.meta.verbose {
        writeln!(stderr, "Number of samples for the job: {}", rows.len())?;
        return Ok(());
    }
    if args.meta.raw {
        for r in &rows {
            writeln!(output, "{:?}", r)?;
        }
        return Ok(());
    }
    if rows.is_empty() {
        bail!("No samples for the job");
    }
    print_rows(output, &table, &args.format.fmt, DEFAULT_FIELDS, &None, rows)
}

pub fn profile_table() -> Table<LogEntry> {
    Table::<LogEntry>::new()
        .field("Time", Kind::Time, "Time of the sample", |e| Value::Time(e.timestamp))
        .field("Host", Kind::Str, "Host the process ran on", |e| Value::Str(e.hostname.clone()))
        .field("Pid", Kind::UInt, "Process ID, zero for rolled-up processes", |e| {
            Value::UInt(e.pid as u64)
        })
        .field("Cmd", Kind::Str, "The command", |e| Value::Str(e.command.clone()))
        .field("Cpu", Kind::UInt, "CPU utilization in percent of one core", |e| {
            Value::UInt((e.cpu_pct * 100.0).round() as u64)
        })
        .field("Mem", Kind::UInt, "Main memory in GB", |e| Value::UInt(e.mem_gb.round() as u64))
        .field("Gpu", Kind::UInt, "GPU utilization in percent of one card", |e| {
            Value::UInt((e.gpu_pct * 100.0).round() as u64)
        })
        .field("GpuMem", Kind::UInt, "GPU memory in GB", |e| {
            Value::UInt(e.gpu_mem_gb.round() as u64)
        })
        .field("Rolledup", Kind::UInt, "Number of processes rolled into this one", |e| {
            Value::UInt(e.rolledup as u64)
        })
        .alias("time", &["Time"])
        .alias("host", &["Host"])
        .alias("pid", &["Pid"])
        .alias("cmd", &["Cmd"])
        .alias("cpu", &["Cpu"])
        .alias("mem", &["Mem"])
        .alias("gpu", &["Gpu"])
        .alias("gpumem", &["GpuMem"])
        .alias("rolledup", &["Rolledup"])
}

#[test]
fn test_profile_command() {
    let tmp = tempfile::TempDir::new().unwrap();
    let file = tmp.path().join("log.csv");
    std::fs::write(
        &file,
        "\
v=0.7.0,time=2023-08-15T10:05:00Z,host=ml8,user=joe,job=10,pid=12,cmd=python,cpu%=50,cpukib=2097152
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml8,user=joe,job=10,pid=12,cmd=python,cpu%=100,cpukib=1048576
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml3,user=joe,job=10,pid=11,cmd=python,cpu%=200,cpukib=1048576
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml8,user=ann,job=20,pid=20,cmd=R,cpu%=50
",
    )
    .unwrap();
    let ctx = Context::default();
    let path = file.to_str().unwrap();
    let args = ["profile", "--from", "2023-08-15", "--to", "2023-08-15", "-j", "10", "--fmt", "csv,host,pid,cpu,mem", "--", path];
    let out = crate::dispatch::run_for_test(&ctx, &args).unwrap().0;
    assert_eq!(out, "ml3,11,200,1\nml8,12,100,1\nml8,12,50,2\n");

    let args = ["profile", "--from", "2023-08-15", "--to", "2023-08-15", "--", path];
    let e = crate::dispatch::run_for_test(&ctx, &args).unwrap_err().to_string();
    assert!(e == "Exactly one job number must be specified");
}
