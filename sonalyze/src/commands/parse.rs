// Print the selected sample records more or less as they were read.  This is mostly for debugging
// and for exporting data; the default output is CSV.

use crate::cli::ParseArgs;
use crate::commands::{print_rows_as, read_records, wants_help, RecordFilter};
use crate::dispatch::Context;
use crate::table::{DefaultFormat, Kind, Table, Value};

use anyhow::Result;
use chrono::SecondsFormat;
use sonarlog::LogEntry;
use std::io;

pub const DEFAULT_FIELDS: &str = "job,user,cmd";

pub fn run(
    ctx: &Context,
    args: &ParseArgs,
    output: &mut dyn io::Write,
    stderr: &mut dyn io::Write,
) -> Result<()> {
    let table = parse_table();
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
        false,
        args.meta.raw,
    )?;
    let files = ctx.logfiles(&args.source, &filter.hosts, from, to)?;
    let entries = read_records(ctx, &files, args.meta.verbose, stderr)?;
    if args.meta.verbose {
        return Ok(());
    }

    let mut rows = entries
        .into_iter()
        .filter(|e| (args.meta.raw || !e.is_heartbeat()) && filter.matches(e))
        .collect::<Vec<LogEntry>>();
    rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.hostname.cmp(&b.hostname)));
    print_rows_as(
        output,
        &table,
        &args.format.fmt,
        DEFAULT_FIELDS,
        &args.query.query,
        rows,
        DefaultFormat::Csv,
    )
}

fn kib(gb: f64) -> Value {
    Value::UInt((gb * 1024.0 * 1024.0).round() as u64)
}

pub fn parse_table() -> Table<LogEntry> {
    Table::<LogEntry>::new()
        .field("Version", Kind::Str, "Semver string (MAJOR.MINOR.BUGFIX)", |e| {
            Value::Str(e.version.clone())
        })
        .field("Timestamp", Kind::Time, "Time of the record", |e| Value::Time(e.timestamp))
        .field("time", Kind::Str, "Time of the record, RFC 3339", |e| {
            Value::Str(e.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true))
        })
        .field("Hostname", Kind::Str, "Host name (FQDN)", |e| Value::Str(e.hostname.clone()))
        .field("Cores", Kind::UInt, "Total number of cores (including hyperthreads)", |e| {
            Value::UInt(e.num_cores as u64)
        })
        .field("User", Kind::Str, "Username of process owner", |e| Value::Str(e.user.clone()))
        .field("Pid", Kind::UInt, "Process ID", |e| Value::UInt(e.pid as u64))
        .field("Job", Kind::UInt, "Job ID", |e| Value::UInt(e.job_id as u64))
        .field("Cmd", Kind::Str, "Command name", |e| Value::Str(e.command.clone()))
        .field("CpuPct", Kind::Float, "cpu% reading", |e| Value::Float(e.cpu_pct * 100.0))
        .field("CpuKB", Kind::UInt, "Virtual memory reading", |e| kib(e.mem_gb))
        .field("MemGB", Kind::Float, "Virtual memory reading (GB)", |e| Value::Float(e.mem_gb))
        .field("RssAnonKB", Kind::UInt, "RssAnon reading", |e| kib(e.rssanon_gb))
        .field("Gpus", Kind::Gpus, "GPU set (`none`,`unknown`,list)", |e| {
            Value::Gpus(e.gpus.clone())
        })
        .field("GpuPct", Kind::Float, "GPU utilization reading", |e| {
            Value::Float(e.gpu_pct * 100.0)
        })
        .field("GpuMemPct", Kind::Float, "GPU memory percentage reading", |e| {
            Value::Float(e.gpu_mem_pct * 100.0)
        })
        .field("GpuKB", Kind::UInt, "GPU memory utilization reading", |e| kib(e.gpu_mem_gb))
        .field("GpuFail", Kind::UInt, "GPU status flag (0=ok)", |e| Value::UInt(e.gpu_fail as u64))
        .field("CpuTimeSec", Kind::Float, "CPU time since the process started", |e| {
            Value::Float(e.cputime_sec)
        })
        .field("Rolledup", Kind::UInt, "Number of rolled-up processes, minus 1", |e| {
            Value::UInt(e.rolledup as u64)
        })
        .alias("version", &["Version"])
        .alias("v", &["Version"])
        .alias("localtime", &["Timestamp"])
        .alias("host", &["Hostname"])
        .alias("cores", &["Cores"])
        .alias("user", &["User"])
        .alias("pid", &["Pid"])
        .alias("job", &["Job"])
        .alias("cmd", &["Cmd"])
        .alias("cpu_pct", &["CpuPct"])
        .alias("cpu%", &["CpuPct"])
        .alias("cpukib", &["CpuKB"])
        .alias("mem_gb", &["MemGB"])
        .alias("gpus", &["Gpus"])
        .alias("gpu_pct", &["GpuPct"])
        .alias("gpu%", &["GpuPct"])
        .alias("gpumem_pct", &["GpuMemPct"])
        .alias("gpumem%", &["GpuMemPct"])
        .alias("gpukib", &["GpuKB"])
        .alias("gpu_status", &["GpuFail"])
        .alias("gpufail", &["GpuFail"])
        .alias("cputime_sec", &["CpuTimeSec"])
        .alias("rolledup", &["Rolledup"])
        .alias(
            "roundtrip",
            &[
                "v", "time", "host", "cores", "user", "job", "pid", "cmd", "cpu%", "cpukib", "gpus",
                "gpu%", "gpumem%", "gpukib", "gpufail", "cputime_sec", "rolledup",
            ],
        )
}

#[test]
fn test_parse_command() {
    let tmp = tempfile::TempDir::new().unwrap();
    let file = tmp.path().join("log.csv");
    std::fs::write(
        &file,
        "\
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml8,user=joe,job=10,pid=12,cmd=python,cpu%=150,cpukib=2048
v=0.8.0,time=2023-08-15T10:00:00Z,host=ml8,user=_sonar_,cmd=_heartbeat_
v=0.7.0,time=2023-08-15T10:05:00Z,host=ml8,user=ann,job=20,pid=20,cmd=R,cpu%=50
",
    )
    .unwrap();
    let ctx = Context { logname: Some("joe".to_string()), ..Default::default() };
    let path = file.to_str().unwrap();
    let args = ["parse", "--from", "2023-08-15", "--to", "2023-08-15", "--", path];
    let out = crate::dispatch::run_for_test(&ctx, &args).unwrap().0;
    assert_eq!(out, "10,joe,python\n");

    let args = [
        "parse", "--from", "2023-08-15", "--to", "2023-08-15", "-u", "-", "--fmt",
        "csvnamed,host,time,user,cpu%,cpukib", "--", path,
    ];
    let out = crate::dispatch::run_for_test(&ctx, &args).unwrap().0;
    assert_eq!(
        out,
        "host=ml8,time=2023-08-15T10:00:00Z,user=joe,cpu%=150,cpukib=2048\n\
         host=ml8,time=2023-08-15T10:05:00Z,user=ann,cpu%=50,cpukib=0\n"
    );

    let args = [
        "parse", "--from", "2023-08-15", "--to", "2023-08-15", "-u", "-", "--query", "job = 20",
        "--", path,
    ];
    let out = crate::dispatch::run_for_test(&ctx, &args).unwrap().0;
    assert_eq!(out, "20,ann,R\n");
}
