// Information about the data rather than about the jobs: which files would be read, and the time
// span of the records per host.

use crate::cli::MetadataArgs;
use crate::commands::{print_rows, read_records, wants_help};
use crate::dispatch::Context;
use crate::table::{Kind, Table, Value};

use anyhow::{bail, Result};
use sonarlog::{HostFilter, Timestamp};
use std::collections::BTreeMap;
use std::io;

pub const DEFAULT_FIELDS: &str = "host,earliest,latest";

#[derive(Debug, Clone, PartialEq)]
pub struct Bounds {
    host: String,
    earliest: Timestamp,
    latest: Timestamp,
}

pub fn run(
    ctx: &Context,
    args: &MetadataArgs,
    output: &mut dyn io::Write,
    stderr: &mut dyn io::Write,
) -> Result<()> {
    let table = bounds_table();
    if wants_help(&args.format.fmt) {
        return table.help(output, DEFAULT_FIELDS);
    }
    if !args.files && !args.bounds {
        bail!("One of --files or --bounds is required");
    }

    let (from, to) = args.source.window()?;
    let mut hosts = HostFilter::new();
    for h in &args.source.host {
        hosts.insert(h)?;
    }
    let files = ctx.logfiles(&args.source, &hosts, from, to)?;
    if args.files {
        for f in &files {
            writeln!(output, "{f}")?;
        }
    }
    if !args.bounds {
        return Ok(());
    }

    let entries = read_records(ctx, &files, args.meta.verbose, stderr)?;
    let mut bounds: BTreeMap<String, Bounds> = BTreeMap::new();
    for e in entries {
        if e.timestamp < from || e.timestamp > to || !(hosts.is_empty() || hosts.contains(&e.hostname)) {
            continue;
        }
        bounds
            .entry(e.hostname.clone())
            .and_modify(|b| {
                b.earliest = b.earliest.min(e.timestamp);
                b.latest = b.latest.max(e.timestamp);
            })
            .or_insert(Bounds { host: e.hostname, earliest: e.timestamp, latest: e.timestamp });
    }
    if args.meta.verbose {
        return Ok(());
    }
    let rows = bounds.into_values().collect::<Vec<Bounds>>();
    print_rows(output, &table, &args.format.fmt, DEFAULT_FIELDS, &None, rows)
}

pub fn bounds_table() -> Table<Bounds> {
    Table::<Bounds>::new()
        .field("Host", Kind::Str, "Name of the host", |b| Value::Str(b.host.clone()))
        .field("Earliest", Kind::Time, "Time of the earliest record", |b| Value::Time(b.earliest))
        .field("Latest", Kind::Time, "Time of the latest record", |b| Value::Time(b.latest))
        .alias("host", &["Host"])
        .alias("earliest", &["Earliest"])
        .alias("latest", &["Latest"])
}

#[test]
fn test_metadata_command() {
    let tmp = tempfile::TempDir::new().unwrap();
    let dir = tmp.path().join("2023/08/15");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("ml8.csv"),
        "\
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml8,user=joe,job=10,pid=10,cmd=python,cpu%=100
v=0.8.0,time=2023-08-15T12:30:00Z,host=ml8,user=_sonar_,cmd=_heartbeat_
",
    )
    .unwrap();
    std::fs::write(
        dir.join("ml3.csv"),
        "v=0.7.0,time=2023-08-15T09:00:00Z,host=ml3,user=joe,job=10,pid=10,cmd=python,cpu%=100\n",
    )
    .unwrap();
    let ctx = Context::default();
    let root = tmp.path().to_str().unwrap();

    let args = ["metadata", "--data-path", root, "--from", "2023-08-15", "--to", "2023-08-15", "--bounds", "--fmt", "csv,host,earliest,latest"];
    let out = crate::dispatch::run_for_test(&ctx, &args).unwrap().0;
    assert_eq!(out, "ml3,2023-08-15 09:00,2023-08-15 09:00\nml8,2023-08-15 10:00,2023-08-15 12:30\n");

    let args = ["metadata", "--data-path", root, "--from", "2023-08-15", "--to", "2023-08-15", "--files", "--host", "ml8"];
    let out = crate::dispatch::run_for_test(&ctx, &args).unwrap().0;
    assert!(out.trim_end().ends_with("2023/08/15/ml8.csv"));
    assert!(out.lines().count() == 1);

    let args = ["metadata", "--data-path", root];
    assert!(crate::dispatch::run_for_test(&ctx, &args).is_err());
}
