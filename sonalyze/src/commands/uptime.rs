// Compute the intervals when hosts were up and down.  A host is taken to be up from a sample until
// the next sample if the gap between them is at most twice the sampling interval, and down
// otherwise.  Heartbeats count as samples.  Hosts named in the cluster configuration that have no
// samples at all were down for the whole window.

use crate::cli::UptimeArgs;
use crate::commands::{print_rows, read_records, wants_help};
use crate::dispatch::Context;
use crate::table::{Kind, Table, Value};

use anyhow::Result;
use sonarlog::{HostFilter, Timestamp};
use std::collections::BTreeMap;
use std::io;

pub const DEFAULT_FIELDS: &str = "host,state,start,end";

const DEFAULT_INTERVAL_MINUTES: u64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct UptimeRow {
    host: String,
    up: bool,
    start: Timestamp,
    end: Timestamp,
}

pub fn run(
    ctx: &Context,
    args: &UptimeArgs,
    output: &mut dyn io::Write,
    stderr: &mut dyn io::Write,
) -> Result<()> {
    let table = uptime_table();
    if wants_help(&args.format.fmt) {
        return table.help(output, DEFAULT_FIELDS);
    }

    let (from, to) = args.source.window()?;
    let mut hosts = HostFilter::new();
    for h in &args.source.host {
        hosts.insert(h)?;
    }
    let files = ctx.logfiles(&args.source, &hosts, from, to)?;
    let entries = read_records(ctx, &files, args.meta.verbose, stderr)?;
    let config = ctx.read_config(&args.config.config_file)?;

    let mut by_host: BTreeMap<String, Vec<Timestamp>> = BTreeMap::new();
    for e in entries {
        if from <= e.timestamp && e.timestamp <= to && (hosts.is_empty() || hosts.contains(&e.hostname)) {
            by_host.entry(e.hostname).or_default().push(e.timestamp);
        }
    }
    if let Some(ref config) = config {
        for name in config.keys() {
            if hosts.is_empty() || hosts.contains(name) {
                by_host.entry(name.clone()).or_default();
            }
        }
    }
    if args.meta.verbose {
        writeln!(stderr, "Number of hosts: {}", by_host.len())?;
        return Ok(());
    }

    let interval = args.interval.unwrap_or(DEFAULT_INTERVAL_MINUTES);
    let cutoff = chrono::Duration::seconds((interval * 60 * 2) as i64);
    let end = Timestamp::min(to, sonarlog::now());

    let mut rows = vec![];
    for (host, mut times) in by_host {
        times.sort();
        times.dedup();
        rows.extend(
            compute_intervals(&host, &times, from, end, cutoff)
                .into_iter()
                .filter(|r| (!args.only_up || r.up) && (!args.only_down || !r.up)),
        );
    }
    print_rows(output, &table, &args.format.fmt, DEFAULT_FIELDS, &args.query.query, rows)
}

// `times` is sorted ascending without duplicates.  The result is sorted by start time.
fn compute_intervals(
    host: &str,
    times: &[Timestamp],
    from: Timestamp,
    to: Timestamp,
    cutoff: chrono::Duration,
) -> Vec<UptimeRow> {
    let row = |up: bool, start: Timestamp, end: Timestamp| UptimeRow {
        host: host.to_string(),
        up,
        start,
        end,
    };
    let (Some(&first), Some(&last)) = (times.first(), times.last()) else {
        return vec![row(false, from, to)];
    };

    let mut rows = vec![];
    if first - from > cutoff {
        rows.push(row(false, from, first));
    }
    let mut start = first;
    for w in times.windows(2) {
        if w[1] - w[0] > cutoff {
            rows.push(row(true, start, w[0]));
            rows.push(row(false, w[0], w[1]));
            start = w[1];
        }
    }
    rows.push(row(true, start, last));
    if to - last > cutoff {
        rows.push(row(false, last, to));
    }
    rows
}

pub fn uptime_table() -> Table<UptimeRow> {
    Table::<UptimeRow>::new()
        .field("Host", Kind::Str, "Name of the host", |r| Value::Str(r.host.clone()))
        .field("State", Kind::Str, "`up` or `down`", |r| {
            Value::Str(if r.up { "up" } else { "down" }.to_string())
        })
        .field("Start", Kind::Time, "Start of the interval", |r| Value::Time(r.start))
        .field("End", Kind::Time, "End of the interval", |r| Value::Time(r.end))
        .alias("host", &["Host"])
        .alias("state", &["State"])
        .alias("start", &["Start"])
        .alias("end", &["End"])
}

#[cfg(test)]
fn t(h: u32, m: u32) -> Timestamp {
    sonarlog::timestamp_from_ymdhms(2023, 8, 15, h, m, 0).unwrap()
}

#[test]
fn test_compute_intervals() {
    let cutoff = chrono::Duration::minutes(10);
    let times = vec![t(10, 0), t(10, 5), t(10, 10), t(11, 0), t(11, 5)];
    let rows = compute_intervals("ml8", &times, t(0, 0), t(23, 59), cutoff);
    let spans = rows.iter().map(|r| (r.up, r.start, r.end)).collect::<Vec<_>>();
    assert_eq!(
        spans,
        vec![
            (false, t(0, 0), t(10, 0)),
            (true, t(10, 0), t(10, 10)),
            (false, t(10, 10), t(11, 0)),
            (true, t(11, 0), t(11, 5)),
            (false, t(11, 5), t(23, 59)),
        ]
    );

    // Within the cutoff at both ends
    let rows = compute_intervals("ml8", &times, t(9, 55), t(11, 10), cutoff);
    assert!(rows.len() == 3);
    assert!(rows[0].up && rows[0].start == t(10, 0));

    // No samples at all
    let rows = compute_intervals("ml8", &[], t(0, 0), t(1, 0), cutoff);
    assert_eq!(rows, vec![UptimeRow { host: "ml8".to_string(), up: false, start: t(0, 0), end: t(1, 0) }]);
}

#[test]
fn test_uptime_command() {
    let tmp = tempfile::TempDir::new().unwrap();
    let file = tmp.path().join("log.csv");
    std::fs::write(
        &file,
        "\
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml8,user=joe,job=10,pid=10,cmd=python,cpu%=100
v=0.8.0,time=2023-08-15T10:05:00Z,host=ml8,user=_sonar_,cmd=_heartbeat_
v=0.7.0,time=2023-08-15T12:00:00Z,host=ml8,user=joe,job=10,pid=10,cmd=python,cpu%=100
",
    )
    .unwrap();
    let config = tmp.path().join("config.json");
    std::fs::write(&config, r#"[{"hostname":"ml8","cpu_cores":4,"mem_gb":10},{"hostname":"ml9","cpu_cores":4,"mem_gb":10}]"#)
        .unwrap();
    let ctx = Context::default();
    let args = [
        "uptime", "--from", "2023-08-15", "--to", "2023-08-15", "--interval", "5", "--only-up",
        "--config-file", config.to_str().unwrap(), "--fmt", "csv,host,state,start,end", "--",
        file.to_str().unwrap(),
    ];
    let out = crate::dispatch::run_for_test(&ctx, &args).unwrap().0;
    assert_eq!(out, "ml8,up,2023-08-15 10:00,2023-08-15 10:05\nml8,up,2023-08-15 12:00,2023-08-15 12:00\n");

    let args = [
        "uptime", "--from", "2023-08-15", "--to", "2023-08-15", "--only-down", "--config-file",
        config.to_str().unwrap(), "--fmt", "csv,host,start,end", "--query", "host = ml9", "--",
        file.to_str().unwrap(),
    ];
    let out = crate::dispatch::run_for_test(&ctx, &args).unwrap().0;
    assert_eq!(out, "ml9,2023-08-15 00:00,2023-08-15 23:59\n");
}
