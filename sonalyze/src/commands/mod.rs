// The analysis verbs, and the record selection and printing they share.

pub mod add;
pub mod jobs;
pub mod load;
pub mod metadata;
pub mod parse;
pub mod profile;
pub mod uptime;

use crate::cli::RecordFilterArgs;
use crate::dispatch::Context;
use crate::table::{
    compile_query, format_data, parse_query, standard_options, DefaultFormat, Table,
};

use anyhow::{bail, Result};
use sonarlog::{HostFilter, LogEntry, Timestamp};
use std::collections::HashSet;
use std::io;
use std::str::FromStr;

/// Record selection shared by the verbs that look at individual samples.  Empty include sets mean
/// "all".

pub struct RecordFilter {
    pub hosts: HostFilter,
    include_users: HashSet<String>,
    exclude_users: HashSet<String>,
    include_commands: HashSet<String>,
    exclude_commands: HashSet<String>,
    include_jobs: HashSet<u32>,
    from: Timestamp,
    to: Timestamp,
}

impl RecordFilter {
    /// `all_users` selects everyone when no --user is given, otherwise the default is the current
    /// user.  Unless `raw`, system users and shells are always excluded.

    pub fn new(
        ctx: &Context,
        args: &RecordFilterArgs,
        hosts: &[String],
        from: Timestamp,
        to: Timestamp,
        all_users: bool,
        raw: bool,
    ) -> Result<RecordFilter> {
        let mut host_filter = HostFilter::new();
        for host in hosts {
            host_filter.insert(host)?;
        }

        let mut include_users = HashSet::new();
        if !args.user.is_empty() {
            if !args.user.iter().any(|user| user == "-") {
                include_users.extend(args.user.iter().cloned());
            }
        } else if !all_users {
            if let Some(ref u) = ctx.logname {
                include_users.insert(u.clone());
            }
        }

        let mut exclude_users = args.exclude_user.iter().cloned().collect::<HashSet<String>>();
        let mut exclude_commands = args.exclude_command.iter().cloned().collect::<HashSet<String>>();
        if !raw {
            exclude_users.insert("root".to_string());
            exclude_users.insert("zabbix".to_string());
            for cmd in ["bash", "zsh", "sshd", "tmux", "systemd"] {
                exclude_commands.insert(cmd.to_string());
            }
        }

        let mut include_jobs = HashSet::new();
        for job in &args.job {
            let Ok(n) = u32::from_str(job) else {
                bail!("Invalid job number {job}");
            };
            include_jobs.insert(n);
        }

        Ok(RecordFilter {
            hosts: host_filter,
            include_users,
            exclude_users,
            include_commands: args.command.iter().cloned().collect(),
            exclude_commands,
            include_jobs,
            from,
            to,
        })
    }

    pub fn matches(&self, e: &LogEntry) -> bool {
        (self.include_users.is_empty() || self.include_users.contains(&e.user))
            && (self.hosts.is_empty() || self.hosts.contains(&e.hostname))
            && (self.include_jobs.is_empty() || self.include_jobs.contains(&e.job_id))
            && (self.include_commands.is_empty() || self.include_commands.contains(&e.command))
            && !self.exclude_users.contains(&e.user)
            && !self.exclude_commands.contains(&e.command)
            && self.in_window(e)
    }

    pub fn in_window(&self, e: &LogEntry) -> bool {
        self.from <= e.timestamp && e.timestamp <= self.to
    }
}

/// True if the format spec asks for help.

pub fn wants_help(fmt: &Option<String>) -> bool {
    fmt.as_deref().is_some_and(|f| f.split(',').any(|w| w == "help"))
}

/// Select rows by the query, if any, and print them according to the format spec, or `defaults`
/// if there is none.  The output is fixed-width unless the spec says otherwise.

pub fn print_rows<T: 'static>(
    output: &mut dyn io::Write,
    table: &Table<T>,
    fmt: &Option<String>,
    defaults: &str,
    query: &Option<String>,
    rows: Vec<T>,
) -> Result<()> {
    print_rows_as(output, table, fmt, defaults, query, rows, DefaultFormat::Fixed)
}

pub fn print_rows_as<T: 'static>(
    output: &mut dyn io::Write,
    table: &Table<T>,
    fmt: &Option<String>,
    defaults: &str,
    query: &Option<String>,
    rows: Vec<T>,
    def: DefaultFormat,
) -> Result<()> {
    let (fields, others) = table.parse_spec(fmt.as_deref().unwrap_or(defaults))?;
    let opts = standard_options(&others, def);
    let rows = match query {
        Some(q) => {
            let filter = compile_query(table, &parse_query(q)?)?;
            rows.into_iter().filter(|r| filter(r)).collect::<Vec<T>>()
        }
        None => rows,
    };
    if fields.is_empty() {
        return Ok(());
    }
    format_data(output, &fields, table, &opts, &rows)
}

/// Read the selected log files, with some statistics on stderr if `verbose`.

pub fn read_records(
    ctx: &Context,
    files: &[String],
    verbose: bool,
    stderr: &mut dyn io::Write,
) -> Result<Vec<LogEntry>> {
    if verbose {
        writeln!(stderr, "Log files: {:?}", files)?;
    }
    let entries = ctx.read_entries(files)?;
    if verbose {
        writeln!(stderr, "Number of samples read: {}", entries.len())?;
    }
    Ok(entries)
}

#[cfg(test)]
pub fn test_entries(text: &str) -> Vec<LogEntry> {
    sonarlog::parse_logfile_from(text.as_bytes()).unwrap()
}

#[test]
fn test_record_filter() {
    let ctx = Context { logname: Some("joe".to_string()), ..Default::default() };
    let from = sonarlog::timestamp_from_ymdhms(2023, 8, 15, 0, 0, 0).unwrap();
    let to = sonarlog::timestamp_from_ymdhms(2023, 8, 15, 23, 59, 59).unwrap();
    let entries = test_entries(
        "\
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml8,user=joe,job=10,pid=10,cmd=python,cpu%=100
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml8,user=ann,job=11,pid=11,cmd=python,cpu%=100
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml8,user=root,job=12,pid=12,cmd=python,cpu%=100
v=0.7.0,time=2023-08-15T10:00:00Z,host=ml3,user=joe,job=13,pid=13,cmd=bash,cpu%=100
v=0.7.0,time=2023-08-16T10:00:00Z,host=ml8,user=joe,job=14,pid=14,cmd=python,cpu%=100
",
    );
    let count = |f: &RecordFilter| entries.iter().filter(|e| f.matches(e)).count();

    let args = RecordFilterArgs::default();
    let f = RecordFilter::new(&ctx, &args, &[], from, to, false, false).unwrap();
    assert!(count(&f) == 1);
    let f = RecordFilter::new(&ctx, &args, &[], from, to, true, false).unwrap();
    assert!(count(&f) == 2);
    let f = RecordFilter::new(&ctx, &args, &[], from, to, true, true).unwrap();
    assert!(count(&f) == 4);

    let args = RecordFilterArgs { user: vec!["-".to_string()], job: vec!["11".to_string()], ..Default::default() };
    let f = RecordFilter::new(&ctx, &args, &["ml8".to_string()], from, to, false, false).unwrap();
    assert!(count(&f) == 1);

    let args = RecordFilterArgs { job: vec!["x".to_string()], ..Default::default() };
    assert!(RecordFilter::new(&ctx, &args, &[], from, to, false, false).is_err());
}
