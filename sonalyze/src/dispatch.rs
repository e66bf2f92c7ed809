// The command dispatcher: parse a command line, fill in defaults, and run the verb either here or on
// a remote daemon.  The same entry point serves the command line program and the daemon, which is
// why all I/O goes through the streams passed in.

use crate::cache::{ClusterConfig, ConfigCache, LogCache};
use crate::cli::{Cli, Commands, SourceArgs};
use crate::commands;
use crate::ini::{self, Ini};
use crate::remote;

use anyhow::{bail, Result};
use clap::{CommandFactory, FromArgMatches};
use sonarlog::{HostFilter, LogEntry, Timestamp};
use std::env;
use std::io;
use std::sync::Arc;

/// What a command may know about its environment.

#[derive(Default)]
pub struct Context {
    /// The user's ~/.sonalyze, if any.
    pub user_defaults: Option<Ini>,

    /// Credentials from $SONALYZE_AUTH, overriding any --auth-file.
    pub env_auth: Option<String>,

    /// The default user for verbs that select the current user's records.
    pub logname: Option<String>,

    /// Fallback data path from $SONAR_ROOT.
    pub sonar_root: Option<String>,

    pub log_cache: Option<Arc<LogCache>>,
    pub config_cache: Option<Arc<ConfigCache>>,
}

impl Context {
    /// The context of an interactive command.

    pub fn from_environment() -> Result<Context> {
        Ok(Context {
            user_defaults: ini::read_user_defaults()?,
            env_auth: env::var("SONALYZE_AUTH").ok(),
            logname: env::var("LOGNAME").ok(),
            sonar_root: env::var("SONAR_ROOT").ok(),
            log_cache: None,
            config_cache: None,
        })
    }

    /// The context of commands run on behalf of daemon clients: nothing comes from the daemon's own
    /// environment.

    pub fn for_daemon(log_cache: Option<Arc<LogCache>>, config_cache: Arc<ConfigCache>) -> Context {
        Context { log_cache, config_cache: Some(config_cache), ..Default::default() }
    }

    /// The log files to read: the explicit ones if any, otherwise the files under the data path for
    /// the hosts and the time window.

    pub fn logfiles(
        &self,
        source: &SourceArgs,
        hosts: &HostFilter,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<String>> {
        if !source.logfiles.is_empty() {
            return Ok(source.logfiles.clone());
        }
        let Some(data_path) = source.data_path.as_ref().or(self.sonar_root.as_ref()) else {
            bail!("Required --data-path or -- logfile ...");
        };
        sonarlog::find_logfiles(data_path, hosts, from, to)
    }

    pub fn read_entries(&self, files: &[String]) -> Result<Vec<LogEntry>> {
        let mut entries = vec![];
        for f in files {
            match self.log_cache {
                Some(ref cache) => entries.extend(cache.get(f)?.iter().cloned()),
                None => entries.extend(sonarlog::parse_logfile(f)?),
            }
        }
        Ok(entries)
    }

    pub fn read_config(&self, config_file: &Option<String>) -> Result<Option<Arc<ClusterConfig>>> {
        let Some(filename) = config_file else {
            return Ok(None);
        };
        match self.config_cache {
            Some(ref cache) => Ok(Some(cache.get(filename)?)),
            None => Ok(Some(Arc::new(sonarlog::read_cluster_config(filename)?))),
        }
    }
}

/// Run the command line `args`, whose first element is the program name.

pub fn dispatch(
    ctx: &Context,
    args: &[String],
    stdin: &mut dyn io::Read,
    stdout: &mut dyn io::Write,
    stderr: &mut dyn io::Write,
) -> Result<()> {
    let matches = Cli::command().try_get_matches_from(args)?;
    let mut cli = Cli::from_arg_matches(&matches)?;

    if let Some(source) = cli.command.source_args_mut() {
        source.apply_defaults(ctx.user_defaults.as_ref(), ctx.env_auth.is_some())?;
        if source.is_remote() {
            let Some((verb, sub)) = matches.subcommand() else {
                bail!("No command");
            };
            return remote::remote_operation(ctx, source, verb, sub, stdout);
        }
    }

    match cli.command {
        Commands::Jobs(ref a) => commands::jobs::run(ctx, a, stdout, stderr),
        Commands::Load(ref a) => commands::load::run(ctx, a, stdout, stderr),
        Commands::Uptime(ref a) => commands::uptime::run(ctx, a, stdout, stderr),
        Commands::Profile(ref a) => commands::profile::run(ctx, a, stdout, stderr),
        Commands::Parse(ref a) => commands::parse::run(ctx, a, stdout, stderr),
        Commands::Metadata(ref a) => commands::metadata::run(ctx, a, stdout, stderr),
        Commands::Add(ref a) => {
            if a.remote.is_some() || a.cluster.is_some() {
                remote::remote_add(ctx, a, stdin, stdout)
            } else {
                commands::add::run(a, stdin, stdout, stderr)
            }
        }
        Commands::Daemon(_) => bail!("The daemon can't be started from here"),
    }
}

#[cfg(test)]
pub fn run_for_test(ctx: &Context, args: &[&str]) -> Result<(String, String)> {
    let mut argv = vec!["sonalyze".to_string()];
    argv.extend(args.iter().map(|s| s.to_string()));
    let mut stdout = vec![];
    let mut stderr = vec![];
    dispatch(ctx, &argv, &mut io::empty(), &mut stdout, &mut stderr)?;
    Ok((String::from_utf8(stdout)?, String::from_utf8(stderr)?))
}

#[test]
fn test_dispatch_errors() {
    let ctx = Context::default();
    assert!(run_for_test(&ctx, &["bogus"]).is_err());
    let e = run_for_test(&ctx, &["jobs"]).unwrap_err().to_string();
    assert!(e == "Required --data-path or -- logfile ...");
    let e = run_for_test(&ctx, &["jobs", "--remote", "http://localhost"]).unwrap_err().to_string();
    assert!(e == "--remote and --cluster must be used together");
    assert!(run_for_test(&ctx, &["daemon", "--jobanalyzer-dir", "/tmp"]).is_err());
}

#[test]
fn test_dispatch_reads_cached() {
    let tmp = tempfile::TempDir::new().unwrap();
    let dir = tmp.path().join("2023/08/15");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("ml8.csv"),
        "v=0.7.0,time=2023-08-15T10:00:00Z,host=ml8,user=joe,job=10,pid=10,cmd=python,cpu%=100\n",
    )
    .unwrap();
    let cache = Arc::new(LogCache::new(1 << 20));
    let ctx = Context::for_daemon(Some(cache.clone()), Arc::new(ConfigCache::new()));
    let root = tmp.path().to_str().unwrap();
    let args = ["parse", "--data-path", root, "--from", "2023-08-15", "--to", "2023-08-15", "-u", "-"];
    let (a, _) = run_for_test(&ctx, &args).unwrap();
    let (b, _) = run_for_test(&ctx, &args).unwrap();
    assert!(a == b);
    assert!(a.contains("python"));
    assert!(cache.usage().0 == 1);
}
