// `sonalyze` -- Analyze `sonar` log files
//
// Run with --help for brief help, or with `<verb> --fmt=help` for the fields a verb can print.
//
// The analysis verbs read the log tree under --data-path, explicit log files, or with --remote and
// --cluster ask a `sonalyze daemon` to run the verb on the data it manages.  Defaults for the data
// source can be set in the [data-source] section of ~/.sonalyze.
//
// Quirks
//
// Having the absence of --user mean "only $LOGNAME" can be confusing -- though it's the right thing
// for a use case where somebody is looking only at their own jobs.  The daemon has no such notion
// and defaults to all users.
//
// The --from and --to values are used *both* for filtering files in the directory tree of logs
// (where it is used to generate directory names to search) *and* for filtering individual records
// in the log files.  Things can become confusing if the log records do not have dates corresponding
// to the directories they are located in.  This is mostly a concern for testing; production data
// will have a sane mapping.

use anyhow::Result;
use clap::Parser;
use sonalyze::cli::{Cli, Commands};
use sonalyze::daemon;
use sonalyze::dispatch::{dispatch, Context};
use std::env;
use std::io;
use std::process;

fn main() {
    match sonalyze() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {}", msg);
            process::exit(1);
        }
    }
}

fn sonalyze() -> Result<()> {
    let args = env::args().collect::<Vec<String>>();
    let cli = match Cli::try_parse_from(&args) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    if let Commands::Daemon(ref daemon_args) = cli.command {
        let runtime = tokio::runtime::Runtime::new()?;
        return runtime.block_on(daemon::run(daemon_args));
    }

    let ctx = Context::from_environment()?;
    let mut stdout = io::stdout().lock();
    dispatch(&ctx, &args, &mut io::stdin(), &mut stdout, &mut io::stderr())
}
