// `naicreport` -- Reports about policy violations from the job logs.
//
// Run with --help for brief help.  Each report is a subcommand; the report's state is kept in the
// state directory alongside the job logs, so that each violation is reported only once.

use anyhow::Result;
use clap::{Parser, Subcommand};
use naicreport::cpuhog::{self, CpuhogArgs};
use naicreport::deadweight::{self, DeadweightArgs};
use std::io;
use std::process;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report new jobs that use a lot of CPU and no GPU
    MlCpuhog(CpuhogArgs),

    /// Report new zombie, defunct and hung jobs
    MlDeadweight(DeadweightArgs),
}

fn main() {
    match naicreport() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {}", msg);
            process::exit(1);
        }
    }
}

fn naicreport() -> Result<()> {
    let cli = Cli::parse();
    let mut stdout = io::stdout().lock();
    match cli.command {
        Commands::MlCpuhog(ref args) => cpuhog::run(args, &mut stdout, &mut io::stderr()),
        Commands::MlDeadweight(ref args) => deadweight::run(args, &mut stdout, &mut io::stderr()),
    }
}
