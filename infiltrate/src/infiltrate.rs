// `infiltrate` - data receiver for node data, to run on the database/analysis host.
//
// Infiltrate accepts sonar samples, heartbeats and sysinfo records by HTTP POST and appends them to
// the data store under `<data-path>/<cluster>/<yyyy>/<mm>/<dd>/`.  It is the only contact point for
// the forwarders on the nodes, and there can be only one per data store since its store writer
// assumes it is the sole writer.
//
// Services:
//
// POST /sonar-freecsv?cluster=C     text/csv, one free-CSV record per line, stored verbatim
// POST /sysinfo?cluster=C           application/json, one node description
// POST /sonar-reading               application/json, array of samples, each naming its cluster
// POST /sonar-heartbeat             application/json, array of heartbeats, ditto
//
// With --auth-file every request must carry basic-auth credentials found in that file.  With
// --match-user-and-cluster in addition, the user name must equal the cluster uploaded to; JSON
// records for other clusters are skipped.
//
// SIGHUP or SIGTERM shut the server down in an orderly manner.  The exit code is non-zero if an
// error was found during startup or shutdown.

use anyhow::{bail, Result};
use clap::Parser;
use ingest::{ingest_routes, Authenticator, ClusterAliases, IngestState, StoreWriter, StoreWriterConfig};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Parser, Debug)]
#[command(author, version, about = "Receive sonar data and store it", long_about = None)]
struct Cli {
    /// Listen for connections on this port
    #[arg(long, default_value_t = 8086)]
    port: u16,

    /// Root directory of the data store (required)
    #[arg(long, alias = "data-dir")]
    data_path: String,

    /// Read user names and passwords from this file, one `user:password` per line
    #[arg(long)]
    auth_file: Option<String>,

    /// Require the authenticated user name to match the cluster name
    #[arg(long, default_value_t = false)]
    match_user_and_cluster: bool,

    /// JSON file mapping cluster aliases to canonical cluster names
    #[arg(long)]
    cluster_aliases: Option<String>,

    /// Verbose logging
    #[arg(short, default_value_t = false)]
    v: bool,
}

fn main() {
    match infiltrate() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {}", msg);
            process::exit(1);
        }
    }
}

#[tokio::main]
async fn infiltrate() -> Result<()> {
    let cli = Cli::parse();
    ingest::init_logging(cli.v);

    let data_path = PathBuf::from(&cli.data_path);
    if !data_path.is_dir() {
        bail!("Bad --data-path, not a directory: {}", cli.data_path);
    }
    let auth = match cli.auth_file {
        Some(ref filename) => Some(Authenticator::read_passwords(filename)?),
        None => None,
    };
    let aliases = match cli.cluster_aliases {
        Some(ref filename) => ClusterAliases::read(filename)?,
        None => ClusterAliases::default(),
    };

    tracing::info!(
        data_path = %cli.data_path,
        port = cli.port,
        authenticated = auth.is_some(),
        "infiltrate starting"
    );
    let (writer, shutdown) = StoreWriter::start(data_path, StoreWriterConfig::default());
    let state = IngestState {
        writer,
        auth,
        realm: String::new(),
        aliases,
        match_user_and_cluster: cli.match_user_and_cluster,
    };
    let router = ingest_routes(Arc::new(state)).layer(TraceLayer::new_for_http());

    let served = ingest::serve(cli.port, router).await;
    shutdown.stop().await;
    served
}

#[test]
fn test_cli() {
    let cli = Cli::try_parse_from(["infiltrate", "--data-dir", "/tmp", "-v"]).unwrap();
    assert!(cli.port == 8086);
    assert!(cli.data_path == "/tmp");
    assert!(cli.v);
    assert!(Cli::try_parse_from(["infiltrate"]).is_err());
}
