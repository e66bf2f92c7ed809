// `exfiltrate` - data forwarder for sonar output, to run on the compute nodes.
//
// Exfiltrate reads sonar's output from stdin, reformats it for transmission and forwards it to a
// receiver.  It does so reliably: a payload that could not be delivered is resent at fixed intervals
// until it is delivered or a maximum number of attempts has been made.  To keep load off the server,
// the first send happens at a random time inside a sending window.
//
// Stdin is read to EOF before anything else happens, so that the producer can exit right away.
//
// Example, with a sending window of 300s:
//
//   sonar ps ... | exfiltrate --window=300 --cluster=ml --source=sonar/csvnamed --output=json \
//                    --target=https://... --ca-cert=ca.pem --auth-file=upload-auth.txt
//
// Source formats: "sonar/csvnamed", mixed sample and heartbeat records as free CSV.
//
// Output formats: "json", arrays of at most 10 records.  Samples are posted to
// <target>/sonar-reading and heartbeats to <target>/sonar-heartbeat.  Every record is tagged with
// the cluster name unless it names one already.
//
// An http target must not have --ca-cert; an https target must.

mod httpclient;

use anyhow::{bail, Result};
use clap::Parser;
use httpclient::HttpClient;
use rand::Rng;
use serde::Serialize;
use sonarlog::{parse_free_csv, Getter, HeartbeatRecord, JsonTime, SampleRecord, HEARTBEAT_CMD};
use std::io::{self, Read};
use std::process;
use std::thread;
use std::time::Duration;
use url::Url;

// A few large jobs per node is the common case, so this is more than enough.
const MAX_RECORDS_PER_MESSAGE: usize = 10;

// Together these give the server about half an hour to come back if it's down.
const MAX_ATTEMPTS: u32 = 6;
const RESEND_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Parser, Debug)]
#[command(author, version, about = "Forward sonar data to a receiver", long_about = None)]
struct Cli {
    /// Send data inside a window of this many seconds
    #[arg(long, default_value_t = 0)]
    window: u64,

    /// Tag the data as coming from this cluster (required)
    #[arg(long)]
    cluster: String,

    /// Assume input data are in this format (required; only sonar/csvnamed)
    #[arg(long)]
    source: String,

    /// Transmit data in this format (required; only json)
    #[arg(long)]
    output: String,

    /// Upload data to this URL, scheme://host:port (required)
    #[arg(long)]
    target: String,

    /// Read upload credentials, `user:password`, from this file
    #[arg(long)]
    auth_file: Option<String>,

    /// Validate the server against this CA certificate (required for https)
    #[arg(long)]
    ca_cert: Option<String>,

    /// Verbose information
    #[arg(short, default_value_t = false)]
    v: bool,
}

fn main() {
    match exfiltrate() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {}", msg);
            process::exit(1);
        }
    }
}

fn exfiltrate() -> Result<()> {
    let cli = Cli::parse();
    ingest::init_logging(cli.v);

    if cli.source != "sonar/csvnamed" {
        bail!("Unknown --source value {}", cli.source);
    }
    if cli.output != "json" {
        bail!("--output must be `json`");
    }
    let target = check_target(&cli.target, cli.ca_cert.as_deref())?;
    let credentials = match cli.auth_file {
        Some(ref filename) => Some(ingest::auth::parse_auth(filename)?),
        None => None,
    };

    let mut input = vec![];
    io::stdin().read_to_end(&mut input)?;
    tracing::debug!(bytes = input.len(), "input read");

    let (samples, heartbeats, bad) = parse_input(&input, &cli.cluster)?;
    if bad > 0 {
        tracing::warn!("Bad records and/or fields: {bad}");
    }
    tracing::debug!(samples = samples.len(), heartbeats = heartbeats.len(), "input parsed");

    if cli.window > 0 {
        let secs = rand::thread_rng().gen_range(0..cli.window);
        tracing::debug!("Sleeping {secs} seconds");
        thread::sleep(Duration::from_secs(secs));
    }

    let mut client = HttpClient::new(
        target,
        cli.ca_cert.as_deref(),
        credentials,
        MAX_ATTEMPTS,
        RESEND_INTERVAL,
    )?;
    for body in batches(&samples)? {
        client.post("/sonar-reading", "application/json", body);
    }
    for body in batches(&heartbeats)? {
        client.post("/sonar-heartbeat", "application/json", body);
    }

    // The producer is long gone by now.  Undeliverable payloads are eventually dropped; out of
    // order arrival at the receiver is fine.
    client.drain();

    let (posts, delivered, dropped) = client.counts();
    tracing::debug!(posts, delivered, dropped, "done");
    Ok(())
}

fn check_target(target: &str, ca_cert: Option<&str>) -> Result<Url> {
    let Ok(url) = Url::parse(target) else {
        bail!("Failed to parse target URL {target}")
    };
    if url.host_str().is_none() || !(url.path().is_empty() || url.path() == "/") {
        bail!("Failed to parse target URL {target}")
    }
    match (url.scheme(), ca_cert) {
        ("http", None) | ("https", Some(_)) => Ok(url),
        ("http", Some(_)) => bail!("--ca-cert is not allowed with an http target"),
        ("https", None) => bail!("--ca-cert is required with an https target"),
        _ => bail!("Only http / https targets for now"),
    }
}

/// Split sonar free-CSV into samples and heartbeats, tagged with `cluster` unless they carry a
/// `cluster` field.  Also returns the number of records that could not be decoded.

fn parse_input(
    input: &[u8],
    cluster: &str,
) -> Result<(Vec<SampleRecord>, Vec<HeartbeatRecord>, usize)> {
    let mut samples = vec![];
    let mut heartbeats = vec![];
    let mut bad = 0;
    for row in parse_free_csv(input)? {
        let cluster = match row.get("cluster") {
            Some(c) if !c.is_empty() => c.as_str(),
            _ => cluster,
        };
        if row.get("cmd").map(String::as_str) == Some(HEARTBEAT_CMD) {
            let mut g = Getter::new(&row);
            let hb = HeartbeatRecord {
                version: g.string("v"),
                cluster: cluster.to_string(),
                host: g.string("host"),
                timestamp: JsonTime(g.rfc3339("time")),
            };
            if g.success && !hb.host.is_empty() {
                heartbeats.push(hb);
            } else {
                bad += 1;
            }
        } else {
            match SampleRecord::from_free_csv(&row, cluster) {
                Ok(r) if !r.host.is_empty() => samples.push(r),
                _ => bad += 1,
            }
        }
    }
    Ok((samples, heartbeats, bad))
}

fn batches<T: Serialize>(records: &[T]) -> Result<Vec<Vec<u8>>> {
    let mut bodies = vec![];
    for chunk in records.chunks(MAX_RECORDS_PER_MESSAGE) {
        bodies.push(serde_json::to_vec(chunk)?);
    }
    Ok(bodies)
}

#[test]
fn test_parse_input() {
    let input = "v=0.9.0,time=2023-11-14T00:00:00Z,host=n1,user=u,cmd=py,cpu%=NaN,job=3\n\
                 v=0.9.0,time=2023-11-14T00:00:00Z,host=n1,user=_sonar_,cmd=_heartbeat_\n\
                 v=0.9.0,time=2023-11-14T00:00:00Z,host=n2,user=u,cmd=py,cluster=other\n\
                 v=0.9.0,host=n1,user=u,cmd=py\n";
    let (samples, heartbeats, bad) = parse_input(input.as_bytes(), "ml").unwrap();
    assert!(samples.len() == 2);
    assert!(heartbeats.len() == 1);
    assert!(bad == 1);
    assert!(samples[0].cluster == "ml");
    assert!(samples[0].cpu_pct == 0.0);
    assert!(samples[0].job == 3);
    assert!(samples[1].cluster == "other");
    assert!(heartbeats[0].cluster == "ml");
    assert!(heartbeats[0].host == "n1");
}

#[test]
fn test_batches() {
    let records = (0..25).collect::<Vec<u32>>();
    let bodies = batches(&records).unwrap();
    assert!(bodies.len() == 3);
    assert!(bodies[2] == b"[20,21,22,23,24]".to_vec());
    assert!(batches::<u32>(&[]).unwrap().is_empty());
}

#[test]
fn test_check_target() {
    assert!(check_target("http://localhost:8086", None).is_ok());
    assert!(check_target("http://localhost:8086", Some("ca.pem")).is_err());
    assert!(check_target("https://localhost:8086", None).is_err());
    assert!(check_target("https://localhost:8086", Some("ca.pem")).is_ok());
    assert!(check_target("ftp://localhost", None).is_err());
    assert!(check_target("http://localhost:8086/path", None).is_err());
    assert!(check_target("nonsense", None).is_err());
}

#[test]
fn test_cli() {
    let cli = Cli::try_parse_from([
        "exfiltrate",
        "--window=5",
        "--cluster=c",
        "--source=sonar/csvnamed",
        "--output=json",
        "--target=http://127.0.0.1:0",
    ])
    .unwrap();
    assert!(cli.window == 5);
    assert!(cli.auth_file.is_none());
    assert!(Cli::try_parse_from(["exfiltrate", "--window=5"]).is_err());
}
