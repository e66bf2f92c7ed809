// Run a command on a remote `sonalyze daemon`.
//
// The command line is turned back into query parameters: every argument the user gave explicitly
// is sent under its long name, and boolean flags are sent with a magic value that the daemon
// recognizes.  Arguments that only make sense locally are not sent.  The cluster and the time
// window are sent as they are after defaults have been applied.  The daemon's output is copied to
// stdout; a failure is reported with the text of the daemon's response.

use crate::cli::{AddArgs, Cli, SourceArgs};
use crate::dispatch::Context;

use anyhow::{bail, Result};
use clap::parser::ValueSource;
use clap::{ArgAction, ArgMatches, CommandFactory};
use ingest::auth::parse_auth_text;
use ingest::MAGIC_BOOLEAN;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::CONTENT_TYPE;
use std::fs;
use std::io;
use std::time::Duration;
use url::Url;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// Argument ids that are handled separately or not forwarded at all.
const LOCAL_ARGS: [&str; 10] = [
    "remote",
    "cluster",
    "auth_file",
    "data_path",
    "logfiles",
    "config_file",
    "verbose",
    "raw",
    "from",
    "to",
];

pub fn remote_operation(
    ctx: &Context,
    source: &SourceArgs,
    verb: &str,
    matches: &ArgMatches,
    stdout: &mut dyn io::Write,
) -> Result<()> {
    let (Some(remote), Some(cluster)) = (&source.remote, &source.cluster) else {
        bail!("--remote and --cluster must be used together");
    };
    let mut params = command_line_params(verb, matches)?;
    params.push(("cluster".to_string(), cluster.clone()));
    if let Some(ref from) = source.from {
        params.push(("from".to_string(), from.clone()));
    }
    if let Some(ref to) = source.to {
        params.push(("to".to_string(), to.clone()));
    }

    let url = operation_url(remote, verb, &params)?;
    let credentials = credentials(ctx, &source.auth_file)?;
    let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
    tracing::debug!(url = %url, "remote operation");
    send(with_auth(client.get(url), &credentials), stdout)
}

/// Send the `add` payload on stdin to the daemon's /add endpoint.

pub fn remote_add(
    ctx: &Context,
    args: &AddArgs,
    stdin: &mut dyn io::Read,
    stdout: &mut dyn io::Write,
) -> Result<()> {
    let (Some(remote), Some(cluster)) = (&args.remote, &args.cluster) else {
        bail!("--remote and --cluster must be used together");
    };
    if args.data_path.is_some() {
        bail!("--data-path may not be used with --remote or --cluster");
    }
    let (kind, content_type) = match (args.sample, args.sysinfo) {
        (true, false) => ("sample", "text/csv"),
        (false, true) => ("sysinfo", "application/json"),
        _ => bail!("Exactly one of --sample or --sysinfo is required"),
    };
    let mut body = vec![];
    stdin.read_to_end(&mut body)?;

    let params = vec![
        (kind.to_string(), MAGIC_BOOLEAN.to_string()),
        ("cluster".to_string(), cluster.clone()),
    ];
    let url = operation_url(remote, "add", &params)?;
    let credentials = credentials(ctx, &args.auth_file)?;
    let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
    let req = client.post(url).header(CONTENT_TYPE, content_type).body(body);
    send(with_auth(req, &credentials), stdout)
}

// The explicitly given arguments of the subcommand, under their long names.
fn command_line_params(verb: &str, matches: &ArgMatches) -> Result<Vec<(String, String)>> {
    let cmd = Cli::command();
    let Some(sub) = cmd.find_subcommand(verb) else {
        bail!("Unknown verb {verb}");
    };
    let mut params = vec![];
    for arg in sub.get_arguments() {
        let id = arg.get_id().as_str();
        let Some(long) = arg.get_long() else {
            continue;
        };
        if LOCAL_ARGS.contains(&id) || matches.value_source(id) != Some(ValueSource::CommandLine) {
            continue;
        }
        match arg.get_action() {
            ArgAction::SetTrue => params.push((long.to_string(), MAGIC_BOOLEAN.to_string())),
            _ => {
                if let Ok(Some(values)) = matches.try_get_raw(id) {
                    for v in values {
                        params.push((long.to_string(), v.to_string_lossy().to_string()));
                    }
                }
            }
        }
    }
    Ok(params)
}

fn operation_url(remote: &str, verb: &str, params: &[(String, String)]) -> Result<Url> {
    let mut url = Url::parse(&format!("{}/{}", remote.trim_end_matches('/'), verb))?;
    url.query_pairs_mut().extend_pairs(params.iter());
    Ok(url)
}

// $SONALYZE_AUTH takes precedence over --auth-file.
fn credentials(ctx: &Context, auth_file: &Option<String>) -> Result<Option<(String, String)>> {
    if let Some(ref text) = ctx.env_auth {
        return match parse_auth_text(text) {
            Ok(c) => Ok(Some(c)),
            Err(_) => bail!("Invalid SONALYZE_AUTH syntax"),
        };
    }
    let Some(filename) = auth_file else {
        return Ok(None);
    };
    let text = fs::read_to_string(filename)?;
    let lines = text.lines().filter(|l| !l.trim().is_empty()).collect::<Vec<&str>>();
    if lines.len() != 1 {
        bail!("Auth file must have exactly one line");
    }
    match parse_auth_text(lines[0]) {
        Ok(c) => Ok(Some(c)),
        Err(_) => bail!("Invalid auth file syntax"),
    }
}

fn with_auth(req: RequestBuilder, credentials: &Option<(String, String)>) -> RequestBuilder {
    match credentials {
        Some((user, pass)) => req.basic_auth(user, Some(pass)),
        None => req,
    }
}

fn send(req: RequestBuilder, stdout: &mut dyn io::Write) -> Result<()> {
    let response = req.send()?;
    let status = response.status();
    let body = response.bytes()?;
    if !status.is_success() {
        bail!("Remote: {}", String::from_utf8_lossy(&body).trim_end());
    }
    stdout.write_all(&body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    // Answer one request with `status` and `body`, returning the request text.
    fn serve_once(status: u16, body: &'static str) -> (u16, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = vec![];
            let mut chunk = [0u8; 4096];
            loop {
                let n = stream.read(&mut chunk).unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap()))
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            write!(
                stream,
                "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });
        (port, handle)
    }

    #[test]
    fn test_remote_jobs() {
        let (port, server) = serve_once(200, "10,joe\n");
        let ctx = Context { env_auth: Some("joe:secret".to_string()), ..Default::default() };
        let remote = format!("http://127.0.0.1:{port}");
        let args = [
            "jobs", "--remote", &remote, "--cluster", "ml", "--from", "2d", "-u", "joe", "--zombie",
            "--fmt", "csv,job,user", "-v",
        ];
        let (out, _) = crate::dispatch::run_for_test(&ctx, &args).unwrap();
        assert_eq!(out, "10,joe\n");

        let request = server.join().unwrap();
        let first = request.lines().next().unwrap();
        assert!(first.starts_with("GET /jobs?"));
        assert!(first.contains("user=joe"));
        assert!(first.contains(&format!("zombie={MAGIC_BOOLEAN}")));
        assert!(first.contains("fmt=csv%2Cjob%2Cuser"));
        assert!(first.contains("cluster=ml"));
        assert!(first.contains("from=2d"));
        assert!(!first.contains("verbose"));
        assert!(!first.contains("remote"));
        assert!(request.to_ascii_lowercase().contains("authorization: basic"));
    }

    #[test]
    fn test_remote_failure() {
        let (port, _server) = serve_once(400, "Bad parameter bogus\n");
        let ctx = Context::default();
        let remote = format!("http://127.0.0.1:{port}");
        let args = ["load", "--remote", &remote, "--cluster", "ml"];
        let e = crate::dispatch::run_for_test(&ctx, &args).unwrap_err().to_string();
        assert_eq!(e, "Remote: Bad parameter bogus");
    }

    #[test]
    fn test_remote_add() {
        let (port, server) = serve_once(200, "");
        let ctx = Context::default();
        let args = AddArgs {
            sysinfo: true,
            remote: Some(format!("http://127.0.0.1:{port}/")),
            cluster: Some("ml".to_string()),
            ..Default::default()
        };
        let mut input = r#"{"hostname":"ml8"}"#.as_bytes();
        remote_add(&ctx, &args, &mut input, &mut io::sink()).unwrap();
        let request = server.join().unwrap();
        assert!(request.starts_with(&format!("POST /add?sysinfo={MAGIC_BOOLEAN}&cluster=ml HTTP/1.1")));
        assert!(request.ends_with(r#"{"hostname":"ml8"}"#));
    }

    #[test]
    fn test_credentials() {
        let tmp = tempfile::TempDir::new().unwrap();
        let good = tmp.path().join("good");
        fs::write(&good, "joe:secret\n\n").unwrap();
        let bad = tmp.path().join("bad");
        fs::write(&bad, "joe:secret\nann:secret\n").unwrap();
        let ctx = Context::default();
        let c = credentials(&ctx, &Some(good.to_str().unwrap().to_string())).unwrap();
        assert!(c == Some(("joe".to_string(), "secret".to_string())));
        let e = credentials(&ctx, &Some(bad.to_str().unwrap().to_string())).unwrap_err();
        assert!(e.to_string() == "Auth file must have exactly one line");
        assert!(credentials(&ctx, &None).unwrap().is_none());

        let ctx = Context { env_auth: Some("nonsense".to_string()), ..Default::default() };
        let e = credentials(&ctx, &Some(good.to_str().unwrap().to_string())).unwrap_err();
        assert!(e.to_string() == "Invalid SONALYZE_AUTH syntax");
    }
}
