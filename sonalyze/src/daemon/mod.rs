// `sonalyze daemon` - an HTTP server that runs analysis verbs on behalf of remote clients and
// accepts uploads for the data store under the Jobanalyzer directory.
//
// GET /jobs, /load, /uptime, /profile, /parse, /metadata ?cluster=C&name=value...
//
//   The parameters are turned into a command line for the verb, with the data path (and for some
//   verbs the cluster configuration) supplied by the daemon, and the verb is run in-process.  The
//   response is the verb's output, or 400 with the error message.
//
// POST /add?cluster=C&sample=..., /add?cluster=C&sysinfo=...
// POST /sonar-freecsv?cluster=C, /sysinfo?cluster=C
//
//   Uploads go through the same store writer as for `infiltrate`, rooted at <jobanalyzer-dir>/data.
//
// With --kafka the daemon also consumes the data topics of every cluster in the store.

pub mod kafka;

use crate::cache::{ConfigCache, LogCache};
use crate::cli::{Cli, DaemonArgs};
use crate::dispatch::{dispatch, Context};

use anyhow::{bail, Result};
use axum::extract::{Request, State};
use axum::http::Method;
use axum::routing::any;
use axum::Router;
use clap::CommandFactory;
use ingest::routes::{sonar_freecsv, sysinfo};
use ingest::{
    check_request, Authenticator, ClusterAliases, Expect, IngestState, RequestError, StoreWriter,
    StoreWriterConfig, MAGIC_BOOLEAN,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

pub const AUTH_REALM: &str = "Jobanalyzer remote access";
pub const CLUSTER_ALIASES_FILENAME: &str = "cluster-aliases.json";

/// The verbs that can be run remotely.

pub const VERBS: [&str; 6] = ["jobs", "load", "uptime", "profile", "parse", "metadata"];

// Verbs that get the cluster configuration.
const CONFIG_VERBS: [&str; 3] = ["jobs", "load", "uptime"];

// Parameters the daemon supplies itself or that make no sense remotely.
const RESERVED_PARAMS: [&str; 9] = [
    "cpuprofile",
    "data-path",
    "data-dir",
    "cluster",
    "remote",
    "auth-file",
    "config-file",
    "verbose",
    "raw",
];

pub struct DaemonState {
    pub jobanalyzer_dir: PathBuf,
    pub analysis_auth: Option<Authenticator>,
    pub aliases: ClusterAliases,
    pub log_cache: Option<Arc<LogCache>>,
    pub config_cache: Arc<ConfigCache>,
    pub ingest: Arc<IngestState>,
}

impl DaemonState {
    fn data_dir(&self) -> PathBuf {
        self.jobanalyzer_dir.join("data")
    }

    fn config_file(&self, cluster: &str) -> PathBuf {
        self.jobanalyzer_dir
            .join("scripts")
            .join(cluster)
            .join(format!("{cluster}-config.json"))
    }
}

pub fn daemon_routes(state: Arc<DaemonState>) -> Router {
    let mut router = Router::new();
    for verb in VERBS {
        router = router.route(
            &format!("/{verb}"),
            any(move |State(state): State<Arc<DaemonState>>, req: Request| {
                analysis(state, verb, req)
            }),
        );
    }
    let ingest = state.ingest.clone();
    router
        .route("/add", any(add))
        .with_state(state)
        .merge(
            Router::new()
                .route("/sonar-freecsv", any(sonar_freecsv))
                .route("/sysinfo", any(sysinfo))
                .with_state(ingest),
        )
}

async fn analysis(
    state: Arc<DaemonState>,
    verb: &'static str,
    req: Request,
) -> Result<String, RequestError> {
    let expect = Expect {
        method: Method::GET,
        authenticator: state.analysis_auth.as_ref(),
        realm: AUTH_REALM,
        content_type: None,
        need_cluster: true,
        match_user_and_cluster: false,
    };
    let accepted = check_request(req, &expect, &state.aliases).await?;
    let cluster = accepted.cluster.unwrap_or_default();
    let data_path = sonarlog::cluster_dir(&state.data_dir(), &cluster).map_err(|_| RequestError::BadCluster)?;
    let config_file = state.config_file(&cluster);
    let config_file = if CONFIG_VERBS.contains(&verb) && config_file.is_file() {
        Some(config_file)
    } else {
        None
    };
    let args = command_line(verb, &data_path, config_file.as_deref(), &accepted.params)?;
    tracing::debug!(command = %args.join(" "), "running");

    let ctx = Context::for_daemon(state.log_cache.clone(), state.config_cache.clone());
    let outcome = tokio::task::spawn_blocking(move || {
        let mut stdout = vec![];
        let mut stderr = vec![];
        let r = dispatch(&ctx, &args, &mut io::empty(), &mut stdout, &mut stderr);
        (r, stdout, stderr)
    })
    .await;

    let (r, stdout, stderr) = match outcome {
        Ok(x) => x,
        Err(e) => {
            tracing::error!(verb, error = %e, "command failed");
            return Err(RequestError::Command(format!("Internal error running {verb}")));
        }
    };
    let stderr = String::from_utf8_lossy(&stderr).to_string();
    match r {
        Ok(()) => {
            if !stderr.is_empty() {
                tracing::info!(verb, stderr = %stderr, "command succeeded with diagnostics");
            }
            Ok(String::from_utf8_lossy(&stdout).to_string())
        }
        Err(e) => {
            tracing::info!(verb, error = %e, "command failed");
            let mut text = e.to_string();
            if !stderr.is_empty() {
                text += "\n";
                text += &stderr;
            }
            Err(RequestError::Command(text))
        }
    }
}

/// True if `name` may be passed by a client as a parameter to a verb.

pub fn arg_ok(name: &str) -> bool {
    let mut cs = name.chars();
    name.len() >= 2
        && cs.next().is_some_and(|c| c.is_ascii_lowercase())
        && cs.all(|c| c.is_ascii_lowercase() || c == '-')
        && !RESERVED_PARAMS.contains(&name)
}

// True if `name` is a flag of `verb`, ie, an option that takes no value.
fn is_flag(verb: &str, name: &str) -> bool {
    Cli::command()
        .find_subcommand(verb)
        .and_then(|c| c.get_arguments().find(|a| a.get_long() == Some(name)).cloned())
        .is_some_and(|a| !a.get_action().takes_values())
}

/// The command line for `verb` from the request parameters, in order.  The magic value sets a flag.
/// For the verb's flags `true` and `false` also set and clear it; for other parameters they are
/// ordinary values.

pub fn command_line(
    verb: &str,
    data_path: &Path,
    config_file: Option<&Path>,
    params: &[(String, String)],
) -> Result<Vec<String>, RequestError> {
    let mut args = vec![
        "sonalyze".to_string(),
        verb.to_string(),
        "--data-path".to_string(),
        data_path.to_string_lossy().to_string(),
    ];
    if let Some(config_file) = config_file {
        args.push("--config-file".to_string());
        args.push(config_file.to_string_lossy().to_string());
    }
    for (name, value) in params {
        if name == "cluster" {
            continue;
        }
        if !arg_ok(name) {
            tracing::warn!(name = %name, "bad parameter");
            return Err(RequestError::BadParameter(name.clone()));
        }
        match value.as_str() {
            MAGIC_BOOLEAN => args.push(format!("--{name}")),
            "true" if is_flag(verb, name) => args.push(format!("--{name}")),
            "false" if is_flag(verb, name) => {}
            _ => args.push(format!("--{name}={value}")),
        }
    }
    Ok(args)
}

// /add is an alias for the upload endpoint selected by the one boolean parameter present.
async fn add(State(state): State<Arc<DaemonState>>, req: Request) -> Result<(), RequestError> {
    let params = req
        .uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_else(Vec::new);
    let is_sample = add_flag(&params, "sample")?;
    let is_sysinfo = add_flag(&params, "sysinfo")?;
    match (is_sample, is_sysinfo) {
        (true, false) => sonar_freecsv(State(state.ingest.clone()), req).await,
        (false, true) => sysinfo(State(state.ingest.clone()), req).await,
        _ => Err(RequestError::BadOperation(
            "Need exactly one of `sample` or `sysinfo`".to_string(),
        )),
    }
}

fn add_flag(params: &[(String, String)], name: &str) -> Result<bool, RequestError> {
    let values = params.iter().filter(|(k, _)| k == name).map(|(_, v)| v.as_str()).collect::<Vec<&str>>();
    match values.as_slice() {
        [] | ["false"] => Ok(false),
        ["true"] => Ok(true),
        [v] if *v == MAGIC_BOOLEAN => Ok(true),
        _ => Err(RequestError::BadOperation(format!("Bad `{name}` parameter"))),
    }
}

/// Run the daemon until signalled.

pub async fn run(args: &DaemonArgs) -> Result<()> {
    ingest::init_logging(args.verbose);

    let jobanalyzer_dir = PathBuf::from(&args.jobanalyzer_dir);
    if !jobanalyzer_dir.is_dir() {
        bail!("Bad --jobanalyzer-dir, not a directory: {}", args.jobanalyzer_dir);
    }
    let data_dir = jobanalyzer_dir.join("data");
    if !data_dir.is_dir() {
        bail!("No data directory {}", data_dir.display());
    }
    let aliases_file = jobanalyzer_dir.join(CLUSTER_ALIASES_FILENAME);
    let aliases = match fs::metadata(&aliases_file) {
        Ok(md) if md.is_file() => ClusterAliases::read(&aliases_file.to_string_lossy())?,
        Ok(_) => bail!("Cluster alias file is not a regular file: {}", aliases_file.display()),
        Err(_) => ClusterAliases::default(),
    };
    let analysis_auth = match args.analysis_auth {
        Some(ref filename) => Some(Authenticator::read_passwords(filename)?),
        None => None,
    };
    let upload_auth = match args.upload_auth {
        Some(ref filename) => Some(Authenticator::read_passwords(filename)?),
        None => None,
    };
    tracing::info!(
        jobanalyzer_dir = %args.jobanalyzer_dir,
        port = args.port,
        cache = ?args.cache,
        "sonalyze daemon starting"
    );
    let (writer, shutdown) = StoreWriter::start(data_dir.clone(), StoreWriterConfig::default());
    let ingest = Arc::new(IngestState {
        writer: writer.clone(),
        auth: upload_auth,
        realm: String::new(),
        aliases: aliases.clone(),
        match_user_and_cluster: args.match_user_and_cluster,
    });
    let state = Arc::new(DaemonState {
        jobanalyzer_dir,
        analysis_auth,
        aliases,
        log_cache: args.cache.map(|budget| Arc::new(LogCache::new(budget))),
        config_cache: Arc::new(ConfigCache::new()),
        ingest,
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    let workers = match start_kafka(args, &data_dir, &writer, stop_rx) {
        Ok(w) => w,
        Err(e) => {
            shutdown.stop().await;
            return Err(e);
        }
    };

    let router = daemon_routes(state).layer(TraceLayer::new_for_http());
    let served = ingest::serve(args.port, router).await;

    let _ = stop_tx.send(true);
    for w in workers {
        let _ = w.await;
    }
    shutdown.stop().await;
    served
}

#[cfg(feature = "kafka")]
fn start_kafka(
    args: &DaemonArgs,
    data_dir: &Path,
    writer: &StoreWriter,
    stop: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>> {
    match args.kafka {
        Some(ref broker) => {
            let clusters = known_clusters(data_dir)?;
            Ok(kafka::spawn_fleet(broker, &clusters, writer, stop))
        }
        None => Ok(vec![]),
    }
}

#[cfg(not(feature = "kafka"))]
fn start_kafka(
    args: &DaemonArgs,
    _data_dir: &Path,
    _writer: &StoreWriter,
    _stop: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>> {
    if args.kafka.is_some() {
        bail!("Kafka support is not built into this program");
    }
    Ok(vec![])
}

/// The clusters that have a directory in the store.

pub fn known_clusters(data_dir: &Path) -> Result<Vec<String>> {
    let mut clusters = vec![];
    for entry in fs::read_dir(data_dir)? {
        let Ok(entry) = entry else { continue };
        if entry.path().is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                clusters.push(name.to_string());
            }
        }
    }
    clusters.sort();
    Ok(clusters)
}

#[test]
fn test_arg_ok() {
    assert!(arg_ok("user"));
    assert!(arg_ok("min-cpu-avg"));
    assert!(!arg_ok("u"));
    assert!(!arg_ok("User"));
    assert!(!arg_ok("-user"));
    assert!(!arg_ok("cpu2"));
    assert!(!arg_ok("data-path"));
    assert!(!arg_ok("auth-file"));
    assert!(!arg_ok("raw"));
}

#[test]
fn test_command_line() {
    let params = vec![
        ("cluster".to_string(), "c".to_string()),
        ("user".to_string(), "-".to_string()),
        ("zombie".to_string(), MAGIC_BOOLEAN.to_string()),
        ("completed".to_string(), "false".to_string()),
        ("host".to_string(), "a".to_string()),
        ("host".to_string(), "b".to_string()),
    ];
    let args = command_line("jobs", Path::new("/x/data/c"), Some(Path::new("/x/c.json")), &params).unwrap();
    assert_eq!(
        args,
        vec![
            "sonalyze", "jobs", "--data-path", "/x/data/c", "--config-file", "/x/c.json", "--user=-",
            "--zombie", "--host=a", "--host=b"
        ]
    );

    // `true` and `false` are only special for flags
    let params = vec![
        ("completed".to_string(), "true".to_string()),
        ("running".to_string(), "false".to_string()),
        ("host".to_string(), "true".to_string()),
        ("user".to_string(), "false".to_string()),
    ];
    let args = command_line("jobs", Path::new("/d"), None, &params).unwrap();
    assert_eq!(
        args,
        vec!["sonalyze", "jobs", "--data-path", "/d", "--completed", "--host=true", "--user=false"]
    );
    let params = vec![("only-up".to_string(), "true".to_string()), ("host".to_string(), "false".to_string())];
    let args = command_line("uptime", Path::new("/d"), None, &params).unwrap();
    assert_eq!(args, vec!["sonalyze", "uptime", "--data-path", "/d", "--only-up", "--host=false"]);

    let params = vec![("data-path".to_string(), "/etc".to_string())];
    let e = command_line("jobs", Path::new("/x"), None, &params).unwrap_err();
    assert!(e == RequestError::BadParameter("data-path".to_string()));
}

#[test]
fn test_add_flag() {
    let p = |k: &str, v: &str| vec![(k.to_string(), v.to_string())];
    assert!(add_flag(&p("sample", MAGIC_BOOLEAN), "sample") == Ok(true));
    assert!(add_flag(&p("sample", "true"), "sample") == Ok(true));
    assert!(add_flag(&p("sample", "false"), "sample") == Ok(false));
    assert!(add_flag(&p("sysinfo", "true"), "sample") == Ok(false));
    assert!(add_flag(&p("sample", "yes"), "sample").is_err());
    let mut twice = p("sample", "true");
    twice.extend(p("sample", "true"));
    assert!(add_flag(&twice, "sample").is_err());
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, StatusCode};
    use http_body_util::BodyExt;
    use ingest::auth::basic_header_value;
    use ingest::WriterShutdown;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn make_state(dir: &Path) -> (Arc<DaemonState>, WriterShutdown) {
        let (writer, shutdown) = StoreWriter::start(dir.join("data"), StoreWriterConfig::default());
        let ingest = Arc::new(IngestState {
            writer,
            auth: Some(Authenticator::from_text("c:upload\n").unwrap()),
            realm: String::new(),
            aliases: ClusterAliases::default(),
            match_user_and_cluster: true,
        });
        let state = Arc::new(DaemonState {
            jobanalyzer_dir: dir.to_path_buf(),
            analysis_auth: Some(Authenticator::from_text("joe:secret\n").unwrap()),
            aliases: ClusterAliases::from_json(r#"[{"alias":"cc","value":"c"}]"#).unwrap(),
            log_cache: Some(Arc::new(LogCache::new(1 << 20))),
            config_cache: Arc::new(ConfigCache::new()),
            ingest,
        });
        (state, shutdown)
    }

    fn get(uri: &str, user: &str, pass: &str) -> Request {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(header::AUTHORIZATION, basic_header_value(user, pass))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(r: axum::response::Response) -> String {
        String::from_utf8(r.into_body().collect().await.unwrap().to_bytes().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_remote_jobs() {
        let tmp = TempDir::new().unwrap();
        let now = sonarlog::now();
        let day = tmp.path().join(format!("data/c/{}", now.format("%Y/%m/%d")));
        fs::create_dir_all(&day).unwrap();
        let t = now.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        fs::write(
            day.join("n1.csv"),
            format!("v=0.7.0,time={t},host=n1,user=joe,job=10,pid=10,cmd=python,cpu%=100\n"),
        )
        .unwrap();
        let (state, shutdown) = make_state(tmp.path());
        let app = daemon_routes(state);

        let r = app
            .clone()
            .oneshot(get("/jobs?cluster=cc&user=-&from=2d&min-samples=1&fmt=csv,job,user,cmd", "joe", "secret"))
            .await
            .unwrap();
        assert_eq!(r.status(), StatusCode::OK);
        assert_eq!(body_text(r).await, "10,joe,python\n");

        let r = app.clone().oneshot(get("/jobs?cluster=c&user=-", "joe", "wrong")).await.unwrap();
        assert_eq!(r.status(), StatusCode::UNAUTHORIZED);
        assert!(r.headers().get(header::WWW_AUTHENTICATE).is_some());

        let r = app.clone().oneshot(get("/jobs?cluster=c&data-path=/etc", "joe", "secret")).await.unwrap();
        assert_eq!(r.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(r).await, "Bad parameter data-path");

        let r = app.clone().oneshot(get("/jobs?user=-", "joe", "secret")).await.unwrap();
        assert_eq!(r.status(), StatusCode::BAD_REQUEST);

        let r = app.clone().oneshot(get("/jobs?cluster=c&from=bogus", "joe", "secret")).await.unwrap();
        assert_eq!(r.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(r).await, "Invalid --from argument bogus");

        let post = Request::builder().method(Method::POST).uri("/jobs?cluster=c").body(Body::empty()).unwrap();
        let r = app.oneshot(post).await.unwrap();
        assert_eq!(r.status(), StatusCode::FORBIDDEN);
        shutdown.stop().await;
    }

    #[tokio::test]
    async fn test_cluster_outside_store() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("data/c")).unwrap();
        fs::create_dir_all(tmp.path().join("secret/2023/11/14")).unwrap();
        let (state, shutdown) = make_state(tmp.path());
        let app = daemon_routes(state);
        for cluster in ["..", "..%2Fsecret", "c%2F..%2F..%2Fsecret", "%2Fetc", "c%5C..", "c%00"] {
            let uri = format!("/metadata?cluster={cluster}&files={MAGIC_BOOLEAN}");
            let r = app.clone().oneshot(get(&uri, "joe", "secret")).await.unwrap();
            assert_eq!(r.status(), StatusCode::BAD_REQUEST, "{cluster}");
            assert_eq!(body_text(r).await, RequestError::BadCluster.to_string());
        }
        shutdown.stop().await;
    }

    #[tokio::test]
    async fn test_add() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("data")).unwrap();
        let (state, shutdown) = make_state(tmp.path());
        let app = daemon_routes(state);
        let post = |uri: &str, content_type: &str, body: &str| {
            Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::AUTHORIZATION, basic_header_value("c", "upload"))
                .body(Body::from(body.to_string()))
                .unwrap()
        };
        let line = "v=0.7,time=2023-11-14T00:00:00Z,host=n1,cmd=py,job=1,pid=100,cpu%=1,cpukib=10,user=u";

        let r = app
            .clone()
            .oneshot(post(&format!("/add?cluster=c&sample={MAGIC_BOOLEAN}"), "text/csv", line))
            .await
            .unwrap();
        assert_eq!(r.status(), StatusCode::OK);

        let r = app
            .clone()
            .oneshot(post("/add?cluster=c&sample=true&sysinfo=true", "text/csv", line))
            .await
            .unwrap();
        assert_eq!(r.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(r).await.starts_with("Bad operation: "));

        let r = app.clone().oneshot(post("/sonar-freecsv?cluster=c", "text/csv", line)).await.unwrap();
        assert_eq!(r.status(), StatusCode::OK);

        let r = app.oneshot(post("/sonar-freecsv?cluster=d", "text/csv", line)).await.unwrap();
        assert_eq!(r.status(), StatusCode::BAD_REQUEST);

        shutdown.stop().await;
        let text = fs::read_to_string(tmp.path().join("data/c/2023/11/14/n1.csv")).unwrap();
        assert_eq!(text, format!("{line}\n{line}\n"));
    }

    #[test]
    fn test_known_clusters() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("b")).unwrap();
        fs::create_dir_all(tmp.path().join("a")).unwrap();
        fs::write(tmp.path().join("README"), "x").unwrap();
        assert_eq!(known_clusters(tmp.path()).unwrap(), vec!["a", "b"]);
    }
}
