//! The ingestion endpoints.  Each runs the request preamble, decodes its payload as a whole, and
//! hands the records to the store writer.  A response of 200 means the records are queued, not that
//! they are on disk.

use crate::payload::{free_csv_requests, heartbeat_requests, sample_requests, sysinfo_request};
use crate::{
    check_request, Authenticator, ClusterAliases, Expect, RequestError, StoreWriter, WriteRequest,
};

use axum::extract::{Request, State};
use axum::http::Method;
use axum::routing::any;
use axum::Router;
use std::sync::Arc;

pub struct IngestState {
    pub writer: StoreWriter,

    /// Credentials for uploads; without it, uploads must be anonymous.
    pub auth: Option<Authenticator>,

    /// Challenge realm on failed authentication, empty for none.
    pub realm: String,

    pub aliases: ClusterAliases,

    /// Require the authenticated user to be named as the cluster that is uploaded to.
    pub match_user_and_cluster: bool,
}

impl IngestState {
    fn expect(&self, content_type: &'static str, need_cluster: bool) -> Expect<'_> {
        Expect {
            method: Method::POST,
            authenticator: self.auth.as_ref(),
            realm: &self.realm,
            content_type: Some(content_type),
            need_cluster,
            match_user_and_cluster: self.match_user_and_cluster,
        }
    }

    async fn store(&self, requests: Vec<WriteRequest>) -> Result<(), RequestError> {
        tracing::debug!(records = requests.len(), "queueing records");
        for req in requests {
            if let Err(e) = self.writer.write(req).await {
                tracing::error!(error = %e, "could not queue record");
                return Err(RequestError::Unavailable);
            }
        }
        Ok(())
    }
}

/// Routes for all four endpoints.  Methods are checked by the handlers, so that a wrong method gets
/// the same treatment everywhere.

pub fn ingest_routes(state: Arc<IngestState>) -> Router {
    Router::new()
        .route("/sonar-reading", any(sonar_reading))
        .route("/sonar-heartbeat", any(sonar_heartbeat))
        .route("/sonar-freecsv", any(sonar_freecsv))
        .route("/sysinfo", any(sysinfo))
        .with_state(state)
}

pub async fn sonar_reading(
    State(state): State<Arc<IngestState>>,
    req: Request,
) -> Result<(), RequestError> {
    let accepted = check_request(req, &state.expect("application/json", false), &state.aliases).await?;
    let required = required_cluster(&state, &accepted.user);
    let requests = sample_requests(&accepted.body, required, &state.aliases)?;
    state.store(requests).await
}

pub async fn sonar_heartbeat(
    State(state): State<Arc<IngestState>>,
    req: Request,
) -> Result<(), RequestError> {
    let accepted = check_request(req, &state.expect("application/json", false), &state.aliases).await?;
    let required = required_cluster(&state, &accepted.user);
    let requests = heartbeat_requests(&accepted.body, required, &state.aliases)?;
    state.store(requests).await
}

pub async fn sonar_freecsv(
    State(state): State<Arc<IngestState>>,
    req: Request,
) -> Result<(), RequestError> {
    let accepted = check_request(req, &state.expect("text/csv", true), &state.aliases).await?;
    let cluster = accepted.cluster.unwrap_or_default();
    let requests = free_csv_requests(&cluster, &accepted.body)?;
    state.store(requests).await
}

pub async fn sysinfo(
    State(state): State<Arc<IngestState>>,
    req: Request,
) -> Result<(), RequestError> {
    let accepted = check_request(req, &state.expect("application/json", true), &state.aliases).await?;
    let cluster = accepted.cluster.unwrap_or_default();
    let request = sysinfo_request(&cluster, &accepted.body)?;
    state.store(vec![request]).await
}

// JSON records name their own cluster, so the user can only be matched against each record.

fn required_cluster<'a>(state: &IngestState, user: &'a Option<String>) -> Option<&'a str> {
    if state.match_user_and_cluster {
        user.as_deref()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::basic_header_value;
    use crate::storewriter::{StoreWriterConfig, WriterShutdown};
    use axum::body::Body;
    use axum::http::{header, StatusCode};
    use http_body_util::BodyExt;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn make_state(root: &Path, match_user: bool) -> (Arc<IngestState>, WriterShutdown) {
        let (writer, shutdown) = StoreWriter::start(root.to_path_buf(), StoreWriterConfig::default());
        let state = IngestState {
            writer,
            auth: Some(Authenticator::from_text("c:secret\n").unwrap()),
            realm: String::new(),
            aliases: ClusterAliases::default(),
            match_user_and_cluster: match_user,
        };
        (Arc::new(state), shutdown)
    }

    fn post(uri: &str, content_type: &str, body: &str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::AUTHORIZATION, basic_header_value("c", "secret"))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    const READING: &str = r#"[{"host":"n1","timestamp":1700000000,"cluster":"c","cmd":"py","cpu_util_pct":10,"cpu_kb":1024}]"#;

    #[tokio::test]
    async fn test_sonar_reading() {
        let tmp = TempDir::new().unwrap();
        let (state, shutdown) = make_state(tmp.path(), true);
        let response = ingest_routes(state)
            .oneshot(post("/sonar-reading", "application/json", READING))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        shutdown.stop().await;

        let text = fs::read_to_string(tmp.path().join("c/2023/11/14/n1.csv")).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.contains("host=n1"));
    }

    #[tokio::test]
    async fn test_wrong_content_type() {
        let tmp = TempDir::new().unwrap();
        let (state, shutdown) = make_state(tmp.path(), false);
        let response = ingest_routes(state)
            .oneshot(post("/sonar-reading", "text/plain", READING))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "Bad content-type");
        shutdown.stop().await;
        assert!(!tmp.path().join("c").exists());
    }

    #[tokio::test]
    async fn test_sonar_freecsv() {
        let tmp = TempDir::new().unwrap();
        let (state, shutdown) = make_state(tmp.path(), true);
        let line = "v=0.7,time=2023-11-14T00:00:00Z,host=n1,cmd=py,job=1,pid=100,cpu%=1,cpukib=10,user=u";
        let response = ingest_routes(state)
            .oneshot(post("/sonar-freecsv?cluster=c", "text/csv", line))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        shutdown.stop().await;

        let text = fs::read_to_string(tmp.path().join("c/2023/11/14/n1.csv")).unwrap();
        assert_eq!(text, format!("{line}\n"));
    }

    #[tokio::test]
    async fn test_freecsv_upload_not_authorized() {
        let tmp = TempDir::new().unwrap();
        let (state, shutdown) = make_state(tmp.path(), true);
        let response = ingest_routes(state)
            .oneshot(post("/sonar-freecsv?cluster=d", "text/csv", "time=2023-11-14T00:00:00Z,host=n1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "Upload not authorized");
        shutdown.stop().await;
    }

    #[tokio::test]
    async fn test_wrong_method_and_auth() {
        let tmp = TempDir::new().unwrap();
        let (state, shutdown) = make_state(tmp.path(), false);
        let router = ingest_routes(state);

        let get = Request::builder().uri("/sysinfo?cluster=c").body(Body::empty()).unwrap();
        let response = router.clone().oneshot(get).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let anonymous = Request::builder()
            .method(Method::POST)
            .uri("/sysinfo?cluster=c")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let response = router.oneshot(anonymous).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
        shutdown.stop().await;
    }

    #[tokio::test]
    async fn test_sysinfo() {
        let tmp = TempDir::new().unwrap();
        let (state, shutdown) = make_state(tmp.path(), false);
        let body = r#"{"timestamp":"2023-11-14T10:00:00+01:00","hostname":"n1","cpu_cores":8}"#;
        let response = ingest_routes(state)
            .oneshot(post("/sysinfo?cluster=c", "application/json", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        shutdown.stop().await;

        let text = fs::read_to_string(tmp.path().join("c/2023/11/14/sysinfo-n1.json")).unwrap();
        assert_eq!(text, format!("{body}\n"));
    }
}
