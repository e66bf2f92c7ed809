//! The checks every request goes through before its payload is looked at, in this order:
//!
//!   method -> authentication -> content type -> body -> cluster parameter
//!
//! The first failing check decides the response.

use crate::auth::basic_credentials;
use crate::{Authenticator, ClusterAliases, RequestError};

use axum::body::{to_bytes, Body, Bytes};
use axum::http::{header, Method, Request};

/// Upper bound on a request body.
pub const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

/// What an endpoint requires of a request.

pub struct Expect<'a> {
    pub method: Method,

    /// When present, requests must carry valid basic-auth credentials.  Without it, requests must
    /// carry none.
    pub authenticator: Option<&'a Authenticator>,

    /// Realm for the challenge on failed authentication; empty for no challenge.
    pub realm: &'a str,

    /// Media type the `Content-Type` header must have, if any.
    pub content_type: Option<&'a str>,

    /// Require exactly one non-empty `cluster` query parameter.
    pub need_cluster: bool,

    /// Require an authenticated user to be named the same as the cluster.
    pub match_user_and_cluster: bool,
}

/// A request that passed the checks.

#[derive(Debug)]
pub struct Accepted {
    /// Authenticated user name, if any.
    pub user: Option<String>,

    /// Canonical cluster name, when the cluster parameter was required.
    pub cluster: Option<String>,

    /// All query parameters in order, including `cluster`.
    pub params: Vec<(String, String)>,

    pub body: Bytes,
}

pub async fn check_request(
    req: Request<Body>,
    expect: &Expect<'_>,
    aliases: &ClusterAliases,
) -> Result<Accepted, RequestError> {
    if req.method() != expect.method {
        tracing::debug!(method = %req.method(), "bad method");
        return Err(RequestError::BadMethod);
    }

    let credentials = basic_credentials(req.headers());
    let passed = match (expect.authenticator, &credentials) {
        (None, None) => true,
        (Some(a), Some((user, pass))) => a.authenticate(user, pass),
        _ => false,
    };
    if !passed {
        tracing::warn!("authorization failed");
        let realm = if expect.authenticator.is_some() && !expect.realm.is_empty() {
            Some(expect.realm.to_string())
        } else {
            None
        };
        return Err(RequestError::Unauthorized { realm });
    }
    let user = credentials.map(|(user, _)| user);

    if let Some(want) = expect.content_type {
        let have = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_string());
        if have.as_deref() != Some(want) {
            tracing::debug!(content_type = ?have, "bad content-type");
            return Err(RequestError::BadContentType);
        }
    }

    let params = req
        .uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_else(Vec::new);

    let body = to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|_| RequestError::BadContent)?;

    let cluster = if expect.need_cluster {
        let clusters = params
            .iter()
            .filter(|(k, _)| k == "cluster")
            .map(|(_, v)| v.as_str())
            .collect::<Vec<&str>>();
        if clusters.len() != 1 || !sonarlog::is_store_name(clusters[0]) {
            return Err(RequestError::BadCluster);
        }
        let cluster = clusters[0];
        if expect.match_user_and_cluster && user.as_deref().is_some_and(|u| u != cluster) {
            return Err(RequestError::UploadNotAuthorized);
        }
        Some(aliases.resolve(cluster).to_string())
    } else {
        None
    };

    Ok(Accepted {
        user,
        cluster,
        params,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::basic_header_value;

    fn expect<'a>(auth: Option<&'a Authenticator>) -> Expect<'a> {
        Expect {
            method: Method::POST,
            authenticator: auth,
            realm: "",
            content_type: Some("text/csv"),
            need_cluster: true,
            match_user_and_cluster: true,
        }
    }

    fn request(method: Method, uri: &str, auth: Option<(&str, &str)>, ct: &str) -> Request<Body> {
        let mut b = Request::builder().method(method).uri(uri).header(header::CONTENT_TYPE, ct);
        if let Some((u, p)) = auth {
            b = b.header(header::AUTHORIZATION, basic_header_value(u, p));
        }
        b.body(Body::from("x=1")).unwrap()
    }

    #[tokio::test]
    async fn test_order_of_checks() {
        let a = Authenticator::from_text("c:pw\nd:pw\n").unwrap();
        let aliases = ClusterAliases::from_json(r#"[{"alias":"c","value":"c.uio.no"}]"#).unwrap();
        let e = expect(Some(&a));

        // Method before auth
        let r = check_request(request(Method::GET, "/x?cluster=c", None, "x"), &e, &aliases).await;
        assert_eq!(r.unwrap_err(), RequestError::BadMethod);

        // Auth before content type
        let r = check_request(request(Method::POST, "/x?cluster=c", None, "x"), &e, &aliases).await;
        assert_eq!(r.unwrap_err(), RequestError::Unauthorized { realm: None });

        // Content type before cluster
        let r = check_request(request(Method::POST, "/x", Some(("c", "pw")), "x"), &e, &aliases).await;
        assert_eq!(r.unwrap_err(), RequestError::BadContentType);

        let r = check_request(request(Method::POST, "/x", Some(("c", "pw")), "text/csv"), &e, &aliases).await;
        assert_eq!(r.unwrap_err(), RequestError::BadCluster);

        let r = check_request(
            request(Method::POST, "/x?cluster=c&cluster=c", Some(("c", "pw")), "text/csv"),
            &e,
            &aliases,
        )
        .await;
        assert_eq!(r.unwrap_err(), RequestError::BadCluster);

        // User/cluster match is checked before the alias is resolved
        let r = check_request(request(Method::POST, "/x?cluster=c", Some(("d", "pw")), "text/csv"), &e, &aliases).await;
        assert_eq!(r.unwrap_err(), RequestError::UploadNotAuthorized);

        let ok = check_request(
            request(Method::POST, "/x?cluster=c", Some(("c", "pw")), "text/csv; charset=utf-8"),
            &e,
            &aliases,
        )
        .await
        .unwrap();
        assert_eq!(ok.user.as_deref(), Some("c"));
        assert_eq!(ok.cluster.as_deref(), Some("c.uio.no"));
        assert_eq!(&ok.body[..], b"x=1");
    }

    #[tokio::test]
    async fn test_unsafe_cluster() {
        let aliases = ClusterAliases::default();
        let e = expect(None);
        for q in ["..", "..%2F..%2Fetc", "a%2Fb", "%2Ftmp", "a%5Cb", "a%00b", "."] {
            let uri = format!("/x?cluster={q}");
            let r = check_request(request(Method::POST, &uri, None, "text/csv"), &e, &aliases).await;
            assert_eq!(r.unwrap_err(), RequestError::BadCluster, "{q}");
        }
        let ok = check_request(request(Method::POST, "/x?cluster=ml.hpc", None, "text/csv"), &e, &aliases).await;
        assert_eq!(ok.unwrap().cluster.as_deref(), Some("ml.hpc"));
    }

    #[tokio::test]
    async fn test_no_credential_store() {
        let aliases = ClusterAliases::default();
        let mut e = expect(None);
        e.realm = "Jobanalyzer remote access";
        let ok = check_request(request(Method::POST, "/x?cluster=c", None, "text/csv"), &e, &aliases).await;
        assert!(ok.unwrap().user.is_none());

        // Credentials are not expected when there is nothing to check them against, and there is
        // no challenge.
        let r = check_request(request(Method::POST, "/x?cluster=c", Some(("c", "pw")), "text/csv"), &e, &aliases).await;
        assert_eq!(r.unwrap_err(), RequestError::Unauthorized { realm: None });
    }

    #[tokio::test]
    async fn test_realm() {
        let a = Authenticator::from_text("c:pw\n").unwrap();
        let mut e = expect(Some(&a));
        e.realm = "Jobanalyzer remote access";
        let r = check_request(
            request(Method::POST, "/x?cluster=c", Some(("c", "wrong")), "text/csv"),
            &e,
            &ClusterAliases::default(),
        )
        .await;
        assert_eq!(
            r.unwrap_err(),
            RequestError::Unauthorized { realm: Some("Jobanalyzer remote access".to_string()) }
        );
    }
}
