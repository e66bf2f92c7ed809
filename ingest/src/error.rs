//! Request failures and their HTTP rendering.  The body of every failure response is a short
//! human-readable message; clients show it verbatim.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("Bad method")]
    BadMethod,

    /// `realm` is set when the failure should carry a `WWW-Authenticate` challenge.
    #[error("Unauthorized")]
    Unauthorized { realm: Option<String> },

    #[error("Bad content-type")]
    BadContentType,

    #[error("Bad content")]
    BadContent,

    #[error("Bad parameters - missing or empty or repeated 'cluster'")]
    BadCluster,

    #[error("Upload not authorized")]
    UploadNotAuthorized,

    #[error("Bad parameter {0}")]
    BadParameter(String),

    #[error("Bad operation: {0}")]
    BadOperation(String),

    /// Failure reported by a command, with its text.
    #[error("{0}")]
    Command(String),

    /// The store writer has stopped.
    #[error("Store unavailable")]
    Unavailable,
}

impl RequestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RequestError::BadMethod => StatusCode::FORBIDDEN,
            RequestError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            RequestError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let challenge = match &self {
            RequestError::Unauthorized { realm: Some(realm) } => {
                HeaderValue::from_str(&format!("Basic realm=\"{realm}\", charset=\"utf-8\"")).ok()
            }
            _ => None,
        };
        let mut response = (status, self.to_string()).into_response();
        if let Some(value) = challenge {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(RequestError::BadMethod.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            RequestError::Unauthorized { realm: None }.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(RequestError::BadContentType.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            RequestError::BadParameter("raw".to_string()).to_string(),
            "Bad parameter raw"
        );
    }

    #[test]
    fn test_challenge_header() {
        let r = RequestError::Unauthorized { realm: Some("Jobanalyzer remote access".to_string()) }
            .into_response();
        assert_eq!(
            r.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"Jobanalyzer remote access\", charset=\"utf-8\""
        );
        let r = RequestError::Unauthorized { realm: None }.into_response();
        assert!(r.headers().get(header::WWW_AUTHENTICATE).is_none());
    }
}
