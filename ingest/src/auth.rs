//! Credentials.
//!
//! A client's credentials live in a file with a single line `user:password` (the older form
//! `user/password` is also accepted).  A server's credentials live in a password file with one
//! `user:password` per line; blank lines are ignored and a user may appear only once.

use anyhow::{bail, Result};
use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::fs;

/// Read a client credentials file.

pub fn parse_auth(filename: &str) -> Result<(String, String)> {
    parse_auth_text(&fs::read_to_string(filename)?)
}

pub fn parse_auth_text(text: &str) -> Result<(String, String)> {
    let text = text.trim();
    let mut xs = text.split('/').collect::<Vec<&str>>();
    if xs.len() != 2 {
        xs = text.split(':').collect();
    }
    if xs.len() != 2 || xs[0].contains(':') {
        bail!("Authentication file has the wrong format or illegal values")
    }
    Ok((xs[0].to_string(), xs[1].to_string()))
}

/// The user -> password map of a server.  Immutable once loaded.

#[derive(Debug, Default, Clone)]
pub struct Authenticator {
    identities: HashMap<String, String>,
}

impl Authenticator {
    pub fn read_passwords(filename: &str) -> Result<Authenticator> {
        Authenticator::from_text(&fs::read_to_string(filename)?)
    }

    pub fn from_text(text: &str) -> Result<Authenticator> {
        let mut identities = HashMap::new();
        for (i, l) in text.lines().enumerate() {
            let s = l.trim();
            if s.is_empty() {
                continue;
            }
            let xs = s.split(':').collect::<Vec<&str>>();
            if xs.len() != 2 {
                bail!("Password file has the wrong format (line {})", i + 1)
            }
            if identities.contains_key(xs[0]) {
                bail!("Password file has duplicated user name (line {})", i + 1)
            }
            identities.insert(xs[0].to_string(), xs[1].to_string());
        }
        Ok(Authenticator { identities })
    }

    pub fn authenticate(&self, user: &str, pass: &str) -> bool {
        self.identities.get(user).is_some_and(|p| p == pass)
    }
}

/// The user and password of an `Authorization: Basic` header, if there is a well-formed one.

pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// The value of an `Authorization` header for these credentials.

pub fn basic_header_value(user: &str, pass: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_parse_auth() {
        assert_eq!(
            parse_auth_text("joe:secret\n").unwrap(),
            ("joe".to_string(), "secret".to_string())
        );
        assert_eq!(
            parse_auth_text("  joe/secret  ").unwrap(),
            ("joe".to_string(), "secret".to_string())
        );
        assert!(parse_auth_text("joe").is_err());
        assert!(parse_auth_text("joe:sec:ret").is_err());
        assert!(parse_auth_text("j:oe/secret").is_err());
    }

    #[test]
    fn test_read_passwords() {
        let a = Authenticator::from_text("joe:secret\n\n  ann:pw  \n").unwrap();
        assert!(a.authenticate("joe", "secret"));
        assert!(a.authenticate("ann", "pw"));
        assert!(!a.authenticate("ann", "secret"));
        assert!(!a.authenticate("bob", ""));

        let e = Authenticator::from_text("joe:secret\nann\n").unwrap_err();
        assert_eq!(e.to_string(), "Password file has the wrong format (line 2)");
        let e = Authenticator::from_text("joe:secret\n\njoe:other\n").unwrap_err();
        assert_eq!(e.to_string(), "Password file has duplicated user name (line 3)");
    }

    #[test]
    fn test_basic_credentials() {
        let mut headers = HeaderMap::new();
        assert!(basic_credentials(&headers).is_none());
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&basic_header_value("joe", "pw")).unwrap(),
        );
        assert_eq!(basic_credentials(&headers), Some(("joe".to_string(), "pw".to_string())));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert!(basic_credentials(&headers).is_none());
    }
}
