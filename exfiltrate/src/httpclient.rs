// A simple HTTP client with a retry queue.
//
// A POST that fails at the transport level, or is answered with anything but a 2xx status, is put
// on the retry queue, and `drain` resends queued payloads at fixed intervals until every payload has
// been delivered or has used up its attempts.  There is no telling a host that is down from a
// misconfiguration from here, so every failure is treated as transient.
//
// The client is not thread-safe and is meant to have a single owner: posting and draining must not
// happen concurrently.

use anyhow::{bail, Result};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::Certificate;
use std::fs;
use std::thread;
use std::time::Duration;
use url::Url;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

struct Retry {
    attempts: u32, // attempts made so far
    path: String,
    content_type: String,
    body: Vec<u8>,
}

pub struct HttpClient {
    target: Url,
    client: Client,
    credentials: Option<(String, String)>,
    max_attempts: u32,
    resend_interval: Duration,
    retries: Vec<Retry>,
    posts: u64,
    delivered: u64,
    dropped: u64,
}

impl HttpClient {
    /// `max_attempts` bounds the number of POSTs per payload, including the first.  With a
    /// `ca_cert` PEM file, the server's certificate is validated against that.

    pub fn new(
        target: Url,
        ca_cert: Option<&str>,
        credentials: Option<(String, String)>,
        max_attempts: u32,
        resend_interval: Duration,
    ) -> Result<HttpClient> {
        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(filename) = ca_cert {
            let pem = fs::read(filename)?;
            if !String::from_utf8_lossy(&pem).contains("-----BEGIN CERTIFICATE-----") {
                bail!("Invalid cert in CA PEM")
            }
            let Ok(cert) = Certificate::from_pem(&pem) else {
                bail!("Invalid cert in CA PEM")
            };
            builder = builder.add_root_certificate(cert);
        }
        Ok(HttpClient {
            target,
            client: builder.build()?,
            credentials,
            max_attempts,
            resend_interval,
            retries: vec![],
            posts: 0,
            delivered: 0,
            dropped: 0,
        })
    }

    /// POST `body` to the target URL extended by `path`, which should start with `/`.  On failure
    /// the payload is queued for `drain`.

    pub fn post(&mut self, path: &str, content_type: &str, body: Vec<u8>) {
        self.attempt(Retry {
            attempts: 0,
            path: path.to_string(),
            content_type: content_type.to_string(),
            body,
        })
    }

    /// Resend queued payloads until the queue is empty.  Sleeps before every round.

    pub fn drain(&mut self) {
        while !self.retries.is_empty() {
            thread::sleep(self.resend_interval);
            let rs = std::mem::take(&mut self.retries);
            tracing::debug!(pending = rs.len(), "resending");
            for r in rs {
                self.attempt(r);
            }
        }
    }

    /// Number of payloads waiting to be resent.

    pub fn pending(&self) -> usize {
        self.retries.len()
    }

    /// (POSTs attempted, payloads delivered, payloads dropped)

    pub fn counts(&self) -> (u64, u64, u64) {
        (self.posts, self.delivered, self.dropped)
    }

    fn attempt(&mut self, mut r: Retry) {
        let url = format!("{}{}", self.target.as_str().trim_end_matches('/'), r.path);
        let mut req = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, &r.content_type)
            .body(r.body.clone());
        if let Some((ref user, ref pass)) = self.credentials {
            req = req.basic_auth(user, Some(pass));
        }
        r.attempts += 1;
        self.posts += 1;
        tracing::debug!(url = %url, bytes = r.body.len(), attempts = r.attempts, "posting");

        let failure = match req.send() {
            Ok(response) => {
                let status = response.status();
                // The body must be consumed for the connection to be reused.
                let _ = response.bytes();
                if status.is_success() {
                    None
                } else {
                    Some(format!("HTTP status={}", status.as_u16()))
                }
            }
            Err(e) => Some(e.to_string()),
        };

        match failure {
            None => self.delivered += 1,
            Some(msg) if r.attempts < self.max_attempts => {
                tracing::info!(url = %url, attempts = r.attempts, "failed to post, will retry: {msg}");
                self.retries.push(r);
            }
            Some(msg) => {
                self.dropped += 1;
                tracing::warn!(url = %url, attempts = r.attempts, "failed to post after max retries: {msg}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    // Answer `statuses.len()` requests, one per connection, with the given statuses.
    fn serve(statuses: Vec<u16>) -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let mut requests = vec![];
            for status in statuses {
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
                        if buf.len() >= end + 4 + length || n == 0 {
                            requests.push(text);
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }
                write!(stream, "HTTP/1.1 {status} X\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").unwrap();
            }
            requests
        });
        (port, handle)
    }

    #[test]
    fn test_connection_refused_is_bounded() {
        let target = Url::parse(&format!("http://127.0.0.1:{}", closed_port())).unwrap();
        let mut client = HttpClient::new(target, None, None, 6, Duration::ZERO).unwrap();
        client.post("/sonar-reading", "application/json", b"[]".to_vec());
        assert_eq!(client.pending(), 1);
        client.drain();
        assert_eq!(client.pending(), 0);
        assert_eq!(client.counts(), (6, 0, 1));
    }

    #[test]
    fn test_retry_until_delivered() {
        let (port, server) = serve(vec![503, 400, 200]);
        let target = Url::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        let credentials = Some(("c".to_string(), "secret".to_string()));
        let mut client = HttpClient::new(target, None, credentials, 6, Duration::ZERO).unwrap();
        client.post("/sonar-heartbeat", "application/json", b"[{}]".to_vec());
        client.drain();
        assert_eq!(client.counts(), (3, 1, 0));

        let requests = server.join().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].starts_with("POST /sonar-heartbeat HTTP/1.1"));
        assert!(requests[0].to_ascii_lowercase().contains("authorization: basic yzpzzwnyzxq="));
        assert!(requests[2].ends_with("[{}]"));
    }

    #[test]
    fn test_bad_ca_cert() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("bad.pem");
        fs::write(&file, "not a certificate").unwrap();
        let target = Url::parse("https://localhost:8443").unwrap();
        let r = HttpClient::new(target, Some(file.to_str().unwrap()), None, 6, Duration::ZERO);
        assert!(r.is_err());
    }
}
