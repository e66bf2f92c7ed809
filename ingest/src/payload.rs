//! Decoding of ingestion payloads into store write requests.
//!
//! A payload is validated as a whole before anything is queued: one malformed record rejects the
//! batch.  Records are stored verbatim (free CSV, sysinfo) or re-encoded as free CSV (sample and
//! heartbeat JSON).  Host and cluster names become path components in the store and must pass
//! `sonarlog::is_store_name`.

use crate::{ClusterAliases, RequestError, WriteRequest};

use serde_json::Value;
use sonarlog::{is_store_name, sample_file_name, sysinfo_file_name, HeartbeatRecord, SampleRecord};

/// Sonar free-CSV, one record per line.  Every record must have `host` and `time`.

pub fn free_csv_requests(cluster: &str, body: &[u8]) -> Result<Vec<WriteRequest>, RequestError> {
    let mut requests = vec![];
    for line in body.split(|c| *c == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(|c| c.is_ascii_whitespace()) {
            continue;
        }
        let rows = sonarlog::parse_free_csv(line).map_err(|_| RequestError::BadContent)?;
        let Some(row) = rows.first() else {
            return Err(RequestError::BadContent);
        };
        match (row.get("host"), row.get("time")) {
            (Some(host), Some(time)) if is_store_name(host) && !time.is_empty() => {
                requests.push(WriteRequest::new(
                    cluster,
                    host,
                    time,
                    sample_file_name(host),
                    line.to_vec(),
                ));
            }
            _ => return Err(RequestError::BadContent),
        }
    }
    Ok(requests)
}

/// A JSON array of sample records.  Each names its own cluster.  When `required_cluster` is set,
/// records for other clusters are skipped.

pub fn sample_requests(
    body: &[u8],
    required_cluster: Option<&str>,
    aliases: &ClusterAliases,
) -> Result<Vec<WriteRequest>, RequestError> {
    let records: Vec<SampleRecord> =
        serde_json::from_slice(body).map_err(|_| RequestError::BadContent)?;
    let mut requests = vec![];
    for r in records {
        if !is_store_name(&r.host) || !is_store_name(&r.cluster) {
            return Err(RequestError::BadContent);
        }
        if required_cluster.is_some_and(|c| c != r.cluster) {
            tracing::info!(cluster = %r.cluster, "skipping sample for unauthorized cluster");
            continue;
        }
        requests.push(WriteRequest::new(
            aliases.resolve(&r.cluster),
            &r.host,
            &r.timestamp.to_rfc3339(),
            sample_file_name(&r.host),
            r.to_free_csv(),
        ));
    }
    Ok(requests)
}

/// A JSON array of heartbeat records, handled like samples.

pub fn heartbeat_requests(
    body: &[u8],
    required_cluster: Option<&str>,
    aliases: &ClusterAliases,
) -> Result<Vec<WriteRequest>, RequestError> {
    let records: Vec<HeartbeatRecord> =
        serde_json::from_slice(body).map_err(|_| RequestError::BadContent)?;
    let mut requests = vec![];
    for r in records {
        if !is_store_name(&r.host) || !is_store_name(&r.cluster) {
            return Err(RequestError::BadContent);
        }
        if required_cluster.is_some_and(|c| c != r.cluster) {
            tracing::info!(cluster = %r.cluster, "skipping heartbeat for unauthorized cluster");
            continue;
        }
        requests.push(WriteRequest::new(
            aliases.resolve(&r.cluster),
            &r.host,
            &r.timestamp.to_rfc3339(),
            sample_file_name(&r.host),
            r.to_free_csv(),
        ));
    }
    Ok(requests)
}

/// A single JSON node description with string fields `timestamp` and `hostname`.

pub fn sysinfo_request(cluster: &str, body: &[u8]) -> Result<WriteRequest, RequestError> {
    let v: Value = serde_json::from_slice(body).map_err(|_| RequestError::BadContent)?;
    let field = |name: &str| match v.get(name) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    };
    match (field("timestamp"), field("hostname")) {
        (Some(timestamp), Some(hostname)) if is_store_name(&hostname) => {
            let mut payload = body.to_vec();
            while payload.last().is_some_and(|c| c.is_ascii_whitespace()) {
                payload.pop();
            }
            Ok(WriteRequest::new(
                cluster,
                &hostname,
                &timestamp,
                sysinfo_file_name(&hostname),
                payload,
            ))
        }
        _ => Err(RequestError::BadContent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_csv_requests() {
        let body = b"v=0.7,time=2023-11-14T00:00:00Z,host=n1,cmd=py\r\n\nv=0.7,time=2023-11-14T00:05:00Z,host=n2,cmd=py\n";
        let rs = free_csv_requests("c", body).unwrap();
        assert_eq!(rs.len(), 2);
        assert_eq!(rs[0].file_name, "n1.csv");
        assert_eq!(rs[0].payload, b"v=0.7,time=2023-11-14T00:00:00Z,host=n1,cmd=py".to_vec());
        assert_eq!(rs[1].timestamp, "2023-11-14T00:05:00Z");

        // One bad line spoils the batch
        let body = b"v=0.7,time=2023-11-14T00:00:00Z,host=n1\nv=0.7,host=n2\n";
        assert_eq!(free_csv_requests("c", body), Err(RequestError::BadContent));
    }

    #[test]
    fn test_unsafe_names_rejected() {
        for host in ["../../etc", "a/b", "a\\b", "..", "x\\u0000y"] {
            let line = format!("v=0.7,time=2023-11-14T00:00:00Z,host={host},cmd=py\n");
            assert_eq!(
                free_csv_requests("c", line.as_bytes()),
                Err(RequestError::BadContent),
                "{host}"
            );
            let sysinfo =
                serde_json::json!({"timestamp": "2023-11-14T00:00:00Z", "hostname": host}).to_string();
            assert_eq!(sysinfo_request("c", sysinfo.as_bytes()), Err(RequestError::BadContent));
        }
        let line = b"v=0.7,time=2023-11-14T00:00:00Z,host=n1\0x,cmd=py\n";
        assert_eq!(free_csv_requests("c", line), Err(RequestError::BadContent));

        let aliases = ClusterAliases::default();
        let body = br#"[{"host":"../n1","timestamp":1700000000,"cluster":"c"}]"#;
        assert_eq!(sample_requests(body, None, &aliases), Err(RequestError::BadContent));
        let body = br#"[{"host":"n1","timestamp":1700000000,"cluster":"../../tmp"}]"#;
        assert_eq!(sample_requests(body, None, &aliases), Err(RequestError::BadContent));
        let body = br#"[{"host":"n1","timestamp":"2023-11-14T00:00:00Z","cluster":"a\\b"}]"#;
        assert_eq!(heartbeat_requests(body, None, &aliases), Err(RequestError::BadContent));
        let body = br#"[{"host":"n1\u0000","timestamp":"2023-11-14T00:00:00Z","cluster":"c"}]"#;
        assert_eq!(heartbeat_requests(body, None, &aliases), Err(RequestError::BadContent));
    }

    #[test]
    fn test_sample_requests() {
        let aliases = ClusterAliases::from_json(r#"[{"alias":"c","value":"c.uio.no"}]"#).unwrap();
        let body = br#"[{"host":"n1","timestamp":1700000000,"cluster":"c","cmd":"py"},
                        {"host":"n2","timestamp":1700000000,"cluster":"d","cmd":"py"}]"#;
        let rs = sample_requests(body, None, &aliases).unwrap();
        assert_eq!(rs.len(), 2);
        assert_eq!(rs[0].cluster, "c.uio.no");
        assert_eq!(rs[1].cluster, "d");

        let rs = sample_requests(body, Some("c"), &aliases).unwrap();
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].host, "n1");

        let body = br#"[{"host":"","timestamp":1700000000,"cluster":"c"}]"#;
        assert_eq!(sample_requests(body, None, &aliases), Err(RequestError::BadContent));
        assert_eq!(sample_requests(b"{}", None, &aliases), Err(RequestError::BadContent));
    }

    #[test]
    fn test_heartbeat_requests() {
        let body = br#"[{"host":"n1","timestamp":"2023-11-14T00:00:00Z","cluster":"c","version":"0.8.0"}]"#;
        let rs = heartbeat_requests(body, None, &ClusterAliases::default()).unwrap();
        assert_eq!(
            rs[0].payload,
            b"v=0.8.0,time=2023-11-14T00:00:00Z,host=n1,user=_sonar_,cmd=_heartbeat_\n".to_vec()
        );
    }

    #[test]
    fn test_sysinfo_request() {
        let body = b"{\"timestamp\":\"2023-11-14T00:00:00Z\",\"hostname\":\"n1\",\"cpu_cores\":8}\n";
        let r = sysinfo_request("c", body).unwrap();
        assert_eq!(r.file_name, "sysinfo-n1.json");
        assert_eq!(r.payload.last(), Some(&b'}'));
        assert_eq!(
            sysinfo_request("c", br#"{"hostname":"n1"}"#),
            Err(RequestError::BadContent)
        );
    }
}
