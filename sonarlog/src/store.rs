// Appending records to the log store.  A record with timestamp T for host H in cluster C goes to
//
//   <root>/C/<yyyy>/<mm>/<dd>/<file>
//
// where the date is the UTC date of T and <file> is derived from H.  Directories are created with
// mode 0755 and files with mode 0644.  Files are only ever appended to.
//
// C and H come from clients.  Each must be usable as a single path component, see
// `is_store_name`, or the record is refused.

use crate::parse_rfc3339;

use chrono::Datelike;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The record can never be stored.
    #[error("bad timestamp `{0}`")]
    BadTimestamp(String),

    /// Creating the directory or opening the file failed; trying again later may work.
    #[error("can't open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    /// The cluster or file name would escape the store.
    #[error("bad name `{0}`")]
    BadName(String),

    /// The write was accepted but no bytes were appended; trying again later may work.
    #[error("nothing written to {path}")]
    NothingWritten { path: PathBuf },

    /// Some bytes may have been appended.  The file can't be repaired from here.
    #[error("write failed for {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Open { .. } | StoreError::NothingWritten { .. })
    }
}

/// True if `name` can be used as one path component in the store: not empty, and without `/`,
/// `\`, `..` or NUL.

pub fn is_store_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && !name.contains("..")
        && !name.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
}

/// The directory for `cluster` under the store root.

pub fn cluster_dir(root: &Path, cluster: &str) -> Result<PathBuf, StoreError> {
    if !is_store_name(cluster) {
        return Err(StoreError::BadName(cluster.to_string()));
    }
    Ok(root.join(cluster))
}

pub fn sample_file_name(host: &str) -> String {
    format!("{host}.csv")
}

pub fn sysinfo_file_name(host: &str) -> String {
    format!("sysinfo-{host}.json")
}

/// The directory for records on the date of `timestamp` (RFC 3339) under `cluster_dir`.

pub fn store_dir(cluster_dir: &Path, timestamp: &str) -> Result<PathBuf, StoreError> {
    let t = parse_rfc3339(timestamp).map_err(|_| StoreError::BadTimestamp(timestamp.to_string()))?;
    Ok(cluster_dir.join(format!("{}/{:02}/{:02}", t.year(), t.month(), t.day())))
}

/// Append `payload` to `file_name` in the directory for `timestamp`, adding a newline if the payload
/// does not end with one.  Returns the path of the file written.

pub fn append_record(
    cluster_dir: &Path,
    timestamp: &str,
    file_name: &str,
    payload: &[u8],
) -> Result<PathBuf, StoreError> {
    if !is_store_name(file_name) {
        return Err(StoreError::BadName(file_name.to_string()));
    }
    let dir = store_dir(cluster_dir, timestamp)?;
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o755);
    builder.create(&dir).map_err(|source| StoreError::Open {
        path: dir.clone(),
        source,
    })?;

    let path = dir.join(file_name);
    let mut options = fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    options.mode(0o644);
    let mut file = options.open(&path).map_err(|source| StoreError::Open {
        path: path.clone(),
        source,
    })?;

    let mut buf = payload.to_vec();
    if buf.last() != Some(&b'\n') {
        buf.push(b'\n');
    }
    // One write call is one append.  A short write is not resumed.
    match file.write(&buf) {
        Ok(n) if n == buf.len() => Ok(path),
        Ok(0) => Err(StoreError::NothingWritten { path }),
        Ok(n) => Err(StoreError::Write {
            path,
            source: io::Error::new(io::ErrorKind::WriteZero, format!("short write: {n} of {}", buf.len())),
        }),
        Err(source) => Err(StoreError::Write { path, source }),
    }
}

#[test]
fn test_append_record() {
    let dir = tempfile::TempDir::new().unwrap();
    let cluster_dir = dir.path().join("c");
    let p = append_record(&cluster_dir, "2023-11-14T22:13:20Z", "n1.csv", b"a=1").unwrap();
    assert!(p == cluster_dir.join("2023/11/14/n1.csv"));
    append_record(&cluster_dir, "2023-11-14T23:00:00Z", "n1.csv", b"a=2\n").unwrap();
    assert!(fs::read_to_string(&p).unwrap() == "a=1\na=2\n");

    // The partition is by UTC date
    let p = append_record(&cluster_dir, "2023-11-15T00:30:00+01:00", "n1.csv", b"a=3").unwrap();
    assert!(p == cluster_dir.join("2023/11/14/n1.csv"));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&p).unwrap().permissions().mode() & 0o777;
        assert!(mode & 0o600 == 0o600);
    }

    match append_record(&cluster_dir, "yesterday", "n1.csv", b"a=4") {
        Err(StoreError::BadTimestamp(_)) => {}
        _ => panic!("Expected bad timestamp"),
    }
}

#[test]
fn test_append_unwritable() {
    let dir = tempfile::TempDir::new().unwrap();
    // A plain file where the cluster directory should be
    let blocker = dir.path().join("c");
    fs::write(&blocker, "x").unwrap();
    let err = append_record(&blocker, "2023-11-14T22:13:20Z", "n1.csv", b"a=1").unwrap_err();
    assert!(err.is_retryable());
}

#[test]
fn test_store_names() {
    for good in ["ml8", "ml8.hpc.uio.no", "sysinfo-n1.json", "0+sample-n1.json", "a.b"] {
        assert!(is_store_name(good), "{good}");
    }
    for bad in ["", ".", "..", "../x", "a/b", "a\\b", "x..y", "/etc", "a\0b"] {
        assert!(!is_store_name(bad), "{bad}");
    }

    let dir = tempfile::TempDir::new().unwrap();
    assert!(cluster_dir(dir.path(), "c").unwrap() == dir.path().join("c"));
    assert!(matches!(cluster_dir(dir.path(), "../c"), Err(StoreError::BadName(_))));

    let store = dir.path().join("store/c1");
    let err = append_record(&store, "2023-08-15T10:00:00Z", "../../../../escaped.csv", b"x=1").unwrap_err();
    assert!(matches!(err, StoreError::BadName(_)));
    assert!(!err.is_retryable());
    assert!(!dir.path().join("escaped.csv").exists());
    assert!(!store.exists());
}

#[test]
fn test_retryable_errors() {
    assert!(StoreError::NothingWritten { path: PathBuf::from("x") }.is_retryable());
    let partial = StoreError::Write {
        path: PathBuf::from("x"),
        source: io::Error::new(io::ErrorKind::WriteZero, "short write"),
    };
    assert!(!partial.is_retryable());
    assert!(!StoreError::BadTimestamp("x".to_string()).is_retryable());
}
