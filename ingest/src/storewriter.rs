//! The store writer.
//!
//! There is one writer per process and it is the only code that appends to the data files, so we
//! don't need file system locks: HTTP handlers and Kafka workers run concurrently and hand their
//! records to the writer through a bounded queue, and the writer appends them one at a time on a
//! dedicated blocking worker.  A full queue blocks the senders.
//!
//! Failure to create the directory or open the file is retried after a delay, up to a fixed number
//! of attempts; the retry is scheduled on a separate task so that the worker stays responsive.  A
//! failure during the append itself is logged and the record is abandoned, since the file may now
//! hold part of it.
//!
//! To stop the writer, first stop everything that sends records, then call `WriterShutdown::stop`,
//! which sends the sentinel and waits for the worker to finish what is queued before it.  Pending
//! retries die with the process.

use anyhow::{anyhow, Result};
use sonarlog::{append_record, cluster_dir, StoreError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub const MAX_WRITE_ATTEMPTS: u32 = 6;
pub const WRITE_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);
pub const QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub cluster: String,
    pub host: String,
    /// RFC 3339; determines the directory.
    pub timestamp: String,
    pub file_name: String,
    pub payload: Vec<u8>,
    attempts: u32,
}

impl WriteRequest {
    pub fn new(
        cluster: &str,
        host: &str,
        timestamp: &str,
        file_name: String,
        payload: Vec<u8>,
    ) -> WriteRequest {
        WriteRequest {
            cluster: cluster.to_string(),
            host: host.to_string(),
            timestamp: timestamp.to_string(),
            file_name,
            payload,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreWriterConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub capacity: usize,
}

impl Default for StoreWriterConfig {
    fn default() -> Self {
        StoreWriterConfig {
            max_attempts: MAX_WRITE_ATTEMPTS,
            retry_delay: WRITE_RETRY_DELAY,
            capacity: QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Default)]
pub struct WriterStats {
    pub written: AtomicU64,
    pub retried: AtomicU64,
    pub dropped: AtomicU64,
}

/// Handle for submitting records.  Cheap to clone.

#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::Sender<Option<WriteRequest>>,
    stats: Arc<WriterStats>,
}

/// Handle for stopping the writer.

pub struct WriterShutdown {
    tx: mpsc::Sender<Option<WriteRequest>>,
    done: oneshot::Receiver<()>,
}

impl StoreWriter {
    /// Start the worker.  Must be called from within a tokio runtime.  Records for cluster C are
    /// stored under `data_root/C`.

    pub fn start(data_root: PathBuf, config: StoreWriterConfig) -> (StoreWriter, WriterShutdown) {
        let (tx, mut rx) = mpsc::channel::<Option<WriteRequest>>(config.capacity);
        let (done_tx, done) = oneshot::channel();
        let stats = Arc::new(WriterStats::default());
        let runtime = tokio::runtime::Handle::current();
        let requeue = tx.clone();
        let worker_stats = stats.clone();

        tokio::task::spawn_blocking(move || {
            while let Some(Some(mut req)) = rx.blocking_recv() {
                req.attempts += 1;
                let appended = cluster_dir(&data_root, &req.cluster)
                    .and_then(|dir| append_record(&dir, &req.timestamp, &req.file_name, &req.payload));
                match appended {
                    Ok(path) => {
                        worker_stats.written.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(path = %path.display(), "appended record");
                    }
                    Err(e) if e.is_retryable() && req.attempts < config.max_attempts => {
                        worker_stats.retried.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(error = %e, attempts = req.attempts, "write failed, will retry");
                        let tx = requeue.clone();
                        let delay = config.retry_delay;
                        runtime.spawn(async move {
                            tokio::time::sleep(delay).await;
                            // Fails only if the writer has stopped.
                            let _ = tx.send(Some(req)).await;
                        });
                    }
                    Err(e @ StoreError::Write { .. }) => {
                        worker_stats.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(error = %e, "partial write, record abandoned");
                    }
                    Err(e) => {
                        worker_stats.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            error = %e,
                            cluster = %req.cluster,
                            host = %req.host,
                            attempts = req.attempts,
                            "record dropped"
                        );
                    }
                }
            }
            let _ = done_tx.send(());
        });

        (
            StoreWriter { tx: tx.clone(), stats },
            WriterShutdown { tx, done },
        )
    }

    /// Queue a record, waiting for space if the queue is full.

    pub async fn write(&self, req: WriteRequest) -> Result<()> {
        self.tx
            .send(Some(req))
            .await
            .map_err(|_| anyhow!("store writer has stopped"))
    }

    /// Queue a record from outside the async runtime.

    pub fn blocking_write(&self, req: WriteRequest) -> Result<()> {
        self.tx
            .blocking_send(Some(req))
            .map_err(|_| anyhow!("store writer has stopped"))
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }
}

impl WriterShutdown {
    pub async fn stop(self) {
        if self.tx.send(None).await.is_ok() {
            let _ = self.done.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fast_config() -> StoreWriterConfig {
        StoreWriterConfig {
            max_attempts: 3,
            retry_delay: Duration::from_millis(20),
            capacity: 10,
        }
    }

    async fn wait_for(what: impl Fn() -> bool) {
        for _ in 0..200 {
            if what() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out");
    }

    #[tokio::test]
    async fn test_writes_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let (writer, shutdown) = StoreWriter::start(dir.path().to_path_buf(), fast_config());
        for i in 0..5 {
            let req = WriteRequest::new(
                "c",
                "n1",
                "2023-11-14T22:13:20Z",
                "n1.csv".to_string(),
                format!("x={i}").into_bytes(),
            );
            writer.write(req).await.unwrap();
        }
        shutdown.stop().await;
        let text = fs::read_to_string(dir.path().join("c/2023/11/14/n1.csv")).unwrap();
        assert_eq!(text, "x=0\nx=1\nx=2\nx=3\nx=4\n");
        assert_eq!(writer.stats().written.load(Ordering::Relaxed), 5);
        assert!(writer.write(WriteRequest::new("c", "n1", "x", "f".to_string(), vec![])).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_timestamp_dropped() {
        let dir = tempfile::TempDir::new().unwrap();
        let (writer, shutdown) = StoreWriter::start(dir.path().to_path_buf(), fast_config());
        let req = WriteRequest::new("c", "n1", "yesterday", "n1.csv".to_string(), b"x=1".to_vec());
        writer.write(req).await.unwrap();
        shutdown.stop().await;
        assert_eq!(writer.stats().dropped.load(Ordering::Relaxed), 1);
        assert_eq!(writer.stats().retried.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_unsafe_names_dropped() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().join("data");
        fs::create_dir(&root).unwrap();
        let (writer, shutdown) = StoreWriter::start(root.clone(), fast_config());
        let ts = "2023-11-14T22:13:20Z";
        let reqs = [
            WriteRequest::new("..", "n1", ts, "n1.csv".to_string(), b"x=1".to_vec()),
            WriteRequest::new("../elsewhere", "n1", ts, "n1.csv".to_string(), b"x=1".to_vec()),
            WriteRequest::new("c", "../n1", ts, "../../../../../n1.csv".to_string(), b"x=1".to_vec()),
        ];
        for req in reqs {
            writer.write(req).await.unwrap();
        }
        shutdown.stop().await;
        assert_eq!(writer.stats().dropped.load(Ordering::Relaxed), 3);
        assert_eq!(writer.stats().retried.load(Ordering::Relaxed), 0);
        assert!(!dir.path().join("2023").exists());
        assert!(!dir.path().join("elsewhere").exists());
        assert!(fs::read_dir(&root).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("c");
        fs::write(&blocker, "not a directory").unwrap();
        let (writer, shutdown) = StoreWriter::start(dir.path().to_path_buf(), fast_config());
        let req = WriteRequest::new("c", "n1", "2023-11-14T22:13:20Z", "n1.csv".to_string(), b"x=1".to_vec());
        writer.write(req).await.unwrap();
        wait_for(|| writer.stats().retried.load(Ordering::Relaxed) >= 1).await;
        fs::remove_file(&blocker).unwrap();
        wait_for(|| writer.stats().written.load(Ordering::Relaxed) == 1).await;
        shutdown.stop().await;
        assert!(dir.path().join("c/2023/11/14/n1.csv").is_file());
    }

    #[tokio::test]
    async fn test_retry_bounded() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("c"), "not a directory").unwrap();
        let (writer, shutdown) = StoreWriter::start(dir.path().to_path_buf(), fast_config());
        let req = WriteRequest::new("c", "n1", "2023-11-14T22:13:20Z", "n1.csv".to_string(), b"x=1".to_vec());
        writer.write(req).await.unwrap();
        wait_for(|| writer.stats().dropped.load(Ordering::Relaxed) == 1).await;
        shutdown.stop().await;
        assert_eq!(writer.stats().retried.load(Ordering::Relaxed), 2);
        assert_eq!(writer.stats().written.load(Ordering::Relaxed), 0);
    }
}
