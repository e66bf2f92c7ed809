// Ingestion from Kafka.  Every cluster gets its own worker, which consumes the topics
// `<cluster>.sample`, `<cluster>.sysinfo`, `<cluster>.jobs` and `<cluster>.cluster` in the
// consumer group `jobanalyzer-ingest` and hands the records to the store writer.  The record key
// is the host name.  Records are stored as the JSON envelopes they arrive as; an envelope without
// `data` is an error report from the producer and is dropped.
//
// The decoding and routing of records is always built.  The consumer itself needs librdkafka and
// is only built with the `kafka` feature.

use anyhow::{bail, Result};
use ingest::WriteRequest;
use serde::Deserialize;

pub const CONSUMER_GROUP: &str = "jobanalyzer-ingest";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TopicKind {
    Sample,
    Sysinfo,
    Jobs,
    Cluster,
}

impl TopicKind {
    pub const ALL: [TopicKind; 4] = [
        TopicKind::Sample,
        TopicKind::Sysinfo,
        TopicKind::Jobs,
        TopicKind::Cluster,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            TopicKind::Sample => "sample",
            TopicKind::Sysinfo => "sysinfo",
            TopicKind::Jobs => "jobs",
            TopicKind::Cluster => "cluster",
        }
    }

    /// The store file for a record of this kind.  Slurm data are per cluster, not per host.

    pub fn file_name(self, host: &str) -> String {
        match self {
            TopicKind::Sample => format!("0+sample-{host}.json"),
            TopicKind::Sysinfo => format!("0+sysinfo-{host}.json"),
            TopicKind::Jobs => "0+job-slurm.json".to_string(),
            TopicKind::Cluster => "0+cluzter-slurm.json".to_string(),
        }
    }

    fn per_host(self) -> bool {
        matches!(self, TopicKind::Sample | TopicKind::Sysinfo)
    }
}

pub fn topics(cluster: &str) -> Vec<String> {
    TopicKind::ALL.iter().map(|k| format!("{cluster}.{}", k.tag())).collect()
}

fn topic_kind(cluster: &str, topic: &str) -> Option<TopicKind> {
    let tag = topic.strip_prefix(cluster)?.strip_prefix('.')?;
    TopicKind::ALL.into_iter().find(|k| k.tag() == tag)
}

// Only the parts of the envelope that are needed for routing.  The rest is stored as received.

#[derive(Deserialize)]
struct Envelope {
    data: Option<EnvelopeData>,
}

#[derive(Deserialize)]
struct EnvelopeData {
    attributes: Attributes,
}

#[derive(Deserialize)]
struct Attributes {
    time: String,
}

/// The store write for a record from `topic`, or None if the record is an error envelope.

pub fn record_request(
    cluster: &str,
    topic: &str,
    key: Option<&[u8]>,
    value: &[u8],
) -> Result<Option<WriteRequest>> {
    let Some(kind) = topic_kind(cluster, topic) else {
        bail!("No handler for topic {topic}");
    };
    let envelope: Envelope = serde_json::from_slice(value)?;
    let Some(data) = envelope.data else {
        tracing::debug!(cluster, topic, "dropping error envelope");
        return Ok(None);
    };
    let host = key.map(String::from_utf8_lossy).unwrap_or_default().to_string();
    if kind.per_host() && host.is_empty() {
        bail!("Record without host key on topic {topic}");
    }
    if kind.per_host() && !sonarlog::is_store_name(&host) {
        bail!("Bad host key {host:?} on topic {topic}");
    }
    Ok(Some(WriteRequest::new(
        cluster,
        &host,
        &data.attributes.time,
        kind.file_name(&host),
        value.to_vec(),
    )))
}

#[cfg(feature = "kafka")]
pub use consumer::spawn_fleet;

#[cfg(feature = "kafka")]
mod consumer {
    use super::{record_request, topics, CONSUMER_GROUP};

    use anyhow::Result;
    use ingest::StoreWriter;
    use rdkafka::config::ClientConfig;
    use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
    use rdkafka::message::Message;
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio::task::JoinHandle;

    // Wait before restarting a worker that failed.
    const RESTART_DELAY: Duration = Duration::from_secs(30);

    /// Start one supervised worker per cluster.  The workers stop when `stop` becomes true.

    pub fn spawn_fleet(
        broker: &str,
        clusters: &[String],
        writer: &StoreWriter,
        stop: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        clusters
            .iter()
            .map(|cluster| {
                tokio::spawn(supervise(
                    broker.to_string(),
                    cluster.clone(),
                    writer.clone(),
                    stop.clone(),
                ))
            })
            .collect()
    }

    // A worker that fails or panics is restarted after a while; other clusters are not affected.
    async fn supervise(
        broker: String,
        cluster: String,
        writer: StoreWriter,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let worker = tokio::spawn(consume(
                broker.clone(),
                cluster.clone(),
                writer.clone(),
                stop.clone(),
            ));
            match worker.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => tracing::warn!(cluster = %cluster, error = %e, "kafka worker failed"),
                Err(e) => tracing::error!(cluster = %cluster, error = %e, "kafka worker panicked"),
            }
            tokio::select! {
                _ = tokio::time::sleep(RESTART_DELAY) => {}
                _ = stop.wait_for(|s| *s) => return,
            }
        }
    }

    async fn consume(
        broker: String,
        cluster: String,
        writer: StoreWriter,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &broker)
            .set("group.id", CONSUMER_GROUP)
            .set("enable.auto.commit", "false")
            .create()?;
        let names = topics(&cluster);
        consumer.subscribe(&names.iter().map(|s| s.as_str()).collect::<Vec<&str>>())?;
        tracing::info!(cluster = %cluster, broker = %broker, "kafka worker connected");

        loop {
            let message = tokio::select! {
                m = consumer.recv() => m,
                _ = stop.wait_for(|s| *s) => return Ok(()),
            };
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(cluster = %cluster, error = %e, "failed to fetch data");
                    continue;
                }
            };
            let topic = message.topic();
            let value = message.payload().unwrap_or_default();
            match record_request(&cluster, topic, message.key(), value) {
                Ok(Some(req)) => writer.write(req).await?,
                Ok(None) => {}
                Err(e) => tracing::warn!(cluster = %cluster, topic, error = %e, "topic handler failed"),
            }
            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                tracing::warn!(cluster = %cluster, error = %e, "commit failed");
            }
        }
    }
}

#[test]
fn test_topics() {
    assert_eq!(
        topics("ml"),
        vec!["ml.sample", "ml.sysinfo", "ml.jobs", "ml.cluster"]
    );
    assert!(topic_kind("ml", "ml.jobs") == Some(TopicKind::Jobs));
    assert!(topic_kind("ml", "mlx.jobs").is_none());
    assert!(topic_kind("ml", "ml.bogus").is_none());
}

#[test]
fn test_record_request() {
    let sample = br#"{"meta":{"producer":"sonar"},"data":{"type":"sample","attributes":{"time":"2025-03-01T10:00:00+01:00","node":"n1"}}}"#;
    let req = record_request("ml", "ml.sample", Some(b"n1"), sample).unwrap().unwrap();
    assert!(req.cluster == "ml");
    assert!(req.file_name == "0+sample-n1.json");
    assert!(req.timestamp == "2025-03-01T10:00:00+01:00");
    assert!(req.payload == sample.to_vec());

    let jobs = br#"{"data":{"attributes":{"time":"2025-03-01T10:00:00Z"}}}"#;
    let req = record_request("ml", "ml.jobs", None, jobs).unwrap().unwrap();
    assert!(req.file_name == "0+job-slurm.json");
    let req = record_request("ml", "ml.cluster", Some(b"n1"), jobs).unwrap().unwrap();
    assert!(req.file_name == "0+cluzter-slurm.json");

    let error = br#"{"meta":{"producer":"sonar"},"errors":[{"detail":"no gpu"}]}"#;
    assert!(record_request("ml", "ml.sysinfo", Some(b"n1"), error).unwrap().is_none());

    assert!(record_request("ml", "ml.sample", None, sample).is_err());
    assert!(record_request("ml", "ml.other", Some(b"n1"), sample).is_err());
    assert!(record_request("ml", "ml.sample", Some(b"n1"), b"not json").is_err());
}

#[test]
fn test_record_request_bad_host() {
    let sample = br#"{"data":{"attributes":{"time":"2025-03-01T10:00:00Z"}}}"#;
    let keys: [&[u8]; 5] = [b"../../etc/n1", b"a/b", b"a\\b", b"..", b"n1\0"];
    for key in keys {
        let e = record_request("ml", "ml.sample", Some(key), sample).unwrap_err();
        assert!(e.to_string().starts_with("Bad host key"), "{e}");
    }
    assert!(record_request("ml", "ml.sysinfo", Some(b"../n1"), sample).is_err());
}
