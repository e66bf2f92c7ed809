// Process-wide caches for the daemon: parsed sample files and cluster configurations.
//
// A cached entry is valid while the file's length and modification time are unchanged.  Sample
// files in the store are only ever appended to, so a change of either means the entry is stale.
//
// Each cache has one lock and the lock is never held while reading or parsing a file:
//
//   lock -> lookup -> unlock -> parse -> lock -> re-check and insert -> unlock
//
// Two threads that miss on the same file at the same time will both parse it; the second insert
// finds the first and returns it.

use anyhow::Result;
use parking_lot::Mutex;
use sonarlog::{LogEntry, System};
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::SystemTime;

pub type ClusterConfig = HashMap<String, System>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct FileStamp {
    len: u64,
    mtime: SystemTime,
}

impl FileStamp {
    fn of(path: &str) -> Result<FileStamp> {
        let meta = fs::metadata(path)?;
        Ok(FileStamp { len: meta.len(), mtime: meta.modified()? })
    }
}

struct LogCacheEntry {
    stamp: FileStamp,
    records: Arc<Vec<LogEntry>>,
    serial: u64,
}

#[derive(Default)]
struct LogCacheState {
    entries: HashMap<String, LogCacheEntry>,
    size: u64,
    serial: u64,
}

/// Parsed sample files, with a budget on the summed size of the files.  The oldest entries are
/// evicted first when an insert would exceed the budget.

pub struct LogCache {
    budget: u64,
    state: Mutex<LogCacheState>,
}

impl LogCache {
    pub fn new(budget: usize) -> LogCache {
        LogCache { budget: budget as u64, state: Mutex::new(LogCacheState::default()) }
    }

    pub fn get(&self, path: &str) -> Result<Arc<Vec<LogEntry>>> {
        let stamp = FileStamp::of(path)?;
        if let Some(records) = self.lookup(path, stamp) {
            tracing::trace!(path, "log cache hit");
            return Ok(records);
        }

        let records = Arc::new(sonarlog::parse_logfile(path)?);

        let mut state = self.state.lock();
        if let Some(e) = state.entries.get(path) {
            if e.stamp == stamp {
                return Ok(e.records.clone());
            }
        }
        if let Some(stale) = state.entries.remove(path) {
            state.size -= stale.stamp.len;
        }
        if stamp.len > self.budget {
            return Ok(records);
        }
        while state.size + stamp.len > self.budget {
            let Some(oldest) = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.serial)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if let Some(e) = state.entries.remove(&oldest) {
                tracing::debug!(path = %oldest, "log cache eviction");
                state.size -= e.stamp.len;
            }
        }
        state.serial += 1;
        let serial = state.serial;
        state.size += stamp.len;
        state.entries.insert(
            path.to_string(),
            LogCacheEntry { stamp, records: records.clone(), serial },
        );
        Ok(records)
    }

    fn lookup(&self, path: &str, stamp: FileStamp) -> Option<Arc<Vec<LogEntry>>> {
        let state = self.state.lock();
        match state.entries.get(path) {
            Some(e) if e.stamp == stamp => Some(e.records.clone()),
            _ => None,
        }
    }

    /// Number of cached files and their summed size.

    pub fn usage(&self) -> (usize, u64) {
        let state = self.state.lock();
        (state.entries.len(), state.size)
    }
}

/// Parsed cluster configuration files.  These are small, so there is no budget.

#[derive(Default)]
pub struct ConfigCache {
    state: Mutex<HashMap<String, (FileStamp, Arc<ClusterConfig>)>>,
}

impl ConfigCache {
    pub fn new() -> ConfigCache {
        ConfigCache::default()
    }

    pub fn get(&self, path: &str) -> Result<Arc<ClusterConfig>> {
        let stamp = FileStamp::of(path)?;
        {
            let state = self.state.lock();
            if let Some((s, config)) = state.get(path) {
                if *s == stamp {
                    return Ok(config.clone());
                }
            }
        }

        let config = Arc::new(sonarlog::read_cluster_config(path)?);

        let mut state = self.state.lock();
        if let Some((s, existing)) = state.get(path) {
            if *s == stamp {
                return Ok(existing.clone());
            }
        }
        state.insert(path.to_string(), (stamp, config.clone()));
        Ok(config)
    }
}

#[cfg(test)]
const LINE: &str = "v=0.7.0,time=2023-08-15T10:00:00Z,host=ml8,user=joe,job=10,pid=10,cmd=python,cpu%=100\n";

#[test]
fn test_log_cache_hit_and_reload() {
    use std::io::Write;

    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("ml8.csv");
    fs::write(&path, LINE).unwrap();
    let p = path.to_str().unwrap();

    let cache = LogCache::new(1024 * 1024);
    let a = cache.get(p).unwrap();
    let b = cache.get(p).unwrap();
    assert!(a.len() == 1);
    assert!(Arc::ptr_eq(&a, &b));
    assert!(cache.usage() == (1, LINE.len() as u64));

    // Appending changes the length, so the file is parsed again.
    let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
    f.write_all(LINE.as_bytes()).unwrap();
    drop(f);
    let c = cache.get(p).unwrap();
    assert!(c.len() == 2);
    assert!(cache.usage() == (1, 2 * LINE.len() as u64));
}

#[test]
fn test_log_cache_eviction() {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut names = vec![];
    for i in 0..3 {
        let path = tmp.path().join(format!("h{i}.csv"));
        fs::write(&path, LINE).unwrap();
        names.push(path.to_str().unwrap().to_string());
    }

    // Room for two files.
    let cache = LogCache::new(2 * LINE.len() + 1);
    let first = cache.get(&names[0]).unwrap();
    cache.get(&names[1]).unwrap();
    cache.get(&names[2]).unwrap();
    assert!(cache.usage().0 == 2);

    // The first file was evicted and is parsed anew.
    let again = cache.get(&names[0]).unwrap();
    assert!(!Arc::ptr_eq(&first, &again));

    // A file larger than the budget is returned but not cached.
    let tiny = LogCache::new(10);
    assert!(tiny.get(&names[0]).unwrap().len() == 1);
    assert!(tiny.usage() == (0, 0));
}

#[test]
fn test_config_cache() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("ml-config.json");
    fs::write(&path, r#"[{"hostname":"ml1","cpu_cores":64,"mem_gb":256}]"#).unwrap();
    let cache = ConfigCache::new();
    let a = cache.get(path.to_str().unwrap()).unwrap();
    let b = cache.get(path.to_str().unwrap()).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(a["ml1"].cpu_cores == 64);
    assert!(cache.get("/no/such/file.json").is_err());
}
