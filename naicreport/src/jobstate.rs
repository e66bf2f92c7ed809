// Persistent state for violation reports: which jobs have been seen, when, and whether they have
// been reported.  This is what makes a report about a job appear once even though the job shows up
// in the logs many times.
//
// A job is active if it is the most recent job with its id on its host, and then it is keyed by
// (id, host).  Older jobs with the same id are expired and keyed by (id, host, last_seen).  The
// `aux` value carries the report data for jobs seen in the current run; it is not persisted.
//
// The database is stored as a free-CSV file with the fields id, host, startedOnOrBefore,
// firstViolation, lastSeen, isReported and isExpired, and is rewritten in full on every run.

use anyhow::Result;
use chrono::SecondsFormat;
use sonarlog::{FreeCsvRow, Getter, Timestamp};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct JobState<A> {
    pub id: u32,
    pub host: String,
    pub started_on_or_before: Timestamp,
    pub first_violation: Timestamp,
    pub last_seen: Timestamp,
    pub is_reported: bool,
    pub is_expired: bool,
    pub aux: Option<A>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActiveKey {
    pub id: u32,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExpiredKey {
    pub id: u32,
    pub host: String,
    pub last_seen: Timestamp,
}

#[derive(Debug)]
pub struct JobDatabase<A> {
    pub active: HashMap<ActiveKey, JobState<A>>,
    pub expired: HashMap<ExpiredKey, JobState<A>>,
}

impl<A> Default for JobDatabase<A> {
    fn default() -> JobDatabase<A> {
        JobDatabase {
            active: HashMap::new(),
            expired: HashMap::new(),
        }
    }
}

const FIELDS: [&str; 7] = [
    "id",
    "host",
    "startedOnOrBefore",
    "firstViolation",
    "lastSeen",
    "isReported",
    "isExpired",
];

impl<A> JobDatabase<A> {
    pub fn new() -> JobDatabase<A> {
        Default::default()
    }

    /// Read the database, or return an empty one if the file does not exist.  Rows that can't be
    /// parsed are dropped.

    pub fn read_or_empty(filename: &Path) -> Result<JobDatabase<A>> {
        match File::open(filename) {
            Ok(f) => Self::read_from(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_from<R: io::Read>(input: R) -> Result<JobDatabase<A>> {
        let mut db = Self::new();
        for row in sonarlog::parse_free_csv(input)? {
            let mut g = Getter::new(&row);
            let mut state = JobState {
                id: g.u32("id"),
                host: g.string("host"),
                started_on_or_before: g.rfc3339("startedOnOrBefore"),
                first_violation: g.rfc3339("firstViolation"),
                last_seen: g.rfc3339("lastSeen"),
                is_reported: g.bool("isReported"),
                is_expired: false,
                aux: None,
            };
            // Older files do not have isExpired.
            if row.contains_key("isExpired") {
                state.is_expired = g.bool("isExpired");
            }
            if g.success {
                db.insert(state);
            }
        }
        Ok(db)
    }

    fn insert(&mut self, state: JobState<A>) {
        if state.is_expired {
            let key = ExpiredKey {
                id: state.id,
                host: state.host.clone(),
                last_seen: state.last_seen,
            };
            self.expired.insert(key, state);
        } else {
            let key = ActiveKey {
                id: state.id,
                host: state.host.clone(),
            };
            self.active.insert(key, state);
        }
    }

    /// Make sure the job is in the database.  Returns true if it was added, in which case its first
    /// violation is `now` and it is unreported.  If the job was already present then its last-seen
    /// time and aux data are updated.

    #[allow(clippy::too_many_arguments)]
    pub fn ensure_job(
        &mut self,
        id: u32,
        host: &str,
        started_on_or_before: Timestamp,
        now: Timestamp,
        last_seen: Timestamp,
        expired: bool,
        aux: A,
    ) -> bool {
        let existing = if expired {
            self.expired.get_mut(&ExpiredKey {
                id,
                host: host.to_string(),
                last_seen,
            })
        } else {
            self.active.get_mut(&ActiveKey {
                id,
                host: host.to_string(),
            })
        };
        if let Some(state) = existing {
            state.last_seen = last_seen;
            state.aux = Some(aux);
            return false;
        }
        self.insert(JobState {
            id,
            host: host.to_string(),
            started_on_or_before,
            first_violation: now,
            last_seen,
            is_reported: false,
            is_expired: expired,
            aux: Some(aux),
        });
        true
    }

    /// Remove the reported jobs that were last seen before `cutoff`, returning the number removed.
    /// Unreported jobs are never purged.

    pub fn purge_jobs_before(&mut self, cutoff: Timestamp) -> usize {
        let before = self.len();
        self.active
            .retain(|_, s| !(s.last_seen < cutoff && s.is_reported));
        self.expired
            .retain(|_, s| !(s.last_seen < cutoff && s.is_reported));
        before - self.len()
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.expired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All jobs, active first, each part ordered by host and id.

    pub fn states(&self) -> Vec<&JobState<A>> {
        let mut active = self.active.values().collect::<Vec<&JobState<A>>>();
        active.sort_by(|a, b| (&a.host, a.id).cmp(&(&b.host, b.id)));
        let mut expired = self.expired.values().collect::<Vec<&JobState<A>>>();
        expired.sort_by(|a, b| (&a.host, a.id, a.last_seen).cmp(&(&b.host, b.id, b.last_seen)));
        active.extend(expired);
        active
    }

    pub fn states_mut(&mut self) -> impl Iterator<Item = &mut JobState<A>> {
        self.active.values_mut().chain(self.expired.values_mut())
    }

    /// Replace the file with the contents of the database.

    pub fn write(&self, filename: &Path) -> Result<()> {
        let rows = self
            .states()
            .into_iter()
            .map(|s| {
                FreeCsvRow::from([
                    ("id".to_string(), s.id.to_string()),
                    ("host".to_string(), s.host.clone()),
                    ("startedOnOrBefore".to_string(), rfc3339(s.started_on_or_before)),
                    ("firstViolation".to_string(), rfc3339(s.first_violation)),
                    ("lastSeen".to_string(), rfc3339(s.last_seen)),
                    ("isReported".to_string(), s.is_reported.to_string()),
                    ("isExpired".to_string(), s.is_expired.to_string()),
                ])
            })
            .collect::<Vec<FreeCsvRow>>();
        sonarlog::write_free_csv(filename, &FIELDS, &rows)
    }
}

fn rfc3339(t: Timestamp) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
fn t(d: u32, h: u32) -> Timestamp {
    sonarlog::timestamp_from_ymdhms(2023, 11, d, h, 0, 0).unwrap()
}

#[test]
fn test_ensure_job() {
    let mut db = JobDatabase::<()>::new();
    let (t0, t1, t2) = (t(14, 0), t(14, 10), t(14, 12));
    assert!(db.ensure_job(5, "n1", t0, t1, t1, false, ()));
    assert!(!db.ensure_job(5, "n1", t0, t1, t1, false, ()));
    assert!(!db.ensure_job(5, "n1", t0, t2, t2, false, ()));
    assert!(db.active.len() == 1);
    let s = &db.active[&ActiveKey { id: 5, host: "n1".to_string() }];
    assert!(s.last_seen == t2);
    assert!(s.first_violation == t1);
    assert!(s.started_on_or_before == t0);
    assert!(!s.is_reported);

    // Expired jobs are keyed by their last-seen time as well.
    assert!(db.ensure_job(5, "n1", t0, t2, t0, true, ()));
    assert!(db.ensure_job(5, "n1", t0, t2, t1, true, ()));
    assert!(!db.ensure_job(5, "n1", t0, t2, t1, true, ()));
    assert!(db.expired.len() == 2);
    assert!(db.active.len() == 1);

    // Another host is another job.
    assert!(db.ensure_job(5, "n2", t0, t1, t1, false, ()));
}

#[test]
fn test_purge_jobs_before() {
    let mut db = JobDatabase::<()>::new();
    db.ensure_job(1, "n1", t(1, 0), t(1, 0), t(1, 0), false, ());
    db.ensure_job(2, "n1", t(1, 0), t(1, 0), t(1, 0), false, ());
    db.ensure_job(3, "n1", t(1, 0), t(5, 0), t(5, 0), false, ());
    db.ensure_job(2, "n1", t(1, 0), t(1, 0), t(1, 0), true, ());
    for s in db.states_mut() {
        if s.id != 2 || s.is_expired {
            s.is_reported = true;
        }
    }
    assert!(db.purge_jobs_before(t(3, 0)) == 2);
    let left = db.states().iter().map(|s| s.id).collect::<Vec<u32>>();
    assert!(left == vec![2, 3]);
    assert!(db.expired.is_empty());
}

#[test]
fn test_read_write() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("state.csv");

    let db = JobDatabase::<()>::read_or_empty(&path).unwrap();
    assert!(db.is_empty());

    let mut db = JobDatabase::<()>::new();
    db.ensure_job(10, "ml8", t(1, 0), t(2, 0), t(3, 0), false, ());
    db.ensure_job(10, "ml8", t(1, 0), t(2, 0), t(1, 5), true, ());
    for s in db.states_mut() {
        s.is_reported = s.is_expired;
    }
    db.write(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(
        text,
        "\
id=10,host=ml8,startedOnOrBefore=2023-11-01T00:00:00Z,firstViolation=2023-11-02T00:00:00Z,lastSeen=2023-11-03T00:00:00Z,isReported=false,isExpired=false
id=10,host=ml8,startedOnOrBefore=2023-11-01T00:00:00Z,firstViolation=2023-11-02T00:00:00Z,lastSeen=2023-11-01T05:00:00Z,isReported=true,isExpired=true
"
    );

    let db2 = JobDatabase::<()>::read_or_empty(&path).unwrap();
    assert!(db2.active.len() == 1);
    assert!(db2.expired.len() == 1);
    let s = &db2.active[&ActiveKey { id: 10, host: "ml8".to_string() }];
    assert!(s.last_seen == t(3, 0));
    assert!(s.aux.is_none());

    // Missing isExpired means active; unparseable rows are dropped.
    let text = "\
id=7,host=n1,startedOnOrBefore=2023-11-01T00:00:00Z,firstViolation=2023-11-02T00:00:00Z,lastSeen=2023-11-03T00:00:00Z,isReported=true
id=x,host=n1,startedOnOrBefore=2023-11-01T00:00:00Z,firstViolation=2023-11-02T00:00:00Z,lastSeen=2023-11-03T00:00:00Z,isReported=true
";
    let db3 = JobDatabase::<()>::read_from(text.as_bytes()).unwrap();
    assert!(db3.len() == 1);
    assert!(db3.active[&ActiveKey { id: 7, host: "n1".to_string() }].is_reported);
}
