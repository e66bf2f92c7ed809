// Data in "free CSV" form: CSV syntax, but each row can have a different number of columns, each
// column value starts with `<fieldname>=`, and column order is irrelevant.
//
// I/O errors and CSV syntax errors are propagated to the caller.  Fields without a `=` are dropped
// silently.

use crate::Timestamp;

use anyhow::Result;
use chrono::{NaiveDateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::str::FromStr;

pub type FreeCsvRow = HashMap<String, String>;

/// Format used by the joblog producers for their `now`, `start` and `end` fields.

pub const COMMON_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M";

pub fn parse_free_csv<R: io::Read>(input: R) -> Result<Vec<FreeCsvRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input);
    let mut rows = vec![];
    for record in reader.records() {
        let record = record?;
        let mut m = FreeCsvRow::new();
        for field in record.iter() {
            if let Some((k, v)) = field.split_once('=') {
                m.insert(k.to_string(), v.to_string());
            }
        }
        rows.push(m);
    }
    Ok(rows)
}

/// Write the fields named by `fields`, in that order, for each row that has them.  Rows that have
/// none of the fields are skipped.  The file is written to a temporary in the same directory and
/// then renamed, so readers see either the old or the new contents.

pub fn write_free_csv(filename: &Path, fields: &[&str], rows: &[FreeCsvRow]) -> Result<()> {
    let dir = match filename.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let temp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(temp.as_file());
        for row in rows {
            let r = fields
                .iter()
                .filter_map(|name| row.get(*name).map(|value| format!("{name}={value}")))
                .collect::<Vec<String>>();
            if !r.is_empty() {
                writer.write_record(&r)?;
            }
        }
        writer.flush()?;
    }
    temp.persist(filename)?;
    Ok(())
}

/// Typed access to the fields of a row.  A failure to find or parse a field clears `success` and
/// yields a zero value, so that a caller can get all the fields and then check once.

pub struct Getter<'a> {
    row: &'a FreeCsvRow,
    pub success: bool,
}

impl<'a> Getter<'a> {
    pub fn new(row: &'a FreeCsvRow) -> Getter<'a> {
        Getter { row, success: true }
    }

    fn field(&mut self, tag: &str) -> &'a str {
        match self.row.get(tag) {
            Some(s) => s,
            None => {
                self.success = false;
                ""
            }
        }
    }

    fn parsed<T: FromStr + Default>(&mut self, s: &str) -> T {
        match T::from_str(s) {
            Ok(v) => v,
            Err(_) => {
                self.success = false;
                T::default()
            }
        }
    }

    pub fn string(&mut self, tag: &str) -> String {
        self.field(tag).to_string()
    }

    /// A job number optionally suffixed by `<`, `>` or `!`; the suffix is dropped.

    pub fn job_mark(&mut self, tag: &str) -> u32 {
        let s = self.field(tag);
        self.parsed(s.trim_end_matches(&['<', '>', '!'][..]))
    }

    pub fn u32(&mut self, tag: &str) -> u32 {
        let s = self.field(tag);
        self.parsed(s)
    }

    pub fn f64(&mut self, tag: &str) -> f64 {
        let s = self.field(tag);
        self.parsed(s)
    }

    pub fn bool(&mut self, tag: &str) -> bool {
        match self.field(tag) {
            "1" | "t" | "T" | "true" | "TRUE" | "True" => true,
            "0" | "f" | "F" | "false" | "FALSE" | "False" => false,
            _ => {
                self.success = false;
                false
            }
        }
    }

    pub fn rfc3339(&mut self, tag: &str) -> Timestamp {
        let s = self.field(tag);
        match crate::parse_rfc3339(s) {
            Ok(t) => t,
            Err(_) => {
                self.success = false;
                Timestamp::default()
            }
        }
    }

    /// `YYYY-MM-DD HH:MM`, taken to be UTC.

    pub fn common_datetime(&mut self, tag: &str) -> Timestamp {
        let s = self.field(tag);
        match NaiveDateTime::parse_from_str(s, COMMON_DATETIME_FORMAT) {
            Ok(t) => Utc.from_utc_datetime(&t),
            Err(_) => {
                self.success = false;
                Timestamp::default()
            }
        }
    }
}

#[test]
fn test_parse_free_csv() {
    let text = "a=1,b=hello,junk,c=x=y\nd=,e=2\n";
    let rows = parse_free_csv(text.as_bytes()).unwrap();
    assert!(rows.len() == 2);
    assert!(rows[0].len() == 3);
    assert!(rows[0]["b"] == "hello");
    assert!(rows[0]["c"] == "x=y");
    assert!(rows[1]["d"] == "");

    // Quoted fields with embedded commas
    let rows = parse_free_csv("\"cmd=a,b\",x=1\n".as_bytes()).unwrap();
    assert!(rows[0]["cmd"] == "a,b");
}

#[test]
fn test_getters() {
    let rows = parse_free_csv(
        "job=123<,n=7,f=1.5,b=true,t=2023-09-03T20:00:00Z,d=2023-09-03 20:00\n".as_bytes(),
    )
    .unwrap();
    let mut g = Getter::new(&rows[0]);
    assert!(g.job_mark("job") == 123);
    assert!(g.u32("n") == 7);
    assert!(g.f64("f") == 1.5);
    assert!(g.bool("b"));
    assert!(g.rfc3339("t") == g.common_datetime("d"));
    assert!(g.success);
    g.u32("f");
    assert!(!g.success);

    let mut g = Getter::new(&rows[0]);
    g.string("missing");
    assert!(!g.success);
}

#[test]
fn test_write_free_csv() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("state.csv");
    let mut r1 = FreeCsvRow::new();
    r1.insert("b".to_string(), "2".to_string());
    r1.insert("a".to_string(), "x,y".to_string());
    r1.insert("z".to_string(), "ignored".to_string());
    let mut r2 = FreeCsvRow::new();
    r2.insert("q".to_string(), "nothing".to_string());
    write_free_csv(&path, &["a", "b"], &[r1, r2]).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text == "\"a=x,y\",b=2\n");
}
