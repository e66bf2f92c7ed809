// Sample and heartbeat records in the JSON form used between the forwarder and the receiver, and
// their re-encoding as free-CSV lines for the store.
//
// JSON timestamps are written as integer seconds since the epoch but are accepted either as
// integers or as RFC 3339 strings.

use crate::{parse_rfc3339, FreeCsvRow, GpuSet, Getter, Timestamp};

use anyhow::{bail, Result};
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;

pub const HEARTBEAT_USER: &str = "_sonar_";
pub const HEARTBEAT_CMD: &str = "_heartbeat_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JsonTime(pub Timestamp);

impl JsonTime {
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

impl Serialize for JsonTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0.timestamp())
    }
}

impl<'de> Deserialize<'de> for JsonTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<JsonTime, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(i64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(s) => match Utc.timestamp_opt(s, 0).single() {
                Some(t) => Ok(JsonTime(t)),
                None => Err(D::Error::custom(format!("timestamp out of range: {s}"))),
            },
            Raw::Text(s) => match parse_rfc3339(&s) {
                Ok(t) => Ok(JsonTime(t)),
                Err(_) => Err(D::Error::custom(format!("bad timestamp: {s}"))),
            },
        }
    }
}

/// GPU sets travel as sonar's textual form or as a list of card numbers.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonGpus {
    Text(String),
    Cards(Vec<u32>),
}

impl JsonGpus {
    pub fn to_gpuset(&self) -> GpuSet {
        match self {
            JsonGpus::Text(s) => GpuSet::from_str(s).unwrap_or(GpuSet::Unknown),
            JsonGpus::Cards(cs) if cs.is_empty() => GpuSet::Empty,
            JsonGpus::Cards(cs) => GpuSet::Cards(cs.iter().copied().collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SampleRecord {
    #[serde(default, alias = "v")]
    pub version: String,
    pub cluster: String,
    pub host: String,
    pub timestamp: JsonTime,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub job: u32,
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub memtotal_kb: u64,
    #[serde(default)]
    pub cpu_pct: f64,
    #[serde(default)]
    pub cpu_util_pct: f64,
    #[serde(default)]
    pub cpu_kb: u64,
    #[serde(default)]
    pub rss_anon_kb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<JsonGpus>,
    #[serde(default)]
    pub gpu_pct: f64,
    #[serde(default)]
    pub gpu_mem_pct: f64,
    #[serde(default)]
    pub gpu_mem_kb: u64,
    #[serde(default)]
    pub gpu_fail: u32,
    #[serde(default)]
    pub cpu_time_sec: u64,
    #[serde(default)]
    pub rolledup: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    #[serde(default, alias = "v")]
    pub version: String,
    pub cluster: String,
    pub host: String,
    pub timestamp: JsonTime,
}

/// JSON cannot represent NaN or the infinities.

pub fn clean_float(f: f64) -> f64 {
    if f.is_finite() {
        f
    } else {
        0.0
    }
}

fn csv_line(fields: &[String]) -> Vec<u8> {
    let mut w = csv::WriterBuilder::new().flexible(true).from_writer(vec![]);
    // Writing to a Vec cannot fail except on allocation failure.
    if w.write_record(fields).is_err() {
        return vec![];
    }
    w.into_inner().unwrap_or_default()
}

impl SampleRecord {
    /// The free-CSV encoding, newline-terminated.  Fields with default values are omitted except
    /// for the ones that sonar always writes.

    pub fn to_free_csv(&self) -> Vec<u8> {
        let mut fields = vec![
            format!("v={}", self.version),
            format!("time={}", self.timestamp.to_rfc3339()),
            format!("host={}", self.host),
            format!("user={}", self.user),
            format!("cmd={}", self.cmd),
        ];
        if self.cores > 0 {
            fields.push(format!("cores={}", self.cores));
        }
        if self.memtotal_kb > 0 {
            fields.push(format!("memtotalkib={}", self.memtotal_kb));
        }
        if self.job > 0 {
            fields.push(format!("job={}", self.job));
        }
        if self.pid > 0 {
            fields.push(format!("pid={}", self.pid));
        }
        let cpu_pct = if self.cpu_pct > 0.0 { self.cpu_pct } else { self.cpu_util_pct };
        if clean_float(cpu_pct) > 0.0 {
            fields.push(format!("cpu%={}", cpu_pct));
        }
        if self.cpu_kb > 0 {
            fields.push(format!("cpukib={}", self.cpu_kb));
        }
        if self.rss_anon_kb > 0 {
            fields.push(format!("rssanonkib={}", self.rss_anon_kb));
        }
        if let Some(ref gpus) = self.gpus {
            let set = gpus.to_gpuset();
            if !set.is_empty() {
                fields.push(format!("gpus={set}"));
            }
        }
        if clean_float(self.gpu_pct) > 0.0 {
            fields.push(format!("gpu%={}", self.gpu_pct));
        }
        if clean_float(self.gpu_mem_pct) > 0.0 {
            fields.push(format!("gpumem%={}", self.gpu_mem_pct));
        }
        if self.gpu_mem_kb > 0 {
            fields.push(format!("gpukib={}", self.gpu_mem_kb));
        }
        if self.gpu_fail != 0 {
            fields.push(format!("gpufail={}", self.gpu_fail));
        }
        if self.cpu_time_sec > 0 {
            fields.push(format!("cputime_sec={}", self.cpu_time_sec));
        }
        if self.rolledup > 0 {
            fields.push(format!("rolledup={}", self.rolledup));
        }
        csv_line(&fields)
    }

    /// Decode a sonar free-CSV row.  The mandatory fields are v, time, host, user and cmd; the
    /// cluster is supplied by the caller.  Numeric fields that sonar may write as NaN are cleaned.

    pub fn from_free_csv(row: &FreeCsvRow, cluster: &str) -> Result<SampleRecord> {
        let mut g = Getter::new(row);
        let version = g.string("v");
        let timestamp = JsonTime(g.rfc3339("time"));
        let host = g.string("host");
        let user = g.string("user");
        let cmd = g.string("cmd");
        if !g.success {
            bail!("Missing or malformed mandatory field")
        }
        let mut r = SampleRecord {
            version,
            cluster: cluster.to_string(),
            host,
            timestamp,
            user,
            cmd,
            ..Default::default()
        };
        let num = |name: &str| -> Result<f64> {
            match row.get(name) {
                Some(s) => Ok(clean_float(f64::from_str(s)?)),
                None => Ok(0.0),
            }
        };
        let int = |name: &str| -> Result<u64> {
            match row.get(name) {
                Some(s) => Ok(u64::from_str(s)?),
                None => Ok(0),
            }
        };
        let int32 = |name: &str| -> Result<u32> { Ok(u32::try_from(int(name)?)?) };
        r.cores = int32("cores")?;
        r.memtotal_kb = int("memtotalkib")?;
        r.job = int32("job")?;
        r.pid = int32("pid")?;
        r.cpu_pct = num("cpu%")?;
        r.cpu_kb = int("cpukib")?;
        r.rss_anon_kb = int("rssanonkib")?;
        if let Some(s) = row.get("gpus") {
            r.gpus = Some(JsonGpus::Text(s.clone()));
        }
        r.gpu_pct = num("gpu%")?;
        r.gpu_mem_pct = num("gpumem%")?;
        r.gpu_mem_kb = int("gpukib")?;
        r.gpu_fail = int32("gpufail")?;
        r.cpu_time_sec = num("cputime_sec")? as u64;
        r.rolledup = int32("rolledup")?;
        Ok(r)
    }
}

impl HeartbeatRecord {
    pub fn to_free_csv(&self) -> Vec<u8> {
        csv_line(&[
            format!("v={}", self.version),
            format!("time={}", self.timestamp.to_rfc3339()),
            format!("host={}", self.host),
            format!("user={HEARTBEAT_USER}"),
            format!("cmd={HEARTBEAT_CMD}"),
        ])
    }
}

#[test]
fn test_sample_json() {
    let text = r#"[{"host":"n1","timestamp":1700000000,"cluster":"c","cmd":"py","cpu_util_pct":10,"cpu_kb":1024}]"#;
    let rs: Vec<SampleRecord> = serde_json::from_str(text).unwrap();
    assert!(rs.len() == 1);
    assert!(rs[0].timestamp.to_rfc3339() == "2023-11-14T22:13:20Z");
    let line = String::from_utf8(rs[0].to_free_csv()).unwrap();
    assert!(line == "v=,time=2023-11-14T22:13:20Z,host=n1,user=,cmd=py,cpu%=10,cpukib=1024\n");

    // String timestamps are also fine, and a missing host is not.
    let rs: Vec<SampleRecord> = serde_json::from_str(
        r#"[{"host":"n1","timestamp":"2023-11-14T00:00:00+01:00","cluster":"c","v":"0.9.0"}]"#,
    )
    .unwrap();
    assert!(rs[0].timestamp.to_rfc3339() == "2023-11-13T23:00:00Z");
    assert!(rs[0].version == "0.9.0");
    assert!(serde_json::from_str::<Vec<SampleRecord>>(r#"[{"timestamp":1,"cluster":"c"}]"#).is_err());
}

#[test]
fn test_heartbeat_csv() {
    let hb = HeartbeatRecord {
        version: "0.8.0".to_string(),
        cluster: "c".to_string(),
        host: "n1".to_string(),
        timestamp: JsonTime(crate::timestamp_from_ymdhms(2023, 11, 14, 0, 0, 0).unwrap()),
    };
    assert!(
        hb.to_free_csv()
            == b"v=0.8.0,time=2023-11-14T00:00:00Z,host=n1,user=_sonar_,cmd=_heartbeat_\n".to_vec()
    );
}

#[test]
fn test_from_free_csv() {
    let rows = crate::parse_free_csv(
        "v=0.7.0,time=2023-08-15T12:46:53+02:00,host=ml8,user=joe,job=3321033,pid=0,cmd=python,cpu%=NaN,cpukib=304326252,gpus=0,gpu%=3033.6\n"
            .as_bytes(),
    )
    .unwrap();
    let r = SampleRecord::from_free_csv(&rows[0], "mlx").unwrap();
    assert!(r.cluster == "mlx");
    assert!(r.job == 3321033);
    assert!(r.cpu_pct == 0.0);
    assert!(r.gpu_pct == 3033.6);
    assert!(r.gpus == Some(JsonGpus::Text("0".to_string())));

    let rows = crate::parse_free_csv("v=0.7.0,host=ml8,user=joe,cmd=python\n".as_bytes()).unwrap();
    assert!(SampleRecord::from_free_csv(&rows[0], "mlx").is_err());

    // Out-of-range values are errors, not wrapped around
    let base = "v=0.7.0,time=2023-08-15T12:46:53+02:00,host=ml8,user=joe,cmd=python";
    for field in ["job=4294967296", "cores=4294967297", "pid=18446744073709551615", "rolledup=4294967296"] {
        let rows = crate::parse_free_csv(format!("{base},{field}\n").as_bytes()).unwrap();
        assert!(SampleRecord::from_free_csv(&rows[0], "mlx").is_err(), "{field}");
    }
    let rows = crate::parse_free_csv(format!("{base},job=4294967295,cores=64\n").as_bytes()).unwrap();
    let r = SampleRecord::from_free_csv(&rows[0], "mlx").unwrap();
    assert!(r.job == u32::MAX);
    assert!(r.cores == 64);
}
