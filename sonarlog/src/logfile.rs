// Simple parser / preprocessor / input filterer for the Sonar log file format.
//
// These are the tagged fields with their gloss, contents, and defaults:
//
//  Name        Optional?  Gloss                                  Format, default
//  ------      ---------  -------------------------------------  ----------------------------------
//  v           No         Version number of program writing log  major.minor.bugfix
//  time        No         Timestamp                              ISO w/o subseconds, with UTC offset
//  host        No         Host name                              Alphanumeric FQDN
//  user        No         User name of user running job          Alphanumeric Unix user name
//  cmd         No         Command string                         Alphanumeric, maybe with spaces
//  cores       Yes        Number of cores on the system          Positive integer, default 0
//  job         Yes        Job number                             Nonnegative integer, default 0
//  pid         Yes        Process ID                             Nonnegative integer, default 0
//  cpu%        Yes        % of one core utilized at present      Nonnegative float, default 0.0
//  cpukib      Yes        KiB of node memory currently used      Nonnegative integer, default 0
//  rssanonkib  Yes        KiB of resident anonymous memory       Nonnegative integer, default 0
//  gpus        Yes        Set of GPUs being used by job          "none", "unknown", list of
//                                                                  integers, default "none"
//  gpu%        Yes        % of GPU cards utilized by job         Nonnegative float, default 0.0
//  gpumem%     Yes        % of GPU cards utilized by job         Nonnegative float, default 0.0
//  gpukib      Yes        KiB of GPU memory currently used       Nonnegative integer, default 0
//  gpufail     Yes        GPU failure indicator                  Nonnegative integer, default 0
//  cputime_sec Yes        CPU time used by the process           Nonnegative float, default 0.0
//  rolledup    Yes        Number of processes rolled into this   Nonnegative integer, default 0
//
// The fields need not be in any particular order and unknown fields are ignored.  Per sonar, the
// `gpu%`, `gpumem%`, and `gpukib` fields are summed across / relative to the cards in the `gpus`
// field.  Heartbeat records have user `_sonar_` and command `_heartbeat_` and no data.
//
// A record that is not valid CSV, lacks a mandatory field, repeats a field, or has a field value
// that can't be parsed is dropped.  The store can have partially written trailing records, so this
// is normal.

use crate::{parse_rfc3339, GpuSet, LogEntry};

use anyhow::Result;
use std::fs::File;
use std::io::{BufReader, Read};
use std::str::FromStr;

/// Parse a log file into a set of LogEntry structures.
///
/// This returns an error in the case of I/O errors, but silently drops records with parse errors.

pub fn parse_logfile(file_name: &str) -> Result<Vec<LogEntry>> {
    parse_logfile_from(BufReader::new(File::open(file_name)?))
}

pub fn parse_logfile_from<R: Read>(input: R) -> Result<Vec<LogEntry>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input);

    let mut results = vec![];
    for record in reader.records() {
        match record {
            Err(e) => {
                if e.is_io_error() {
                    return Err(e.into());
                }
                // Otherwise drop the record
            }
            Ok(record) => {
                if let Some(entry) = parse_record(record.iter()) {
                    results.push(entry);
                }
            }
        }
    }
    Ok(results)
}

fn parse_record<'a>(fields: impl Iterator<Item = &'a str>) -> Option<LogEntry> {
    // Find the fields and then convert them.  Duplicates are not allowed.  Mandatory fields are
    // really required.
    let mut version: Option<String> = None;
    let mut timestamp = None;
    let mut hostname: Option<String> = None;
    let mut user: Option<String> = None;
    let mut command: Option<String> = None;
    let mut num_cores = None;
    let mut pid = None;
    let mut job_id = None;
    let mut cpu_pct = None;
    let mut mem_gb = None;
    let mut rssanon_gb = None;
    let mut gpus = None;
    let mut gpu_pct = None;
    let mut gpu_mem_pct = None;
    let mut gpu_mem_gb = None;
    let mut gpu_fail = None;
    let mut cputime_sec = None;
    let mut rolledup = None;

    fn set<T>(slot: &mut Option<T>, v: Option<T>) -> Option<()> {
        if slot.is_some() {
            return None;
        }
        *slot = Some(v?);
        Some(())
    }
    fn num<T: FromStr>(s: &str) -> Option<T> {
        T::from_str(s).ok()
    }
    const KIB_PER_GB: f64 = 1024.0 * 1024.0;

    for field in fields {
        let Some((tag, value)) = field.split_once('=') else {
            continue;
        };
        match tag {
            "v" => set(&mut version, Some(value.to_string()))?,
            "time" => set(&mut timestamp, parse_rfc3339(value).ok())?,
            "host" => set(&mut hostname, Some(value.to_string()))?,
            "user" => set(&mut user, Some(value.to_string()))?,
            "cmd" => set(&mut command, Some(value.to_string()))?,
            "cores" => set(&mut num_cores, num::<u32>(value))?,
            "pid" => set(&mut pid, num::<u32>(value))?,
            "job" => set(&mut job_id, num::<u32>(value))?,
            "cpu%" => set(&mut cpu_pct, num::<f64>(value).map(|v| v / 100.0))?,
            "cpukib" => set(&mut mem_gb, num::<f64>(value).map(|v| v / KIB_PER_GB))?,
            "rssanonkib" => set(&mut rssanon_gb, num::<f64>(value).map(|v| v / KIB_PER_GB))?,
            "gpus" => set(&mut gpus, GpuSet::from_str(value).ok())?,
            "gpu%" => set(&mut gpu_pct, num::<f64>(value).map(|v| v / 100.0))?,
            "gpumem%" => set(&mut gpu_mem_pct, num::<f64>(value).map(|v| v / 100.0))?,
            "gpukib" => set(&mut gpu_mem_gb, num::<f64>(value).map(|v| v / KIB_PER_GB))?,
            "gpufail" => set(&mut gpu_fail, num::<u32>(value))?,
            "cputime_sec" => set(&mut cputime_sec, num::<f64>(value))?,
            "rolledup" => set(&mut rolledup, num::<u32>(value))?,
            _ => {
                // Unknown field, ignore it silently, this is benign.
            }
        }
    }

    Some(LogEntry {
        version: version?,
        timestamp: timestamp?,
        hostname: hostname?,
        num_cores: num_cores.unwrap_or(0),
        user: user?,
        pid: pid.unwrap_or(0),
        job_id: job_id.unwrap_or(0),
        command: command?,
        cpu_pct: cpu_pct.unwrap_or(0.0),
        mem_gb: mem_gb.unwrap_or(0.0),
        rssanon_gb: rssanon_gb.unwrap_or(0.0),
        gpus: gpus.unwrap_or_default(),
        gpu_pct: gpu_pct.unwrap_or(0.0),
        gpu_mem_pct: gpu_mem_pct.unwrap_or(0.0),
        gpu_mem_gb: gpu_mem_gb.unwrap_or(0.0),
        gpu_fail: gpu_fail.unwrap_or(0),
        cputime_sec: cputime_sec.unwrap_or(0.0),
        rolledup: rolledup.unwrap_or(0),
    })
}

#[test]
fn test_parse_logfile1() {
    // No such file
    assert!(parse_logfile("no/such/dir/ml2.hpc.uio.no.csv").is_err());
}

#[test]
fn test_parse_logfile2() {
    // Four records: the second has a malformed timestamp, the third repeats a field, and the fourth
    // is a heartbeat.
    let text = "\
v=0.7.0,time=2023-06-05T10:00:01+02:00,host=ml4.hpc.uio.no,cores=64,user=zabbix,job=4093,pid=4093,cmd=zabbix_agentd,cpu%=4.6,cpukib=2664
v=0.7.0,time=2023-06-05 10:05,host=ml4.hpc.uio.no,cores=64,user=root,job=1,cmd=systemd,cpu%=1,cpukib=10
v=0.7.0,time=2023-06-05T10:05:01+02:00,host=ml4.hpc.uio.no,user=root,user=other,cmd=x
v=0.8.0,time=2023-06-05T10:05:01+02:00,host=ml4.hpc.uio.no,user=_sonar_,cmd=_heartbeat_
v=0.7.0,time=2023-06-05T10:05:01+02:00,host=ml4.hpc.uio.no,cores=64,user=larsbent,job=1249151,pid=1249151,cmd=python,cpu%=126,cpukib=5084956,gpus=4,5,6,gpu%=100,gpumem%=10,gpukib=2000000,cputime_sec=300,rolledup=2
";
    let x = parse_logfile_from(text.as_bytes()).unwrap();
    assert!(x.len() == 3);
    assert!(x[0].user == "zabbix");
    assert!(x[1].is_heartbeat());
    assert!(x[2].user == "larsbent");
    assert!(x[0].timestamp < x[1].timestamp);
    assert!(x[1].timestamp == x[2].timestamp);
    assert!(x[2].cpu_pct == 1.26);
    assert!(x[2].rolledup == 2);
    // "gpus=4,5,6" is three CSV fields, of which only the first is tagged
    assert!(x[2].gpus.to_string() == "4");
}

#[test]
fn test_parse_logfile3() {
    // Quoted gpu set
    let text = "v=0.7.0,time=2023-06-05T10:05:01Z,host=ml4,user=u,cmd=python,\"gpus=4,5,6\",gpu%=50\n";
    let x = parse_logfile_from(text.as_bytes()).unwrap();
    assert!(x.len() == 1);
    assert!(x[0].gpus.to_string() == "4,5,6");
    assert!(x[0].gpu_pct == 0.5);
}
