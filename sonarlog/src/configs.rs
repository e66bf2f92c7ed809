// Read cluster configuration data from a json file into a hashmap with the host name as key.
//
// The file format is an array [...] of objects { ... }, each with the following named fields and
// value types:
//
//   hostname - string, the fully qualified and unique host name of the node, or a host pattern
//              with number ranges, eg `c1-[1-28].fox`, standing for many identical nodes
//   description - string, optional, arbitrary text describing the system
//   cross_node_jobs - bool, optional, true if jobs on this node may span nodes
//   cpu_cores - integer, the number of hyperthreads
//   mem_gb - integer, the amount of main memory in gigabytes
//   gpu_cards - integer, optional, the number of gpu cards on the node
//   gpumem_gb - integer, optional, the amount of gpu memory in gigabytes across all cards (also
//               accepted as gpu_mem_gb)
//   gpumem_pct - bool, optional, true if the GPU reports memory use as a percentage only
//
// Unknown fields (timestamp, comment, metadata) are ignored.

use crate::hosts::expand_pattern;

use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path;

// See above comment block for field documentation.

#[derive(Debug, Default, Clone, PartialEq)]
pub struct System {
    pub hostname: String,
    pub description: String,
    pub cross_node_jobs: bool,
    pub cpu_cores: usize,
    pub mem_gb: usize,
    pub gpu_cards: usize,
    pub gpu_mem_gb: usize,
    pub gpu_mem_pct: bool,
}

// Since the input is human-generated, may vary a bit over time, and have optional fields, I've
// opted to use the generic JSON parser followed by explicit decoding of the fields, rather than a
// (derived) strongly-typed parser.

pub fn read_cluster_config(filename: &str) -> Result<HashMap<String, System>> {
    let file = File::open(path::Path::new(filename))?;
    read_cluster_config_from(BufReader::new(file))
}

pub fn read_cluster_config_from<R: Read>(reader: R) -> Result<HashMap<String, System>> {
    let v = serde_json::from_reader(reader)?;
    let mut m = HashMap::new();
    let Value::Array(objs) = v else {
        bail!("Expected an array value")
    };
    for obj in objs {
        let Value::Object(fields) = obj else {
            bail!("Expected an object value")
        };
        let mut sys: System = Default::default();
        let pattern = if let Some(Value::String(hn)) = fields.get("hostname") {
            hn.clone()
        } else {
            bail!("Field 'hostname' must be present and have a string value");
        };
        if let Some(d) = fields.get("description") {
            if let Value::String(desc) = d {
                sys.description = desc.clone();
            } else {
                bail!("Field 'description' must have a string value");
            }
        }
        sys.cross_node_jobs = grab_bool(&fields, "cross_node_jobs")?;
        sys.cpu_cores = grab_usize(&fields, "cpu_cores")?;
        sys.mem_gb = grab_usize(&fields, "mem_gb")?;
        sys.gpu_cards = grab_usize_opt(&fields, "gpu_cards")?;
        sys.gpu_mem_gb = grab_usize_opt(&fields, "gpumem_gb")?.max(grab_usize_opt(&fields, "gpu_mem_gb")?);
        sys.gpu_mem_pct = grab_bool(&fields, "gpumem_pct")?;
        if sys.cpu_cores == 0 || sys.mem_gb == 0 {
            bail!("Nonsensical CPU/memory information for {pattern}");
        }
        if sys.gpu_cards == 0 && (sys.gpu_mem_gb != 0 || sys.gpu_mem_pct) {
            bail!("Inconsistent GPU information for {pattern}");
        }
        for hostname in expand_pattern(&pattern)? {
            if m.contains_key(&hostname) {
                bail!("Duplicate host name in config: {hostname}");
            }
            let mut s = sys.clone();
            s.hostname = hostname.clone();
            m.insert(hostname, s);
        }
    }
    Ok(m)
}

fn grab_usize(fields: &serde_json::Map<String, Value>, name: &str) -> Result<usize> {
    if fields.get(name).is_none() {
        bail!("Field '{name}' must be present and have an integer value")
    }
    grab_usize_opt(fields, name)
}

fn grab_usize_opt(fields: &serde_json::Map<String, Value>, name: &str) -> Result<usize> {
    match fields.get(name) {
        None => Ok(0),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(n) => Ok(usize::try_from(n)?),
            None => bail!("Field '{name}' must have unsigned integer value"),
        },
        Some(_) => bail!("Field '{name}' must have an integer value"),
    }
}

fn grab_bool(fields: &serde_json::Map<String, Value>, name: &str) -> Result<bool> {
    match fields.get(name) {
        None => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => bail!("Field '{name}' must have a boolean value"),
    }
}

#[test]
fn test_read_cluster_config() {
    let text = r#"[
 {"hostname": "ml1.hpc.uio.no", "description": "2x14 Intel", "cpu_cores": 56, "mem_gb": 128,
  "gpu_cards": 3, "gpumem_gb": 33},
 {"hostname": "c1-[1-3]", "cpu_cores": 128, "mem_gb": 512, "cross_node_jobs": true}
]"#;
    let m = read_cluster_config_from(text.as_bytes()).unwrap();
    assert!(m.len() == 4);
    let ml1 = &m["ml1.hpc.uio.no"];
    assert!(ml1.cpu_cores == 56 && ml1.gpu_cards == 3 && ml1.gpu_mem_gb == 33);
    assert!(ml1.description == "2x14 Intel");
    assert!(m["c1-2"].cross_node_jobs);
    assert!(m["c1-3"].hostname == "c1-3");

    assert!(read_cluster_config_from(r#"[{"hostname":"x","cpu_cores":0,"mem_gb":1}]"#.as_bytes()).is_err());
    assert!(read_cluster_config_from(r#"[{"hostname":"x","cpu_cores":1,"mem_gb":1,"gpumem_gb":4}]"#.as_bytes()).is_err());
    assert!(read_cluster_config_from(r#"{"hostname":"x"}"#.as_bytes()).is_err());
}
