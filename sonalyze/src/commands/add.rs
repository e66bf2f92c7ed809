// Add data from stdin to a local cluster store.  The input is validated as a whole with the same
// decoders the daemon uses, then each record is appended to its host's file for its date.

use crate::cli::AddArgs;

use anyhow::{bail, Result};
use ingest::payload::{free_csv_requests, sysinfo_request};
use std::io;
use std::path::Path;

pub fn run(
    args: &AddArgs,
    stdin: &mut dyn io::Read,
    _stdout: &mut dyn io::Write,
    stderr: &mut dyn io::Write,
) -> Result<()> {
    if args.sample == args.sysinfo {
        bail!("Exactly one of --sample or --sysinfo is required");
    }
    let Some(ref data_path) = args.data_path else {
        bail!("Required --data-path");
    };
    let cluster_dir = Path::new(data_path);
    if !cluster_dir.is_dir() {
        bail!("No viable data directory {data_path}");
    }

    let mut body = vec![];
    stdin.read_to_end(&mut body)?;

    // The cluster name is not used for local stores.
    let requests = if args.sample {
        free_csv_requests("", &body)?
    } else {
        vec![sysinfo_request("", &body)?]
    };
    for r in &requests {
        let path = sonarlog::append_record(cluster_dir, &r.timestamp, &r.file_name, &r.payload)?;
        if args.meta.verbose {
            writeln!(stderr, "Appended to {}", path.display())?;
        }
    }
    Ok(())
}

#[test]
fn test_add_sample() {
    let tmp = tempfile::TempDir::new().unwrap();
    let args = AddArgs {
        sample: true,
        data_path: Some(tmp.path().to_str().unwrap().to_string()),
        ..Default::default()
    };
    let input = "\
v=0.7.0,time=2023-08-15T10:00:00+02:00,host=ml8,user=joe,job=10,pid=10,cmd=python,cpu%=100
v=0.7.0,time=2023-08-16T10:00:00+02:00,host=ml3,user=joe,job=10,pid=10,cmd=python,cpu%=100
";
    run(&args, &mut input.as_bytes(), &mut io::sink(), &mut io::sink()).unwrap();
    let a = std::fs::read_to_string(tmp.path().join("2023/08/15/ml8.csv")).unwrap();
    assert!(a.starts_with("v=0.7.0,time=2023-08-15T10:00:00+02:00,host=ml8"));
    assert!(tmp.path().join("2023/08/16/ml3.csv").exists());

    // One bad line rejects everything
    let input = "v=0.7.0,time=2023-08-17T10:00:00Z,host=ml8\nv=0.7.0,user=joe\n";
    assert!(run(&args, &mut input.as_bytes(), &mut io::sink(), &mut io::sink()).is_err());
    assert!(!tmp.path().join("2023/08/17").exists());
}

#[test]
fn test_add_sysinfo() {
    let tmp = tempfile::TempDir::new().unwrap();
    let args = AddArgs {
        sysinfo: true,
        data_path: Some(tmp.path().to_str().unwrap().to_string()),
        ..Default::default()
    };
    let input = r#"{"timestamp":"2023-08-15T10:00:00Z","hostname":"ml8","cpu_cores":64}"#;
    run(&args, &mut input.as_bytes(), &mut io::sink(), &mut io::sink()).unwrap();
    let s = std::fs::read_to_string(tmp.path().join("2023/08/15/sysinfo-ml8.json")).unwrap();
    assert!(s == format!("{input}\n"));

    let both = AddArgs { sample: true, ..args };
    assert!(run(&both, &mut input.as_bytes(), &mut io::sink(), &mut io::sink()).is_err());
}
