// Enumerate log files in a log tree.
//
// The tree below a cluster's data directory has this shape:
//
//    <data_path>/<year>/<month>/<day>/<hostname>.csv
//
// where year is CE and month and day have leading zeroes if necessary, ie, these are split out from
// a standard ISO timestamp.  Report generators drop their own files into the same tree, under fixed
// names, eg `<data_path>/<year>/<month>/<day>/cpuhog.csv`.

use crate::{dates, HostFilter, Timestamp};

use anyhow::{bail, Result};
use std::path;

/// Create a set of plausible log file names within a directory tree, for a date range and a set of
/// included host files.
///
/// `data_path` is the root of the tree.  `hosts`, if not empty, selects the host names we will want
/// data for.  `from` and `to` express the inclusive date range for the records we will want to
/// consider.
///
/// This returns an error if the `data_path` does not name a directory or if any directory that is
/// considered in the subtree, and which exists, cannot be read.
///
/// It does not return an error if the csv files cannot be read; that has to be handled later.
///
/// File names that are not representable as UTF8 are ignored.

pub fn find_logfiles(
    data_path: &str,
    hosts: &HostFilter,
    from: Timestamp,
    to: Timestamp,
) -> Result<Vec<String>> {
    if !path::Path::new(data_path).is_dir() {
        bail!("No viable log directory");
    }

    let mut filenames = vec![];
    for (year, month, day) in dates::date_range(from, to) {
        let dir_name = format!("{}/{}/{:02}/{:02}", data_path, year, month, day);
        let p = path::Path::new(&dir_name);
        if !p.is_dir() {
            continue;
        }
        let mut names = vec![];
        for entry in p.read_dir()? {
            // Bad directory entries are ignored
            let Ok(entry) = entry else { continue };
            let p = entry.path();
            // Non-UTF8 paths are ignored, we construct only UTF8 names and host names are UTF8.
            let Some(pstr) = p.to_str() else { continue };
            if p.extension().map_or(true, |ext| ext != "csv") {
                continue;
            }
            let Some(stem) = p.file_stem().and_then(|s| s.to_str()) else { continue };
            if hosts.is_empty() || hosts.contains(stem) {
                names.push(pstr.to_string());
            }
        }
        // Directory order is arbitrary
        names.sort();
        filenames.extend(names);
    }
    Ok(filenames)
}

/// Return the paths `<data_path>/<yyyy>/<mm>/<dd>/<file_name>` that exist for dates in the range.

pub fn find_files_named(
    data_path: &str,
    file_name: &str,
    from: Timestamp,
    to: Timestamp,
) -> Result<Vec<String>> {
    if !path::Path::new(data_path).is_dir() {
        bail!("No viable log directory");
    }
    Ok(dates::date_range(from, to)
        .into_iter()
        .map(|(year, month, day)| {
            format!("{}/{}/{:02}/{:02}/{}", data_path, year, month, day, file_name)
        })
        .filter(|name| path::Path::new(name).is_file())
        .collect())
}

#[cfg(test)]
fn make_tree(root: &path::Path) {
    for (dir, file) in [
        ("2023/05/30", "ml1.hpc.uio.no.csv"),
        ("2023/05/31", "ml1.hpc.uio.no.csv"),
        ("2023/05/31", "ml8.hpc.uio.no.csv"),
        ("2023/05/31", "cpuhog.csv"),
        ("2023/05/31", "sysinfo-ml1.hpc.uio.no.json"),
        ("2023/06/02", "ml8.hpc.uio.no.csv"),
    ] {
        std::fs::create_dir_all(root.join(dir)).unwrap();
        std::fs::write(root.join(dir).join(file), "").unwrap();
    }
}

#[test]
fn test_find_logfiles() {
    let dir = tempfile::TempDir::new().unwrap();
    make_tree(dir.path());
    let root = dir.path().to_str().unwrap();
    let from = crate::timestamp_from_ymdhms(2023, 5, 31, 0, 0, 0).unwrap();
    let to = crate::timestamp_from_ymdhms(2023, 6, 2, 12, 0, 0).unwrap();

    let mut hosts = HostFilter::new();
    hosts.insert("ml8").unwrap();
    let files = find_logfiles(root, &hosts, from, to).unwrap();
    assert!(files.len() == 2);
    assert!(files[0].ends_with("2023/05/31/ml8.hpc.uio.no.csv"));
    assert!(files[1].ends_with("2023/06/02/ml8.hpc.uio.no.csv"));

    // No host filter: every csv file, including report files, but not json
    let files = find_logfiles(root, &HostFilter::new(), from, to).unwrap();
    assert!(files.len() == 4);

    assert!(find_logfiles(&format!("{root}/nonexistent"), &hosts, from, to).is_err());
}

#[test]
fn test_find_files_named() {
    let dir = tempfile::TempDir::new().unwrap();
    make_tree(dir.path());
    let root = dir.path().to_str().unwrap();
    let from = crate::timestamp_from_ymdhms(2023, 5, 1, 0, 0, 0).unwrap();
    let to = crate::timestamp_from_ymdhms(2023, 6, 30, 0, 0, 0).unwrap();
    let files = find_files_named(root, "cpuhog.csv", from, to).unwrap();
    assert!(files.len() == 1);
    assert!(files[0].ends_with("2023/05/31/cpuhog.csv"));
}
