// Reader for the simple INI files that hold per-user defaults, typically ~/.sonalyze:
//
//   # comment
//   [data-source]
//   remote = https://naic-monitor.uio.no
//   cluster = ml
//   auth-file = /home/me/.ssh/sonalyzed-auth.txt
//
// Blank lines and lines whose first nonblank is `#` are ignored.  Names are `[-a-zA-Z_$]` followed
// by `[-a-zA-Z0-9_$]*`.  Whitespace around values is stripped.  Sections and variables within a
// section must not be duplicated, and every statement must follow a section header.

use anyhow::{bail, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Ini {
    sections: HashMap<String, HashMap<String, String>>,
}

impl Ini {
    pub fn read(filename: &Path) -> Result<Ini> {
        Ini::parse(&fs::read_to_string(filename)?)
    }

    pub fn parse(text: &str) -> Result<Ini> {
        let blank = Regex::new(r"^\s*(?:#.*)?$")?;
        let header = Regex::new(r"^\[([-a-zA-Z_$][-a-zA-Z0-9_$]*)\]\s*$")?;
        let statement = Regex::new(r"^\s*([-a-zA-Z_$][-a-zA-Z0-9_$]*)\s*=(.*)$")?;

        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current: Option<String> = None;
        for (i, line) in text.lines().enumerate() {
            let lineno = i + 1;
            if blank.is_match(line) {
                continue;
            }
            if let Some(m) = header.captures(line) {
                let name = m[1].to_string();
                if sections.contains_key(&name) {
                    bail!("Line {lineno}: Duplicated section name {name}.\n{line}");
                }
                sections.insert(name.clone(), HashMap::new());
                current = Some(name);
                continue;
            }
            if let Some(m) = statement.captures(line) {
                let Some(section) = current.as_ref().and_then(|c| sections.get_mut(c)) else {
                    bail!("Line {lineno}: Missing section header\n{line}");
                };
                let name = m[1].to_string();
                if section.contains_key(&name) {
                    bail!("Line {lineno}: Duplicated variable name {name}.\n{line}");
                }
                section.insert(name, m[2].trim().to_string());
                continue;
            }
            bail!("Line {lineno}: Malformed content.\n{line}");
        }
        Ok(Ini { sections })
    }

    pub fn get(&self, section: &str, name: &str) -> Option<&str> {
        self.sections.get(section)?.get(name).map(|s| s.as_str())
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }
}

/// The user's defaults file, if there is one.  A file that exists but can't be parsed is an error.

pub fn read_user_defaults() -> Result<Option<Ini>> {
    let Ok(home) = std::env::var("HOME") else {
        return Ok(None);
    };
    let p = Path::new(&home).join(".sonalyze");
    if !p.is_file() {
        return Ok(None);
    }
    Ok(Some(Ini::read(&p)?))
}

#[test]
fn test_ini() {
    let ini = Ini::parse(
        "# defaults\n\
         \n\
         [data-source]\n\
         remote = https://naic-monitor.uio.no  \n\
         cluster=ml\n   \
         empty =\n\
         [other_$]\n\
         cluster = fox\n",
    )
    .unwrap();
    assert!(ini.get("data-source", "remote") == Some("https://naic-monitor.uio.no"));
    assert!(ini.get("data-source", "cluster") == Some("ml"));
    assert!(ini.get("data-source", "empty") == Some(""));
    assert!(ini.get("other_$", "cluster") == Some("fox"));
    assert!(ini.get("data-source", "to").is_none());
    assert!(ini.get("nope", "cluster").is_none());
    assert!(ini.has_section("other_$"));
}

#[test]
fn test_ini_errors() {
    let e = Ini::parse("[a]\n[a]\n").unwrap_err().to_string();
    assert!(e == "Line 2: Duplicated section name a.\n[a]");
    let e = Ini::parse("x = 1\n").unwrap_err().to_string();
    assert!(e == "Line 1: Missing section header\nx = 1");
    let e = Ini::parse("[a]\nx = 1\n# c\nx = 2\n").unwrap_err().to_string();
    assert!(e == "Line 4: Duplicated variable name x.\nx = 2");
    let e = Ini::parse("[a]\n[b c]\n").unwrap_err().to_string();
    assert!(e == "Line 2: Malformed content.\n[b c]");
    assert!(Ini::parse("[a]\n3x = 1\n").is_err());
}
