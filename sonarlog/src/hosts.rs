/// Matcher for host names.
///
/// The matcher holds a number of patterns.  Each pattern is a vector of element patterns, one per
/// `.`-separated element of a host name.  A name matches a pattern if each element pattern matches
/// the corresponding element of the name; the pattern may be shorter than the name, so `ml8`
/// matches `ml8.hpc.uio.no`, unless the pattern was added as exhaustive.
///
/// Grammar for the element patterns given to `insert`:
///
///  element ::= eltpat ("," eltpat)*
///  eltpat ::= (literal | range)+ star?
///  range ::= '[' range-elt ("," range-elt)* ']'
///  range-elt ::= number | number "-" number
///
/// Ranges are expanded when the pattern is inserted, so `ml[1-3]*` becomes `ml1*`, `ml2*`, `ml3*`.
/// A trailing `*` matches any suffix of the element.

use anyhow::{bail, Result};
use std::str::FromStr;

#[derive(Debug, Default, Clone)]
pub struct HostFilter {
    matchers: Vec<(bool, Vec<Vec<String>>)>,
}

impl HostFilter {
    /// Create a new, empty filter.

    pub fn new() -> HostFilter {
        HostFilter { matchers: vec![] }
    }

    /// Add a pattern of already-expanded element alternatives.

    pub fn add_pattern(&mut self, elements: Vec<Vec<String>>, exhaustive: bool) {
        self.matchers.push((exhaustive, elements));
    }

    /// Parse and add a host pattern such as `ml[1-4].hpc` or `c1-*`.

    pub fn insert(&mut self, pattern: &str) -> Result<()> {
        let mut elements = vec![];
        for element in split_elements(pattern)? {
            elements.push(expand_element(&element)?);
        }
        self.add_pattern(elements, false);
        Ok(())
    }

    /// Return true iff the filter has no patterns.

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Match s against the patterns and return true iff it matches at least one pattern.

    pub fn contains(&self, s: &str) -> bool {
        let components = s.split('.').collect::<Vec<&str>>();
        self.matchers.iter().any(|(exhaustive, pattern)| {
            if pattern.len() > components.len() {
                return false;
            }
            if *exhaustive && pattern.len() != components.len() {
                return false;
            }
            pattern
                .iter()
                .zip(components.iter())
                .all(|(alternatives, c)| alternatives.iter().any(|p| match_simple(p, c)))
        })
    }
}

/// Expand a pattern into every host name it denotes.  Stars are not allowed.

pub(crate) fn expand_pattern(pattern: &str) -> Result<Vec<String>> {
    let mut names = vec![String::new()];
    for (i, element) in split_elements(pattern)?.iter().enumerate() {
        let alternatives = expand_element(element)?;
        if alternatives.iter().any(|a| a.ends_with('*')) {
            bail!("Wildcard not allowed in `{pattern}`")
        }
        names = names
            .iter()
            .flat_map(|n| {
                alternatives
                    .iter()
                    .map(move |a| if i == 0 { a.clone() } else { format!("{n}.{a}") })
            })
            .collect();
    }
    Ok(names)
}

fn match_simple(pattern: &str, component: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => component.starts_with(prefix),
        None => pattern == component,
    }
}

// Split on `.` outside brackets.

fn split_elements(pattern: &str) -> Result<Vec<String>> {
    let mut elements = vec![];
    let mut current = String::new();
    let mut depth = 0;
    for c in pattern.chars() {
        match c {
            '[' => depth += 1,
            ']' if depth == 0 => bail!("Unbalanced `]` in host pattern"),
            ']' => depth -= 1,
            '.' if depth == 0 => {
                elements.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if depth != 0 {
        bail!("Unbalanced `[` in host pattern")
    }
    elements.push(current);
    Ok(elements)
}

// Expand one element into its alternatives.

fn expand_element(element: &str) -> Result<Vec<String>> {
    let chars = element.chars().collect::<Vec<char>>();
    let mut result = vec![];
    let mut alternatives = vec![String::new()];
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            ',' => {
                flush(&mut result, &mut alternatives)?;
                i += 1;
            }
            '*' => {
                alternatives.iter_mut().for_each(|s| s.push('*'));
                i += 1;
                if i < chars.len() && chars[i] != ',' {
                    bail!("`*` must end a host pattern element")
                }
            }
            '[' => {
                let close = match chars[i..].iter().position(|c| *c == ']') {
                    Some(k) => i + k,
                    None => bail!("Missing `]` in host pattern"),
                };
                let body = chars[i + 1..close].iter().collect::<String>();
                let numbers = expand_range(&body)?;
                alternatives = alternatives
                    .iter()
                    .flat_map(|s| numbers.iter().map(move |n| format!("{s}{n}")))
                    .collect();
                i = close + 1;
            }
            c => {
                alternatives.iter_mut().for_each(|s| s.push(c));
                i += 1;
            }
        }
    }
    flush(&mut result, &mut alternatives)?;
    Ok(result)
}

fn flush(result: &mut Vec<String>, alternatives: &mut Vec<String>) -> Result<()> {
    if alternatives.len() == 1 && alternatives[0].is_empty() {
        bail!("Empty pattern in input")
    }
    result.append(alternatives);
    alternatives.push(String::new());
    Ok(())
}

fn expand_range(body: &str) -> Result<Vec<u32>> {
    let mut numbers = vec![];
    for r in body.split(',') {
        match r.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (u32::from_str(lo)?, u32::from_str(hi)?);
                if lo > hi {
                    bail!("Empty range in host pattern")
                }
                numbers.extend(lo..=hi);
            }
            None => numbers.push(u32::from_str(r)?),
        }
    }
    Ok(numbers)
}

#[test]
fn test_hostfilter() {
    let mut hf = HostFilter::new();
    hf.add_pattern(vec![vec!["ml8".to_string()]], false);
    hf.add_pattern(
        ["ml4", "hpc", "uio", "no"].iter().map(|x| vec![x.to_string()]).collect(),
        true,
    );
    hf.insert("ml3.hpc").unwrap();

    // Single-element prefix match against this
    assert!(hf.contains("ml8.hpc.uio.no"));

    // Multi-element prefix match against this
    assert!(hf.contains("ml3.hpc.uio.no"));

    // Exhaustive match against this
    assert!(hf.contains("ml4.hpc.uio.no"));
    assert!(!hf.contains("ml4.hpc.uio.no.yes"));
    assert!(!hf.contains("ml5.hpc.uio.no"));
}

#[test]
fn test_expand_element() {
    assert_eq!(
        expand_element("c1-[0-1],c2-[2-3]").unwrap(),
        vec!["c1-0", "c1-1", "c2-2", "c2-3"]
    );
    assert_eq!(expand_element("ml[1,3]*").unwrap(), vec!["ml1*", "ml3*"]);
    assert!(expand_element("").is_err());
    assert!(expand_element("a,,b").is_err());
    assert!(expand_element("a[1-").is_err());
    assert!(expand_element("a*b").is_err());

    let mut hf = HostFilter::new();
    hf.insert("gpu-[1-3]*.fox").unwrap();
    assert!(hf.contains("gpu-2x.fox"));
    assert!(!hf.contains("gpu-4.fox"));
    assert!(!hf.contains("gpu-2.saga"));
}

#[test]
fn test_expand_pattern() {
    assert_eq!(
        expand_pattern("ml[1-2].hpc.uio.no").unwrap(),
        vec!["ml1.hpc.uio.no", "ml2.hpc.uio.no"]
    );
    assert_eq!(expand_pattern("c[1,3].n[5-6]").unwrap(), vec!["c1.n5", "c1.n6", "c3.n5", "c3.n6"]);
    assert!(expand_pattern("ml*").is_err());
}
