// A set of GPU cards as reported by sonar: "none", "unknown", or a comma-separated list of card
// numbers.

use anyhow::{bail, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GpuSet {
    /// No cards in use.
    #[default]
    Empty,

    /// Some cards are in use but sonar could not tell which.
    Unknown,

    /// These cards, never empty.
    Cards(BTreeSet<u32>),
}

impl GpuSet {
    pub fn is_empty(&self) -> bool {
        *self == GpuSet::Empty
    }

    /// Merge two sets.  Unknown absorbs everything.

    pub fn union(&self, other: &GpuSet) -> GpuSet {
        match (self, other) {
            (GpuSet::Unknown, _) | (_, GpuSet::Unknown) => GpuSet::Unknown,
            (GpuSet::Empty, x) | (x, GpuSet::Empty) => x.clone(),
            (GpuSet::Cards(a), GpuSet::Cards(b)) => GpuSet::Cards(a.union(b).copied().collect()),
        }
    }
}

impl FromStr for GpuSet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<GpuSet> {
        match s {
            "none" | "" => Ok(GpuSet::Empty),
            "unknown" => Ok(GpuSet::Unknown),
            _ => {
                let mut cards = BTreeSet::new();
                for x in s.split(',') {
                    match u32::from_str(x) {
                        Ok(n) => {
                            cards.insert(n);
                        }
                        Err(_) => bail!("Bad GPU set `{s}`"),
                    }
                }
                Ok(GpuSet::Cards(cards))
            }
        }
    }
}

impl fmt::Display for GpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuSet::Empty => write!(f, "none"),
            GpuSet::Unknown => write!(f, "unknown"),
            GpuSet::Cards(cards) => {
                let s = cards.iter().map(|c| c.to_string()).collect::<Vec<String>>().join(",");
                write!(f, "{s}")
            }
        }
    }
}

#[test]
fn test_gpuset() {
    let a = GpuSet::from_str("1,3").unwrap();
    let b = GpuSet::from_str("2").unwrap();
    assert!(a.union(&b).to_string() == "1,2,3");
    assert!(a.union(&GpuSet::Empty) == a);
    assert!(b.union(&GpuSet::Unknown) == GpuSet::Unknown);
    assert!(GpuSet::from_str("none").unwrap().is_empty());
    assert!(GpuSet::from_str("1,x").is_err());
}
