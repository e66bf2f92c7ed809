//! Cluster aliases: a JSON array of `{"alias": "ml", "value": "mlx.hpc.uio.no"}` objects mapping
//! short names onto canonical cluster names.  Immutable once loaded.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;

#[derive(Debug, Default, Clone)]
pub struct ClusterAliases {
    mapping: HashMap<String, String>,
}

#[derive(Deserialize)]
struct AliasEncoding {
    alias: String,
    value: String,
}

impl ClusterAliases {
    pub fn read(filename: &str) -> Result<ClusterAliases> {
        ClusterAliases::from_json(&fs::read_to_string(filename)?)
    }

    pub fn from_json(text: &str) -> Result<ClusterAliases> {
        let aliases: Vec<AliasEncoding> =
            serde_json::from_str(text).context("Failed to unmarshal aliases")?;
        Ok(ClusterAliases {
            mapping: aliases.into_iter().map(|a| (a.alias, a.value)).collect(),
        })
    }

    /// The canonical name for `name`, which is `name` itself if it is not an alias.

    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.mapping.get(name).map_or(name, |s| s.as_str())
    }

    /// Map each canonical name to the aliases for it.

    pub fn reverse_expand(&self) -> HashMap<String, Vec<String>> {
        let mut xs: HashMap<String, Vec<String>> = HashMap::new();
        for (alias, cluster) in &self.mapping {
            xs.entry(cluster.clone()).or_default().push(alias.clone());
        }
        xs.values_mut().for_each(|v| v.sort());
        xs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let a = ClusterAliases::from_json(
            r#"[{"alias":"ml","value":"mlx.hpc.uio.no"},{"alias":"mlx","value":"mlx.hpc.uio.no"},
                {"alias":"fox","value":"fox.educloud.no"}]"#,
        )
        .unwrap();
        assert_eq!(a.resolve("ml"), "mlx.hpc.uio.no");
        assert_eq!(a.resolve("saga"), "saga");
        assert_eq!(
            a.reverse_expand()["mlx.hpc.uio.no"],
            vec!["ml".to_string(), "mlx".to_string()]
        );
        assert!(ClusterAliases::from_json("{}").is_err());
    }
}
