//! Graph persistence.
//!
//! A leading `format` field carries a fixed version string, checked before
//! anything else is deserialized, so a schema mismatch fails cleanly
//! instead of attempting (and possibly succeeding at) a garbage partial
//! parse.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BuildError;

use super::BuildGraph;

/// Bumped whenever the on-disk shape of [`BuildGraph`] changes in a way
/// that isn't forward compatible.
pub const FORMAT_VERSION: &str = "build-graph-core-v1";

#[derive(Debug, Serialize, Deserialize)]
struct PersistedGraph {
    format: String,
    graph: BuildGraph,
}

impl BuildGraph {
    /// Serializes this graph to `path`. Deterministic: two graphs with
    /// identical contents produce byte-identical output, since every
    /// serialized collection is a `BTreeMap`/`BTreeSet`, never a
    /// `HashMap`/`HashSet`.
    pub fn save(&self, path: &Path) -> Result<(), BuildError> {
        let persisted = PersistedGraph { format: FORMAT_VERSION.to_string(), graph: self.clone() };
        let bytes = serde_json::to_vec_pretty(&persisted)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Loads a graph previously written by [`Self::save`]. Rejects with
    /// [`BuildError::IncompatibleBuildGraph`] on a format-tag mismatch
    /// without attempting to interpret the rest of the file.
    pub fn load(path: &Path) -> Result<BuildGraph, BuildError> {
        let bytes = std::fs::read(path)?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        let format = value.get("format").and_then(|f| f.as_str()).unwrap_or_default();
        if format != FORMAT_VERSION {
            return Err(BuildError::IncompatibleBuildGraph {
                path: path.to_path_buf(),
                reason: format!("expected format {FORMAT_VERSION:?}, found {format:?}"),
            });
        }
        let persisted: PersistedGraph = serde_json::from_value(value)?;
        let mut graph = persisted.graph;
        graph.rebuild_indexes();
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ArtifactData, ArtifactKind, ProductId};

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");

        let mut graph = BuildGraph::new();
        let p = ProductId(0);
        graph.add_product(p);
        let a = graph.add_artifact(ArtifactData::new("a.o".into(), ArtifactKind::Source, p));
        let b = graph.add_artifact(ArtifactData::new("b.o".into(), ArtifactKind::Generated, p));
        graph.connect(b, a).unwrap();

        graph.save(&path).unwrap();
        let loaded = BuildGraph::load(&path).unwrap();

        assert!(loaded.has_edge(b, a));
        assert_eq!(loaded.lookup_artifact(p, std::path::Path::new("a.o")), Some(a));
    }

    #[test]
    fn identical_graphs_serialize_identically() {
        let build = |tag: &str| {
            let mut graph = BuildGraph::new();
            let p = ProductId(0);
            graph.add_product(p);
            let a = graph.add_artifact(ArtifactData::new(format!("{tag}.o").into(), ArtifactKind::Source, p));
            let _ = a;
            graph
        };
        let g1 = build("same");
        let g2 = build("same");
        let bytes1 = serde_json::to_vec(&PersistedGraph { format: FORMAT_VERSION.to_string(), graph: g1 }).unwrap();
        let bytes2 = serde_json::to_vec(&PersistedGraph { format: FORMAT_VERSION.to_string(), graph: g2 }).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn mismatched_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(&path, r#"{"format":"some-ancient-format","graph":{}}"#).unwrap();
        let err = BuildGraph::load(&path).unwrap_err();
        assert!(matches!(err, BuildError::IncompatibleBuildGraph { .. }));
    }
}
