//! Input-artifact scanner.
//!
//! Resolved dependency names are cached keyed by path so identical inputs
//! aren't re-scanned. Newly detected edges are distinguished from declared
//! children via a separate edge set — `scanner_children` on
//! [`crate::graph::ArtifactData`].

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Mutex,
};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    error::BuildError,
    graph::{BuildGraph, Node, NodeId},
};

/// One dependency name reported by a scanner plugin, before it has been
/// resolved against the search paths (e.g. `"stdio.h"` from a C scanner, or
/// a bare module name from a script-import scanner).
#[derive(Debug, Clone)]
pub struct ScannedName(pub String);

/// A scanner plugin: given a file's tags, says whether it applies; given a
/// file's contents path, reports the dependency names it finds.
pub trait ScannerPlugin: Send + Sync {
    fn matches_tags(&self, tags: &BTreeSet<String>) -> bool;
    fn scan(&self, artifact_path: &Path) -> Result<Vec<ScannedName>, BuildError>;
    /// Identity used as part of the resolution cache key.
    fn id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency {
    pub path: PathBuf,
    pub artifact: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    scanner_id: String,
    property_set_key: String,
    search_paths_key: String,
    artifact_path: PathBuf,
}

#[derive(Default)]
pub struct InputArtifactScanner {
    plugins: Vec<Box<dyn ScannerPlugin>>,
    cache: Mutex<BTreeMap<(String, String, String, PathBuf), Vec<ResolvedDependency>>>,
}

impl InputArtifactScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Box<dyn ScannerPlugin>) {
        self.plugins.push(plugin);
    }

    /// Scans `artifact` (a Generated artifact under consideration) using
    /// every plugin matching its file tags, resolving each reported
    /// dependency name against `search_paths`. Creates a file-dependency
    /// node for names that match no known artifact in `artifact`'s product,
    /// otherwise connects an edge recorded as scanner-added. Returns
    /// whether any *new* dependency edge was added, so the caller (the
    /// executor) knows to re-check readiness.
    pub fn scan_artifact(
        &self,
        graph: &mut BuildGraph,
        artifact: NodeId,
        search_paths: &[PathBuf],
        property_set_key: &str,
    ) -> Result<bool, BuildError> {
        let (path, tags, product) = {
            let Some(Node::Artifact(data)) = graph.node(artifact) else {
                return Ok(false);
            };
            (data.path.clone(), data.file_tags.clone(), data.product)
        };

        let search_paths_key = search_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(";");

        let mut any_added = false;

        for plugin in &self.plugins {
            if !plugin.matches_tags(&tags) {
                continue;
            }

            let key = (plugin.id().to_string(), property_set_key.to_string(), search_paths_key.clone(), path.clone());
            let resolved = {
                let mut cache = self.cache.lock().unwrap();
                if let Some(cached) = cache.get(&key) {
                    cached.clone()
                } else {
                    let names = plugin.scan(&path)?;
                    let resolved: Vec<ResolvedDependency> = names
                        .into_iter()
                        .map(|name| resolve_against_search_paths(graph, product, &name.0, search_paths))
                        .collect();
                    cache.insert(key, resolved.clone());
                    resolved
                }
            };

            for dep in resolved {
                let dep_node = match dep.artifact {
                    Some(existing) => existing,
                    None => graph.file_dependency(dep.path.clone()),
                };
                if !graph.has_edge(artifact, dep_node) {
                    graph.connect(artifact, dep_node)?;
                    mark_scanner_added(graph, artifact, dep_node);
                    any_added = true;
                }
            }
        }

        Ok(any_added)
    }
}

fn resolve_against_search_paths(
    graph: &BuildGraph,
    product: crate::graph::ProductId,
    name: &str,
    search_paths: &[PathBuf],
) -> ResolvedDependency {
    let candidate = PathBuf::from(name);
    if let Some(artifact) = graph.lookup_artifact(product, &candidate) {
        return ResolvedDependency { path: candidate, artifact: Some(artifact) };
    }
    for base in search_paths {
        let joined = base.join(name);
        if let Some(artifact) = graph.lookup_artifact(product, &joined) {
            return ResolvedDependency { path: joined, artifact: Some(artifact) };
        }
        if joined.is_file() {
            return ResolvedDependency { path: joined, artifact: None };
        }
    }
    ResolvedDependency { path: candidate, artifact: None }
}

fn mark_scanner_added(graph: &mut BuildGraph, artifact: NodeId, dep: NodeId) {
    if let Some(Node::Artifact(data)) = graph.node_mut(artifact) {
        data.scanner_children.insert(dep);
    }
}

/// Matches a C-preprocessor-style `#include "path"` or `#include <path>`
/// directive, capturing the referenced path in the named group `path`.
/// Compiled once and shared across every [`RegexScanner`] that doesn't
/// supply its own pattern.
static RE_C_INCLUDE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"#\s*include\s+(?:"(?P<path>[^"]+)"|<(?P<path2>[^>]+)>)"#).unwrap());

/// A generic built-in scanner plugin driven by a single capturing regex,
/// for build-file syntaxes whose input-scanning needs are "grep every
/// matching line, take the captured path" rather than a real parser (spec
/// §4.6 "Scanner plugins" — this is the reference implementation of one).
pub struct RegexScanner {
    tags: BTreeSet<String>,
    pattern: Regex,
    id: String,
}

impl RegexScanner {
    /// A scanner over `tags` using the built-in C/C++ `#include` pattern.
    pub fn c_includes(tags: impl IntoIterator<Item = String>) -> Self {
        Self { tags: tags.into_iter().collect(), pattern: RE_C_INCLUDE.clone(), id: "regex:c-include".to_string() }
    }

    /// A scanner over `tags` using a caller-supplied pattern. The pattern
    /// must define a capture group named `path` (or, as a fallback,
    /// `path2`, mirroring `c_includes`' `"..."` vs `<...>` alternation).
    pub fn with_pattern(id: impl Into<String>, tags: impl IntoIterator<Item = String>, pattern: Regex) -> Self {
        Self { tags: tags.into_iter().collect(), pattern, id: id.into() }
    }
}

impl ScannerPlugin for RegexScanner {
    fn matches_tags(&self, tags: &BTreeSet<String>) -> bool {
        self.tags.iter().any(|t| tags.contains(t))
    }

    fn scan(&self, artifact_path: &Path) -> Result<Vec<ScannedName>, BuildError> {
        let contents = std::fs::read_to_string(artifact_path)?;
        let names = contents
            .lines()
            .filter_map(|line| self.pattern.captures(line))
            .filter_map(|caps| {
                caps.name("path")
                    .or_else(|| caps.name("path2"))
                    .map(|m| ScannedName(m.as_str().to_string()))
            })
            .collect();
        Ok(names)
    }

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ArtifactData, ArtifactKind, ProductId};

    struct StubScanner {
        tag: String,
        names: Vec<String>,
    }

    impl ScannerPlugin for StubScanner {
        fn matches_tags(&self, tags: &BTreeSet<String>) -> bool {
            tags.contains(&self.tag)
        }

        fn scan(&self, _artifact_path: &Path) -> Result<Vec<ScannedName>, BuildError> {
            Ok(self.names.iter().cloned().map(ScannedName).collect())
        }

        fn id(&self) -> &str {
            "stub"
        }
    }

    #[test]
    fn unresolved_name_becomes_file_dependency() {
        let mut graph = BuildGraph::new();
        let p = ProductId(0);
        graph.add_product(p);
        let mut data = ArtifactData::new("main.c".into(), ArtifactKind::Source, p);
        data.file_tags.insert("c-source".into());
        let main = graph.add_artifact(data);

        let mut scanner = InputArtifactScanner::new();
        scanner.register(Box::new(StubScanner {
            tag: "c-source".into(),
            names: vec!["stdio.h".into()],
        }));

        let added = scanner.scan_artifact(&mut graph, main, &[], "props-v1").unwrap();
        assert!(added);
        let Some(Node::Artifact(data)) = graph.node(main) else { panic!() };
        assert_eq!(data.scanner_children.len(), 1);
    }

    #[test]
    fn repeated_scan_is_cached_and_idempotent() {
        let mut graph = BuildGraph::new();
        let p = ProductId(0);
        graph.add_product(p);
        let mut data = ArtifactData::new("main.c".into(), ArtifactKind::Source, p);
        data.file_tags.insert("c-source".into());
        let main = graph.add_artifact(data);

        let mut scanner = InputArtifactScanner::new();
        scanner.register(Box::new(StubScanner { tag: "c-source".into(), names: vec!["stdio.h".into()] }));

        scanner.scan_artifact(&mut graph, main, &[], "props-v1").unwrap();
        let added_again = scanner.scan_artifact(&mut graph, main, &[], "props-v1").unwrap();
        assert!(!added_again);
    }

    #[test]
    fn regex_scanner_extracts_quoted_and_angle_includes() {
        let dir = tempfile::tempdir().unwrap();
        let main_path = dir.path().join("main.c");
        std::fs::write(&main_path, "#include \"local.h\"\n#include <stdio.h>\n").unwrap();

        let mut graph = BuildGraph::new();
        let p = ProductId(0);
        graph.add_product(p);
        let mut data = ArtifactData::new(main_path, ArtifactKind::Source, p);
        data.file_tags.insert("c-source".into());
        let main = graph.add_artifact(data);

        let mut scanner = InputArtifactScanner::new();
        scanner.register(Box::new(RegexScanner::c_includes(["c-source".to_string()])));

        let added = scanner.scan_artifact(&mut graph, main, &[], "props-v1").unwrap();
        assert!(added);
        let Some(Node::Artifact(data)) = graph.node(main) else { panic!() };
        assert_eq!(data.scanner_children.len(), 2);
    }
}
