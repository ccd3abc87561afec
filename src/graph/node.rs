//! Tagged node variant replacing the visitor hierarchy described in the
//! design notes: `Artifact`, `RuleNode` and `FileDependencyNode` all become
//! one `Node` enum instead of three classes behind a common virtual base.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use super::{NodeId, ProductId, TransformerId};

/// Strictly Untouched -> Buildable -> Building -> Built within a single
/// build; no back-edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildState {
    Untouched,
    Buildable,
    Building,
    Built,
}

impl Default for BuildState {
    fn default() -> Self {
        BuildState::Untouched
    }
}

impl BuildState {
    /// Advances to `next`, refusing any transition that isn't the next step
    /// in Untouched -> Buildable -> Building -> Built.
    pub fn advance(&mut self, next: BuildState) {
        let valid = matches!(
            (*self, next),
            (BuildState::Untouched, BuildState::Buildable)
                | (BuildState::Buildable, BuildState::Building)
                | (BuildState::Building, BuildState::Built)
        );
        assert!(valid, "invalid build state transition: {self:?} -> {next:?}");
        *self = next;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactKind {
    Source,
    Generated,
    FileDependency,
}

/// A file known to the build graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactData {
    pub path: PathBuf,
    pub file_tags: BTreeSet<String>,
    pub kind: ArtifactKind,
    /// Milliseconds since the epoch, for portable, deterministic
    /// serialization across platforms.
    pub timestamp: Option<u64>,
    pub product: ProductId,
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub always_updated: bool,
    pub timestamp_retrieved: bool,
    /// Set on load, cleared after a rescue attempt (successful or not).
    pub old_data_possibly_present: bool,
    pub children: BTreeSet<NodeId>,
    pub scanner_children: BTreeSet<NodeId>,
    pub file_dep_children: BTreeSet<NodeId>,
    pub producing_transformer: Option<TransformerId>,
    pub build_state: BuildState,
}

impl ArtifactData {
    pub fn new(path: PathBuf, kind: ArtifactKind, product: ProductId) -> Self {
        Self {
            path,
            file_tags: BTreeSet::new(),
            kind,
            timestamp: None,
            product,
            properties: serde_json::Map::new(),
            always_updated: false,
            timestamp_retrieved: false,
            old_data_possibly_present: false,
            children: BTreeSet::new(),
            scanner_children: BTreeSet::new(),
            file_dep_children: BTreeSet::new(),
            producing_transformer: None,
            build_state: BuildState::Untouched,
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self.kind, ArtifactKind::Source)
    }

    pub fn is_generated(&self) -> bool {
        matches!(self.kind, ArtifactKind::Generated)
    }
}

/// One rule applied within one product. Children are the artifacts it
/// currently consumes; parents (tracked at the graph level, not here) are
/// downstream rule nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleNodeData {
    pub rule_name: String,
    pub product: ProductId,
    pub build_state: BuildState,
    pub children: BTreeSet<NodeId>,
    pub transformer: Option<TransformerId>,
    /// The rule's declared input tag set. A rule node's children are
    /// exactly the artifacts, among its product's artifacts, whose file
    /// tags intersect this set as of the last rule application.
    pub input_tags: BTreeSet<String>,
}

impl RuleNodeData {
    pub fn new(rule_name: impl Into<String>, product: ProductId) -> Self {
        Self {
            rule_name: rule_name.into(),
            product,
            build_state: BuildState::Untouched,
            children: BTreeSet::new(),
            transformer: None,
            input_tags: BTreeSet::new(),
        }
    }

    pub fn with_input_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.input_tags = tags.into_iter().collect();
        self
    }
}

/// A lightweight record for a file referenced by a scanner but not produced
/// by this build (e.g. a system header). Never executed, never installed.
/// Deduplicated process-wide via [`super::BuildGraph::file_dependency`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDepData {
    pub path: PathBuf,
    pub timestamp: Option<u64>,
}

impl FileDepData {
    pub fn new(path: PathBuf) -> Self {
        Self { path, timestamp: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Node {
    Artifact(ArtifactData),
    Rule(RuleNodeData),
    FileDep(FileDepData),
}

impl Node {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Node::Artifact(a) => Some(&a.path),
            Node::Rule(_) => None,
            Node::FileDep(f) => Some(&f.path),
        }
    }

    pub fn build_state(&self) -> BuildState {
        match self {
            Node::Artifact(a) => a.build_state,
            Node::Rule(r) => r.build_state,
            Node::FileDep(_) => BuildState::Built,
        }
    }

    pub fn as_artifact(&self) -> Option<&ArtifactData> {
        match self {
            Node::Artifact(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_artifact_mut(&mut self) -> Option<&mut ArtifactData> {
        match self {
            Node::Artifact(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_rule(&self) -> Option<&RuleNodeData> {
        match self {
            Node::Rule(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_rule_mut(&mut self) -> Option<&mut RuleNodeData> {
        match self {
            Node::Rule(r) => Some(r),
            _ => None,
        }
    }
}
