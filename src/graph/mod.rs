//! The build graph: the project build-data arena and its invariants.
//!
//! All nodes live in one owning arena and refer to each other by a stable
//! index handle rather than by pointer: there are no reference cycles to
//! manage, just a `NodeId` that may no longer resolve — callers check on
//! use.

pub mod node;
pub mod persistence;
pub mod transformer;

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::BuildError;

pub use node::{ArtifactData, ArtifactKind, BuildState, FileDepData, Node, RuleNodeData};
pub use transformer::{Transformer, TransformerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductId(pub u32);

/// The project build-data arena. Owns every [`Node`] and every
/// [`Transformer`]; all cross-references are [`NodeId`]/[`TransformerId`]
/// handles into this structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildGraph {
    nodes: Vec<Option<Node>>,
    transformers: Vec<Option<Transformer>>,
    /// Reverse adjacency: child -> parents, maintained alongside each
    /// node's own forward `children` set. This is what lets the loader walk
    /// "importers" for dirty-file propagation. Derived from `nodes`; not
    /// serialized — see [`Self::rebuild_indexes`].
    #[serde(skip)]
    parents: BTreeMap<NodeId, BTreeSet<NodeId>>,
    #[serde(skip)]
    path_index: BTreeMap<(ProductId, PathBuf), NodeId>,
    #[serde(skip)]
    file_dep_index: BTreeMap<PathBuf, NodeId>,
    products: BTreeSet<ProductId>,
}

impl BuildGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the derived indexes (`path_index`, `file_dep_index`,
    /// `parents`) from `nodes`. Required after deserializing a persisted
    /// graph, since none of those indexes are part of the serialized form —
    /// keeping only `BTreeMap`/`BTreeSet`-keyed-by-handle data on the wire
    /// is what gives the persistence format its byte-for-byte determinism
    /// (tuple-keyed maps like `path_index` can't round-trip through JSON
    /// object keys directly).
    pub fn rebuild_indexes(&mut self) {
        self.path_index.clear();
        self.file_dep_index.clear();
        self.parents.clear();
        for (i, slot) in self.nodes.iter().enumerate() {
            let Some(node) = slot else { continue };
            let id = NodeId(i as u32);
            match node {
                Node::Artifact(a) => {
                    self.path_index.insert((a.product, a.path.clone()), id);
                    for child in a.children.iter().chain(a.scanner_children.iter()).chain(a.file_dep_children.iter()) {
                        self.parents.entry(*child).or_default().insert(id);
                    }
                }
                Node::FileDep(f) => {
                    self.file_dep_index.insert(f.path.clone(), id);
                }
                Node::Rule(r) => {
                    for child in &r.children {
                        self.parents.entry(*child).or_default().insert(id);
                    }
                }
            }
        }
    }

    // -- products ---------------------------------------------------

    pub fn add_product(&mut self, product: ProductId) {
        self.products.insert(product);
    }

    /// Removes a product and every artifact/rule node scoped to it.
    pub fn remove_product(&mut self, product: ProductId) {
        self.products.remove(&product);
        let doomed: Vec<NodeId> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| match n {
                Some(Node::Artifact(a)) if a.product == product => Some(NodeId(i as u32)),
                Some(Node::Rule(r)) if r.product == product => Some(NodeId(i as u32)),
                _ => None,
            })
            .collect();
        for id in doomed {
            self.remove_node(id);
        }
    }

    pub fn has_product(&self, product: ProductId) -> bool {
        self.products.contains(&product)
    }

    // -- nodes --------------------------------------------------------

    fn insert_node(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(node));
        id
    }

    pub fn add_artifact(&mut self, data: ArtifactData) -> NodeId {
        let key = (data.product, data.path.clone());
        let id = self.insert_node(Node::Artifact(data));
        self.path_index.insert(key, id);
        id
    }

    /// Deduplicated process-wide by path.
    pub fn file_dependency(&mut self, path: PathBuf) -> NodeId {
        if let Some(existing) = self.file_dep_index.get(&path) {
            return *existing;
        }
        let id = self.insert_node(Node::FileDep(FileDepData::new(path.clone())));
        self.file_dep_index.insert(path, id);
        id
    }

    pub fn add_rule_node(&mut self, data: RuleNodeData) -> NodeId {
        self.insert_node(Node::Rule(data))
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize).and_then(|n| n.as_ref())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0 as usize).and_then(|n| n.as_mut())
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn lookup_artifact(&self, product: ProductId, path: &Path) -> Option<NodeId> {
        self.path_index.get(&(product, path.to_path_buf())).copied()
    }

    pub fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.get_mut(id.0 as usize)?.take()?;
        if let Some(path) = node.path() {
            match &node {
                Node::Artifact(a) => {
                    self.path_index.remove(&(a.product, a.path.clone()));
                }
                Node::FileDep(_) => {
                    self.file_dep_index.remove(path);
                }
                Node::Rule(_) => {}
            }
        }
        // Remove this node from its children's parent sets and from its
        // own former parents' child sets.
        let children: Vec<NodeId> = match &node {
            Node::Artifact(a) => a.children.iter().chain(a.scanner_children.iter()).chain(a.file_dep_children.iter()).copied().collect(),
            Node::Rule(r) => r.children.iter().copied().collect(),
            Node::FileDep(_) => Vec::new(),
        };
        for child in children {
            if let Some(parents) = self.parents.get_mut(&child) {
                parents.remove(&id);
            }
        }
        if let Some(parents) = self.parents.remove(&id) {
            for parent in parents {
                self.remove_child_edge(parent, id);
            }
        }
        Some(node)
    }

    fn remove_child_edge(&mut self, parent: NodeId, child: NodeId) {
        if let Some(node) = self.node_mut(parent) {
            match node {
                Node::Artifact(a) => {
                    a.children.remove(&child);
                    a.scanner_children.remove(&child);
                    a.file_dep_children.remove(&child);
                }
                Node::Rule(r) => {
                    r.children.remove(&child);
                }
                Node::FileDep(_) => {}
            }
        }
    }

    // -- edges ----------------------------------------------------------

    /// Returns whether `from` can reach `to` by following forward child
    /// edges — used to detect the cycle that adding `parent -> child` would
    /// close.
    fn can_reach(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.node(current) {
                stack.extend(self.forward_children(node));
            }
        }
        false
    }

    fn forward_children(&self, node: &Node) -> Vec<NodeId> {
        match node {
            Node::Artifact(a) => a
                .children
                .iter()
                .chain(a.scanner_children.iter())
                .chain(a.file_dep_children.iter())
                .copied()
                .collect(),
            Node::Rule(r) => r.children.iter().copied().collect(),
            Node::FileDep(_) => Vec::new(),
        }
    }

    /// Connects `parent -> child`. Fails with [`BuildError::CycleIntroduced`]
    /// if `child` can already reach `parent`.
    pub fn connect(&mut self, parent: NodeId, child: NodeId) -> Result<(), BuildError> {
        if self.can_reach(child, parent) {
            let parent_path = self.node(parent).and_then(Node::path).map(Path::to_path_buf).unwrap_or_default();
            let child_path = self.node(child).and_then(Node::path).map(Path::to_path_buf).unwrap_or_default();
            return Err(BuildError::CycleIntroduced { parent: parent_path, child: child_path });
        }
        self.add_child_edge(parent, child);
        self.parents.entry(child).or_default().insert(parent);
        Ok(())
    }

    /// `connect`, but a no-op if the edge already exists.
    pub fn safe_connect(&mut self, parent: NodeId, child: NodeId) -> Result<(), BuildError> {
        if self.has_edge(parent, child) {
            return Ok(());
        }
        self.connect(parent, child)
    }

    pub fn has_edge(&self, parent: NodeId, child: NodeId) -> bool {
        self.node(parent).map(|n| self.forward_children(n).contains(&child)).unwrap_or(false)
    }

    pub fn disconnect(&mut self, parent: NodeId, child: NodeId) {
        self.remove_child_edge(parent, child);
        if let Some(parents) = self.parents.get_mut(&child) {
            parents.remove(&parent);
        }
    }

    fn add_child_edge(&mut self, parent: NodeId, child: NodeId) {
        if let Some(node) = self.node_mut(parent) {
            match node {
                Node::Artifact(a) => {
                    a.children.insert(child);
                }
                Node::Rule(r) => {
                    r.children.insert(child);
                }
                Node::FileDep(_) => {}
            }
        }
    }

    /// Nodes whose forward children include `child`, used by the loader's
    /// dirty-propagation DFS.
    pub fn parents_of(&self, child: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.parents.get(&child).into_iter().flatten().copied()
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        self.parents.get(&id).map(|p| p.is_empty()).unwrap_or(true)
    }

    // -- transformers -----------------------------------------------------

    pub fn add_transformer(&mut self, transformer: Transformer) -> TransformerId {
        let id = TransformerId(self.transformers.len() as u32);
        self.transformers.push(Some(transformer));
        id
    }

    pub fn transformer(&self, id: TransformerId) -> Option<&Transformer> {
        self.transformers.get(id.0 as usize).and_then(|t| t.as_ref())
    }

    pub fn transformer_mut(&mut self, id: TransformerId) -> Option<&mut Transformer> {
        self.transformers.get_mut(id.0 as usize).and_then(|t| t.as_mut())
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().enumerate().filter_map(|(i, n)| n.as_ref().map(|_| NodeId(i as u32)))
    }

    /// Artifacts belonging to `product` whose file tags intersect `tags`.
    fn artifacts_matching(&self, product: ProductId, tags: &BTreeSet<String>) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let Some(Node::Artifact(a)) = slot else { return None };
                if a.product == product && a.file_tags.iter().any(|t| tags.contains(t)) {
                    Some(NodeId(i as u32))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Forward children of any node, for callers outside this module (the
    /// executor's up-to-date check and readiness walk).
    pub fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id).map(|n| self.forward_children(n)).unwrap_or_default()
    }

    pub fn build_state(&self, id: NodeId) -> BuildState {
        self.node(id).map(Node::build_state).unwrap_or(BuildState::Built)
    }

    pub fn set_build_state(&mut self, id: NodeId, state: BuildState) {
        if let Some(node) = self.node_mut(id) {
            match node {
                Node::Artifact(a) => a.build_state = state,
                Node::Rule(r) => r.build_state = state,
                Node::FileDep(_) => {}
            }
        }
    }

    /// Timestamp of an Artifact or FileDep node (Source artifacts' and
    /// file-dependencies' timestamps are leaves for up-to-date
    /// computations; rule nodes have none).
    pub fn timestamp_of(&self, id: NodeId) -> Option<u64> {
        match self.node(id)? {
            Node::Artifact(a) => a.timestamp,
            Node::FileDep(f) => f.timestamp,
            Node::Rule(_) => None,
        }
    }

    pub fn set_timestamp(&mut self, id: NodeId, ts: Option<u64>) {
        match self.node_mut(id) {
            Some(Node::Artifact(a)) => {
                a.timestamp = ts;
                a.timestamp_retrieved = true;
            }
            Some(Node::FileDep(f)) => f.timestamp = ts,
            _ => {}
        }
    }

    /// "Apply a rule node": recompute its children as exactly the artifacts
    /// of its product matching its `input_tags`. Connects newly-matching
    /// artifacts and disconnects ones that no longer match. Returns whether
    /// the child set actually changed — callers use this to decide whether
    /// to invalidate descendants.
    pub fn apply_rule(&mut self, rule_node: NodeId) -> Result<bool, BuildError> {
        let Some(Node::Rule(rule)) = self.node(rule_node) else {
            return Ok(false);
        };
        let product = rule.product;
        let tags = rule.input_tags.clone();
        let previous: BTreeSet<NodeId> = rule.children.iter().copied().collect();

        let matching: BTreeSet<NodeId> = self.artifacts_matching(product, &tags).into_iter().collect();

        for &child in matching.difference(&previous) {
            self.connect(rule_node, child)?;
        }
        for &child in previous.difference(&matching) {
            self.disconnect(rule_node, child);
        }

        Ok(previous != matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(graph: &mut BuildGraph, product: ProductId, path: &str) -> NodeId {
        graph.add_artifact(ArtifactData::new(PathBuf::from(path), ArtifactKind::Source, product))
    }

    #[test]
    fn direct_cycle_is_rejected() {
        let mut graph = BuildGraph::new();
        let p = ProductId(0);
        graph.add_product(p);
        let a = artifact(&mut graph, p, "a.o");
        let b = artifact(&mut graph, p, "b.o");

        graph.connect(a, b).unwrap();
        let err = graph.connect(b, a).unwrap_err();
        assert!(matches!(err, BuildError::CycleIntroduced { .. }));
    }

    #[test]
    fn indirect_cycle_is_rejected() {
        let mut graph = BuildGraph::new();
        let p = ProductId(0);
        graph.add_product(p);
        let a = artifact(&mut graph, p, "a.o");
        let b = artifact(&mut graph, p, "b.o");
        let c = artifact(&mut graph, p, "c.o");

        graph.connect(a, b).unwrap();
        graph.connect(b, c).unwrap();
        let err = graph.connect(c, a).unwrap_err();
        assert!(matches!(err, BuildError::CycleIntroduced { .. }));
    }

    #[test]
    fn disjoint_trees_sharing_a_root_are_fine() {
        let mut graph = BuildGraph::new();
        let p = ProductId(0);
        graph.add_product(p);
        let root = artifact(&mut graph, p, "root.o");
        let left = artifact(&mut graph, p, "left.o");
        let right = artifact(&mut graph, p, "right.o");

        graph.connect(root, left).unwrap();
        graph.connect(root, right).unwrap();
    }

    #[test]
    fn safe_connect_is_idempotent() {
        let mut graph = BuildGraph::new();
        let p = ProductId(0);
        graph.add_product(p);
        let a = artifact(&mut graph, p, "a.o");
        let b = artifact(&mut graph, p, "b.o");

        graph.safe_connect(a, b).unwrap();
        graph.safe_connect(a, b).unwrap();
        assert!(graph.has_edge(a, b));
    }

    #[test]
    fn lookup_by_product_and_path() {
        let mut graph = BuildGraph::new();
        let p = ProductId(0);
        graph.add_product(p);
        let a = artifact(&mut graph, p, "a.o");
        assert_eq!(graph.lookup_artifact(p, Path::new("a.o")), Some(a));
        assert_eq!(graph.lookup_artifact(ProductId(1), Path::new("a.o")), None);
    }

    #[test]
    fn file_dependencies_are_deduplicated_process_wide() {
        let mut graph = BuildGraph::new();
        let a = graph.file_dependency(PathBuf::from("/usr/include/stdio.h"));
        let b = graph.file_dependency(PathBuf::from("/usr/include/stdio.h"));
        assert_eq!(a, b);
    }
}
