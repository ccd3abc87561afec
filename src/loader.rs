//! The build-graph loader: reloads a persisted graph, validates it against
//! the current environment, and rescues still-valid artifact data across
//! reconfigures.
//!
//! The cache file is read only if the paths it was keyed on are unchanged;
//! otherwise the loader starts from an empty graph and lets the resolver
//! rebuild it. Rescue is a diff between the persisted graph and the
//! freshly-resolved one: orphaned generated artifacts are deleted from
//! disk before the new graph is adopted.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    time::SystemTime,
};

use crate::{
    error::BuildError,
    graph::{BuildGraph, Node, NodeId},
    util::discover_files_with_extensions,
};

/// Configuration keys pinned at the last resolve, compared against the
/// current run's keys to decide `ConfigurationChanged`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupProjectParameters {
    pub configuration: BTreeMap<String, String>,
}

/// Everything the five-part change-detection policy needs to decide
/// whether a full reresolve is warranted.
#[derive(Debug, Clone, Default)]
pub struct ChangeDetectionInputs {
    /// Environment variable names referenced by any probe or command,
    /// together with their values as seen by the previous resolve.
    pub previous_env: BTreeMap<String, String>,
    pub current_env: BTreeMap<String, String>,
    /// Filesystem queries (existence / canonical path / directory listing
    /// / mtime) cached by the previous resolve, as `(query key -> answer)`;
    /// compared against a fresh read of the same queries.
    pub cached_fs_answers: BTreeMap<String, String>,
    pub current_fs_answers: BTreeMap<String, String>,
    /// Project file, imports, and files matched by scanned wildcards.
    pub build_system_files: Vec<PathBuf>,
    pub graph_mtime: Option<SystemTime>,
    pub force_probe_execution: bool,
    pub previous_params: SetupProjectParameters,
    pub current_params: SetupProjectParameters,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeReason {
    EnvironmentChanged,
    FilesystemQueryChanged,
    BuildSystemFileNewer(PathBuf),
    ForcedProbeExecution,
    ConfigurationChanged,
}

/// Populates [`ChangeDetectionInputs::build_system_files`] by walking
/// `root` for files carrying one of `extensions` (e.g. the build-file
/// syntax's own extension plus whatever config format it imports).
pub fn discover_build_system_files(root: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    discover_files_with_extensions(root, extensions)
}

/// The five-part change-detection policy: any one true forces a full
/// reresolve.
pub fn needs_reresolve(inputs: &ChangeDetectionInputs) -> Option<ChangeReason> {
    if inputs.previous_env != inputs.current_env {
        return Some(ChangeReason::EnvironmentChanged);
    }
    if inputs.cached_fs_answers != inputs.current_fs_answers {
        return Some(ChangeReason::FilesystemQueryChanged);
    }
    if let Some(graph_mtime) = inputs.graph_mtime {
        for file in &inputs.build_system_files {
            if let Ok(meta) = std::fs::metadata(file) {
                if let Ok(modified) = meta.modified() {
                    if modified > graph_mtime {
                        return Some(ChangeReason::BuildSystemFileNewer(file.clone()));
                    }
                }
            }
        }
    }
    if inputs.force_probe_execution {
        return Some(ChangeReason::ForcedProbeExecution);
    }
    if inputs.previous_params != inputs.current_params {
        return Some(ChangeReason::ConfigurationChanged);
    }
    None
}

#[derive(Debug, Default)]
pub struct RescueReport {
    /// (product, path) keys successfully rescued.
    pub rescued: Vec<PathBuf>,
    /// Old artifact files deleted because they could not be rescued.
    pub deleted_files: Vec<PathBuf>,
    /// Parent directories of deleted files that are now empty and are
    /// candidates for cleanup.
    pub empty_parent_dirs: BTreeSet<PathBuf>,
}

/// Rescues reusable `Generated`-artifact data from `old` into `new`
/// in-place, mutating `new`. For every rescue miss, deletes the stale
/// artifact's file from disk and records its parent directory as an
/// empty-directory cleanup candidate.
pub fn rescue(old: &BuildGraph, new: &mut BuildGraph) -> Result<RescueReport, BuildError> {
    let mut report = RescueReport::default();

    for old_id in old.node_ids() {
        let Some(Node::Artifact(old_artifact)) = old.node(old_id) else { continue };
        if !old_artifact.is_generated() {
            continue;
        }

        let Some(new_id) = new.lookup_artifact(old_artifact.product, &old_artifact.path) else {
            delete_stale(old_artifact.path.clone(), &mut report)?;
            continue;
        };

        if !children_all_present(old, old_id, new) {
            delete_stale(old_artifact.path.clone(), &mut report)?;
            continue;
        }

        if !commands_match(old, old_id, new, new_id) {
            delete_stale(old_artifact.path.clone(), &mut report)?;
            continue;
        }

        copy_rescued_data(old, old_id, new, new_id);
        report.rescued.push(old_artifact.path.clone());
    }

    Ok(report)
}

fn delete_stale(path: PathBuf, report: &mut RescueReport) -> Result<(), BuildError> {
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    if let Some(parent) = path.parent() {
        report.empty_parent_dirs.insert(parent.to_path_buf());
    }
    report.deleted_files.push(path);
    Ok(())
}

fn children_all_present(old: &BuildGraph, old_id: NodeId, new: &BuildGraph) -> bool {
    for child in old.children_of(old_id) {
        let Some(node) = old.node(child) else { continue };
        let found = match node {
            Node::Artifact(a) => new.lookup_artifact(a.product, &a.path).is_some(),
            Node::FileDep(f) => f.path.exists(),
            Node::Rule(_) => true,
        };
        if !found {
            return false;
        }
    }
    true
}

fn commands_match(old: &BuildGraph, old_id: NodeId, new: &BuildGraph, new_id: NodeId) -> bool {
    let old_transformer = match old.node(old_id) {
        Some(Node::Artifact(a)) => a.producing_transformer.and_then(|t| old.transformer(t)),
        _ => None,
    };
    let new_transformer = match new.node(new_id) {
        Some(Node::Artifact(a)) => a.producing_transformer.and_then(|t| new.transformer(t)),
        _ => None,
    };
    match (old_transformer, new_transformer) {
        (Some(a), Some(b)) => a.commands_equal(b),
        (None, None) => true,
        _ => false,
    }
}

fn copy_rescued_data(old: &BuildGraph, old_id: NodeId, new: &mut BuildGraph, new_id: NodeId) {
    let Some(Node::Artifact(old_artifact)) = old.node(old_id) else { return };
    let timestamp = old_artifact.timestamp;
    let old_scanner_children_paths: Vec<PathBuf> = old_artifact
        .scanner_children
        .iter()
        .filter_map(|c| old.node(*c).and_then(Node::path).map(Path::to_path_buf))
        .collect();
    let old_transformer_id = old_artifact.producing_transformer;

    if let Some(Node::Artifact(new_artifact)) = new.node_mut(new_id) {
        new_artifact.timestamp = timestamp;
        new_artifact.old_data_possibly_present = false;
    }

    // Re-resolve the old scanner-added children by path in the new graph
    // and mark the equivalent edges as scanner-added there too.
    let new_product = match new.node(new_id) {
        Some(Node::Artifact(a)) => a.product,
        _ => return,
    };
    for path in old_scanner_children_paths {
        if let Some(new_child) = new.lookup_artifact(new_product, &path) {
            let _ = new.safe_connect(new_id, new_child);
            if let Some(Node::Artifact(new_artifact)) = new.node_mut(new_id) {
                new_artifact.scanner_children.insert(new_child);
            }
        }
    }

    let new_tid = match new.node(new_id) {
        Some(Node::Artifact(a)) => a.producing_transformer,
        _ => None,
    };
    if let (Some(old_tid), Some(new_tid)) = (old_transformer_id, new_tid) {
        if let Some(old_t) = old.transformer(old_tid) {
            let prepare = old_t.prepare_properties.clone();
            let command_props = old_t.command_properties.clone();
            if let Some(new_t) = new.transformer_mut(new_tid) {
                new_t.prepare_properties = prepare;
                new_t.command_properties = command_props;
            }
        }
    }
}

/// Read-only introspection of a persisted graph, for tools that just want
/// to look at it without participating in a build.
pub fn load_project(path: &Path) -> Result<BuildGraph, BuildError> {
    BuildGraph::load(path)
}

/// The outcome of [`load`]: either the previous graph, rescued in place
/// against a freshly-resolved one, or a signal that the caller must
/// re-resolve from scratch because no persisted graph exists yet.
pub enum LoadOutcome {
    Loaded { graph: BuildGraph, rescue_report: RescueReport },
    NoPersistedGraph,
}

/// `load(existing, parameters, freshly_resolved)`: the change-detection
/// policy has already been run by the caller (it needs resolver-specific
/// signals this crate doesn't own); this function performs the mechanical
/// part — loading the persisted graph if present and rescuing reusable
/// artifact data into `freshly_resolved`.
pub fn load(persisted_path: &Path, freshly_resolved: &mut BuildGraph) -> Result<LoadOutcome, BuildError> {
    if !persisted_path.exists() {
        return Ok(LoadOutcome::NoPersistedGraph);
    }
    let old = BuildGraph::load(persisted_path)?;
    let rescue_report = rescue(&old, freshly_resolved)?;
    Ok(LoadOutcome::Loaded { graph: freshly_resolved.clone(), rescue_report })
}
