#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

#[macro_use]
pub mod error;

pub mod command;
pub mod executor;
pub mod graph;
pub mod installer;
pub mod loader;
pub mod product;
pub mod util;

#[cfg(feature = "project-util")]
pub mod project_util;

pub use command::{Command, CommonFields, Highlight, JavaScriptCommand, ProcessCommand};
pub use error::{BuildError, Result};
pub use executor::{
    BuildReport, Executor, ExecutorConfig, LogLevel, LogSink, NullProgressObserver, ProgressObserver,
    TracingLogSink,
};
pub use graph::{ArtifactData, ArtifactKind, BuildGraph, BuildState, Node, NodeId, ProductId, Transformer, TransformerId};
pub use installer::{InstallArtifact, InstallReport, Installer, InstallerConfig};
pub use loader::{load, load_project, needs_reresolve, ChangeDetectionInputs, ChangeReason, LoadOutcome, RescueReport, SetupProjectParameters};
pub use product::ProductGraph;

use std::collections::BTreeMap;

/// Fluent construction of an [`Executor`] over a freshly-loaded or
/// freshly-resolved [`BuildGraph`]: configure, then `build()`, defaulting
/// anything the caller didn't set rather than demanding every field up
/// front.
#[derive(Debug, Default)]
#[must_use = "a builder does nothing until build() is called"]
pub struct BuildSystemBuilder {
    graph: Option<BuildGraph>,
    products: ProductGraph,
    config: ExecutorConfig,
}

impl BuildSystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(mut self, graph: BuildGraph) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn products(mut self, products: ProductGraph) -> Self {
        self.products = products;
        self
    }

    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.config.keep_going = keep_going;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.config.dry_run = dry_run;
        self
    }

    pub fn force_timestamp_check(mut self, force: bool) -> Self {
        self.config.force_timestamp_check = force;
        self
    }

    pub fn force_output_check(mut self, force: bool) -> Self {
        self.config.force_output_check = force;
        self
    }

    pub fn job_pool(mut self, name: impl Into<String>, limit: usize) -> Self {
        self.config.job_pools.insert(name.into(), limit);
        self
    }

    pub fn build_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.build_env.insert(key.into(), value.into());
        self
    }

    pub fn changed_file(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.config.changed_files.insert(path.into());
        self
    }

    pub fn file_tag_filter(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.config.file_tag_filter = Some(tags.into_iter().collect());
        self
    }

    pub fn file_set_filter(mut self, files: impl IntoIterator<Item = std::path::PathBuf>) -> Self {
        self.config.file_set_filter = Some(files.into_iter().collect());
        self
    }

    /// Builds the [`Executor`], defaulting the in-process job pool (the
    /// pool every process/script command implicitly belongs to unless it
    /// names its own) to the available parallelism, mirroring the
    /// teacher's `Project::num_jobs()` default.
    pub fn build(mut self) -> Executor {
        let graph = self.graph.take().unwrap_or_default();
        if self.config.job_pools.is_empty() {
            self.config.job_pools = default_jobs_pool(num_cpus::get());
        }
        Executor::new(graph, &self.products, self.config)
    }
}

fn default_jobs_pool(limit: usize) -> BTreeMap<String, usize> {
    let mut pools = BTreeMap::new();
    pools.insert("default".to_string(), limit);
    pools
}
