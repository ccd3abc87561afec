//! The top-level scheduler: a priority queue of build-ready nodes,
//! job-pool limits, progress, cancellation, error aggregation.
//!
//! Dispatch uses a `rayon` thread pool sized to the configured job-pool
//! limits, with a `crossbeam-channel` funneling `finished` events back to
//! a single-threaded control loop: compute the ready queue, traverse it
//! dispatching one job per ready node, re-queue on recoverable failure,
//! persist the graph last.

pub mod job;
pub mod scanner;

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, BTreeMap, BTreeSet},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{unbounded, RecvTimeoutError};

use crate::{
    command::Highlight,
    error::BuildError,
    graph::{BuildGraph, BuildState, Node, NodeId, ProductId, TransformerId},
    product::ProductGraph,
};

use job::ExecutorJob;
use scanner::InputArtifactScanner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Injected log sink. Consumers that don't care get
/// [`TracingLogSink`] for free; consumers that want the literal
/// `(level, message, tag)` record contract implement this directly.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str, tag: &str);
}

pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, message: &str, tag: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "build_graph_core::executor", tag, "{message}"),
            LogLevel::Info => tracing::info!(target: "build_graph_core::executor", tag, "{message}"),
            LogLevel::Warn => tracing::warn!(target: "build_graph_core::executor", tag, "{message}"),
            LogLevel::Error => tracing::error!(target: "build_graph_core::executor", tag, "{message}"),
        }
    }
}

/// Writes directly to stderr with severity-colored labels, for consumers
/// that drive this crate from a plain terminal rather than through
/// `tracing`'s subscriber machinery.
pub struct ColorizingLogSink;

impl LogSink for ColorizingLogSink {
    fn log(&self, level: LogLevel, message: &str, tag: &str) {
        use yansi::Paint;
        let label = match level {
            LogLevel::Debug => Paint::new("debug").dimmed().to_string(),
            LogLevel::Info => Paint::new("info").to_string(),
            LogLevel::Warn => Paint::yellow("warn").to_string(),
            LogLevel::Error => Paint::red("error").bold().to_string(),
        };
        eprintln!("[{label}] {tag}: {message}");
    }
}

/// Progress observer. `canceled()` lets the driver observe a
/// user cancellation request without polling more than every two seconds.
pub trait ProgressObserver: Send + Sync {
    fn initialize(&self, description: &str, total_effort: u64);
    fn increment_progress_value(&self);
    fn set_finished(&self);
    fn canceled(&self) -> bool {
        false
    }
}

pub struct NullProgressObserver;

impl ProgressObserver for NullProgressObserver {
    fn initialize(&self, _description: &str, _total_effort: u64) {}
    fn increment_progress_value(&self) {}
    fn set_finished(&self) {}
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    pub job_pools: BTreeMap<String, usize>,
    pub keep_going: bool,
    pub dry_run: bool,
    pub force_timestamp_check: bool,
    pub force_output_check: bool,
    /// If non-empty, only these paths are treated as changed; no
    /// filesystem scan for source timestamps otherwise.
    pub changed_files: BTreeSet<PathBuf>,
    /// "Build only artifacts whose outputs carry one of these tags."
    pub file_tag_filter: Option<BTreeSet<String>>,
    /// "Build only these files" — restricted to the transitive tag
    /// closure needed to reach them.
    pub file_set_filter: Option<BTreeSet<PathBuf>>,
    pub build_env: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct BuildReport {
    pub errors: Vec<BuildError>,
    pub canceled: bool,
    pub commands_run: usize,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.canceled
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct ReadyItem {
    priority: i64,
    node: NodeId,
}

impl Ord for ReadyItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for ReadyItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

enum JobOutcome {
    Success { node: NodeId, transformer_id: TransformerId, transformer: crate::graph::Transformer },
    Failure { node: NodeId, error: BuildError },
}

pub struct Executor {
    graph: BuildGraph,
    priorities: BTreeMap<ProductId, i64>,
    config: ExecutorConfig,
    scanner: InputArtifactScanner,
    job_pool_in_use: BTreeMap<String, usize>,
    cancel_requested: Arc<AtomicBool>,
    running: BTreeMap<NodeId, Arc<ExecutorJob>>,
    acquired_pools: BTreeMap<NodeId, Vec<String>>,
}

impl Executor {
    pub fn new(graph: BuildGraph, products: &ProductGraph, config: ExecutorConfig) -> Self {
        Self {
            graph,
            priorities: products.assign_priorities(),
            config,
            scanner: InputArtifactScanner::new(),
            job_pool_in_use: BTreeMap::new(),
            cancel_requested: Arc::new(AtomicBool::new(false)),
            running: BTreeMap::new(),
            acquired_pools: BTreeMap::new(),
        }
    }

    pub fn scanner_mut(&mut self) -> &mut InputArtifactScanner {
        &mut self.scanner
    }

    pub fn graph(&self) -> &BuildGraph {
        &self.graph
    }

    pub fn into_graph(self) -> BuildGraph {
        self.graph
    }

    /// Signals cancellation: propagated to every in-flight job; no new jobs
    /// are scheduled afterward.
    pub fn cancel(&self, reason: &str) {
        self.cancel_requested.store(true, AtomicOrdering::SeqCst);
        for job in self.running.values() {
            job.cancel(reason.to_string());
        }
    }

    fn priority_of(&self, node: NodeId) -> i64 {
        let product = match self.graph.node(node) {
            Some(Node::Artifact(a)) => a.product,
            Some(Node::Rule(r)) => r.product,
            _ => return 0,
        };
        self.priorities.get(&product).copied().unwrap_or(0)
    }

    /// Whether `node`'s declared children are all Built.
    fn is_ready(&self, node: NodeId) -> bool {
        self.graph.children_of(node).iter().all(|c| self.graph.build_state(*c) == BuildState::Built)
    }

    /// Runs the build to completion, returning an aggregated report.
    pub fn build(&mut self, progress: &dyn ProgressObserver, log: &dyn LogSink) -> BuildReport {
        let mut report = BuildReport::default();
        let mut queue: BinaryHeap<ReadyItem> = BinaryHeap::new();
        let reachable = self.reachable_nodes();

        for &node in &reachable {
            self.graph.set_build_state(node, BuildState::Buildable);
        }
        for &node in &reachable {
            if self.is_ready(node) {
                queue.push(ReadyItem { priority: self.priority_of(node), node });
            }
        }

        progress.initialize("build", reachable.len() as u64);

        let (tx, rx) = unbounded::<JobOutcome>();
        let mut in_flight = 0usize;
        let mut pool_blocked: Vec<ReadyItem> = Vec::new();
        let mut user_canceled = false;

        loop {
            if !user_canceled && progress.canceled() {
                user_canceled = true;
                self.cancel("user requested cancellation");
            }
            let stopping = self.cancel_requested.load(AtomicOrdering::SeqCst);

            if !stopping {
                // Dispatch everything we can before waiting.
                loop {
                    let Some(item) = queue.pop() else { break };
                    match self.pop_and_handle(item.node, &tx, log) {
                        HandleOutcome::CompletedSynchronously => {
                            self.requeue_parents(item.node, &mut queue, &reachable);
                            progress.increment_progress_value();
                        }
                        HandleOutcome::Dispatched => {
                            in_flight += 1;
                        }
                        HandleOutcome::BlockedOnScanner => {
                            // Re-checked automatically once the newly
                            // scanned dependency completes, via
                            // `requeue_parents` on its own completion.
                        }
                        HandleOutcome::BlockedOnPool => {
                            pool_blocked.push(item);
                        }
                        HandleOutcome::Failed(err) => {
                            report.errors.push(err);
                            if !self.config.keep_going {
                                self.cancel("sibling command failed");
                                break;
                            }
                        }
                    }
                    if self.cancel_requested.load(AtomicOrdering::SeqCst) {
                        break;
                    }
                }
            }

            if queue.is_empty() && in_flight == 0 {
                break;
            }
            if in_flight == 0 {
                break;
            }

            match rx.recv_timeout(Duration::from_secs(2)) {
                Ok(JobOutcome::Success { node, transformer_id, transformer }) => {
                    in_flight -= 1;
                    self.running.remove(&node);
                    self.release_node_pools(node);
                    *self.graph.transformer_mut(transformer_id).unwrap() = transformer;
                    self.mark_outputs_built(transformer_id);
                    self.graph.set_build_state(node, BuildState::Built);
                    report.commands_run += 1;
                    self.requeue_parents(node, &mut queue, &reachable);
                    queue.extend(pool_blocked.drain(..));
                    progress.increment_progress_value();
                }
                Ok(JobOutcome::Failure { node, error }) => {
                    in_flight -= 1;
                    self.running.remove(&node);
                    self.release_node_pools(node);
                    queue.extend(pool_blocked.drain(..));
                    log.log(LogLevel::Error, &error.to_string(), "executor");
                    report.errors.push(error);
                    if !self.config.keep_going {
                        self.cancel("command failed");
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        report.canceled = user_canceled;
        progress.set_finished();
        report
    }

    fn reachable_nodes(&self) -> Vec<NodeId> {
        let allowed_tags = self.transitive_tag_closure();
        self.graph
            .node_ids()
            .filter(|id| match self.graph.node(*id) {
                Some(Node::Artifact(a)) => match &allowed_tags {
                    Some(tags) => a.file_tags.iter().any(|t| tags.contains(t)),
                    None => true,
                },
                _ => true,
            })
            .collect()
    }

    /// Computes the effective tag filter: the configured `file_tag_filter`
    /// directly, or (for `file_set_filter`) the transitive closure of tags
    /// needed to reach the requested files through the rule graph (spec
    /// §4.7 "File-tag and file-set filtering").
    fn transitive_tag_closure(&self) -> Option<BTreeSet<String>> {
        if let Some(tags) = &self.config.file_tag_filter {
            return Some(tags.clone());
        }
        let files = self.config.file_set_filter.as_ref()?;
        let mut tags = BTreeSet::new();
        for id in self.graph.node_ids() {
            if let Some(Node::Artifact(a)) = self.graph.node(id) {
                if files.contains(&a.path) {
                    tags.extend(a.file_tags.iter().cloned());
                }
            }
        }
        Some(tags)
    }

    fn requeue_parents(&self, node: NodeId, queue: &mut BinaryHeap<ReadyItem>, reachable: &[NodeId]) {
        for parent in self.graph.parents_of(node) {
            if reachable.contains(&parent) && self.is_ready(parent) && self.graph.build_state(parent) != BuildState::Built {
                queue.push(ReadyItem { priority: self.priority_of(parent), node: parent });
            }
        }
    }

    fn acquire_pool_slot(&mut self, pool: &str) -> bool {
        let limit = match self.config.job_pools.get(pool) {
            Some(limit) => *limit,
            None => return true,
        };
        let used = self.job_pool_in_use.entry(pool.to_string()).or_insert(0);
        if *used >= limit {
            false
        } else {
            *used += 1;
            true
        }
    }

    fn release_pool_slot(&mut self, pool: &str) {
        if let Some(used) = self.job_pool_in_use.get_mut(pool) {
            *used = used.saturating_sub(1);
        }
    }

    fn release_node_pools(&mut self, node: NodeId) {
        if let Some(pools) = self.acquired_pools.remove(&node) {
            for pool in pools {
                self.release_pool_slot(&pool);
            }
        }
    }

    fn pop_and_handle(
        &mut self,
        node: NodeId,
        tx: &crossbeam_channel::Sender<JobOutcome>,
        log: &dyn LogSink,
    ) -> HandleOutcome {
        match self.graph.node(node).cloned() {
            Some(Node::Rule(_)) => match self.graph.apply_rule(node) {
                Ok(_changed) => {
                    self.graph.set_build_state(node, BuildState::Built);
                    HandleOutcome::CompletedSynchronously
                }
                Err(err) => HandleOutcome::Failed(err),
            },
            Some(Node::FileDep(_)) => {
                self.graph.set_build_state(node, BuildState::Built);
                HandleOutcome::CompletedSynchronously
            }
            Some(Node::Artifact(artifact)) => {
                if !artifact.is_generated() {
                    if artifact.is_source() && !artifact.path.exists() {
                        return HandleOutcome::Failed(BuildError::SourceFileDisappeared(artifact.path.clone()));
                    }
                    self.graph.set_build_state(node, BuildState::Built);
                    return HandleOutcome::CompletedSynchronously;
                }

                let Some(transformer_id) = artifact.producing_transformer else {
                    self.graph.set_build_state(node, BuildState::Built);
                    return HandleOutcome::CompletedSynchronously;
                };

                match self.must_execute(transformer_id) {
                    Ok(false) => {
                        self.graph.set_build_state(node, BuildState::Built);
                        log.log(LogLevel::Debug, &format!("{:?} up to date", artifact.path), "executor");
                        return HandleOutcome::CompletedSynchronously;
                    }
                    Ok(true) => {}
                    Err(err) => return HandleOutcome::Failed(err),
                }

                match self.run_scanner(node) {
                    Ok(true) => return HandleOutcome::BlockedOnScanner,
                    Ok(false) => {}
                    Err(err) => return HandleOutcome::Failed(err),
                }

                self.dispatch(node, transformer_id, tx, log)
            }
            None => HandleOutcome::CompletedSynchronously,
        }
    }

    fn run_scanner(&mut self, artifact: NodeId) -> Result<bool, BuildError> {
        self.scanner.scan_artifact(&mut self.graph, artifact, &[], "default")
    }

    fn dispatch(
        &mut self,
        node: NodeId,
        transformer_id: TransformerId,
        tx: &crossbeam_channel::Sender<JobOutcome>,
        log: &dyn LogSink,
    ) -> HandleOutcome {
        let transformer = self.graph.transformer(transformer_id).unwrap().clone();
        for command in &transformer.commands {
            let common = command.common();
            if !common.silent {
                let event = CommandDescriptionEvent {
                    highlight: common.highlight,
                    message: command.description().to_string(),
                };
                log.log(LogLevel::Info, &event.message, "command");
            }
        }
        let mut acquired = Vec::new();
        for pool in &transformer.job_pools {
            if !self.acquire_pool_slot(pool) {
                for already in &acquired {
                    self.release_pool_slot(already);
                }
                return HandleOutcome::BlockedOnPool;
            }
            acquired.push(pool.clone());
        }
        self.acquired_pools.insert(node, acquired);

        self.graph.set_build_state(node, BuildState::Building);

        let job = Arc::new({
            let mut job = ExecutorJob::new();
            job.set_dry_run(self.config.dry_run);
            job
        });
        self.running.insert(node, job.clone());

        let build_env = self.config.build_env.clone();
        let tx = tx.clone();
        let mut transformer_clone = transformer;

        rayon::spawn(move || {
            let result = job.run(&mut transformer_clone, &build_env);
            let outcome = match result {
                Ok(()) => JobOutcome::Success { node, transformer_id, transformer: transformer_clone },
                Err(err) => JobOutcome::Failure { node, error: err },
            };
            let _ = tx.send(outcome);
        });

        HandleOutcome::Dispatched
    }

    fn mark_outputs_built(&mut self, transformer_id: TransformerId) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let outputs = self.graph.transformer(transformer_id).unwrap().outputs.clone();
        for output in outputs {
            let on_disk = match self.graph.node(output) {
                Some(Node::Artifact(a)) if !self.config.dry_run => {
                    std::fs::metadata(&a.path).ok().and_then(|m| m.modified().ok())
                }
                _ => None,
            };
            let ts = on_disk
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(now);
            self.graph.set_timestamp(output, Some(ts));

            if self.config.force_output_check {
                if let Some(Node::Artifact(a)) = self.graph.node(output) {
                    if !a.path.exists() && !self.config.dry_run {
                        // Recorded as a DependencyOrderViolation by the
                        // caller inspecting the report; we just skip
                        // stamping a timestamp that can't be verified.
                        tracing::warn!(target: "build_graph_core::executor", "declared output {:?} missing after run", a.path);
                    }
                }
            }
        }
    }

    /// The up-to-date formula:
    /// `mustExecute = alwaysRun OR (forced check & any output missing) OR
    /// (any output older than any child) OR (no trackable output)`.
    fn must_execute(&mut self, transformer_id: TransformerId) -> Result<bool, BuildError> {
        let transformer = self.graph.transformer(transformer_id).unwrap().clone();
        if transformer.always_run {
            return Ok(true);
        }

        let any_always_updated = transformer.outputs.iter().any(|&output| {
            matches!(self.graph.node(output), Some(Node::Artifact(a)) if a.always_updated)
        });
        if !any_always_updated {
            return Ok(true);
        }

        for &output in &transformer.outputs {
            if self.config.force_timestamp_check {
                self.refresh_timestamp_from_disk(output)?;
                let exists = matches!(self.graph.node(output), Some(Node::Artifact(a)) if a.path.exists());
                if !exists {
                    return Ok(true);
                }
            }

            let Some(out_ts) = self.graph.timestamp_of(output) else {
                return Ok(true);
            };

            for child in self.graph.children_of(output) {
                if let Some(child_ts) = self.graph.timestamp_of(child) {
                    if child_ts > out_ts {
                        return Ok(true);
                    }
                }
            }
        }

        Ok(false)
    }

    fn refresh_timestamp_from_disk(&mut self, node: NodeId) -> Result<(), BuildError> {
        let path = match self.graph.node(node) {
            Some(Node::Artifact(a)) => a.path.clone(),
            _ => return Ok(()),
        };
        let ts = std::fs::metadata(&path)
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64);
        self.graph.set_timestamp(node, ts);
        Ok(())
    }
}

#[allow(clippy::large_enum_variant)]
enum HandleOutcome {
    CompletedSynchronously,
    Dispatched,
    /// Not ready yet: the input-artifact scanner added a dependency that
    /// isn't built. No explicit retry needed — `requeue_parents` re-checks
    /// this node once that dependency completes.
    BlockedOnScanner,
    /// Ready to run, but every job pool it declares is at capacity. Must
    /// be retried once a slot frees.
    BlockedOnPool,
    Failed(BuildError),
}

/// A command-description event, emitted before a command runs unless
/// `silent`.
#[derive(Debug, Clone)]
pub struct CommandDescriptionEvent {
    pub highlight: Highlight,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{Command, CommonFields, ProcessCommand},
        graph::{ArtifactData, ArtifactKind, Transformer},
    };
    use std::path::PathBuf;

    fn source(graph: &mut BuildGraph, product: ProductId, path: &str, ts: u64) -> NodeId {
        let id = graph.add_artifact(ArtifactData::new(PathBuf::from(path), ArtifactKind::Source, product));
        graph.set_timestamp(id, Some(ts));
        id
    }

    fn generated(graph: &mut BuildGraph, product: ProductId, path: &str, ts: u64, always_updated: bool) -> NodeId {
        let mut data = ArtifactData::new(PathBuf::from(path), ArtifactKind::Generated, product);
        data.always_updated = always_updated;
        let id = graph.add_artifact(data);
        graph.set_timestamp(id, Some(ts));
        id
    }

    fn noop_transformer() -> Transformer {
        let cmd = ProcessCommand {
            common: CommonFields { silent: true, ..Default::default() },
            program: "/bin/true".into(),
            ..Default::default()
        };
        Transformer::new("noop", vec![Command::Process(cmd)])
    }

    #[test]
    fn up_to_date_output_skips_execution() {
        let mut graph = BuildGraph::new();
        let p = ProductId(0);
        graph.add_product(p);
        let input = source(&mut graph, p, "in.txt", 100);
        let output = generated(&mut graph, p, "out.txt", 200, true);
        graph.connect(output, input).unwrap();

        let mut transformer = noop_transformer();
        transformer.outputs.push(output);
        transformer.inputs.push(input);
        let tid = graph.add_transformer(transformer);
        if let Some(Node::Artifact(a)) = graph.node_mut(output) {
            a.producing_transformer = Some(tid);
        }

        let mut products = ProductGraph::new();
        products.add_product(p);
        let mut executor = Executor::new(graph, &products, ExecutorConfig::default());
        assert!(!executor.must_execute(tid).unwrap());
    }

    #[test]
    fn stale_output_requires_execution() {
        let mut graph = BuildGraph::new();
        let p = ProductId(0);
        graph.add_product(p);
        let input = source(&mut graph, p, "in.txt", 300);
        let output = generated(&mut graph, p, "out.txt", 200, true);
        graph.connect(output, input).unwrap();

        let mut transformer = noop_transformer();
        transformer.outputs.push(output);
        let tid = graph.add_transformer(transformer);

        let mut products = ProductGraph::new();
        products.add_product(p);
        let mut executor = Executor::new(graph, &products, ExecutorConfig::default());
        assert!(executor.must_execute(tid).unwrap());
    }

    #[test]
    fn always_run_forces_execution() {
        let mut graph = BuildGraph::new();
        let p = ProductId(0);
        graph.add_product(p);
        let output = generated(&mut graph, p, "out.txt", 999, true);

        let mut transformer = noop_transformer();
        transformer.always_run = true;
        transformer.outputs.push(output);
        let tid = graph.add_transformer(transformer);

        let mut products = ProductGraph::new();
        products.add_product(p);
        let mut executor = Executor::new(graph, &products, ExecutorConfig::default());
        assert!(executor.must_execute(tid).unwrap());
    }

    #[test]
    fn no_always_updated_output_forces_execution() {
        let mut graph = BuildGraph::new();
        let p = ProductId(0);
        graph.add_product(p);
        let output = generated(&mut graph, p, "out.txt", 999, false);

        let mut transformer = noop_transformer();
        transformer.outputs.push(output);
        let tid = graph.add_transformer(transformer);

        let mut products = ProductGraph::new();
        products.add_product(p);
        let mut executor = Executor::new(graph, &products, ExecutorConfig::default());
        assert!(executor.must_execute(tid).unwrap());
    }
}
