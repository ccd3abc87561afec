//! The runtime result of applying one rule to one input-set.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::command::Command;

use super::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransformerId(pub u32);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transformer {
    pub rule_name: String,
    pub commands: Vec<Command>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
    pub always_run: bool,
    /// Properties read while preparing the transformer (used for change
    /// detection alongside the commands' own `properties` fields).
    pub prepare_properties: BTreeMap<String, serde_json::Value>,
    /// Properties read while running the transformer's commands, reset
    /// after each successful run.
    pub command_properties: BTreeMap<String, serde_json::Value>,
    pub imported_files_used: BTreeSet<String>,
    pub job_pools: BTreeSet<String>,
    /// Milliseconds since the epoch; `None` until the transformer has run
    /// at least once.
    pub last_execution_time: Option<u64>,
}

impl Transformer {
    pub fn new(rule_name: impl Into<String>, commands: Vec<Command>) -> Self {
        let job_pools = commands
            .iter()
            .filter_map(|c| c.common().job_pool.clone())
            .collect();
        Self {
            rule_name: rule_name.into(),
            commands,
            inputs: Vec::new(),
            outputs: Vec::new(),
            always_run: false,
            prepare_properties: BTreeMap::new(),
            command_properties: BTreeMap::new(),
            imported_files_used: BTreeSet::new(),
            job_pools,
            last_execution_time: None,
        }
    }

    /// Structural equality over both command kinds and their recorded
    /// properties — the rescue oracle.
    pub fn commands_equal(&self, other: &Transformer) -> bool {
        self.commands == other.commands
    }

    pub fn clear_run_accumulators(&mut self) {
        self.command_properties.clear();
        self.imported_files_used.clear();
    }

    /// `command_properties` as a `serde_json::Map`, for binding into the
    /// script executor's scope.
    pub fn command_properties_as_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.command_properties.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}
