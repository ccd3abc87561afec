//! Rule commands: the declarative description of one unit of executable
//! work. Two concrete kinds behind a common contract; structural equality
//! over both is what the loader's rescue logic uses to decide whether an
//! old transformer can be reused across a reresolve.

pub mod process;
pub mod script;

use std::{
    collections::BTreeMap,
    path::PathBuf,
    time::Duration,
};

use serde::{Deserialize, Serialize};

pub use process::ProcessExecutor;
pub use script::ScriptExecutor;

/// Classification tag used by observers to render a command-description
/// event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Highlight {
    Compiler,
    Linker,
    Codegen,
    Filegen,
    Default,
}

/// Fields common to both command kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonFields {
    pub description: String,
    pub extended_description: String,
    pub highlight: Highlight,
    pub silent: bool,
    pub ignore_dry_run: bool,
    pub job_pool: Option<String>,
    /// Seconds; -1 means no timeout.
    pub timeout: i64,
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl CommonFields {
    pub fn timeout_duration(&self) -> Option<Duration> {
        if self.timeout < 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout as u64))
        }
    }
}

impl Default for CommonFields {
    fn default() -> Self {
        Self {
            description: String::new(),
            extended_description: String::new(),
            highlight: Highlight::Default,
            silent: false,
            ignore_dry_run: false,
            job_pool: None,
            timeout: -1,
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessCommand {
    pub common: CommonFields,
    pub program: String,
    pub arguments: Vec<String>,
    pub working_dir: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub max_exit_code: i32,
    pub stdout_filter_fn: Option<String>,
    pub stderr_filter_fn: Option<String>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub response_file_threshold: Option<usize>,
    pub response_file_arg_index: usize,
    pub response_file_prefix: String,
    pub response_file_separator: String,
    pub relevant_env_vars: Vec<String>,
}

impl Default for ProcessCommand {
    fn default() -> Self {
        Self {
            common: CommonFields::default(),
            program: String::new(),
            arguments: Vec::new(),
            working_dir: PathBuf::new(),
            environment: BTreeMap::new(),
            max_exit_code: 0,
            stdout_filter_fn: None,
            stderr_filter_fn: None,
            stdout_path: None,
            stderr_path: None,
            response_file_threshold: None,
            response_file_arg_index: 0,
            response_file_prefix: "@".to_string(),
            response_file_separator: "\n".to_string(),
            relevant_env_vars: Vec::new(),
        }
    }
}

impl ProcessCommand {
    /// Joined command-line length used to decide response-file fallback.
    pub fn joined_length(&self) -> usize {
        self.arguments.iter().map(|a| a.len() + 1).sum::<usize>() + self.program.len()
    }

    pub fn needs_response_file(&self) -> bool {
        match self.response_file_threshold {
            Some(threshold) => self.joined_length() > threshold,
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JavaScriptCommand {
    pub common: CommonFields,
    pub source_code: String,
    pub import_scope_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Process(ProcessCommand),
    JavaScript(JavaScriptCommand),
}

impl Command {
    pub fn common(&self) -> &CommonFields {
        match self {
            Command::Process(p) => &p.common,
            Command::JavaScript(j) => &j.common,
        }
    }

    pub fn description(&self) -> &str {
        &self.common().description
    }
}
