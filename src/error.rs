//! Error kinds produced by the build graph core.

use std::{fmt, path::PathBuf};

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// A single shell-quoted command invocation, attached to errors raised while
/// running a command so the user can reproduce the failure by hand.
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    pub program: Option<String>,
    pub arguments: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl fmt::Display for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(program) = &self.program {
            write!(f, "{program}")?;
            for arg in &self.arguments {
                write!(f, " {arg:?}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// `connect` would close a cycle in the build graph.
    #[error("cycle introduced connecting {parent:?} -> {child:?}")]
    CycleIntroduced { parent: PathBuf, child: PathBuf },

    /// A persisted build graph could not be loaded (version mismatch, or
    /// otherwise unreadable in a way the loader can't recover from).
    #[error("incompatible build graph at {path}: {reason}")]
    IncompatibleBuildGraph { path: PathBuf, reason: String },

    /// A Source artifact's path no longer exists on disk.
    #[error("source file disappeared: {0}")]
    SourceFileDisappeared(PathBuf),

    /// A process exit code exceeded `maxExitCode`, or a script command threw.
    #[error("command failed: {context}: {message}")]
    CommandFailed { context: CommandContext, message: String },

    /// The child process could not be started at all.
    #[error("failed to spawn command: {context}: {message}")]
    CommandSpawnFailed { context: CommandContext, message: String },

    /// The command was terminated because of a user cancel or a sibling
    /// failure in non-keep-going mode.
    #[error("command canceled: {context}: {reason}")]
    CommandCanceled { context: CommandContext, reason: String },

    /// A transformer declared an output artifact that was not actually
    /// produced, detected under `forceOutputCheck`.
    #[error("transformer for {0:?} did not produce declared output {1:?}")]
    DependencyOrderViolation(PathBuf, PathBuf),

    /// Two distinct source artifacts map to one install target path.
    #[error("install conflict: {source_a:?} and {source_b:?} both target {target:?}")]
    InstallConflict { source_a: PathBuf, source_b: PathBuf, target: PathBuf },

    /// The current `SetupProjectParameters` are incompatible with the
    /// persisted graph's configuration.
    #[error("configuration changed: {0}")]
    ConfigurationChanged(String),

    /// A command (process or script) timed out.
    #[error("command timed out after {0:?}: {1}")]
    CommandTimedOut(std::time::Duration, CommandContext),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Message(String),
}

impl BuildError {
    pub fn msg(msg: impl fmt::Display) -> Self {
        BuildError::Message(msg.to_string())
    }
}
