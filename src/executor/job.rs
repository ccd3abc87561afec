//! Executor job: runs all commands belonging to one transformer, in order,
//! with cancellation.
//!
//! Iterates the command list, stopping at the first failure and
//! accumulating results; on full success it transitions the transformer to
//! "just built" in one step rather than mutating it incrementally.

use std::{
    collections::BTreeMap,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    command::{process::CancelToken, Command, ProcessExecutor, ScriptExecutor},
    error::BuildError,
    graph::Transformer,
};

/// A sticky cancel reason: once set, any later successful `finished` is
/// converted to a cancellation.
#[derive(Default)]
struct StickyCancel(Mutex<Option<String>>);

impl StickyCancel {
    fn set(&self, reason: impl Into<String>) {
        let mut guard = self.0.lock().unwrap();
        if guard.is_none() {
            *guard = Some(reason.into());
        }
    }

    fn get(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct ExecutorJob {
    process_executor: ProcessExecutor,
    script_executor: ScriptExecutor,
    cancel_token: CancelToken,
    sticky_cancel: StickyCancel,
}

impl ExecutorJob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.process_executor.set_dry_run(dry_run);
        self.script_executor.set_dry_run(dry_run);
    }

    /// Requests cancellation. Forwarded to whichever sub-executor is
    /// currently running; any later `finished(Ok)` is converted to a
    /// [`BuildError::CommandCanceled`] using this reason.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.sticky_cancel.set(reason);
        self.cancel_token.cancel();
    }

    /// Runs every command of `transformer` in declaration order, in a
    /// dedicated build environment. Stops at the first failing command. On
    /// success, stamps `last_execution_time` and clears the transformer's
    /// per-run accumulators.
    pub fn run(&self, transformer: &mut Transformer, build_env: &BTreeMap<String, String>) -> Result<(), BuildError> {
        for command in &transformer.commands {
            if let Some(reason) = self.sticky_cancel.get() {
                return Err(BuildError::CommandCanceled {
                    context: Default::default(),
                    reason,
                });
            }

            match command {
                Command::Process(cmd) => {
                    let result =
                        self.process_executor.start(cmd, build_env, &self.cancel_token, &self.script_executor)?;
                    if !result.success {
                        return Err(BuildError::CommandFailed {
                            context: crate::error::CommandContext {
                                program: Some(result.executable.display().to_string()),
                                arguments: result.arguments,
                                working_dir: Some(result.working_dir),
                            },
                            message: format!("exit code {:?} exceeds max {}", result.exit_code, cmd.max_exit_code),
                        });
                    }
                }
                Command::JavaScript(cmd) => {
                    let inputs: Vec<String> = Vec::new();
                    let outputs: Vec<String> = Vec::new();
                    let outcome =
                        self.script_executor.start(cmd, &transformer.command_properties_as_map(), &inputs, &outputs)?;
                    match outcome {
                        crate::command::script::ScriptStartOutcome::Completed(result) if result.success => {}
                        crate::command::script::ScriptStartOutcome::Completed(_) => {
                            return Err(BuildError::CommandFailed {
                                context: Default::default(),
                                message: "script command reported failure".into(),
                            });
                        }
                        crate::command::script::ScriptStartOutcome::EngineBusy => {
                            // The driver is expected to re-post this whole
                            // job for the next control-loop turn rather
                            // than drop it.
                            return Err(BuildError::msg("script engine busy, re-queue job"));
                        }
                    }
                }
            }

            if let Some(reason) = self.sticky_cancel.get() {
                return Err(BuildError::CommandCanceled {
                    context: Default::default(),
                    reason,
                });
            }
        }

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
        transformer.last_execution_time = Some(now);
        transformer.clear_run_accumulators();
        Ok(())
    }
}
