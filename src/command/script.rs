//! The script command executor.
//!
//! `sourceCode` runs on a sandboxed, single-threaded interpreter with access
//! only to the owning transformer's property map and a small set of
//! input/output query helpers — no filesystem or network access otherwise.
//! Uses `rhai`, which is safe-by-default (a bare `Engine` exposes no I/O
//! until the host registers it), in place of a general JavaScript engine.

use std::sync::atomic::{AtomicBool, Ordering};

use rhai::{Dynamic, Engine, Scope};
use serde_json::{Map, Value};

use crate::error::BuildError;

use super::JavaScriptCommand;

/// Outcome of attempting to start a script command while the shared engine
/// may already be busy running another command's script.
pub enum ScriptStartOutcome {
    Completed(ScriptResult),
    /// The engine was busy; the caller should re-post this command for the
    /// next turn of the executor's event loop rather than drop it.
    EngineBusy,
}

#[derive(Debug, Clone)]
pub struct ScriptResult {
    pub value: Value,
    pub success: bool,
}

pub struct ScriptExecutor {
    engine: Engine,
    busy: AtomicBool,
    dry_run: bool,
}

impl Default for ScriptExecutor {
    fn default() -> Self {
        let mut engine = Engine::new();
        // Sandboxed: no filesystem, network, or process spawning registered.
        engine.set_max_operations(10_000_000);
        engine.set_max_expr_depth(64, 64);
        Self { engine, busy: AtomicBool::new(false), dry_run: false }
    }
}

impl ScriptExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Runs `cmd.source_code` with `properties` and the input/output path
    /// lists bound into scope. Returns [`ScriptStartOutcome::EngineBusy`]
    /// instead of running if another script is currently executing on this
    /// engine (spec: "Suspension of rule-execution... is detected").
    pub fn start(
        &self,
        cmd: &JavaScriptCommand,
        properties: &Map<String, Value>,
        inputs: &[String],
        outputs: &[String],
    ) -> Result<ScriptStartOutcome, BuildError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Ok(ScriptStartOutcome::EngineBusy);
        }
        let _guard = BusyGuard(&self.busy);

        if !cmd.common.silent {
            tracing::info!(target: "build_graph_core::command", "{}", cmd.common.description);
        }

        if self.dry_run && !cmd.common.ignore_dry_run {
            return Ok(ScriptStartOutcome::Completed(ScriptResult { value: Value::Null, success: true }));
        }

        let mut scope = Scope::new();
        scope.push("properties", json_to_dynamic(&Value::Object(properties.clone())));
        scope.push("inputs", inputs.to_vec());
        scope.push("outputs", outputs.to_vec());

        let result = self.engine.eval_with_scope::<Dynamic>(&mut scope, &cmd.source_code);

        match result {
            Ok(value) => {
                Ok(ScriptStartOutcome::Completed(ScriptResult { value: dynamic_to_json(&value), success: true }))
            }
            Err(err) => Err(BuildError::CommandFailed {
                context: crate::error::CommandContext {
                    program: Some(format!("script:{}", cmd.import_scope_name)),
                    arguments: Vec::new(),
                    working_dir: None,
                },
                message: err.to_string(),
            }),
        }
    }

    /// Runs a stdout/stderr filter function: a pure single-argument
    /// `output -> string` script, bound to the captured text via the
    /// `output` scope variable. Re-entrant by construction — each
    /// [`crate::command::process::ProcessExecutor::start`] call that needs
    /// one owns its own `ScriptExecutor` instance (one per
    /// [`crate::executor::job::ExecutorJob`]), so concurrently-completing
    /// commands never share an engine.
    pub fn run_filter(&self, source: &str, captured: &str) -> Result<String, BuildError> {
        let mut scope = Scope::new();
        scope.push("output", captured.to_string());

        let result = self.engine.eval_with_scope::<Dynamic>(&mut scope, source);
        match result {
            Ok(value) => Ok(value.clone().into_string().unwrap_or_else(|_| value.to_string())),
            Err(err) => Err(BuildError::CommandFailed {
                context: crate::error::CommandContext::default(),
                message: format!("output filter failed: {err}"),
            }),
        }
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => n.as_f64().map(Dynamic::from).unwrap_or(Dynamic::UNIT),
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(arr) => Dynamic::from(arr.iter().map(json_to_dynamic).collect::<Vec<_>>()),
        Value::Object(map) => {
            let mut rhai_map = rhai::Map::new();
            for (k, v) in map {
                rhai_map.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from(rhai_map)
        }
    }
}

fn dynamic_to_json(value: &Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if let Some(b) = value.clone().try_cast::<bool>() {
        Value::Bool(b)
    } else if let Some(s) = value.clone().into_string().ok() {
        Value::String(s)
    } else if let Some(f) = value.clone().try_cast::<f64>() {
        serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    } else if let Some(i) = value.clone().try_cast::<i64>() {
        Value::Number(i.into())
    } else {
        Value::String(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommonFields;

    fn sample(source: &str) -> JavaScriptCommand {
        JavaScriptCommand {
            common: CommonFields { silent: true, ..Default::default() },
            source_code: source.to_string(),
            import_scope_name: "test".to_string(),
        }
    }

    #[test]
    fn runs_simple_expression() {
        let executor = ScriptExecutor::new();
        let outcome = executor.start(&sample("1 + 2"), &Map::new(), &[], &[]).unwrap();
        match outcome {
            ScriptStartOutcome::Completed(result) => {
                assert!(result.success);
                assert_eq!(result.value, Value::from(3.0));
            }
            ScriptStartOutcome::EngineBusy => panic!("engine should not be busy"),
        }
    }

    #[test]
    fn reads_bound_properties() {
        let executor = ScriptExecutor::new();
        let mut props = Map::new();
        props.insert("name".to_string(), Value::String("widget".to_string()));
        let outcome =
            executor.start(&sample("properties[\"name\"]"), &props, &[], &[]).unwrap();
        match outcome {
            ScriptStartOutcome::Completed(result) => {
                assert_eq!(result.value, Value::String("widget".to_string()));
            }
            ScriptStartOutcome::EngineBusy => panic!("engine should not be busy"),
        }
    }

    #[test]
    fn dry_run_skips_execution() {
        let mut executor = ScriptExecutor::new();
        executor.set_dry_run(true);
        let outcome = executor.start(&sample("throw \"boom\""), &Map::new(), &[], &[]).unwrap();
        assert!(matches!(outcome, ScriptStartOutcome::Completed(_)));
    }

    #[test]
    fn filter_rewrites_captured_output() {
        let executor = ScriptExecutor::new();
        let filtered = executor.run_filter("output.to_upper()", "warning: unused variable").unwrap();
        assert_eq!(filtered, "WARNING: UNUSED VARIABLE");
    }

    #[test]
    fn filter_error_is_reported() {
        let executor = ScriptExecutor::new();
        let err = executor.run_filter("throw \"bad filter\"", "text").unwrap_err();
        assert!(matches!(err, BuildError::CommandFailed { .. }));
    }
}
