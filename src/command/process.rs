//! The process command executor.
//!
//! Wraps `std::process::Command` with piped stdio and a configured
//! `current_dir`, driven entirely off the generic [`super::ProcessCommand`]
//! fields rather than any particular toolchain's flags.

use std::{
    collections::BTreeMap,
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{Child, Command as StdCommand, Stdio},
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    command::script::ScriptExecutor,
    error::{BuildError, CommandContext},
};

use super::ProcessCommand;

/// Path-list environment variables that get prepended rather than
/// overwritten when merging a command's environment onto the build
/// environment.
const PATH_LIST_VARS: &[&str] = &["PATH", "LD_LIBRARY_PATH", "DYLD_LIBRARY_PATH", "DYLD_FRAMEWORK_PATH"];

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        fn var_eq(a: &str, b: &str) -> bool {
            a.eq_ignore_ascii_case(b)
        }
    } else {
        fn var_eq(a: &str, b: &str) -> bool {
            a == b
        }
    }
}

fn is_path_list_var(name: &str) -> bool {
    PATH_LIST_VARS.iter().any(|v| var_eq(v, name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoMode {
    /// Emit only `description`.
    ShortDescription,
    /// Emit the full command line.
    FullCommandLine,
    /// Emit the full command line plus the merged environment.
    FullCommandLinePlusEnv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessErrorKind {
    None,
    SpawnFailed,
    Crashed,
    Timeout,
    WriteError,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub working_dir: PathBuf,
    pub exit_code: Option<i32>,
    pub error_kind: ProcessErrorKind,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub success: bool,
}

/// Cooperative cancellation handle shared between the executor job and a
/// running process executor.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct ProcessExecutor {
    dry_run: bool,
    echo_mode: Option<EchoMode>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    pub fn set_echo_mode(&mut self, mode: Option<EchoMode>) {
        self.echo_mode = mode;
    }

    /// Resolve `program` and merge environments, then spawn and wait,
    /// honoring `cancel` and the command's `timeout`. `script_executor` runs
    /// `stdout_filter_fn`/`stderr_filter_fn` once the command has finished.
    pub fn start(
        &self,
        cmd: &ProcessCommand,
        build_env: &BTreeMap<String, String>,
        cancel: &CancelToken,
        script_executor: &ScriptExecutor,
    ) -> Result<ProcessResult, BuildError> {
        let context = || CommandContext {
            program: Some(cmd.program.clone()),
            arguments: cmd.arguments.clone(),
            working_dir: Some(cmd.working_dir.clone()),
        };

        if !cmd.common.silent {
            self.emit_description(cmd);
        }

        if !cmd.working_dir.as_os_str().is_empty() && !cmd.working_dir.is_dir() {
            return Err(BuildError::CommandSpawnFailed {
                context: context(),
                message: format!("working directory does not exist: {}", cmd.working_dir.display()),
            });
        }

        let merged_env = merge_environment(build_env, &cmd.environment);

        let program_path = resolve_program(&cmd.program, merged_env.get("PATH").map(String::as_str));

        if self.dry_run && !cmd.common.ignore_dry_run {
            return Ok(ProcessResult {
                executable: program_path,
                arguments: cmd.arguments.clone(),
                working_dir: cmd.working_dir.clone(),
                exit_code: Some(0),
                error_kind: ProcessErrorKind::None,
                stdout_lines: Vec::new(),
                stderr_lines: Vec::new(),
                success: true,
            });
        }

        let (final_args, _response_file) = if cmd.needs_response_file() {
            build_response_file_args(cmd)?
        } else {
            (cmd.arguments.clone(), None)
        };

        let mut builder = StdCommand::new(&program_path);
        builder.args(&final_args);
        builder.envs(&merged_env);
        builder.stdin(Stdio::null());
        builder.stdout(Stdio::piped());
        builder.stderr(Stdio::piped());
        if !cmd.working_dir.as_os_str().is_empty() {
            builder.current_dir(&cmd.working_dir);
        }

        let mut child = match builder.spawn() {
            Ok(c) => c,
            Err(e) => {
                let annotated = annotate_spawn_error(&program_path, &e);
                return Err(BuildError::CommandSpawnFailed { context: context(), message: annotated });
            }
        };

        // Drain stdout/stderr concurrently with the wait loop below: a child
        // that writes more than the OS pipe buffer will otherwise block on a
        // full pipe that nobody is reading, and never reach `try_wait`.
        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let timeout = cmd.common.timeout_duration();
        let wait_result = wait_with_cancel_and_timeout(&mut child, cancel, timeout);

        match wait_result {
            WaitOutcome::Canceled => {
                let _ = child.kill();
                let _ = child.wait();
                join_reader(stdout_reader);
                join_reader(stderr_reader);
                Err(BuildError::CommandCanceled { context: context(), reason: "canceled".into() })
            }
            WaitOutcome::TimedOut => {
                let _ = child.kill();
                let _ = child.wait();
                join_reader(stdout_reader);
                join_reader(stderr_reader);
                Err(BuildError::CommandTimedOut(timeout.unwrap_or_default(), context()))
            }
            WaitOutcome::Exited(status) => {
                let stdout_buf = String::from_utf8_lossy(&join_reader(stdout_reader)).into_owned();
                let stderr_buf = String::from_utf8_lossy(&join_reader(stderr_reader)).into_owned();

                let stdout_buf = apply_filter(script_executor, cmd.stdout_filter_fn.as_deref(), stdout_buf)?;
                let stderr_buf = apply_filter(script_executor, cmd.stderr_filter_fn.as_deref(), stderr_buf)?;

                let stdout_lines = if let Some(path) = &cmd.stdout_path {
                    write_output_file(path, stdout_buf.as_bytes())?;
                    Vec::new()
                } else {
                    stdout_buf.lines().map(str::to_string).collect()
                };
                let stderr_lines = if let Some(path) = &cmd.stderr_path {
                    write_output_file(path, stderr_buf.as_bytes())?;
                    Vec::new()
                } else {
                    stderr_buf.lines().map(str::to_string).collect()
                };

                let exit_code = status.code();
                let success = exit_code.map(|c| c <= cmd.max_exit_code).unwrap_or(false);

                Ok(ProcessResult {
                    executable: program_path,
                    arguments: final_args,
                    working_dir: cmd.working_dir.clone(),
                    exit_code,
                    error_kind: if success { ProcessErrorKind::None } else { ProcessErrorKind::Crashed },
                    stdout_lines,
                    stderr_lines,
                    success,
                })
            }
        }
    }

    fn emit_description(&self, cmd: &ProcessCommand) {
        match self.echo_mode {
            None | Some(EchoMode::ShortDescription) => {
                tracing::info!(target: "build_graph_core::command", "{}", cmd.common.description);
            }
            Some(EchoMode::FullCommandLine) => {
                tracing::info!(target: "build_graph_core::command", "{} {}", cmd.program, cmd.arguments.join(" "));
            }
            Some(EchoMode::FullCommandLinePlusEnv) => {
                tracing::info!(
                    target: "build_graph_core::command",
                    "{} {} (env: {:?})",
                    cmd.program,
                    cmd.arguments.join(" "),
                    cmd.environment
                );
            }
        }
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Canceled,
}

/// Spawns a thread that reads `pipe` to EOF, so the wait loop below never
/// shares a thread with I/O on a pipe the OS buffers only ~64 KB of.
fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    let mut pipe = pipe?;
    Some(std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    }))
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Invokes `source` (if set) with `captured` bound to the `output` scope
/// variable; the returned string replaces `captured` for logging and for
/// any configured redirect file.
fn apply_filter(script_executor: &ScriptExecutor, source: Option<&str>, captured: String) -> Result<String, BuildError> {
    match source {
        Some(source) => script_executor.run_filter(source, &captured),
        None => Ok(captured),
    }
}

fn wait_with_cancel_and_timeout(
    child: &mut Child,
    cancel: &CancelToken,
    timeout: Option<Duration>,
) -> WaitOutcome {
    let start = Instant::now();
    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return WaitOutcome::Exited(status);
        }
        if cancel.is_canceled() {
            return WaitOutcome::Canceled;
        }
        if let Some(timeout) = timeout {
            if start.elapsed() >= timeout {
                return WaitOutcome::TimedOut;
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn merge_environment(build_env: &BTreeMap<String, String>, overlay: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut merged = build_env.clone();
    for (key, value) in overlay {
        if is_path_list_var(key) {
            match merged.get(key) {
                Some(existing) if !existing.is_empty() => {
                    let sep = if cfg!(windows) { ';' } else { ':' };
                    merged.insert(key.clone(), format!("{value}{sep}{existing}"));
                }
                _ => {
                    merged.insert(key.clone(), value.clone());
                }
            }
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

fn resolve_program(program: &str, path_var: Option<&str>) -> PathBuf {
    let candidate = Path::new(program);
    if candidate.is_absolute() || candidate.components().count() > 1 {
        return candidate.to_path_buf();
    }
    if let Some(path_var) = path_var {
        for dir in std::env::split_paths(path_var) {
            let full = dir.join(program);
            if full.is_file() {
                return full;
            }
            #[cfg(windows)]
            {
                let exe = full.with_extension("exe");
                if exe.is_file() {
                    return exe;
                }
            }
        }
    }
    candidate.to_path_buf()
}

fn build_response_file_args(cmd: &ProcessCommand) -> Result<(Vec<String>, Option<tempfile::NamedTempFile>), BuildError> {
    let split_at = cmd.response_file_arg_index.min(cmd.arguments.len());
    let (kept, overflow) = cmd.arguments.split_at(split_at);

    let mut file = tempfile::NamedTempFile::new().map_err(BuildError::Io)?;
    let contents = overflow.join(&cmd.response_file_separator);
    file.write_all(contents.as_bytes()).map_err(BuildError::Io)?;
    file.flush().map_err(BuildError::Io)?;

    let mut final_args: Vec<String> = kept.to_vec();
    final_args.push(format!("{}{}", cmd.response_file_prefix, file.path().display()));

    Ok((final_args, Some(file)))
}

fn write_output_file(path: &Path, bytes: &[u8]) -> Result<(), BuildError> {
    std::fs::write(path, bytes).map_err(BuildError::Io)
}

/// On Unix, annotate "exec format error"-style failures as a bad
/// interpreter.
fn annotate_spawn_error(program: &Path, err: &std::io::Error) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if err.raw_os_error() == Some(libc_enoexec()) {
            return format!("{program:?}: bad interpreter (exec format error): {err}");
        }
        if let Ok(meta) = std::fs::metadata(program) {
            if meta.permissions().mode() & 0o111 == 0 {
                return format!("{program:?}: not executable: {err}");
            }
        }
    }
    format!("{program:?}: {err}")
}

#[cfg(unix)]
fn libc_enoexec() -> i32 {
    8 // ENOEXEC, stable across Unix targets this crate supports
}
