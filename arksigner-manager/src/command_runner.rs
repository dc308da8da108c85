//! Abstraction over external command execution for testability.
//!
//! Every host effect the drivers have (systemctl, machinectl, mount,
//! debootstrap, systemd-nspawn, ar, tar, patchelf) goes through the
//! [`CommandRunner`] trait, so the same driver code runs against the real
//! host or against [`MockCommandRunner`].
//!
//! # Strict vs best-effort
//!
//! [`Exec`] layers the two propagation classes on top of a runner:
//! - [`Exec::strict`]: a nonzero exit becomes [`ManagerError::CommandFailed`]
//!   carrying the captured stdout and stderr.
//! - [`Exec::best_effort`]: the result is handed back for the caller to
//!   interpret; failing to even launch the program is folded into an
//!   exit code of 127.
//!
//! A [`CommandOptions::timeout`] bounds how long [`RealCommandRunner`] waits;
//! a command that overruns is killed along with its process group and
//! reported with exit code [`TIMED_OUT`].

use crate::error::ManagerError;
use anyhow::{Context, Result};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::collections::{HashSet, VecDeque};
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Exit code reported when a program could not be started at all.
pub const LAUNCH_FAILURE: i32 = 127;

/// Exit code reported when a command was killed for exceeding its timeout.
pub const TIMED_OUT: i32 = 124;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Trait for abstracting external command execution.
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture stdout, stderr and exit code.
    ///
    /// `Err` means the program could not be launched.
    fn run_output(
        &self,
        program: &str,
        args: &[&str],
        options: &CommandOptions,
    ) -> Result<CommandResult>;

    /// Whether `program` resolves to an executable on `PATH`.
    fn has_program(&self, program: &str) -> bool;
}

/// Options for command execution.
#[derive(Debug, Default, Clone)]
pub struct CommandOptions {
    /// Working directory for the command.
    pub cwd: Option<PathBuf>,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
    /// Kill the command if it runs longer than this.
    pub timeout: Option<Duration>,
}

impl CommandOptions {
    /// Create options with a working directory.
    pub fn with_cwd(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }
}

/// Outcome of one external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn ok() -> Self {
        Self::with_stdout("")
    }

    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMED_OUT
    }

    /// First non-empty stream, trimmed, for one-line diagnostics.
    pub fn summary(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        self.stdout.trim().to_string()
    }
}

/// Production implementation that delegates to [`std::process::Command`].
pub struct RealCommandRunner;

impl CommandRunner for RealCommandRunner {
    fn run_output(
        &self,
        program: &str,
        args: &[&str],
        options: &CommandOptions,
    ) -> Result<CommandResult> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &options.env {
            cmd.env(k, v);
        }
        if let Some(limit) = options.timeout {
            return run_bounded(cmd, program, limit);
        }
        let output = cmd
            .output()
            .with_context(|| format!("Failed to run '{program}'"))?;

        Ok(CommandResult {
            // Killed by a signal: no code, report as generic failure.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn has_program(&self, program: &str) -> bool {
        find_in_path(program).is_some()
    }
}

/// Spawn `cmd` in its own process group and poll it until it exits or
/// `limit` passes, in which case the whole group is killed.
fn run_bounded(mut cmd: Command, program: &str, limit: Duration) -> Result<CommandResult> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to run '{program}'"))?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + limit;
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("Failed to wait for '{program}'"))?
        {
            break Some(status);
        }
        if Instant::now() >= deadline {
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };

    match status {
        Some(status) => Ok(CommandResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: collect(&stdout, None),
            stderr: collect(&stderr, None),
        }),
        None => {
            warn!(program, timeout_secs = limit.as_secs_f32(), "Command timed out, killing it");
            let group = Pid::from_raw(child.id() as i32);
            if let Err(err) = killpg(group, Signal::SIGKILL) {
                debug!(program, %err, "killpg failed, killing the child only");
                let _ = child.kill();
            }
            let _ = child.wait();

            // Descendants that left the group may still hold the pipes open.
            let mut stderr = collect(&stderr, Some(DRAIN_GRACE));
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!("timed out after {}s", limit.as_secs()));
            Ok(CommandResult {
                exit_code: TIMED_OUT,
                stdout: collect(&stdout, Some(DRAIN_GRACE)),
                stderr,
            })
        }
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

fn collect(rx: &Receiver<Vec<u8>>, grace: Option<Duration>) -> String {
    let bytes = match grace {
        Some(grace) => rx.recv_timeout(grace).unwrap_or_default(),
        None => rx.recv().unwrap_or_default(),
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Locate an executable on `PATH`.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let raw = std::env::var("PATH").unwrap_or_default();
    raw.split(':')
        .filter(|dir| !dir.trim().is_empty())
        .map(|dir| PathBuf::from(dir).join(program))
        .find(|candidate| {
            candidate
                .metadata()
                .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}

/// Whether a nonzero exit aborts the current operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    Strict,
    BestEffort,
}

/// A command in argument-vector or shell-string form.
#[derive(Debug, Clone, Copy)]
pub enum Invocation<'a> {
    Argv(&'a str, &'a [&'a str]),
    Shell(&'a str),
}

impl Invocation<'_> {
    fn parts(&self) -> (&str, Vec<&str>) {
        match *self {
            Invocation::Argv(program, args) => (program, args.to_vec()),
            Invocation::Shell(script) => ("/bin/bash", vec!["-c", script]),
        }
    }
}

/// Render a command line for messages.
pub fn display_command(program: &str, args: &[&str]) -> String {
    let words = std::iter::once(program).chain(args.iter().copied());
    shlex::try_join(words).unwrap_or_else(|_| format!("{program} {}", args.join(" ")))
}

/// Strict/best-effort execution on top of a [`CommandRunner`].
#[derive(Clone, Copy)]
pub struct Exec<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Exec<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    pub fn has_program(&self, program: &str) -> bool {
        self.runner.has_program(program)
    }

    /// Run `invocation`; under [`Strictness::Strict`] a nonzero exit is an error.
    pub fn execute(
        &self,
        invocation: Invocation<'_>,
        strictness: Strictness,
        options: &CommandOptions,
    ) -> Result<CommandResult, ManagerError> {
        let (program, args) = invocation.parts();
        let command = display_command(program, &args);
        debug!(%command, ?strictness, "Running command");

        let result = match self.runner.run_output(program, &args, options) {
            Ok(result) => result,
            Err(err) if strictness == Strictness::Strict => {
                return Err(ManagerError::Launch {
                    command,
                    reason: format!("{err:#}"),
                });
            }
            Err(err) => CommandResult::failure(LAUNCH_FAILURE, format!("{err:#}")),
        };

        if result.success() {
            return Ok(result);
        }

        match strictness {
            Strictness::Strict => Err(ManagerError::CommandFailed {
                command,
                code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
            }),
            Strictness::BestEffort => {
                debug!(%command, code = result.exit_code, "Ignoring failure of best-effort command");
                Ok(result)
            }
        }
    }

    pub fn strict(&self, program: &str, args: &[&str]) -> Result<CommandResult, ManagerError> {
        self.execute(
            Invocation::Argv(program, args),
            Strictness::Strict,
            &CommandOptions::default(),
        )
    }

    pub fn strict_in(
        &self,
        program: &str,
        args: &[&str],
        options: &CommandOptions,
    ) -> Result<CommandResult, ManagerError> {
        self.execute(Invocation::Argv(program, args), Strictness::Strict, options)
    }

    pub fn best_effort(&self, program: &str, args: &[&str]) -> CommandResult {
        self.best_effort_in(program, args, &CommandOptions::default())
    }

    pub fn best_effort_in(
        &self,
        program: &str,
        args: &[&str],
        options: &CommandOptions,
    ) -> CommandResult {
        self.infallible(Invocation::Argv(program, args), options)
    }

    /// Run a script through `/bin/bash -c`, best-effort.
    pub fn shell_best_effort_in(&self, script: &str, options: &CommandOptions) -> CommandResult {
        self.infallible(Invocation::Shell(script), options)
    }

    fn infallible(&self, invocation: Invocation<'_>, options: &CommandOptions) -> CommandResult {
        match self.execute(invocation, Strictness::BestEffort, options) {
            Ok(result) => result,
            // Best-effort execution never produces an error value.
            Err(err) => {
                warn!("{err}");
                CommandResult::failure(LAUNCH_FAILURE, err.to_string())
            }
        }
    }
}

/// One invocation observed by [`MockCommandRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl RecordedCall {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn matches(&self, program: &str, args_contain: &str) -> bool {
        self.program == program && self.args.join(" ").contains(args_contain)
    }
}

type Hook = Box<dyn Fn(&RecordedCall) + Send + Sync>;

/// Poisoning from a panicking hook is ignored.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Rule {
    program: String,
    args_contain: String,
    queue: VecDeque<CommandResult>,
}

/// Test double that records every call and returns scripted results.
///
/// Rules match on the program name plus a substring of the space-joined
/// arguments; the most recently added matching rule wins. A rule with
/// several results hands them out in order and then keeps repeating the
/// last one. Calls that match no rule succeed with empty output.
#[derive(Default)]
pub struct MockCommandRunner {
    calls: Mutex<Vec<RecordedCall>>,
    rules: Mutex<Vec<Rule>>,
    hooks: Mutex<Vec<(String, Hook)>>,
    missing: Mutex<HashSet<String>>,
    fallback: Mutex<Option<CommandResult>>,
    unlaunchable: Mutex<HashSet<String>>,
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call matching no rule returns `result`.
    pub fn fail_by_default(&self, result: CommandResult) {
        *lock(&self.fallback) = Some(result);
    }

    pub fn respond(&self, program: &str, args_contain: &str, result: CommandResult) {
        self.respond_sequence(program, args_contain, vec![result]);
    }

    pub fn respond_sequence(&self, program: &str, args_contain: &str, results: Vec<CommandResult>) {
        lock(&self.rules).push(Rule {
            program: program.to_string(),
            args_contain: args_contain.to_string(),
            queue: results.into(),
        });
    }

    /// Run `hook` whenever `program` is invoked, before the result is returned.
    pub fn on_call(&self, program: &str, hook: impl Fn(&RecordedCall) + Send + Sync + 'static) {
        lock(&self.hooks)
            .push((program.to_string(), Box::new(hook)));
    }

    /// Report `program` as absent from `PATH`.
    pub fn set_missing(&self, program: &str) {
        lock(&self.missing).insert(program.to_string());
    }

    /// Make launching `program` fail outright.
    pub fn set_unlaunchable(&self, program: &str) {
        lock(&self.unlaunchable).insert(program.to_string());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(RecordedCall::command_line).collect()
    }

    pub fn count(&self, program: &str, args_contain: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| call.matches(program, args_contain))
            .count()
    }

    /// Index of the first matching call, for ordering assertions.
    pub fn position(&self, program: &str, args_contain: &str) -> Option<usize> {
        lock(&self.calls)
            .iter()
            .position(|call| call.matches(program, args_contain))
    }

    fn next_result(&self, call: &RecordedCall) -> CommandResult {
        let mut rules = lock(&self.rules);
        if let Some(rule) = rules
            .iter_mut()
            .rev()
            .find(|rule| call.matches(&rule.program, &rule.args_contain))
        {
            if rule.queue.len() > 1 {
                if let Some(result) = rule.queue.pop_front() {
                    return result;
                }
            }
            if let Some(result) = rule.queue.front() {
                return result.clone();
            }
        }
        lock(&self.fallback)
            .clone()
            .unwrap_or_else(CommandResult::ok)
    }
}

impl CommandRunner for MockCommandRunner {
    fn run_output(
        &self,
        program: &str,
        args: &[&str],
        options: &CommandOptions,
    ) -> Result<CommandResult> {
        let call = RecordedCall {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            cwd: options.cwd.clone(),
            timeout: options.timeout,
        };
        lock(&self.calls).push(call.clone());

        if lock(&self.unlaunchable).contains(program) {
            anyhow::bail!("No such file or directory (os error 2)");
        }

        for (hooked, hook) in lock(&self.hooks).iter() {
            if hooked == program {
                hook(&call);
            }
        }

        Ok(self.next_result(&call))
    }

    fn has_program(&self, program: &str) -> bool {
        !lock(&self.missing).contains(program)
    }
}
