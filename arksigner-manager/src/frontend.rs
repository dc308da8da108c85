//! Unprivileged front-end: builds the pkexec command line, runs the
//! backend and turns its output into progress events.
//!
//! Cancellation only stops the front-end from listening. The privileged
//! backend is never signalled and runs to completion on its own.

use crate::command_runner::find_in_path;
use crate::config::{Action, DeploymentMode};
use crate::progress::ProgressEvent;
use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, ValueEnum};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, warn};

pub const BACKEND_NAME: &str = "arksigner-manager-cli";

/// Installed backend locations, checked before `PATH`.
pub const BACKEND_CANDIDATES: [&str; 2] = [
    "/usr/libexec/arksigner-manager/arksigner-manager-cli",
    "/usr/lib/arksigner-manager/arksigner-manager-cli",
];

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeChoice {
    /// Use whichever mode's service is active
    Auto,
    Container,
    Native,
}

#[derive(Debug, Parser)]
#[command(name = "arksigner-manager")]
#[command(about = "Manage ArkSigner through the privileged backend (pkexec)")]
#[command(version)]
pub struct FrontendCli {
    #[arg(value_enum)]
    pub action: Action,

    #[arg(long, value_enum, default_value_t = ModeChoice::Auto)]
    pub mode: ModeChoice,

    /// .deb URL or local path (use 'auto' to find the latest release)
    #[arg(long)]
    pub deb: Option<String>,

    #[arg(long)]
    pub machine: Option<String>,

    #[arg(long)]
    pub suite: Option<String>,

    #[arg(long)]
    pub mirror: Option<String>,

    #[arg(long)]
    pub recreate: bool,

    #[arg(long)]
    pub firefox_add: bool,

    #[arg(long)]
    pub native_rpath: bool,

    #[arg(long)]
    pub force_terminate: bool,

    #[arg(long)]
    pub recreate_mounts: bool,

    /// Skip the daemon-reload/reset-failed step during repair
    #[arg(long)]
    pub no_clear_cache: bool,

    /// Do not ask before uninstall or purge
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Backend executable (default: installed location, then PATH)
    #[arg(long)]
    pub backend: Option<PathBuf>,
}

impl FrontendCli {
    /// Concrete mode for this run. `detected` is consulted only for `auto`
    /// on actions that operate on an existing deployment.
    pub fn resolve_mode(&self, detected: impl FnOnce() -> Option<DeploymentMode>) -> DeploymentMode {
        match self.mode {
            ModeChoice::Container => DeploymentMode::Container,
            ModeChoice::Native => DeploymentMode::Native,
            ModeChoice::Auto => match self.action {
                Action::Install | Action::Status => DeploymentMode::Container,
                _ => detected().unwrap_or_default(),
            },
        }
    }

    pub fn needs_confirmation(&self) -> bool {
        matches!(self.action, Action::Uninstall | Action::Purge) && !self.yes
    }
}

/// Locate the backend: installed locations first, then `PATH`.
pub fn find_backend() -> Option<PathBuf> {
    find_backend_in(&BACKEND_CANDIDATES.map(PathBuf::from))
}

fn find_backend_in(candidates: &[PathBuf]) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;
    candidates
        .iter()
        .find(|path| {
            path.metadata()
                .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
        .cloned()
        .or_else(|| find_in_path(BACKEND_NAME))
}

/// The privileged backend invocation.
#[derive(Debug, Clone)]
pub struct PkexecCommand {
    pub helper: String,
    pub backend: PathBuf,
    pub action: Action,
    pub mode: DeploymentMode,
    pub machine: Option<String>,
    pub suite: Option<String>,
    pub mirror: Option<String>,
    pub deb: Option<String>,
    pub user: String,
    pub home: PathBuf,
    pub recreate: bool,
    pub firefox_add: bool,
    pub native_rpath: bool,
    pub force_terminate: bool,
    pub recreate_mounts: bool,
    pub clear_cache: bool,
}

impl PkexecCommand {
    pub fn from_cli(cli: &FrontendCli, backend: PathBuf, mode: DeploymentMode, user: String, home: PathBuf) -> Self {
        Self {
            helper: "pkexec".to_string(),
            backend,
            action: cli.action,
            mode,
            machine: cli.machine.clone(),
            suite: cli.suite.clone(),
            mirror: cli.mirror.clone(),
            deb: cli.deb.clone(),
            user,
            home,
            recreate: cli.recreate,
            firefox_add: cli.firefox_add,
            native_rpath: cli.native_rpath,
            force_terminate: cli.force_terminate,
            recreate_mounts: cli.recreate_mounts,
            clear_cache: !cli.no_clear_cache,
        }
    }

    /// Full argv, helper first. Unset options are left to the backend's
    /// config file and defaults.
    pub fn build(&self) -> Vec<String> {
        let mut argv = vec![
            self.helper.clone(),
            self.backend.display().to_string(),
            "--action".to_string(),
            self.action.to_string(),
            "--mode".to_string(),
            self.mode.to_string(),
        ];

        let options = [
            ("--machine", &self.machine),
            ("--suite", &self.suite),
            ("--mirror", &self.mirror),
            ("--deb", &self.deb),
        ];
        for (flag, value) in options {
            if let Some(value) = value {
                argv.push(flag.to_string());
                argv.push(value.clone());
            }
        }
        argv.extend([
            "--user".to_string(),
            self.user.clone(),
            "--home".to_string(),
            self.home.display().to_string(),
        ]);

        let switches = [
            ("--recreate", self.recreate),
            ("--firefox-add", self.firefox_add),
            ("--native-rpath", self.native_rpath),
            ("--force-terminate", self.force_terminate),
            ("--recreate-mounts", self.recreate_mounts),
            ("--clear-cache", self.clear_cache),
        ];
        argv.extend(
            switches
                .into_iter()
                .filter(|(_, on)| *on)
                .map(|(flag, _)| flag.to_string()),
        );
        argv
    }
}

/// What the front-end sees of the backend's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Progress(ProgressEvent),
    Line(String),
}

impl StreamEvent {
    pub fn classify(line: &str) -> Self {
        match ProgressEvent::parse(line) {
            Some(event) => StreamEvent::Progress(event),
            None => StreamEvent::Line(line.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct StreamOutcome {
    /// `None` when cancelled or killed by a signal.
    pub exit_code: Option<i32>,
    pub cancelled: bool,
    pub lines: Vec<String>,
}

impl StreamOutcome {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

/// Run `argv`, merging stdout and stderr, and hand each line to `on_event`.
///
/// Returns early with `cancelled` set once `cancel` flips; the child is
/// left running.
pub fn stream_backend(
    argv: &[String],
    cancel: &AtomicBool,
    mut on_event: impl FnMut(&StreamEvent),
) -> Result<StreamOutcome> {
    let (program, args) = argv.split_first().context("Empty backend command")?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to start {program}"))?;

    let (tx, rx) = mpsc::channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, tx.clone());
    }
    drop(tx);

    let mut lines = Vec::new();
    loop {
        if cancel.load(Ordering::SeqCst) {
            debug!("Stopped listening to backend");
            return Ok(StreamOutcome {
                exit_code: None,
                cancelled: true,
                lines,
            });
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(line) => {
                on_event(&StreamEvent::classify(&line));
                lines.push(line);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = child.wait().context("Failed to wait for backend")?;
    Ok(StreamOutcome {
        exit_code: status.code(),
        cancelled: false,
        lines,
    })
}

fn forward_lines(stream: impl Read + Send + 'static, tx: mpsc::Sender<String>) {
    std::thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            if tx.send(line.trim_end_matches('\r').to_string()).is_err() {
                break;
            }
        }
    });
}

/// Timestamped append-only log of everything the backend printed.
pub struct FrontendLog {
    path: PathBuf,
    file: Option<File>,
}

impl FrontendLog {
    /// `$XDG_STATE_HOME/arksigner-manager/frontend.log`
    pub fn default_path() -> Option<PathBuf> {
        let dirs = directories::BaseDirs::new()?;
        let state = dirs
            .state_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dirs.home_dir().join(".local/state"));
        Some(state.join("arksigner-manager").join("frontend.log"))
    }

    /// Logging is best-effort: an unwritable location disables it.
    pub fn open(path: PathBuf) -> Self {
        let file = path
            .parent()
            .map(std::fs::create_dir_all)
            .transpose()
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));
        match file {
            Ok(file) => Self {
                path,
                file: Some(file),
            },
            Err(err) => {
                warn!(path = %path.display(), "Front-end log disabled: {err}");
                Self { path, file: None }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, line: &str) {
        if let Some(file) = &mut self.file {
            let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
            if writeln!(file, "[{stamp}] {line}").is_err() {
                self.file = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli(args: &[&str]) -> FrontendCli {
        FrontendCli::try_parse_from(std::iter::once("arksigner-manager").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        FrontendCli::command().debug_assert();
    }

    #[test]
    fn build_orders_options_then_switches() {
        let cli = cli(&["install", "--deb", "auto", "--recreate", "--firefox-add"]);
        let cmd = PkexecCommand::from_cli(
            &cli,
            PathBuf::from("/usr/libexec/arksigner-manager/arksigner-manager-cli"),
            DeploymentMode::Container,
            "alice".into(),
            PathBuf::from("/home/alice"),
        );
        assert_eq!(
            cmd.build(),
            vec![
                "pkexec",
                "/usr/libexec/arksigner-manager/arksigner-manager-cli",
                "--action",
                "install",
                "--mode",
                "container",
                "--deb",
                "auto",
                "--user",
                "alice",
                "--home",
                "/home/alice",
                "--recreate",
                "--firefox-add",
                "--clear-cache",
            ]
        );
    }

    #[test]
    fn no_clear_cache_drops_switch() {
        let cli = cli(&["repair", "--mode", "native", "--no-clear-cache"]);
        let cmd = PkexecCommand::from_cli(&cli, "backend".into(), DeploymentMode::Native, "u".into(), "/h".into());
        assert!(!cmd.build().contains(&"--clear-cache".to_string()));
    }

    #[test]
    fn auto_mode_only_detects_for_existing_deployments() {
        let install = cli(&["install"]);
        assert_eq!(
            install.resolve_mode(|| panic!("install must not probe")),
            DeploymentMode::Container
        );

        let repair = cli(&["repair"]);
        assert_eq!(repair.resolve_mode(|| Some(DeploymentMode::Native)), DeploymentMode::Native);
        assert_eq!(repair.resolve_mode(|| None), DeploymentMode::Container);

        let explicit = cli(&["purge", "--mode", "native"]);
        assert_eq!(explicit.resolve_mode(|| None), DeploymentMode::Native);
    }

    #[test]
    fn confirmation_rules() {
        assert!(cli(&["purge"]).needs_confirmation());
        assert!(!cli(&["purge", "--yes"]).needs_confirmation());
        assert!(!cli(&["status"]).needs_confirmation());
    }

    #[test]
    fn explicit_candidate_wins() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let backend = dir.path().join(BACKEND_NAME);
        std::fs::write(&backend, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&backend, std::fs::Permissions::from_mode(0o755)).unwrap();

        let plain = dir.path().join("not-executable");
        std::fs::write(&plain, "").unwrap();

        assert_eq!(find_backend_in(&[plain, backend.clone()]), Some(backend));
    }

    #[test]
    fn stream_merges_output_and_parses_progress() {
        let argv: Vec<String> = [
            "/bin/sh",
            "-c",
            "echo 'PROGRESS 5 Resolving'; echo oops >&2; echo 'PROGRESS 180 Done'; exit 3",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let cancel = AtomicBool::new(false);
        let mut progress = Vec::new();
        let outcome = stream_backend(&argv, &cancel, |event| {
            if let StreamEvent::Progress(p) = event {
                progress.push(p.percent);
            }
        })
        .unwrap();

        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success());
        assert_eq!(progress, vec![5, 100]);
        assert!(outcome.lines.contains(&"oops".to_string()));
    }

    #[test]
    fn cancel_stops_listening() {
        let argv: Vec<String> = ["/bin/sh", "-c", "sleep 5"].iter().map(|s| s.to_string()).collect();
        let cancel = AtomicBool::new(true);
        let outcome = stream_backend(&argv, &cancel, |_| {}).unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.exit_code, None);
    }

    #[test]
    fn log_appends_with_timestamps() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/arksigner-manager/frontend.log");
        let mut log = FrontendLog::open(path.clone());
        log.append("PROGRESS 5 Resolving");
        log.append("done");
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] PROGRESS 5 Resolving"));
        assert!(lines[1].starts_with('['));
    }
}
