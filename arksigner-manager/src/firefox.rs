//! Best-effort registration of the PKCS#11 module in Firefox profiles.
//!
//! Nothing here can fail an invocation; every problem ends up as a line
//! in the returned report.

use crate::command_runner::{CommandOptions, CommandRunner, Exec};
use crate::layout::HostLayout;
use chrono::Local;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name the module is registered under in the NSS database.
pub const MODULE_NAME: &str = "ArkSigner";

/// `modutil` hangs on a locked NSS database, e.g. while Firefox is open.
pub const MODUTIL_TIMEOUT: Duration = Duration::from_secs(10);

const PROFILE_PATTERNS: [&str; 2] = ["*.default*", "*.default-release*"];

fn stamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Register the module in every default profile under `<home>/.mozilla/firefox`.
pub fn register(runner: &dyn CommandRunner, layout: &HostLayout, user: &str, home: &Path) -> String {
    let module = layout.module_path();
    if !module.exists() {
        return format!(
            "[{}] Firefox add failed: module missing: {}\n",
            stamp(),
            module.display()
        );
    }
    if !runner.has_program("modutil") {
        return format!(
            "[{}] Firefox add failed: modutil not found (install nss-tools)\n",
            stamp()
        );
    }

    let firefox_dir = home.join(".mozilla/firefox");
    if !firefox_dir.is_dir() {
        return format!(
            "[{}] Firefox add failed: Firefox profile dir not found: {}\n(Launch Firefox once first.)\n",
            stamp(),
            firefox_dir.display()
        );
    }

    let profiles = find_profiles(&firefox_dir);
    if profiles.is_empty() {
        return format!(
            "[{}] Firefox add: no profiles found under {}\n",
            stamp(),
            firefox_dir.display()
        );
    }

    let exec = Exec::new(runner);
    let library_path = format!(
        "LD_LIBRARY_PATH={}:{}",
        layout.lib_dir().display(),
        layout.module_dir().display()
    );
    let module_arg = module.to_string_lossy();
    let bounded = CommandOptions::default().with_timeout(MODUTIL_TIMEOUT);

    let mut out = format!(
        "[{}] Adding PKCS#11 module to Firefox profiles (best-effort)\n",
        stamp()
    );
    for profile in profiles {
        let dbdir = format!("sql:{}", profile.display());

        // A module that was never registered makes -delete fail; that is fine.
        let removed = exec.best_effort_in(
            "sudo",
            &["-u", user, "env", &library_path, "modutil", "-dbdir", &dbdir, "-delete", MODULE_NAME],
            &bounded,
        );
        if removed.timed_out() {
            warn!(profile = %profile.display(), "modutil -delete timed out");
            let _ = writeln!(
                out,
                "Profile: {}\n✗ Timed out after {}s removing the previous registration (is Firefox running?)\n",
                profile.display(),
                MODUTIL_TIMEOUT.as_secs()
            );
            continue;
        }
        debug!(profile = %profile.display(), code = removed.exit_code, "Removed previous registration");

        let add: [&str; 13] = [
            "sudo", "-u", user, "env", &library_path, "modutil", "-dbdir", &dbdir, "-add",
            MODULE_NAME, "-libfile", &module_arg, "-force",
        ];
        let quoted = shlex::try_join(add).unwrap_or_else(|_| add.join(" "));
        let result = exec.shell_best_effort_in(&format!("yes '' | {quoted}"), &bounded);

        let _ = writeln!(out, "Profile: {}", profile.display());
        if result.success() {
            info!(profile = %profile.display(), "Registered PKCS#11 module");
            out.push_str("✓ Module added successfully\n");
        } else if result.timed_out() {
            warn!(profile = %profile.display(), "modutil -add timed out");
            let _ = writeln!(
                out,
                "✗ Timed out after {}s (is Firefox running?)",
                MODUTIL_TIMEOUT.as_secs()
            );
        } else {
            let _ = writeln!(out, "✗ Failed (rc={})", result.exit_code);
        }
        for line in result.stderr.lines().filter(|line| line.contains("ERROR:")) {
            let _ = writeln!(out, "{}", line.trim());
        }
        out.push('\n');
    }
    out
}

fn find_profiles(firefox_dir: &Path) -> Vec<PathBuf> {
    let base = glob::Pattern::escape(&firefox_dir.to_string_lossy());
    let mut profiles: Vec<PathBuf> = PROFILE_PATTERNS
        .iter()
        .filter_map(|pattern| glob::glob(&format!("{base}/{pattern}")).ok())
        .flat_map(|paths| paths.filter_map(Result::ok))
        .filter(|path| path.is_dir())
        .collect();
    profiles.sort();
    profiles.dedup();
    profiles
}

/// Result of running `ldd` against the PKCS#11 module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DependencyCheck {
    ModuleMissing,
    Satisfied,
    Missing { libraries: Vec<String> },
    Unavailable { reason: String },
}

impl DependencyCheck {
    pub fn summary(&self) -> String {
        match self {
            DependencyCheck::ModuleMissing => "Module not found".to_string(),
            DependencyCheck::Satisfied => "All dependencies OK".to_string(),
            DependencyCheck::Missing { libraries } => format!(
                "Missing libraries: {}\nInstall ArkSigner dependencies.",
                libraries.join(", ")
            ),
            DependencyCheck::Unavailable { reason } => format!("Dependency check unavailable: {reason}"),
        }
    }
}

/// List the shared libraries the module links against that cannot be found.
pub fn check_module_dependencies(runner: &dyn CommandRunner, layout: &HostLayout) -> DependencyCheck {
    let module = layout.module_path();
    if !module.exists() {
        return DependencyCheck::ModuleMissing;
    }
    let exec = Exec::new(runner);
    let result = exec.best_effort("ldd", &[&module.to_string_lossy()]);
    let missing: Vec<String> = result
        .stdout
        .lines()
        .filter(|line| line.contains("not found"))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect();

    if !missing.is_empty() {
        DependencyCheck::Missing { libraries: missing }
    } else if result.success() {
        DependencyCheck::Satisfied
    } else {
        DependencyCheck::Unavailable {
            reason: result.summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::{CommandResult, MockCommandRunner, TIMED_OUT};
    use tempfile::TempDir;

    fn layout_with_module(dir: &TempDir) -> HostLayout {
        let layout = HostLayout::rooted_at(dir.path());
        std::fs::create_dir_all(layout.module_dir()).unwrap();
        std::fs::write(layout.module_path(), b"\x7fELF").unwrap();
        layout
    }

    #[test]
    fn missing_module_is_reported() {
        let dir = TempDir::new().unwrap();
        let layout = HostLayout::rooted_at(dir.path());
        let mock = MockCommandRunner::new();
        let report = register(&mock, &layout, "alice", dir.path());
        assert!(report.contains("module missing"));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn missing_modutil_is_reported() {
        let dir = TempDir::new().unwrap();
        let layout = layout_with_module(&dir);
        let mock = MockCommandRunner::new();
        mock.set_missing("modutil");
        let report = register(&mock, &layout, "alice", dir.path());
        assert!(report.contains("modutil not found"));
    }

    #[test]
    fn missing_profile_dir_is_reported() {
        let dir = TempDir::new().unwrap();
        let layout = layout_with_module(&dir);
        let mock = MockCommandRunner::new();
        let report = register(&mock, &layout, "alice", &dir.path().join("home"));
        assert!(report.contains("Firefox profile dir not found"));
        assert!(report.contains("Launch Firefox once first."));
    }

    #[test]
    fn registers_each_profile_once() {
        let dir = TempDir::new().unwrap();
        let layout = layout_with_module(&dir);
        let home = dir.path().join("home");
        let profiles = home.join(".mozilla/firefox");
        std::fs::create_dir_all(profiles.join("abcd.default-release")).unwrap();
        std::fs::create_dir_all(profiles.join("efgh.default")).unwrap();
        std::fs::create_dir_all(profiles.join("other")).unwrap();

        let mock = MockCommandRunner::new();
        mock.respond(
            "/bin/bash",
            "efgh.default",
            CommandResult::failure(1, "prompt\nERROR: bad database\n"),
        );
        let report = register(&mock, &layout, "alice", &home);

        assert_eq!(mock.count("sudo", "-delete ArkSigner"), 2);
        assert_eq!(mock.count("/bin/bash", "modutil"), 2);
        assert_eq!(report.matches("Profile:").count(), 2);
        assert!(report.contains("✓ Module added successfully"));
        assert!(report.contains("✗ Failed (rc=1)"));
        assert!(report.contains("ERROR: bad database"));
        assert!(!report.contains("prompt"));

        let add = mock
            .calls()
            .into_iter()
            .find(|call| call.program == "/bin/bash")
            .unwrap();
        assert!(add.args[1].starts_with("yes '' | sudo -u alice env"));
        assert!(add.args[1].contains("-force"));
        assert!(mock
            .calls()
            .iter()
            .all(|call| call.timeout == Some(MODUTIL_TIMEOUT)));
    }

    #[test]
    fn hung_modutil_is_reported_per_profile() {
        let dir = TempDir::new().unwrap();
        let layout = layout_with_module(&dir);
        let home = dir.path().join("home");
        let profiles = home.join(".mozilla/firefox");
        std::fs::create_dir_all(profiles.join("abcd.default-release")).unwrap();
        std::fs::create_dir_all(profiles.join("efgh.default")).unwrap();

        let mock = MockCommandRunner::new();
        mock.respond(
            "sudo",
            "abcd.default-release -delete",
            CommandResult::failure(TIMED_OUT, "timed out after 10s"),
        );
        mock.respond(
            "/bin/bash",
            "efgh.default",
            CommandResult::failure(TIMED_OUT, "timed out after 10s"),
        );
        let report = register(&mock, &layout, "alice", &home);

        assert_eq!(report.matches("Profile:").count(), 2);
        assert_eq!(report.matches("✗ Timed out after 10s").count(), 2);
        assert!(report.contains("removing the previous registration"));
        assert_eq!(mock.count("/bin/bash", "abcd.default-release"), 0);
        assert_eq!(mock.count("/bin/bash", "efgh.default"), 1);
    }

    #[test]
    fn ldd_reports_missing_libraries() {
        let dir = TempDir::new().unwrap();
        let layout = layout_with_module(&dir);
        let mock = MockCommandRunner::new();
        mock.respond(
            "ldd",
            "",
            CommandResult::with_stdout(
                "\tlinux-vdso.so.1 (0x0000)\n\tlibpcsclite.so.1 => not found\n\tlibc.so.6 => /lib/libc.so.6\n",
            ),
        );
        let check = check_module_dependencies(&mock, &layout);
        assert_eq!(
            check,
            DependencyCheck::Missing {
                libraries: vec!["libpcsclite.so.1".to_string()]
            }
        );
        assert!(check.summary().starts_with("Missing libraries: libpcsclite.so.1"));
    }

    #[test]
    fn ldd_clean_and_absent_module() {
        let dir = TempDir::new().unwrap();
        let mock = MockCommandRunner::new();
        assert_eq!(
            check_module_dependencies(&mock, &HostLayout::rooted_at(dir.path())),
            DependencyCheck::ModuleMissing
        );
        assert!(mock.calls().is_empty());

        let layout = layout_with_module(&dir);
        assert_eq!(check_module_dependencies(&mock, &layout), DependencyCheck::Satisfied);
    }
}
