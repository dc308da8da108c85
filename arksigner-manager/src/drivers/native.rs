//! Native mode: package contents unpacked straight into the host prefix.

use super::{InstallKind, ModeDriver, remove_file_if_present, remove_tree_if_present};
use crate::command_runner::{CommandOptions, Exec};
use crate::config::{DeploymentMode, RepairOptions};
use crate::error::ManagerError;
use crate::layout::{HostLayout, PACKAGE_PAYLOAD};
use crate::outcome::StepLog;
use crate::progress::Progress;
use crate::systemd::ServiceUnit;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Search path patched into the entry points on request.
pub const RPATH: &str = "$ORIGIN/libs";

pub struct NativeDriver<'a> {
    exec: Exec<'a>,
    layout: &'a HostLayout,
    progress: &'a Progress,
    rpath: bool,
}

impl<'a> NativeDriver<'a> {
    pub fn new(exec: Exec<'a>, layout: &'a HostLayout, progress: &'a Progress, rpath: bool) -> Self {
        Self {
            exec,
            layout,
            progress,
            rpath,
        }
    }

    fn unit(&self) -> &str {
        &self.layout.native_unit
    }

    /// Unpack `package` and replace the contents of the install prefix with it.
    pub fn extract_package(&self, package: &Path) -> Result<(), ManagerError> {
        let prefix = &self.layout.install_prefix;
        self.progress
            .emit(40, &format!("Extracting .deb to {}", prefix.display()));

        if !self.exec.has_program("ar") {
            return Err(ManagerError::ToolMissing("ar (install binutils)".to_string()));
        }

        let scratch = tempfile::Builder::new()
            .prefix("arksigner-extract-")
            .tempdir()
            .map_err(|e| ManagerError::io("creating scratch directory", e))?;
        let work = scratch.path();
        let deb = work.join("pkg.deb");
        std::fs::copy(package, &deb)
            .map_err(|e| ManagerError::io(format!("copying {}", package.display()), e))?;

        self.exec
            .strict_in("ar", &["x", "pkg.deb"], &CommandOptions::with_cwd(work))?;
        let data = find_data_archive(work)?;

        let root = work.join("root");
        std::fs::create_dir_all(&root)
            .map_err(|e| ManagerError::io(format!("creating {}", root.display()), e))?;
        let data_arg = data.to_string_lossy();
        let root_arg = root.to_string_lossy();
        self.exec
            .strict("tar", &["-xf", &data_arg, "-C", &root_arg])?;

        let payload = root.join(PACKAGE_PAYLOAD);
        if !payload.exists() {
            return Err(ManagerError::InvalidPackage(format!(
                "package content missing {PACKAGE_PAYLOAD}"
            )));
        }

        std::fs::create_dir_all(prefix)
            .map_err(|e| ManagerError::io(format!("creating {}", prefix.display()), e))?;
        wipe_dir_contents(prefix);
        copy_visible_entries(&payload, prefix)?;
        sweep_hidden_files(prefix);

        for entry in self.layout.entry_points() {
            if entry.exists() {
                std::fs::set_permissions(&entry, std::fs::Permissions::from_mode(0o755))
                    .map_err(|e| ManagerError::io(format!("chmod {}", entry.display()), e))?;
            }
        }

        let module = self.layout.module_path();
        if !module.exists() {
            return Err(ManagerError::missing(
                "PKCS#11 module after install",
                module,
            ));
        }

        self.progress
            .emit(80, &format!("Files installed to {}", prefix.display()));
        info!(prefix = %prefix.display(), "Extracted package");
        Ok(())
    }

    /// Point the entry points' RPATH at `$ORIGIN/libs`, restoring the
    /// original binary whenever patching does not succeed.
    ///
    /// Never fails; every outcome is reported as a line of text.
    pub fn apply_rpath(&self, targets: &[PathBuf]) -> Vec<String> {
        if !self.exec.has_program("patchelf") {
            return vec!["RPATH requested but patchelf not found (install patchelf)".to_string()];
        }

        let mut report = vec![format!(
            "Applying RPATH ({RPATH}) to ArkSigner binaries (opt-in)"
        )];
        for target in targets {
            if !target.exists() {
                report.push(format!("Skip missing: {}", target.display()));
                continue;
            }
            report.push(self.patch_one(target));
        }
        report
    }

    fn patch_one(&self, target: &Path) -> String {
        let mut backup = target.as_os_str().to_owned();
        backup.push(".bak");
        let backup = PathBuf::from(backup);

        if let Err(err) = std::fs::copy(target, &backup) {
            return format!("Error for {}: could not back up: {err}", target.display());
        }

        let target_arg = target.to_string_lossy();
        let result = self
            .exec
            .best_effort("patchelf", &["--set-rpath", RPATH, &target_arg]);
        if result.success() {
            info!(target = %target.display(), "Applied RPATH");
            return format!("OK: {}", target.display());
        }

        warn!(target = %target.display(), code = result.exit_code, "patchelf failed, restoring backup");
        match std::fs::copy(&backup, target) {
            Ok(_) => format!(
                "patchelf failed for {}:\n{}\nRestored backup.",
                target.display(),
                result.summary()
            ),
            Err(err) => format!(
                "patchelf failed for {} and restoring {} failed: {err}",
                target.display(),
                backup.display()
            ),
        }
    }

    pub fn service_unit(&self) -> ServiceUnit {
        let prefix = self.layout.install_prefix.display();
        ServiceUnit::new("ArkSigner Service (native)")
            .requiring(&self.layout.socket_unit)
            .set("Type", "simple")
            .set("User", "root")
            .set(
                "Environment",
                format!(
                    "LD_LIBRARY_PATH={}:{}",
                    self.layout.lib_dir().display(),
                    self.layout.fallback_lib_dir.display()
                ),
            )
            .set("ExecStart", format!("{prefix}/arksigner-universal"))
            .set("Restart", "always")
            .set("RestartSec", "5")
    }
}

fn find_data_archive(dir: &Path) -> Result<PathBuf, ManagerError> {
    let pattern = format!(
        "{}/data.tar.*",
        glob::Pattern::escape(&dir.to_string_lossy())
    );
    let mut matches = glob::glob(&pattern)
        .map_err(|e| ManagerError::InvalidPackage(format!("bad pattern {pattern}: {e}")))?
        .filter_map(Result::ok);
    matches
        .next()
        .ok_or_else(|| ManagerError::InvalidPackage("data.tar.* not found in deb".to_string()))
}

/// Delete every entry directly under `dir`. One stubborn entry does not
/// stop the rest from being removed.
fn wipe_dir_contents(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), "Cannot list directory for wipe: {err}");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let result = if is_dir {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(err) = result {
            warn!(path = %path.display(), "Could not remove old entry: {err}");
        }
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

fn copy_visible_entries(src: &Path, dst: &Path) -> Result<(), ManagerError> {
    let entries = std::fs::read_dir(src)
        .map_err(|e| ManagerError::io(format!("reading {}", src.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ManagerError::io(format!("reading {}", src.display()), e))?;
        let path = entry.path();
        if is_hidden(&path) {
            continue;
        }
        copy_tree(&path, &dst.join(entry.file_name()))?;
    }
    Ok(())
}

/// Recursive copy that keeps symlinks as symlinks.
fn copy_tree(src: &Path, dst: &Path) -> Result<(), ManagerError> {
    let io = |what: &str, e: std::io::Error| ManagerError::io(format!("{what} {}", src.display()), e);
    let meta = std::fs::symlink_metadata(src).map_err(|e| io("inspecting", e))?;
    let kind = meta.file_type();

    if kind.is_symlink() {
        let link = std::fs::read_link(src).map_err(|e| io("reading link", e))?;
        let _ = std::fs::remove_file(dst);
        std::os::unix::fs::symlink(&link, dst).map_err(|e| io("linking", e))?;
    } else if kind.is_dir() {
        std::fs::create_dir_all(dst).map_err(|e| io("creating target for", e))?;
        for entry in std::fs::read_dir(src).map_err(|e| io("reading", e))? {
            let entry = entry.map_err(|e| io("reading", e))?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        std::fs::copy(src, dst).map_err(|e| io("copying", e))?;
    }
    Ok(())
}

/// Remove dotfiles anywhere under `dir`.
fn sweep_hidden_files(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(kind) = entry.file_type() else {
            continue;
        };
        if kind.is_dir() {
            sweep_hidden_files(&path);
        } else if is_hidden(&path) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed hidden file"),
                Err(err) => warn!(path = %path.display(), "Could not remove hidden file: {err}"),
            }
        }
    }
}

impl ModeDriver for NativeDriver<'_> {
    fn mode(&self) -> DeploymentMode {
        DeploymentMode::Native
    }

    fn unit_name(&self) -> &str {
        self.unit()
    }

    fn install(&self, package: &Path, _kind: InstallKind) -> Result<Vec<String>, ManagerError> {
        self.extract_package(package)?;
        if self.rpath {
            Ok(self.apply_rpath(&self.layout.entry_points()))
        } else {
            Ok(Vec::new())
        }
    }

    fn write_service_unit(&self) -> Result<(), ManagerError> {
        self.service_unit()
            .write_to(&self.layout.unit_path(self.unit()))
    }

    fn enable_and_start(&self) -> Result<(), ManagerError> {
        let unit = self.unit();
        self.progress.emit(92, "Enabling systemd service");
        self.exec.strict("systemctl", &["daemon-reload"])?;
        self.exec.best_effort("systemctl", &["stop", unit]);
        self.exec.best_effort("systemctl", &["reset-failed", unit]);
        self.exec.strict("systemctl", &["enable", "--now", unit])?;
        self.progress.emit(100, "Completed");
        Ok(())
    }

    fn uninstall(&self, purge: bool) -> StepLog {
        let mut log = StepLog::new();
        let unit = self.unit();

        log.record_command(
            format!("systemctl stop {unit}"),
            &self.exec.best_effort("systemctl", &["stop", unit]),
        );
        log.record_command(
            format!("systemctl disable {unit}"),
            &self.exec.best_effort("systemctl", &["disable", unit]),
        );
        log.record_result(
            "remove unit file",
            remove_file_if_present(&self.layout.unit_path(unit)),
        );
        log.record_command(
            "systemctl daemon-reload",
            &self.exec.best_effort("systemctl", &["daemon-reload"]),
        );
        self.exec.best_effort("systemctl", &["reset-failed", unit]);

        if purge {
            let prefix = &self.layout.install_prefix;
            log.record_result(
                format!("remove {}", prefix.display()),
                remove_tree_if_present(prefix),
            );
        }
        log
    }

    /// Reload, clear failed state and start; repair flags only affect
    /// container mode.
    fn repair(&self, _options: &RepairOptions) -> StepLog {
        let mut log = StepLog::new();
        let unit = self.unit();
        log.record_command(
            "systemctl daemon-reload",
            &self.exec.best_effort("systemctl", &["daemon-reload"]),
        );
        self.exec.best_effort("systemctl", &["reset-failed", unit]);
        log.record_command(
            format!("systemctl start {unit}"),
            &self.exec.best_effort("systemctl", &["start", unit]),
        );
        log
    }
}
