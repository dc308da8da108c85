//! Container mode: a Debian rootfs run under systemd-nspawn.
//!
//! The daemon lives inside `/var/lib/machines/<machine>`; its install tree
//! is bind-mounted onto the host prefix so consumers of the PKCS#11 module
//! see the same path in either mode.

use super::{InstallKind, ModeDriver, remove_file_if_present, remove_tree_if_present};
use crate::command_runner::{CommandOptions, Exec, Invocation, Strictness};
use crate::config::{DeploymentMode, RepairOptions};
use crate::error::ManagerError;
use crate::fstab::{BindBinding, MountTable};
use crate::layout::HostLayout;
use crate::outcome::{StepLog, StepOutcome};
use crate::progress::Progress;
use crate::systemd::ServiceUnit;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where the package is staged inside the rootfs.
const STAGED_PACKAGE: &str = "root/arksigner.deb";

/// In-container install sequence. `dpkg -i` is allowed to fail the first
/// time because dependencies are only pulled in by `apt-get -f install`.
const INSTALL_STEPS: [(&str, Strictness); 4] = [
    ("apt-get update -y", Strictness::Strict),
    ("dpkg -i /root/arksigner.deb", Strictness::BestEffort),
    ("apt-get -f install -y", Strictness::Strict),
    ("dpkg -i /root/arksigner.deb", Strictness::BestEffort),
];

pub struct ContainerDriver<'a> {
    exec: Exec<'a>,
    layout: &'a HostLayout,
    progress: &'a Progress,
    machine: &'a str,
    suite: &'a str,
    mirror: &'a str,
}

impl<'a> ContainerDriver<'a> {
    pub fn new(
        exec: Exec<'a>,
        layout: &'a HostLayout,
        progress: &'a Progress,
        machine: &'a str,
        suite: &'a str,
        mirror: &'a str,
    ) -> Self {
        Self {
            exec,
            layout,
            progress,
            machine,
            suite,
            mirror,
        }
    }

    fn rootfs(&self) -> PathBuf {
        self.layout.rootfs(self.machine)
    }

    fn unit(&self) -> &str {
        &self.layout.container_unit
    }

    fn binding(&self) -> BindBinding {
        BindBinding::new(
            self.layout.container_payload(self.machine),
            &self.layout.install_prefix,
        )
    }

    fn mount_table(&self) -> MountTable {
        MountTable::new(&self.layout.fstab)
    }

    fn require_tool(&self, tool: &str) -> Result<(), ManagerError> {
        if self.exec.has_program(tool) {
            Ok(())
        } else {
            Err(ManagerError::ToolMissing(tool.to_string()))
        }
    }

    /// Make sure a bootstrapped base system exists.
    ///
    /// Returns `true` when a bootstrap ran, `false` when the marker file
    /// showed the base was already present.
    pub fn ensure_base(&self, recreate: bool) -> Result<bool, ManagerError> {
        let rootfs = self.rootfs();

        if recreate && rootfs.exists() {
            self.progress.emit(18, "Recreating rootfs");
            let mut log = StepLog::new();
            self.terminate(&mut log);
            remove_tree_if_present(&rootfs)?;
            info!(rootfs = %rootfs.display(), "Removed rootfs for recreation");
        }

        if self.layout.base_marker(self.machine).exists() {
            debug!(rootfs = %rootfs.display(), "Base system already present");
            return Ok(false);
        }

        self.require_tool("debootstrap")?;
        self.progress.emit(20, "Preparing Debian rootfs (debootstrap)");
        std::fs::create_dir_all(&rootfs)
            .map_err(|e| ManagerError::io(format!("creating {}", rootfs.display()), e))?;

        let target = rootfs.to_string_lossy();
        self.exec
            .strict("debootstrap", &[self.suite, &target, self.mirror])?;
        self.progress.emit(45, "Debian rootfs ready");
        info!(suite = self.suite, rootfs = %rootfs.display(), "Bootstrapped base system");
        Ok(true)
    }

    /// Copy the package into the rootfs and install it with the two-pass
    /// dpkg/apt sequence.
    pub fn install_package(&self, package: &Path) -> Result<(), ManagerError> {
        self.require_tool("systemd-nspawn")?;
        self.progress.emit(55, "Installing ArkSigner inside container");

        let rootfs = self.rootfs();
        let staged = rootfs.join(STAGED_PACKAGE);
        if let Some(home) = staged.parent() {
            std::fs::create_dir_all(home)
                .map_err(|e| ManagerError::io(format!("creating {}", home.display()), e))?;
        }
        std::fs::copy(package, &staged).map_err(|e| {
            ManagerError::io(
                format!("copying {} into {}", package.display(), staged.display()),
                e,
            )
        })?;

        let root = rootfs.to_string_lossy();
        for (step, strictness) in INSTALL_STEPS {
            let script = format!("export DEBIAN_FRONTEND=noninteractive; {step}");
            let args: [&str; 7] = ["--quiet", "--pipe", "-D", &root, "/bin/bash", "-c", &script];
            let result = self.exec.execute(
                Invocation::Argv("systemd-nspawn", &args),
                strictness,
                &CommandOptions::default(),
            )?;
            if !result.success() {
                debug!(step, code = result.exit_code, "Tolerated in-container failure");
            }
        }

        self.progress.emit(75, "ArkSigner installed in container");
        Ok(())
    }

    /// Bind the in-container install tree onto the host prefix and persist it.
    pub fn bind_into_host(&self) -> Result<(), ManagerError> {
        let prefix = &self.layout.install_prefix;
        self.progress
            .emit(85, &format!("Binding ArkSigner to {}", prefix.display()));

        let binding = self.binding();
        if !binding.source.exists() {
            return Err(ManagerError::missing(
                "container payload (install failed)",
                &binding.source,
            ));
        }

        std::fs::create_dir_all(prefix)
            .map_err(|e| ManagerError::io(format!("creating {}", prefix.display()), e))?;

        let target = prefix.to_string_lossy();
        let source = binding.source.to_string_lossy();
        self.exec.best_effort("umount", &["-lf", &target]);
        self.exec.strict("mount", &["--bind", &source, &target])?;
        self.mount_table().ensure(&binding.fstab_line())?;

        let module = self.layout.module_path();
        if !module.exists() {
            return Err(ManagerError::missing("PKCS#11 module", module));
        }
        info!(source = %source, target = %target, "Bound container payload");
        Ok(())
    }

    pub fn service_unit(&self) -> ServiceUnit {
        let exec_start = format!(
            "/usr/bin/systemd-nspawn -D {} --machine={} --bind=/run/pcscd:/run/pcscd \
             --bind-ro=/dev/bus/usb:/dev/bus/usb --console=passive --keep-unit \
             /bin/bash -lc \"/etc/init.d/arksignerd start; exec sleep infinity\"",
            self.rootfs().display(),
            self.machine,
        );
        ServiceUnit::new("ArkSigner Debian Container (nspawn)")
            .requiring(&self.layout.socket_unit)
            .set("Type", "simple")
            .set("ExecStart", exec_start)
            .set("KillMode", "mixed")
            .set("Restart", "always")
            .set("RestartSec", "5")
    }

    /// Stop the unit, terminate the machine and clear its export directory.
    pub fn terminate(&self, log: &mut StepLog) {
        let unit = self.unit();
        log.record_command(
            format!("systemctl stop {unit}"),
            &self.exec.best_effort("systemctl", &["stop", unit]),
        );
        log.record_command(
            format!("machinectl terminate {}", self.machine),
            &self.exec.best_effort("machinectl", &["terminate", self.machine]),
        );
        self.cleanup_unix_export(log);
    }

    /// Unmount and delete the nspawn unix-export directory left behind by
    /// an abnormal exit. Must run before the host prefix is unmounted.
    pub fn cleanup_unix_export(&self, log: &mut StepLog) {
        let export = self.layout.unix_export(self.machine);
        let path = export.to_string_lossy();
        // Usually not mounted at all.
        let result = self.exec.best_effort("umount", &["-lf", &path]);
        debug!(export = %path, code = result.exit_code, "Unmounted unix-export");
        log.record_result(
            format!("remove {path}"),
            remove_tree_if_present(&export),
        );
    }

    fn force_kill(&self, log: &mut StepLog) {
        log.record_command(
            format!("machinectl kill {}", self.machine),
            &self
                .exec
                .best_effort("machinectl", &["kill", "--signal=SIGKILL", self.machine]),
        );
    }

    fn unmount_prefix(&self) {
        let target = self.layout.install_prefix.to_string_lossy();
        // "not mounted" is the desired state, so the exit code is not recorded.
        let result = self.exec.best_effort("umount", &["-lf", &target]);
        debug!(target = %target, code = result.exit_code, "Unmounted host prefix");
    }

    fn remove_mount_entry(&self, log: &mut StepLog) {
        let line = self.binding().fstab_line();
        log.record_result(
            format!("remove entry from {}", self.layout.fstab.display()),
            self.mount_table().remove(&line).map(|_| ()),
        );
    }
}

impl ModeDriver for ContainerDriver<'_> {
    fn mode(&self) -> DeploymentMode {
        DeploymentMode::Container
    }

    fn unit_name(&self) -> &str {
        self.unit()
    }

    fn install(&self, package: &Path, kind: InstallKind) -> Result<Vec<String>, ManagerError> {
        let bootstrapped = self.ensure_base(kind.recreate())?;
        self.install_package(package)?;
        self.bind_into_host()?;

        let base = if bootstrapped {
            "Debian base bootstrapped"
        } else {
            "Debian base reused"
        };
        Ok(vec![format!("{base} at {}", self.rootfs().display())])
    }

    fn write_service_unit(&self) -> Result<(), ManagerError> {
        self.service_unit()
            .write_to(&self.layout.unit_path(self.unit()))
    }

    fn enable_and_start(&self) -> Result<(), ManagerError> {
        self.progress.emit(92, "Enabling systemd service");
        self.exec.strict("systemctl", &["daemon-reload"])?;

        // A container that was never running is fine here.
        let mut teardown = StepLog::new();
        self.terminate(&mut teardown);

        self.exec.strict("systemctl", &["enable", "--now", self.unit()])?;
        self.progress.emit(100, "Completed");
        Ok(())
    }

    fn uninstall(&self, purge: bool) -> StepLog {
        let mut log = StepLog::new();
        let unit = self.unit();

        self.terminate(&mut log);
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

        self.unmount_prefix();
        self.remove_mount_entry(&mut log);

        if purge {
            let rootfs = self.rootfs();
            log.record_result(
                format!("remove {}", rootfs.display()),
                remove_tree_if_present(&rootfs),
            );
        }
        log
    }

    fn repair(&self, options: &RepairOptions) -> StepLog {
        let mut log = StepLog::new();
        let unit = self.unit();

        if options.force_terminate {
            self.force_kill(&mut log);
        }
        self.terminate(&mut log);
        self.unmount_prefix();

        if options.recreate_mounts {
            self.remove_mount_entry(&mut log);
        }

        if self.layout.container_payload(self.machine).exists() {
            log.record_result("restore bind mount", self.bind_into_host());
        } else {
            log.record(
                "restore bind mount",
                StepOutcome::Failed("container payload missing; reinstall required".into()),
            );
        }

        if options.clear_cache {
            log.record_command(
                "systemctl daemon-reload",
                &self.exec.best_effort("systemctl", &["daemon-reload"]),
            );
            self.exec.best_effort("systemctl", &["reset-failed", unit]);
        }

        log.record_command(
            format!("systemctl start {unit}"),
            &self.exec.best_effort("systemctl", &["start", unit]),
        );
        log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::MockCommandRunner;
    use tempfile::TempDir;

    #[test]
    fn unit_launches_container_and_blocks() {
        let dir = TempDir::new().unwrap();
        let layout = HostLayout::rooted_at(dir.path());
        let mock = MockCommandRunner::new();
        let (progress, _) = Progress::capture();
        let driver = ContainerDriver::new(
            Exec::new(&mock),
            &layout,
            &progress,
            "debian-arksigner",
            "bullseye",
            "http://deb.debian.org/debian",
        );

        let text = driver.service_unit().render();
        assert!(text.contains("Description=ArkSigner Debian Container (nspawn)\n"));
        assert!(text.contains("After=pcscd.socket\nRequires=pcscd.socket\n"));
        assert!(text.contains("--machine=debian-arksigner"));
        assert!(text.contains("--keep-unit /bin/bash -lc \"/etc/init.d/arksignerd start; exec sleep infinity\""));
        assert!(text.contains("KillMode=mixed\nRestart=always\nRestartSec=5\n"));
        assert!(text.contains(&format!(
            "-D {}",
            layout.rootfs("debian-arksigner").display()
        )));
    }
}
