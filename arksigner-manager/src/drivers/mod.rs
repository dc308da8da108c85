//! Mode drivers: one implementation of the lifecycle contract per deployment mode.
//!
//! The orchestrator picks a driver once with [`driver_for`] and never
//! branches on the mode again.

pub mod container;
pub mod native;

pub use container::ContainerDriver;
pub use native::NativeDriver;

use crate::command_runner::Exec;
use crate::config::{DeploymentMode, InstallConfig, RepairOptions};
use crate::error::ManagerError;
use crate::layout::HostLayout;
use crate::outcome::StepLog;
use crate::progress::Progress;
use std::path::Path;

/// How an install treats an existing deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallKind {
    /// Fresh install; `recreate` wipes the container rootfs first.
    Install { recreate: bool },
    /// Keep whatever base exists.
    Upgrade,
}

impl InstallKind {
    pub fn recreate(self) -> bool {
        matches!(self, InstallKind::Install { recreate: true })
    }
}

pub trait ModeDriver {
    fn mode(&self) -> DeploymentMode;

    fn unit_name(&self) -> &str;

    /// Put the package contents in place and pass the module gate.
    ///
    /// Returns informational lines for the final report.
    fn install(&self, package: &Path, kind: InstallKind) -> Result<Vec<String>, ManagerError>;

    /// Regenerate the unit file in full.
    fn write_service_unit(&self) -> Result<(), ManagerError>;

    /// Reload the unit cache, clear the old instance, enable and start.
    fn enable_and_start(&self) -> Result<(), ManagerError>;

    fn uninstall(&self, purge: bool) -> StepLog;

    fn repair(&self, options: &RepairOptions) -> StepLog;
}

pub fn driver_for<'a>(
    config: &'a InstallConfig,
    exec: Exec<'a>,
    layout: &'a HostLayout,
    progress: &'a Progress,
) -> Box<dyn ModeDriver + 'a> {
    match config.mode {
        DeploymentMode::Container => Box::new(ContainerDriver::new(
            exec,
            layout,
            progress,
            &config.machine_name,
            &config.suite,
            &config.mirror,
        )),
        DeploymentMode::Native => Box::new(NativeDriver::new(
            exec,
            layout,
            progress,
            config.native_rpath_opt_in,
        )),
    }
}

/// Remove a file, treating absence as success.
pub(crate) fn remove_file_if_present(path: &Path) -> Result<(), ManagerError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ManagerError::io(format!("removing {}", path.display()), err)),
    }
}

/// Remove a directory tree, treating absence as success.
pub(crate) fn remove_tree_if_present(path: &Path) -> Result<(), ManagerError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ManagerError::io(format!("removing {}", path.display()), err)),
    }
}
