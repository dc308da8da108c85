//! Read-only status snapshot.
//!
//! Only ever runs query commands (`systemctl is-active`, `machinectl list`,
//! `ldd`); nothing in this module changes host state.

use crate::command_runner::{CommandRunner, Exec};
use crate::config::DeploymentMode;
use crate::firefox::{DependencyCheck, check_module_dependencies};
use crate::layout::HostLayout;
use crate::systemd::unit_state;
use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize)]
pub struct UnitState {
    pub unit: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerStatus {
    pub machine: String,
    pub rootfs: PathBuf,
    pub base_present: bool,
    /// Output of `machinectl list`, if it printed anything.
    pub machines: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub timestamp: String,
    pub mode: DeploymentMode,
    pub module: PathBuf,
    pub module_present: bool,
    pub socket: UnitState,
    pub service: UnitState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerStatus>,
    pub dependencies: DependencyCheck,
}

impl StatusReport {
    pub fn gather(
        runner: &dyn CommandRunner,
        layout: &HostLayout,
        mode: DeploymentMode,
        machine: &str,
    ) -> Self {
        let exec = Exec::new(runner);
        let query = |unit: &str| UnitState {
            unit: unit.to_string(),
            state: unit_state(&exec, unit),
        };

        let (service, container) = match mode {
            DeploymentMode::Container => {
                let listing = exec.best_effort("machinectl", &["list"]);
                let machines = Some(listing.stdout.trim().to_string()).filter(|s| !s.is_empty());
                (
                    query(&layout.container_unit),
                    Some(ContainerStatus {
                        machine: machine.to_string(),
                        rootfs: layout.rootfs(machine),
                        base_present: layout.base_marker(machine).exists(),
                        machines,
                    }),
                )
            }
            DeploymentMode::Native => (query(&layout.native_unit), None),
        };

        let module = layout.module_path();
        Self {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            mode,
            module_present: module.exists(),
            module,
            socket: query(&layout.socket_unit),
            service,
            container,
            dependencies: check_module_dependencies(runner, layout),
        }
    }

    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("[{}] ArkSigner Manager status", self.timestamp),
            format!("Mode:    {}", self.mode),
            format!("Module:  {}", self.module.display()),
            format!("{}: {}", self.socket.unit, self.socket.state),
        ];

        if let Some(container) = &self.container {
            lines.push(format!("Machine: {}", container.machine));
            lines.push(format!("Rootfs:  {}", container.rootfs.display()));
        }
        lines.push(format!("{}: {}", self.service.unit, self.service.state));
        lines.push(format!("PKCS#11: {}", self.dependencies.summary()));

        if let Some(machines) = self.container.as_ref().and_then(|c| c.machines.as_ref()) {
            lines.push(String::new());
            lines.push(machines.clone());
        }

        let mut out = lines.join("\n").trim().to_string();
        out.push('\n');
        out
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize status")
    }
}

/// Which mode's unit is active right now, container first.
pub fn detect_mode(runner: &dyn CommandRunner, layout: &HostLayout) -> Option<DeploymentMode> {
    let exec = Exec::new(runner);
    [
        (DeploymentMode::Container, &layout.container_unit),
        (DeploymentMode::Native, &layout.native_unit),
    ]
    .into_iter()
    .find(|(_, unit)| unit_state(&exec, unit) == "active")
    .map(|(mode, _)| mode)
}
