//! Service unit rendering and state queries.

use crate::command_runner::Exec;
use crate::error::ManagerError;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use tracing::info;

/// A complete unit file. Always rendered and written in full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUnit {
    pub description: String,
    pub after: Vec<String>,
    pub requires: Vec<String>,
    pub service: Vec<(String, String)>,
    pub wanted_by: String,
}

impl ServiceUnit {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            after: Vec::new(),
            requires: Vec::new(),
            service: Vec::new(),
            wanted_by: "multi-user.target".to_string(),
        }
    }

    /// Order after `unit` and fail if it is unavailable.
    pub fn requiring(mut self, unit: &str) -> Self {
        self.after.push(unit.to_string());
        self.requires.push(unit.to_string());
        self
    }

    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.service.push((key.to_string(), value.into()));
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("[Unit]\n");
        let _ = writeln!(out, "Description={}", self.description);
        if !self.after.is_empty() {
            let _ = writeln!(out, "After={}", self.after.join(" "));
        }
        if !self.requires.is_empty() {
            let _ = writeln!(out, "Requires={}", self.requires.join(" "));
        }
        out.push_str("\n[Service]\n");
        for (key, value) in &self.service {
            let _ = writeln!(out, "{key}={value}");
        }
        out.push_str("\n[Install]\n");
        let _ = writeln!(out, "WantedBy={}", self.wanted_by);
        out
    }

    /// Replace `path` with the rendered unit via a sibling temp file.
    pub fn write_to(&self, path: &Path) -> Result<(), ManagerError> {
        let dir = path
            .parent()
            .ok_or_else(|| {
                ManagerError::io(
                    format!("locating {}", path.display()),
                    std::io::Error::other("unit path has no parent directory"),
                )
            })?;
        std::fs::create_dir_all(dir)
            .map_err(|e| ManagerError::io(format!("creating {}", dir.display()), e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| ManagerError::io(format!("staging unit in {}", dir.display()), e))?;
        tmp.write_all(self.render().as_bytes())
            .map_err(|e| ManagerError::io(format!("writing {}", path.display()), e))?;
        tmp.persist(path)
            .map_err(|e| ManagerError::io(format!("replacing {}", path.display()), e.error))?;

        set_mode(path, 0o644)?;
        info!(unit = %path.display(), "Wrote service unit");
        Ok(())
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<(), ManagerError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| ManagerError::io(format!("chmod {}", path.display()), e))
}

/// `systemctl is-active <unit>`, trimmed; `unknown` when nothing was printed.
pub fn unit_state(exec: &Exec<'_>, unit: &str) -> String {
    let result = exec.best_effort("systemctl", &["is-active", unit]);
    let state = result.stdout.trim();
    if state.is_empty() {
        "unknown".to_string()
    } else {
        state.to_string()
    }
}
