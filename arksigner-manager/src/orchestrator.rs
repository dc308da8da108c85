//! One backend invocation, start to finish.
//!
//! There is no resumable workflow: a failed install is recovered by
//! running install again, which works because every driver step is
//! idempotent.

use crate::command_runner::{CommandRunner, Exec};
use crate::config::{Action, Request};
use crate::drivers::{InstallKind, ModeDriver, driver_for};
use crate::firefox;
use crate::layout::HostLayout;
use crate::outcome::StepLog;
use crate::progress::Progress;
use crate::status::StatusReport;
use anyhow::{Context, Result};
use arksigner_fetch::{FetchError, PackageSource, ResolvedPackage, Resolver};
use chrono::Local;
use tracing::{info, warn};

/// Turns a `--deb` argument into a staged local file.
pub trait PackageResolver {
    fn resolve(&self, reference: &str) -> Result<ResolvedPackage, FetchError>;
}

impl PackageResolver for Resolver {
    fn resolve(&self, reference: &str) -> Result<ResolvedPackage, FetchError> {
        Resolver::resolve(self, reference)
    }
}

pub struct Orchestrator<'a> {
    runner: &'a dyn CommandRunner,
    layout: &'a HostLayout,
    progress: &'a Progress,
    resolver: &'a dyn PackageResolver,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        layout: &'a HostLayout,
        progress: &'a Progress,
        resolver: &'a dyn PackageResolver,
    ) -> Self {
        Self {
            runner,
            layout,
            progress,
            resolver,
        }
    }

    /// Run `request` and return the text to print on success.
    pub fn run(&self, request: &Request) -> Result<String> {
        let exec = Exec::new(self.runner);
        info!(action = %request.action, mode = %request.mode(), "Starting");

        if request.action.is_mutating() {
            let socket = &self.layout.socket_unit;
            let result = exec.best_effort("systemctl", &["enable", "--now", socket]);
            if !result.success() {
                warn!(unit = %socket, "Could not enable smartcard socket: {}", result.summary());
            }
        }

        let driver = driver_for(&request.install, exec, self.layout, self.progress);

        let mut out = match request.action {
            Action::Status => self.status_text(request)?,
            Action::Install | Action::Upgrade => self.install(request, driver.as_ref())?,
            Action::Repair => {
                let log = driver.repair(&request.repair);
                let mut out = self.status_text(request)?;
                append_failures(&mut out, &log);
                out
            }
            Action::Uninstall | Action::Purge => {
                let purge = request.action == Action::Purge;
                let log = driver.uninstall(purge);
                let mut out = format!(
                    "[{}] Uninstalled. mode={} purge={purge}\n",
                    Local::now().format("%Y-%m-%d %H:%M:%S"),
                    driver.mode()
                );
                append_failures(&mut out, &log);
                // Nothing left to register once the module is gone.
                return Ok(out);
            }
        };

        if let Some(target) = &request.firefox {
            out.push('\n');
            out.push_str(&firefox::register(
                self.runner,
                self.layout,
                &target.user,
                &target.home,
            ));
        }
        Ok(out)
    }

    fn install(&self, request: &Request, driver: &dyn ModeDriver) -> Result<String> {
        let reference = request.install.package_source.as_str();
        let package = self.resolve_package(reference)?;

        let kind = match request.action {
            Action::Install => InstallKind::Install {
                recreate: request.install.recreate,
            },
            _ => InstallKind::Upgrade,
        };

        let notes = driver
            .install(&package.path, kind)
            .with_context(|| format!("{} install failed", driver.mode()))?;
        driver
            .write_service_unit()
            .with_context(|| format!("Failed to write {}", driver.unit_name()))?;
        driver
            .enable_and_start()
            .with_context(|| format!("Failed to enable {}", driver.unit_name()))?;
        info!(unit = driver.unit_name(), "Service enabled");

        let mut out = self.status_text(request)?;
        if !notes.is_empty() {
            out.push('\n');
            for note in notes {
                out.push_str(&note);
                out.push('\n');
            }
        }
        Ok(out)
    }

    fn resolve_package(&self, reference: &str) -> Result<ResolvedPackage> {
        let auto = matches!(reference.parse::<PackageSource>(), Ok(PackageSource::Auto));
        if auto {
            self.progress.note("Auto-detecting latest ArkSigner version...");
        }
        self.progress.emit(5, "Resolving ArkSigner package");
        if PackageSource::is_url(reference) || auto {
            self.progress.emit(8, "Downloading ArkSigner .deb");
        }

        let package = self.resolver.resolve(reference).map_err(|err| match err {
            FetchError::NoVersionFound(_) if auto => anyhow::Error::new(err)
                .context("Failed to auto-detect latest version; specify --deb manually"),
            err => anyhow::Error::new(err).context(format!("Cannot use package {reference}")),
        })?;

        if let Some(version) = &package.version {
            self.progress.note(&format!("Using: {} ({version})", package.origin));
        }
        self.progress
            .note(&format!("Package sha256: {}", package.sha256));
        self.progress.emit(15, "Package ready");
        Ok(package)
    }

    fn status_text(&self, request: &Request) -> Result<String> {
        let report = StatusReport::gather(
            self.runner,
            self.layout,
            request.mode(),
            &request.install.machine_name,
        );
        if request.json {
            let mut json = report.to_json()?;
            json.push('\n');
            Ok(json)
        } else {
            Ok(report.render())
        }
    }
}

fn append_failures(out: &mut String, log: &StepLog) {
    let failures = log.render_failures();
    if failures.is_empty() {
        return;
    }
    out.push_str("\nSteps that did not complete (ignored):\n");
    for failure in failures {
        out.push_str("  ");
        out.push_str(&failure);
        out.push('\n');
    }
}
