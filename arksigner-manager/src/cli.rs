//! CLI argument definitions for the privileged backend.

use crate::config::{
    Action, DeploymentMode, FirefoxTarget, InstallConfig, ManagerConfig, RepairOptions, Request,
};
use crate::privileged::{IdentityHints, home_for, home_of, invoking_user};
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "arksigner-manager-cli")]
#[command(about = "Install, upgrade, repair and remove the ArkSigner signing daemon")]
#[command(version)]
pub struct Cli {
    /// Deployment mode
    ///
    /// - container: Debian rootfs under systemd-nspawn, bound to /opt/arksigner
    /// - native: package unpacked directly into /opt/arksigner
    #[arg(long, value_enum, default_value_t = DeploymentMode::Container)]
    pub mode: DeploymentMode,

    #[arg(long, value_enum)]
    pub action: Action,

    /// .deb URL or local path (use 'auto' to find the latest release)
    #[arg(long, value_name = "PATH|URL|auto")]
    pub deb: Option<String>,

    /// container: debootstrap suite
    #[arg(long)]
    pub suite: Option<String>,

    /// container: debootstrap mirror
    #[arg(long)]
    pub mirror: Option<String>,

    /// container: machine name
    #[arg(long)]
    pub machine: Option<String>,

    /// container: recreate the rootfs from scratch (install only)
    #[arg(long)]
    pub recreate: bool,

    /// Best-effort: add the PKCS#11 module to Firefox profiles (modutil)
    #[arg(long)]
    pub firefox_add: bool,

    /// native: opt in to setting RPATH to $ORIGIN/libs with patchelf
    #[arg(long)]
    pub native_rpath: bool,

    /// repair: SIGKILL the container before tearing it down
    #[arg(long)]
    pub force_terminate: bool,

    /// repair: drop and rewrite the fstab bind entry
    #[arg(long)]
    pub recreate_mounts: bool,

    /// repair: reload systemd and clear failed state
    #[arg(long)]
    pub clear_cache: bool,

    /// Print the status snapshot as JSON
    #[arg(long)]
    pub json: bool,

    /// User whose Firefox profiles get the module (default: invoking user)
    #[arg(long)]
    pub user: Option<String>,

    /// Home directory of --user
    #[arg(long)]
    pub home: Option<PathBuf>,
}

impl Cli {
    /// Merge flags over the config file and built-in defaults.
    pub fn into_request(self, config: &ManagerConfig, hints: &IdentityHints) -> Request {
        let install = InstallConfig {
            mode: self.mode,
            package_source: self.deb.unwrap_or_else(|| config.deb().to_string()),
            machine_name: self.machine.unwrap_or_else(|| config.machine().to_string()),
            suite: self.suite.unwrap_or_else(|| config.suite().to_string()),
            mirror: self.mirror.unwrap_or_else(|| config.mirror().to_string()),
            recreate: self.recreate,
            native_rpath_opt_in: self.native_rpath,
        };

        let firefox = self.firefox_add.then(|| {
            let invoking = invoking_user(hints);
            let (user, home) = match (self.user, self.home) {
                (Some(user), Some(home)) => (user, home),
                (None, Some(home)) => (invoking.name, home),
                (Some(user), None) => {
                    let home = home_of(&user).unwrap_or_else(|| PathBuf::from("/home").join(&user));
                    (user, home)
                }
                (None, None) => {
                    let home = home_for(&invoking);
                    (invoking.name, home)
                }
            };
            FirefoxTarget { user, home }
        });

        Request {
            action: self.action,
            install,
            repair: RepairOptions {
                force_terminate: self.force_terminate,
                recreate_mounts: self.recreate_mounts,
                clear_cache: self.clear_cache,
            },
            firefox,
            json: self.json,
        }
    }
}
