//! arksigner-manager: lifecycle management for the ArkSigner signing daemon.
//!
//! Installs, upgrades, repairs and removes the daemon and its PKCS#11
//! module in one of two deployment modes:
//!
//! - **container**: a Debian rootfs under `systemd-nspawn`, with the daemon
//!   tree bind-mounted onto `/opt/arksigner`
//! - **native**: the package unpacked directly into `/opt/arksigner`
//!
//! Both modes expose the module at the same host path, so consumers such
//! as the Firefox helper never need to know which one is live.
//!
//! ## Re-running is recovery
//!
//! Each step either checks for its end state first or is safe to repeat.
//! A failed install is fixed by running install again; there is no
//! separate resume state.

pub mod cli;
pub mod command_runner;
pub mod config;
pub mod drivers;
pub mod error;
pub mod firefox;
pub mod frontend;
pub mod fstab;
pub mod layout;
pub mod orchestrator;
pub mod outcome;
pub mod output;
pub mod privileged;
pub mod progress;
pub mod status;
pub mod systemd;

pub use cli::Cli;
pub use error::ManagerError;
pub use layout::HostLayout;
pub use orchestrator::Orchestrator;
