//! Fixed host paths and unit names.
//!
//! Drivers never hard-code a host path; they take a [`HostLayout`] so the
//! whole tree can be rebased under a scratch directory in tests.

use std::path::{Path, PathBuf};

pub const INSTALL_PREFIX: &str = "/opt/arksigner";
pub const MODULE_RELPATH: &str = "drivers/akis/x64/libakisp11.so";
pub const CONTAINER_UNIT: &str = "arksigner-nspawn.service";
pub const NATIVE_UNIT: &str = "arksigner-native.service";
pub const SOCKET_UNIT: &str = "pcscd.socket";

/// Marker inside a rootfs meaning "base system present".
pub const BASE_MARKER: &str = "etc/debian_version";
/// Daemon binary inside the container rootfs.
pub const CONTAINER_PAYLOAD: &str = "usr/bin/arksigner";
/// Daemon tree inside the extracted native package.
pub const PACKAGE_PAYLOAD: &str = "usr/bin/arksigner";

/// Executables under the prefix that must carry the exec bit.
pub const ENTRY_POINTS: [&str; 2] = ["arksigner-universal", "arksigner-service"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    pub install_prefix: PathBuf,
    pub module_relpath: PathBuf,
    pub unit_dir: PathBuf,
    pub machines_dir: PathBuf,
    pub fstab: PathBuf,
    pub unix_export_dir: PathBuf,
    pub download_path: PathBuf,
    pub fallback_lib_dir: PathBuf,
    pub container_unit: String,
    pub native_unit: String,
    pub socket_unit: String,
}

impl Default for HostLayout {
    fn default() -> Self {
        Self {
            install_prefix: PathBuf::from(INSTALL_PREFIX),
            module_relpath: PathBuf::from(MODULE_RELPATH),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            machines_dir: PathBuf::from("/var/lib/machines"),
            fstab: PathBuf::from("/etc/fstab"),
            unix_export_dir: PathBuf::from("/run/systemd/nspawn/unix-export"),
            download_path: PathBuf::from(arksigner_fetch::resolver::DEFAULT_DESTINATION),
            fallback_lib_dir: PathBuf::from("/usr/local/lib64"),
            container_unit: CONTAINER_UNIT.to_string(),
            native_unit: NATIVE_UNIT.to_string(),
            socket_unit: SOCKET_UNIT.to_string(),
        }
    }
}

impl HostLayout {
    /// The default layout with every absolute path moved under `root`.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let rebase = |path: &Path| root.join(path.strip_prefix("/").unwrap_or(path));
        let base = Self::default();
        Self {
            install_prefix: rebase(&base.install_prefix),
            unit_dir: rebase(&base.unit_dir),
            machines_dir: rebase(&base.machines_dir),
            fstab: rebase(&base.fstab),
            unix_export_dir: rebase(&base.unix_export_dir),
            download_path: rebase(&base.download_path),
            fallback_lib_dir: rebase(&base.fallback_lib_dir),
            ..base
        }
    }

    pub fn module_path(&self) -> PathBuf {
        self.install_prefix.join(&self.module_relpath)
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.install_prefix.join("libs")
    }

    /// Directory holding the PKCS#11 module itself.
    pub fn module_dir(&self) -> PathBuf {
        self.module_path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.install_prefix.clone())
    }

    pub fn unit_path(&self, unit: &str) -> PathBuf {
        self.unit_dir.join(unit)
    }

    pub fn rootfs(&self, machine: &str) -> PathBuf {
        self.machines_dir.join(machine)
    }

    pub fn base_marker(&self, machine: &str) -> PathBuf {
        self.rootfs(machine).join(BASE_MARKER)
    }

    pub fn container_payload(&self, machine: &str) -> PathBuf {
        self.rootfs(machine).join(CONTAINER_PAYLOAD)
    }

    pub fn unix_export(&self, machine: &str) -> PathBuf {
        self.unix_export_dir.join(machine)
    }

    pub fn entry_points(&self) -> Vec<PathBuf> {
        ENTRY_POINTS
            .iter()
            .map(|name| self.install_prefix.join(name))
            .collect()
    }
}
