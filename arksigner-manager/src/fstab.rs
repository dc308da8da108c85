//! Persisted bind-mount lines in the host mount table.

use crate::error::ManagerError;
use std::io::{ErrorKind, Write as _};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// `source` exposed at `target` through a bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindBinding {
    pub source: PathBuf,
    pub target: PathBuf,
}

impl BindBinding {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    pub fn fstab_line(&self) -> String {
        format!(
            "{} {} none bind 0 0",
            self.source.display(),
            self.target.display()
        )
    }
}

/// A mount table file, edited line by line.
#[derive(Debug, Clone)]
pub struct MountTable {
    path: PathBuf,
}

impl MountTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<String, ManagerError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(ManagerError::io(
                format!("reading {}", self.path.display()),
                err,
            )),
        }
    }

    /// Replace the table through a sibling temp file so a failed write
    /// never leaves it truncated. The existing mode is carried over.
    fn write(&self, content: &str) -> Result<(), ManagerError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mode = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.permissions().mode() & 0o7777,
            Err(err) if err.kind() == ErrorKind::NotFound => 0o644,
            Err(err) => {
                return Err(ManagerError::io(
                    format!("reading {}", self.path.display()),
                    err,
                ));
            }
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| ManagerError::io(format!("staging {}", self.path.display()), e))?;
        tmp.write_all(content.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| ManagerError::io(format!("writing {}", self.path.display()), e))?;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))
            .map_err(|e| ManagerError::io(format!("chmod {}", tmp.path().display()), e))?;
        tmp.persist(&self.path)
            .map_err(|e| ManagerError::io(format!("replacing {}", self.path.display()), e.error))?;
        Ok(())
    }

    pub fn contains(&self, line: &str) -> Result<bool, ManagerError> {
        let wanted = line.trim();
        Ok(self.read()?.lines().any(|existing| existing.trim() == wanted))
    }

    /// Append `line` unless an identical one is already present.
    ///
    /// Returns whether the file changed.
    pub fn ensure(&self, line: &str) -> Result<bool, ManagerError> {
        let mut content = self.read()?;
        let wanted = line.trim();
        if content.lines().any(|existing| existing.trim() == wanted) {
            debug!(table = %self.path.display(), "Mount entry already present");
            return Ok(false);
        }
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(wanted);
        content.push('\n');
        self.write(&content)?;
        info!(table = %self.path.display(), entry = wanted, "Persisted mount entry");
        Ok(true)
    }

    /// Drop every line exactly equal to `line`. Returns whether the file changed.
    pub fn remove(&self, line: &str) -> Result<bool, ManagerError> {
        let content = self.read()?;
        let wanted = line.trim();
        let kept: Vec<&str> = content
            .lines()
            .filter(|existing| existing.trim() != wanted)
            .collect();
        if kept.len() == content.lines().count() {
            return Ok(false);
        }
        let mut rewritten = kept.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }
        self.write(&rewritten)?;
        info!(table = %self.path.display(), entry = wanted, "Removed mount entry");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn binding() -> BindBinding {
        BindBinding::new(
            "/var/lib/machines/debian-arksigner/usr/bin/arksigner",
            "/opt/arksigner",
        )
    }

    #[test]
    fn fstab_line_format() {
        assert_eq!(
            binding().fstab_line(),
            "/var/lib/machines/debian-arksigner/usr/bin/arksigner /opt/arksigner none bind 0 0"
        );
    }

    #[test]
    fn ensure_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let table = MountTable::new(dir.path().join("fstab"));
        let line = binding().fstab_line();

        assert!(table.ensure(&line).unwrap());
        assert!(!table.ensure(&line).unwrap());
        assert!(!table.ensure(&format!("  {line}  ")).unwrap());

        let content = std::fs::read_to_string(table.path()).unwrap();
        assert_eq!(content.matches(&line).count(), 1);
    }

    #[test]
    fn ensure_fixes_missing_trailing_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fstab");
        std::fs::write(&path, "UUID=abc / ext4 defaults 0 1").unwrap();
        let table = MountTable::new(&path);
        table.ensure(&binding().fstab_line()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            format!("UUID=abc / ext4 defaults 0 1\n{}\n", binding().fstab_line())
        );
    }

    #[test]
    fn remove_keeps_other_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fstab");
        let line = binding().fstab_line();
        std::fs::write(&path, format!("UUID=abc / ext4 defaults 0 1\n{line}\ntmpfs /tmp tmpfs 0 0\n"))
            .unwrap();
        let table = MountTable::new(&path);

        assert!(table.remove(&line).unwrap());
        assert!(!table.remove(&line).unwrap());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "UUID=abc / ext4 defaults 0 1\ntmpfs /tmp tmpfs 0 0\n"
        );
    }

    #[test]
    fn remove_last_entry_leaves_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fstab");
        let line = binding().fstab_line();
        std::fs::write(&path, format!("{line}\n")).unwrap();

        MountTable::new(&path).remove(&line).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn rewrite_keeps_mode_and_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fstab");
        std::fs::write(&path, "UUID=abc / ext4 defaults 0 1\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();
        let table = MountTable::new(&path);
        let line = binding().fstab_line();

        table.ensure(&line).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().permissions().mode() & 0o7777, 0o640);
        table.remove(&line).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().permissions().mode() & 0o7777, 0o640);

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "UUID=abc / ext4 defaults 0 1\n"
        );
    }

    #[test]
    fn new_table_is_world_readable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fstab");
        MountTable::new(&path).ensure(&binding().fstab_line()).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().permissions().mode() & 0o7777, 0o644);
    }

    #[test]
    fn missing_table_reads_empty() {
        let dir = TempDir::new().unwrap();
        let table = MountTable::new(dir.path().join("absent"));
        assert!(!table.contains("x").unwrap());
        assert!(!table.remove("x").unwrap());
    }
}
