use std::path::PathBuf;
use thiserror::Error;

/// Fatal conditions that abort an install or upgrade.
///
/// Cleanup paths (repair, uninstall) never produce these; they record
/// failures in a [`StepLog`](crate::outcome::StepLog) instead.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("must run as root (try pkexec or sudo)")]
    NotRoot,

    #[error("required tool '{0}' is not installed")]
    ToolMissing(String),

    #[error("{what} not found at {}", .path.display())]
    MissingArtifact { what: String, path: PathBuf },

    #[error("invalid package: {0}")]
    InvalidPackage(String),

    #[error("command failed ({code}): {command}{}", render_streams(.stdout, .stderr))]
    CommandFailed {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("could not launch {command}: {reason}")]
    Launch { command: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ManagerError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn missing(what: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::MissingArtifact {
            what: what.into(),
            path: path.into(),
        }
    }
}

fn render_streams(stdout: &str, stderr: &str) -> String {
    let mut out = String::new();
    if !stdout.trim().is_empty() {
        out.push_str("\nstdout:\n");
        out.push_str(stdout.trim_end());
    }
    if !stderr.trim().is_empty() {
        out.push_str("\nstderr:\n");
        out.push_str(stderr.trim_end());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_includes_streams() {
        let err = ManagerError::CommandFailed {
            command: "apt-get update -y".into(),
            code: 100,
            stdout: "Reading package lists...\n".into(),
            stderr: "E: temporary failure\n".into(),
        };
        let text = err.to_string();
        assert!(text.starts_with("command failed (100): apt-get update -y"));
        assert!(text.contains("stdout:\nReading package lists..."));
        assert!(text.contains("stderr:\nE: temporary failure"));
    }

    #[test]
    fn command_failed_omits_empty_streams() {
        let err = ManagerError::CommandFailed {
            command: "false".into(),
            code: 1,
            stdout: String::new(),
            stderr: "  \n".into(),
        };
        assert_eq!(err.to_string(), "command failed (1): false");
    }

    #[test]
    fn missing_artifact_names_path() {
        let err = ManagerError::missing("PKCS#11 module", "/opt/arksigner/drivers/x.so");
        assert_eq!(
            err.to_string(),
            "PKCS#11 module not found at /opt/arksigner/drivers/x.so"
        );
    }
}
