//! Line-oriented progress protocol between backend and front-end.
//!
//! The backend writes `PROGRESS <percent> <message>` lines to stdout and
//! flushes after each one so a reader on a pipe sees them immediately.
//! Percentages are clamped to 0..=100 on both sides of the pipe.

use chrono::Local;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

pub const PREFIX: &str = "PROGRESS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub percent: u8,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(percent: i64, message: impl Into<String>) -> Self {
        Self {
            percent: percent.clamp(0, 100) as u8,
            message: message.into(),
        }
    }

    /// Parse a protocol line. Anything else yields `None`, as does a
    /// percent field that is not an integer.
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim_end_matches(['\r', '\n']).strip_prefix(PREFIX)?;
        let rest = rest.strip_prefix(' ')?;
        let (percent, message) = match rest.split_once(' ') {
            Some((percent, message)) => (percent, message),
            None => (rest, ""),
        };
        let percent: i64 = percent.parse().ok()?;
        Some(Self::new(percent, message.trim()))
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX} {} {}", self.percent, self.message)
    }
}

/// Sink for progress lines and timestamped notes.
pub struct Progress {
    out: Mutex<Box<dyn Write + Send>>,
}

impl Progress {
    pub fn stdout() -> Self {
        Self::with_writer(std::io::stdout())
    }

    pub fn with_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(writer)),
        }
    }

    /// A progress sink writing into a shared in-memory buffer.
    pub fn capture() -> (Self, SharedBuffer) {
        let buffer = SharedBuffer::default();
        (Self::with_writer(buffer.clone()), buffer)
    }

    pub fn emit(&self, percent: i64, message: &str) {
        let event = ProgressEvent::new(percent, message);
        self.write_line(&event.to_string());
    }

    /// Free-form informational line, prefixed with a local timestamp.
    pub fn note(&self, message: &str) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        self.write_line(&format!("[{stamp}] {message}"));
    }

    fn write_line(&self, line: &str) {
        // A closed pipe must not abort the operation.
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
    }
}

/// Cloneable in-memory writer.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().map(|b| b.clone()).unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.contents()
            .lines()
            .filter_map(ProgressEvent::parse)
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.lock() {
            Ok(mut inner) => {
                inner.extend_from_slice(buf);
                Ok(buf.len())
            }
            Err(_) => Err(std::io::Error::other("buffer poisoned")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_clamps_percent() {
        let (progress, buffer) = Progress::capture();
        progress.emit(150, "over");
        progress.emit(-3, "under");
        assert_eq!(buffer.contents(), "PROGRESS 100 over\nPROGRESS 0 under\n");
    }

    #[test]
    fn parse_protocol_lines() {
        assert_eq!(
            ProgressEvent::parse("PROGRESS 45 Base rootfs ready\n"),
            Some(ProgressEvent::new(45, "Base rootfs ready"))
        );
        assert_eq!(
            ProgressEvent::parse("PROGRESS 250 done"),
            Some(ProgressEvent::new(100, "done"))
        );
        assert_eq!(ProgressEvent::parse("PROGRESS 7"), Some(ProgressEvent::new(7, "")));
    }

    #[test]
    fn parse_rejects_other_lines() {
        assert_eq!(ProgressEvent::parse("[2024-01-01 00:00:00] hello"), None);
        assert_eq!(ProgressEvent::parse("PROGRESS abc message"), None);
        assert_eq!(ProgressEvent::parse("PROGRESSIVE 10 x"), None);
        assert_eq!(ProgressEvent::parse(""), None);
    }

    #[test]
    fn note_is_timestamped() {
        let (progress, buffer) = Progress::capture();
        progress.note("hello");
        let text = buffer.contents();
        assert!(text.starts_with('['));
        assert!(text.trim_end().ends_with("] hello"));
        assert!(buffer.events().is_empty());
    }
}
