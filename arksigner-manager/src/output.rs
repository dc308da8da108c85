//! Terminal output helpers for the front-end.
//!
//! The backend never uses these: its stdout carries the progress protocol
//! and must stay free of color codes.
//!
//! ```rust,ignore
//! use arksigner_manager::output::Output;
//!
//! let bar = Output::progress_bar("Starting backend");
//! bar.update(45, "Debian rootfs ready");
//! bar.finish_success("Completed");
//! ```

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::time::Duration;

pub struct Output;

impl Output {
    /// Example: `✓ Completed`
    pub fn success(msg: impl AsRef<str>) {
        println!("{} {}", "✓".green().bold(), msg.as_ref());
    }

    /// Example: `✗ Backend exited with status 1` (stderr)
    pub fn error(msg: impl AsRef<str>) {
        eprintln!("{} {}", "✗".red().bold(), msg.as_ref().red());
    }

    /// Example: `⚠ Cancelled; the privileged process keeps running`
    pub fn warning(msg: impl AsRef<str>) {
        println!("{} {}", "⚠".yellow(), msg.as_ref());
    }

    /// Example: `→ Running backend via pkexec`
    pub fn info(msg: impl AsRef<str>) {
        println!("{} {}", "→".cyan(), msg.as_ref().dimmed());
    }

    /// Example: `  Mode:          container`
    pub fn kv(key: impl AsRef<str>, value: impl AsRef<str>) {
        println!("  {:<14} {}", format!("{}:", key.as_ref()).cyan(), value.as_ref());
    }

    /// Example: `  → Log: ~/.local/state/arksigner-manager/frontend.log`
    pub fn hint(msg: impl AsRef<str>) {
        println!("  {} {}", "→".cyan(), msg.as_ref());
    }

    /// Plain progress line for non-terminal output.
    ///
    /// Example: `[ 45%] Debian rootfs ready`
    pub fn progress_line(percent: u8, msg: impl AsRef<str>) {
        println!("{} {}", format!("[{percent:>3}%]").cyan(), msg.as_ref());
    }

    /// Percentage bar driven by backend progress events.
    pub fn progress_bar(msg: impl Into<String>) -> BackendProgress {
        let pb = ProgressBar::new(100);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");
        pb.set_style(style);
        pb.set_message(msg.into());
        pb.enable_steady_tick(Duration::from_millis(80));
        BackendProgress(pb)
    }
}

/// Created via [`Output::progress_bar`].
pub struct BackendProgress(ProgressBar);

impl BackendProgress {
    pub fn update(&self, percent: u8, msg: impl Into<String>) {
        self.0.set_position(u64::from(percent.min(100)));
        self.0.set_message(msg.into());
    }

    /// Print a line above the bar without disturbing it.
    pub fn println(&self, line: impl AsRef<str>) {
        self.0.println(line.as_ref());
    }

    pub fn finish_success(self, msg: impl AsRef<str>) {
        self.0
            .finish_with_message(format!("{} {}", "✓".green().bold(), msg.as_ref()));
    }

    pub fn finish_error(self, msg: impl AsRef<str>) {
        self.0
            .abandon_with_message(format!("{} {}", "✗".red().bold(), msg.as_ref()));
    }
}
