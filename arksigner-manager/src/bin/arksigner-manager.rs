use anyhow::{Context, Result};
use clap::Parser;
use is_terminal::IsTerminal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

use arksigner_manager::command_runner::RealCommandRunner;
use arksigner_manager::config::Action;
use arksigner_manager::frontend::{
    self, FrontendCli, FrontendLog, PkexecCommand, StreamEvent, StreamOutcome,
};
use arksigner_manager::output::Output;
use arksigner_manager::privileged::{IdentityHints, home_for, invoking_user};
use arksigner_manager::HostLayout;
use arksigner_manager::status::detect_mode;

/// Exit status after Ctrl-C, matching shell convention.
const EXIT_CANCELLED: i32 = 130;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = FrontendCli::parse();

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            Output::error(format!("{err:#}"));
            std::process::exit(1);
        }
    }
}

fn run(cli: FrontendCli) -> Result<i32> {
    if cli.needs_confirmation() {
        let prompt = format!(
            "{} ArkSigner? This stops the service and removes its files.",
            if cli.action == Action::Purge {
                "Purge"
            } else {
                "Uninstall"
            }
        );
        let confirmed = cliclack::confirm(prompt)
            .initial_value(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            Output::info("Cancelled.");
            return Ok(0);
        }
    }

    let backend = match &cli.backend {
        Some(path) => path.clone(),
        None => frontend::find_backend().with_context(|| {
            format!("{} not found; is arksigner-manager installed?", frontend::BACKEND_NAME)
        })?,
    };

    let layout = HostLayout::default();
    let mode = cli.resolve_mode(|| detect_mode(&RealCommandRunner, &layout));
    let user = invoking_user(&IdentityHints::from_env());
    let home = home_for(&user);
    let argv = PkexecCommand::from_cli(&cli, backend, mode, user.name, home).build();

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst))
            .context("Failed to set signal handler")?;
    }

    let mut log = FrontendLog::default_path().map(FrontendLog::open);
    if let Some(log) = &mut log {
        log.append(&format!("$ {}", argv.join(" ")));
    }

    Output::kv("Action", cli.action.to_string());
    Output::kv("Mode", mode.to_string());
    let outcome = if std::io::stdout().is_terminal() {
        stream_with_bar(&argv, &cancel, &mut log)?
    } else {
        stream_plain(&argv, &cancel, &mut log)?
    };

    if let Some(log) = &log {
        Output::hint(format!("Log: {}", log.path().display()));
    }

    if outcome.cancelled {
        Output::warning("Cancelled. The privileged operation keeps running in the background.");
        return Ok(EXIT_CANCELLED);
    }
    match outcome.exit_code {
        Some(0) => {
            Output::success(format!("{} finished", cli.action));
            Ok(0)
        }
        Some(code) => {
            Output::error(format!("Backend exited with status {code}"));
            Ok(code)
        }
        None => {
            Output::error("Backend was terminated by a signal");
            Ok(1)
        }
    }
}

fn stream_with_bar(
    argv: &[String],
    cancel: &AtomicBool,
    log: &mut Option<FrontendLog>,
) -> Result<StreamOutcome> {
    let bar = Output::progress_bar("Waiting for authorization");
    let outcome = frontend::stream_backend(argv, cancel, |event| match event {
        StreamEvent::Progress(progress) => {
            append(log, &progress.to_string());
            bar.update(progress.percent, progress.message.clone());
        }
        StreamEvent::Line(line) => {
            append(log, line);
            bar.println(line);
        }
    });
    match &outcome {
        Ok(result) if result.success() => bar.finish_success("Completed"),
        _ => bar.finish_error("Stopped"),
    }
    outcome
}

fn stream_plain(
    argv: &[String],
    cancel: &AtomicBool,
    log: &mut Option<FrontendLog>,
) -> Result<StreamOutcome> {
    frontend::stream_backend(argv, cancel, |event| match event {
        StreamEvent::Progress(progress) => {
            append(log, &progress.to_string());
            Output::progress_line(progress.percent, &progress.message);
        }
        StreamEvent::Line(line) => {
            append(log, line);
            println!("{line}");
        }
    })
}

fn append(log: &mut Option<FrontendLog>, line: &str) {
    if let Some(log) = log {
        log.append(line);
    }
}
