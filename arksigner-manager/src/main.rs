use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use arksigner_fetch::Resolver;
use arksigner_manager::command_runner::RealCommandRunner;
use arksigner_manager::config::ManagerConfig;
use arksigner_manager::privileged::{self, IdentityHints};
use arksigner_manager::progress::Progress;
use arksigner_manager::{Cli, HostLayout, Orchestrator};

fn main() {
    // Logs go to stderr; stdout carries PROGRESS lines and the report.
    // e.g., RUST_LOG=arksigner_manager=debug
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        eprintln!("ERROR: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    privileged::require_root()?;

    let config = ManagerConfig::load()?;
    let request = cli.into_request(&config, &IdentityHints::from_env());
    tracing::debug!(
        action = %request.action,
        mode = %request.mode(),
        caller = %privileged::current_user(),
        "Request resolved"
    );

    let layout = HostLayout::default();
    let runner = RealCommandRunner;
    let progress = Progress::stdout();
    let resolver = Resolver::new()?
        .with_index_url(config.index_url())
        .with_destination(&layout.download_path);

    let report = Orchestrator::new(&runner, &layout, &progress, &resolver).run(&request)?;
    print!("{report}");
    Ok(())
}
