use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use std::sync::Arc;
use std::time::Instant;

use ownerlens::cli::Cli;
use ownerlens::config;
use ownerlens::orchestrate;
use ownerlens::report;
use ownerlens::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    ownerlens::init_tracing();

    let run_config = Arc::new(
        config::load_config(&cli.config)
            .with_context(|| format!("loading configuration from {}", cli.config.display()))?,
    );
    let secrets = Arc::new(
        config::load_secrets(&cli.secrets)
            .with_context(|| format!("loading secrets from {}", cli.secrets.display()))?,
    );

    if let Some(parent) = cli.database.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    let store = Store::open(&format!("sqlite:{}", cli.database.display()))
        .await
        .with_context(|| format!("opening store at {}", cli.database.display()))?;

    let sources = cli.selected_sources();
    if sources.is_empty() {
        println!("no sources selected, see --help");
        return Ok(());
    }

    println!("{}", "starting extraction".bold());
    let started = Instant::now();

    let written = orchestrate::run(
        &sources,
        run_config,
        secrets,
        &store,
        &cli.jira_export,
    )
    .await?;

    report::print_summary(&store).await?;
    println!(
        "\npersisted {} records in {:.1?}",
        written,
        started.elapsed()
    );

    Ok(())
}
