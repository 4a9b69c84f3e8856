use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    ticketscout::logging::init().context("init logging")?;

    let cli = ticketscout::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        ticketscout::cli::Command::Run(args) => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received; finishing after the current page");
                    on_interrupt.cancel();
                }
            });
            ticketscout::run::run(args, cancel).await.context("run")?;
        }
        ticketscout::cli::Command::Fetch(args) => {
            ticketscout::fetch::run(args).await.context("fetch")?;
        }
        ticketscout::cli::Command::Reduce(args) => {
            ticketscout::reduce::run(args).context("reduce")?;
        }
        ticketscout::cli::Command::Extract(args) => {
            ticketscout::extract::run(args).await.context("extract")?;
        }
    }

    Ok(())
}
