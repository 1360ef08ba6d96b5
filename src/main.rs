use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use ficrec::cli::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    ficrec::logging::init(cli.log_format).context("init logging")?;
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        Command::Serve(args) => ficrec::commands::serve(args).await.context("serve")?,
        Command::Crawl(args) => ficrec::commands::crawl(args).await.context("crawl")?,
        Command::Recommend(args) => ficrec::commands::recommend(args)
            .await
            .context("recommend")?,
        Command::Get(args) => ficrec::commands::get(args).await.context("get")?,
    }

    Ok(())
}
