use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use storyforge::cli::{Cli, Command};
use storyforge::commands;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    storyforge::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");
    let data_dir = cli.data_dir.as_path();

    match cli.command {
        Command::New => commands::new_story(data_dir).await.context("new")?,
        Command::Prime(args) => commands::prime(data_dir, args).await.context("prime")?,
        Command::Seed(args) => commands::seed(data_dir, args).await.context("seed")?,
        Command::Chapter(args) => commands::chapter(data_dir, args).await.context("chapter")?,
        Command::Rewind => commands::rewind(data_dir).await.context("rewind")?,
        Command::RegenImage(args) => commands::regen_image(data_dir, args)
            .await
            .context("regen-image")?,
        Command::Narrate(args) => commands::narrate(data_dir, args).await.context("narrate")?,
        Command::Export(args) => commands::export(data_dir, args).await.context("export")?,
        Command::Render(args) => commands::render_file(args).context("render")?,
        Command::Outline(args) => commands::outline_file(args).context("outline")?,
    }

    Ok(())
}
