use anyhow::Result;
use buildblame::cli::Cli;
use clap::Parser;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    info!("Starting buildblame - build time blame tool");
    cli.execute().await?;

    Ok(())
}
