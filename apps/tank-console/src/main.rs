use clap::Parser;
use tank_link::Config;
use tracing_subscriber::filter::LevelFilter;

mod cli;
mod sim;

#[tokio::main(flavor = "current_thread")]
async fn main() -> miette::Result<()> {
    let args = cli::Cli::parse();
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .try_init();

    let config = Config::parse(args.config.clone())?;
    args.command.run(config).await
}
