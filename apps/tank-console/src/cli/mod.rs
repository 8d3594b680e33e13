use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use tank_link::{Config, MemoryStore, TelemetryChannel, incident::IncidentLog};

mod history;
mod run;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Drive a console session against the vehicle simulator
    Run(run::Args),
    /// List recorded incidents, newest first
    History(history::ListArgs),
    /// Delete a recorded incident
    Delete(history::DeleteArgs),
    /// File a detailed report on the latest capture
    Report(history::ReportArgs),
}

impl Commands {
    pub async fn run(&self, config: Config) -> miette::Result<()> {
        match self {
            Commands::Run(args) => args.run(config).await,
            Commands::History(args) => args.run(config).await,
            Commands::Delete(args) => args.run(config).await,
            Commands::Report(args) => args.run(config).await,
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct StoreArgs {
    /// JSON snapshot standing in for the realtime store
    #[arg(long, default_value = "tank-store.json")]
    pub store: PathBuf,
}

impl StoreArgs {
    pub fn open(&self) -> miette::Result<Arc<MemoryStore>> {
        Ok(Arc::new(MemoryStore::open(&self.store)?))
    }

    pub fn log(&self, config: &Config) -> miette::Result<(Arc<MemoryStore>, IncidentLog)> {
        let store = self.open()?;
        let log = IncidentLog::new(TelemetryChannel::new(store.clone()), config.report.clone());
        Ok((store, log))
    }
}
