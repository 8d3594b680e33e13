use chrono::DateTime;
use tank_link::{
    Config,
    incident::{IncidentRecord, Timestamp},
};
use tracing::warn;

use super::StoreArgs;

#[derive(clap::Args, Debug, Clone)]
pub struct ListArgs {
    #[clap(flatten)]
    pub store: StoreArgs,
    /// Only show incidents mentioning this text
    #[arg(long)]
    pub search: Option<String>,
}

impl ListArgs {
    pub async fn run(&self, config: Config) -> miette::Result<()> {
        let (_, log) = self.store.log(&config)?;
        let records = match &self.search {
            Some(term) => log.search(term).await?,
            None => log.list().await?,
        };
        if records.is_empty() {
            println!("no incidents");
        }
        for record in &records {
            println!("{}", summary_line(record));
        }
        Ok(())
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct DeleteArgs {
    /// Incident id as shown by `history`
    pub id: String,
    #[clap(flatten)]
    pub store: StoreArgs,
}

impl DeleteArgs {
    pub async fn run(&self, config: Config) -> miette::Result<()> {
        let (store, log) = self.store.log(&config)?;
        log.delete(&self.id).await?;
        store.save()?;
        println!("deleted {}", self.id);
        Ok(())
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct ReportArgs {
    /// One-line summary
    #[arg(long)]
    pub description: String,
    /// Full account of what was seen
    #[arg(long)]
    pub details: String,
    #[arg(long)]
    pub location: String,
    #[clap(flatten)]
    pub store: StoreArgs,
}

impl ReportArgs {
    pub async fn run(&self, config: Config) -> miette::Result<()> {
        let (store, log) = self.store.log(&config)?;
        let mut draft = log.draft_from_latest().await?;
        if draft.image.is_none() {
            warn!("no capture on record, filing the report without an image");
        }
        draft.description = self.description.clone();
        draft.detailed_description = self.details.clone();
        draft.location = self.location.clone();
        let record = log.submit_report(&draft).await?;
        store.save()?;
        println!("{}", record.id);
        Ok(())
    }
}

fn when(timestamp: &Timestamp) -> String {
    match timestamp {
        Timestamp::Millis(ms) => DateTime::from_timestamp_millis(*ms)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| ms.to_string()),
        Timestamp::Text(text) => text.clone(),
    }
}

fn summary_line(record: &IncidentRecord) -> String {
    let distance = record
        .distance
        .map(|d| format!("{d:.1}"))
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{}  {}  {:<8} {:>6}  {}",
        record.id,
        when(&record.timestamp),
        record.predicted_label.as_deref().unwrap_or("-"),
        distance,
        record.status,
    );
    if !record.description.is_empty() {
        line.push_str(&format!("  {}", record.description));
    }
    if !record.location.is_empty() {
        line.push_str(&format!(" @ {}", record.location));
    }
    line
}
