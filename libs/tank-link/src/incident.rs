//! The incident history and the latest-photo slot.

use std::fmt::Write;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::{
    capture::CaptureResult,
    channel::TelemetryChannel,
    codec::ImageData,
    config::ReportConfig,
    error::Error,
    paths,
};

/// Epoch milliseconds, or a human formatted time from a detailed report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, from = "StoredTimestamp")]
pub enum Timestamp {
    Millis(i64),
    Text(String),
}

/// Every shape a timestamp has been stored in.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredTimestamp {
    Millis(i64),
    Float(f64),
    Text(String),
    Null,
}

impl From<StoredTimestamp> for Timestamp {
    fn from(stored: StoredTimestamp) -> Self {
        match stored {
            StoredTimestamp::Millis(ms) => Timestamp::Millis(ms),
            StoredTimestamp::Float(ms) if ms.is_finite() => Timestamp::Millis(ms as i64),
            StoredTimestamp::Text(text) => Timestamp::Text(text),
            StoredTimestamp::Float(_) | StoredTimestamp::Null => Timestamp::now(),
        }
    }
}

impl Timestamp {
    pub fn now() -> Self {
        Timestamp::Millis(Utc::now().timestamp_millis())
    }

    /// Local time rendered with a chrono format string, or epoch millis if
    /// the format is invalid.
    pub fn formatted(format: &str) -> Self {
        let mut out = String::new();
        match write!(out, "{}", Local::now().format(format)) {
            Ok(()) => Timestamp::Text(out),
            Err(_) => {
                warn!(format, "invalid report time format");
                Timestamp::now()
            }
        }
    }

    /// Millis used for ordering. Text that is not RFC 3339 sorts as oldest.
    pub fn sort_key(&self) -> i64 {
        match self {
            Timestamp::Millis(ms) => *ms,
            Timestamp::Text(text) => DateTime::parse_from_rfc3339(text)
                .map(|t| t.timestamp_millis())
                .unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Entries stored without one are read as just written.
    #[serde(default = "Timestamp::now")]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub detailed_description: String,
    #[serde(default)]
    pub location: String,
    #[serde(default, alias = "imageData", skip_serializing_if = "Option::is_none")]
    pub image_url: Option<ImageData>,
    #[serde(default, alias = "prediction", skip_serializing_if = "Option::is_none")]
    pub predicted_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default)]
    pub status: String,
}

impl IncidentRecord {
    fn matches(&self, term: &str) -> bool {
        [
            self.description.as_str(),
            self.detailed_description.as_str(),
            self.location.as_str(),
            self.predicted_label.as_deref().unwrap_or_default(),
            self.status.as_str(),
        ]
        .iter()
        .any(|field| field.to_lowercase().contains(term))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoMeta {
    pub timestamp: i64,
    pub prediction: String,
    #[serde(default)]
    pub distance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatestPhoto {
    pub photo: ImageData,
    pub meta: Option<PhotoMeta>,
}

/// What a quick capture managed to write.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Persisted {
    pub record_id: Option<String>,
    pub latest_written: bool,
}

/// A detailed report being authored. The image is fixed when the draft is
/// opened; later captures do not change it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReportDraft {
    pub image: Option<ImageData>,
    pub predicted_label: Option<String>,
    pub distance: Option<f64>,
    pub description: String,
    pub detailed_description: String,
    pub location: String,
}

impl ReportDraft {
    pub fn with_capture(capture: &CaptureResult, distance: Option<f64>) -> Self {
        Self {
            image: Some(capture.image.clone()),
            predicted_label: Some(capture.label.clone()),
            distance,
            ..Default::default()
        }
    }

    pub fn with_latest(latest: LatestPhoto) -> Self {
        Self {
            image: Some(latest.photo),
            predicted_label: latest.meta.as_ref().map(|m| m.prediction.clone()),
            distance: latest.meta.and_then(|m| m.distance),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        for (name, value) in [
            ("description", &self.description),
            ("detailedDescription", &self.detailed_description),
            ("location", &self.location),
        ] {
            if value.trim().is_empty() {
                return Err(Error::MissingField(name));
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct IncidentLog {
    channel: TelemetryChannel,
    config: ReportConfig,
}

impl IncidentLog {
    pub fn new(channel: TelemetryChannel, config: ReportConfig) -> Self {
        Self { channel, config }
    }

    /// Appends a quick-capture record and overwrites the latest-photo slot.
    /// Both writes are attempted; failures are logged, not returned.
    pub async fn persist_capture(&self, capture: &CaptureResult, distance: Option<f64>) -> Persisted {
        let now = Utc::now().timestamp_millis();
        let record = IncidentRecord {
            id: String::new(),
            timestamp: Timestamp::Millis(now),
            description: String::new(),
            detailed_description: String::new(),
            location: String::new(),
            image_url: Some(capture.image.clone()),
            predicted_label: Some(capture.label.clone()),
            distance,
            status: self.config.capture_status.clone(),
        };
        let record_id = match self.channel.push(paths::HISTORY, &record).await {
            Ok(id) => {
                info!(%id, label = %capture.label, ?distance, "incident recorded");
                Some(id)
            }
            Err(err) => {
                warn!(%err, "failed to append incident");
                None
            }
        };

        let meta = PhotoMeta {
            timestamp: now,
            prediction: capture.label.clone(),
            distance,
        };
        let latest = self
            .channel
            .update(vec![
                (paths::LATEST_PHOTO, json!(capture.image)),
                (paths::LATEST_META, serde_json::to_value(&meta).unwrap_or(Value::Null)),
            ])
            .await;
        let latest_written = match latest {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "failed to update latest photo");
                false
            }
        };
        Persisted {
            record_id,
            latest_written,
        }
    }

    pub async fn latest_photo(&self) -> Result<Option<LatestPhoto>, Error> {
        let Some(photo) = self.channel.read::<ImageData>(paths::LATEST_PHOTO).await? else {
            return Ok(None);
        };
        let meta = match self.channel.read::<PhotoMeta>(paths::LATEST_META).await {
            Ok(meta) => meta,
            Err(err) => {
                debug!(%err, "ignoring unreadable photo meta");
                None
            }
        };
        Ok(Some(LatestPhoto { photo, meta }))
    }

    /// Every record, newest first.
    pub async fn list(&self) -> Result<Vec<IncidentRecord>, Error> {
        let entries = self
            .channel
            .read::<Map<String, Value>>(paths::HISTORY)
            .await?
            .unwrap_or_default();
        let mut records = entries
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_value::<IncidentRecord>(value) {
                Ok(mut record) => {
                    if record.id.is_empty() {
                        record.id = key;
                    }
                    Some(record)
                }
                Err(err) => {
                    warn!(%key, %err, "skipping malformed history entry");
                    None
                }
            })
            .collect::<Vec<_>>();
        records.sort_by(|a, b| {
            b.timestamp
                .sort_key()
                .cmp(&a.timestamp.sort_key())
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(records)
    }

    /// Case-insensitive substring search over the text fields.
    pub async fn search(&self, term: &str) -> Result<Vec<IncidentRecord>, Error> {
        let term = term.trim().to_lowercase();
        let mut records = self.list().await?;
        if !term.is_empty() {
            records.retain(|r| r.matches(&term));
        }
        Ok(records)
    }

    pub async fn delete(&self, id: &str) -> Result<(), Error> {
        let path = paths::history_entry(id);
        if self.channel.read::<Value>(&path).await?.is_none() {
            return Err(Error::NotFound(path));
        }
        self.channel.remove(&path).await?;
        info!(%id, "incident deleted");
        Ok(())
    }

    /// Draft seeded from whatever the latest-photo slot holds right now.
    pub async fn draft_from_latest(&self) -> Result<ReportDraft, Error> {
        Ok(self
            .latest_photo()
            .await?
            .map(ReportDraft::with_latest)
            .unwrap_or_default())
    }

    pub async fn submit_report(&self, draft: &ReportDraft) -> Result<IncidentRecord, Error> {
        draft.validate()?;
        let timestamp = match &self.config.time_format {
            Some(format) => Timestamp::formatted(format),
            None => Timestamp::now(),
        };
        let mut record = IncidentRecord {
            id: String::new(),
            timestamp,
            description: draft.description.trim().to_string(),
            detailed_description: draft.detailed_description.trim().to_string(),
            location: draft.location.trim().to_string(),
            image_url: draft.image.clone(),
            predicted_label: draft.predicted_label.clone(),
            distance: draft.distance,
            status: self.config.status.clone(),
        };
        record.id = self.channel.push(paths::HISTORY, &record).await?;
        info!(id = %record.id, location = %record.location, "report submitted");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{capture::placeholder, store::MemoryStore};
    use std::sync::Arc;

    fn log() -> (Arc<MemoryStore>, IncidentLog) {
        let store = Arc::new(MemoryStore::new());
        let log = IncidentLog::new(TelemetryChannel::new(store.clone()), ReportConfig::default());
        (store, log)
    }

    fn filled(draft: ReportDraft) -> ReportDraft {
        ReportDraft {
            description: "armour".into(),
            detailed_description: "two vehicles near the ridge".into(),
            location: "north gate".into(),
            ..draft
        }
    }

    #[test]
    fn timestamps_sort_numerically_then_by_rfc3339() {
        assert_eq!(Timestamp::Millis(5).sort_key(), 5);
        assert_eq!(
            Timestamp::Text("1970-01-01T00:00:01Z".into()).sort_key(),
            1000
        );
        assert_eq!(Timestamp::Text("12 May 2024 at 10:00".into()).sort_key(), 0);
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let record: IncidentRecord = serde_json::from_value(json!({
            "timestamp": "yesterday",
            "imageData": "data:image/jpeg;base64,/9j/",
            "prediction": "ENEMY",
        }))
        .unwrap();
        assert_eq!(record.predicted_label.as_deref(), Some("ENEMY"));
        assert_eq!(record.image_url.unwrap().as_base64(), "/9j/");
    }

    #[tokio::test]
    async fn capture_writes_history_and_latest_slot() {
        let (_store, log) = log();
        let capture = placeholder();
        let persisted = log.persist_capture(&capture, Some(12.5)).await;
        assert!(persisted.latest_written);
        let id = persisted.record_id.unwrap();

        let records = log.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].status, "captured");
        assert_eq!(records[0].image_url.as_ref(), Some(&capture.image));

        let latest = log.latest_photo().await.unwrap().unwrap();
        assert_eq!(latest.photo, capture.image);
        let meta = latest.meta.unwrap();
        assert_eq!(meta.prediction, "Unknown");
        assert_eq!(meta.distance, Some(12.5));
    }

    #[tokio::test]
    async fn offline_store_is_absorbed() {
        let (store, log) = log();
        store.set_offline(true);
        let persisted = log.persist_capture(&placeholder(), None).await;
        assert_eq!(persisted, Persisted::default());
    }

    #[tokio::test]
    async fn history_is_newest_first_and_searchable() {
        let (_store, log) = log();
        let channel = &log.channel;
        channel
            .write(
                "history/a",
                &json!({"timestamp": 1_000, "description": "Old sighting", "location": "Dock"}),
            )
            .await
            .unwrap();
        channel
            .write(
                "history/b",
                &json!({"timestamp": 3_000, "description": "Convoy", "status": "completed"}),
            )
            .await
            .unwrap();
        channel
            .write(
                "history/c",
                &json!({"timestamp": "not a date", "location": "dockyard"}),
            )
            .await
            .unwrap();
        channel.write("history/d", &json!(42)).await.unwrap();

        let ids = |records: Vec<IncidentRecord>| records.into_iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids(log.list().await.unwrap()), ["b", "a", "c"]);
        assert_eq!(ids(log.search("DOCK").await.unwrap()), ["a", "c"]);
        assert_eq!(ids(log.search("  ").await.unwrap()).len(), 3);
    }

    #[tokio::test]
    async fn entries_without_integer_timestamps_are_listed() {
        let (_store, log) = log();
        let channel = &log.channel;
        channel
            .write(
                "history/float",
                &json!({"timestamp": 1_718_000_000_000.0, "description": "Float clock"}),
            )
            .await
            .unwrap();
        channel
            .write(
                "history/legacy",
                &json!({"description": "old report", "location": "gate"}),
            )
            .await
            .unwrap();
        channel
            .write(
                "history/nulled",
                &json!({"timestamp": null, "location": "gatehouse"}),
            )
            .await
            .unwrap();

        let records = log.list().await.unwrap();
        assert_eq!(records.len(), 3);
        let float = records.iter().find(|r| r.id == "float").unwrap();
        assert_eq!(float.timestamp, Timestamp::Millis(1_718_000_000_000));
        // undated entries count as fresh
        assert_eq!(records.last().map(|r| r.id.as_str()), Some("float"));

        let ids = log
            .search("gate")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect::<Vec<_>>();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"legacy".to_string()));
        assert!(ids.contains(&"nulled".to_string()));
    }

    #[tokio::test]
    async fn delete_requires_an_existing_record() {
        let (_store, log) = log();
        let id = log.persist_capture(&placeholder(), None).await.record_id.unwrap();
        log.delete(&id).await.unwrap();
        assert!(log.list().await.unwrap().is_empty());
        assert!(matches!(log.delete(&id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn report_requires_all_text_fields() {
        let (_store, log) = log();
        let draft = ReportDraft {
            location: "   ".into(),
            ..filled(ReportDraft::default())
        };
        assert!(matches!(
            log.submit_report(&draft).await,
            Err(Error::MissingField("location"))
        ));
        assert!(log.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn report_from_latest_slot() {
        let (_store, log) = log();
        log.persist_capture(&placeholder(), Some(9.0)).await;
        let draft = filled(log.draft_from_latest().await.unwrap());
        assert_eq!(draft.distance, Some(9.0));

        let record = log.submit_report(&draft).await.unwrap();
        assert_eq!(record.status, "completed");
        assert_eq!(record.image_url, Some(placeholder().image));
        assert_eq!(log.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn formatted_report_time() {
        let store = Arc::new(MemoryStore::new());
        let log = IncidentLog::new(
            TelemetryChannel::new(store),
            ReportConfig {
                time_format: Some("%Y".into()),
                ..ReportConfig::default()
            },
        );
        let record = log.submit_report(&filled(ReportDraft::default())).await.unwrap();
        let Timestamp::Text(year) = record.timestamp else {
            panic!("expected formatted timestamp");
        };
        assert_eq!(year.len(), 4);
    }
}
