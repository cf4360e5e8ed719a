//! Message loading pass.
//!
//! Reads every raw batch from a [`RawCapture`], normalizes each record on its
//! own and inserts it keyed on `message_id`. A malformed record rejects only
//! itself; a batch that is not a JSON array fails only itself. Loss of the
//! warehouse aborts the pass.

use crate::config::LoadingConfig;
use crate::raw_capture::{BatchHandle, CaptureError, RawCapture};
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::{self, StreamExt};
use medgram_storage::{Message, StoreError, WarehouseStore};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Why a single raw record could not become a [`Message`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Errors that abort a loading pass.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Raw capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Warehouse store error: {0}")]
    Store(#[from] StoreError),
}

/// One record (or whole batch, when `index` is `None`) that was not loaded
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub batch: String,
    pub index: Option<usize>,
    pub reason: String,
}

/// Outcome of one loading pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub batches: usize,
    pub batches_failed: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub timed_out: usize,
    /// Messages inserted without media although detections were already
    /// stored for their id by an earlier enrichment pass
    pub media_conflicts: usize,
    /// First rejections in full; `rejected` and `batches_failed` count all
    pub rejections: Vec<Rejection>,
}

impl LoadReport {
    fn note(&mut self, limit: usize, rejection: Rejection) {
        if self.rejections.len() < limit {
            self.rejections.push(rejection);
        }
    }
}

/// Runtime settings for the loader.
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub concurrency: usize,
    pub record_timeout: Duration,
    pub max_reported_rejections: usize,
}

impl From<&LoadingConfig> for LoaderSettings {
    fn from(config: &LoadingConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            record_timeout: config.record_timeout(),
            max_reported_rejections: config.max_reported_rejections,
        }
    }
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self::from(&LoadingConfig::default())
    }
}

enum RecordOutcome {
    Inserted,
    /// Inserted as a no-media message over existing detections
    InsertedOverDetections,
    Duplicate,
    Rejected(String),
    TimedOut,
}

/// Loads raw message batches into the warehouse.
pub struct Loader {
    store: Arc<dyn WarehouseStore>,
    settings: LoaderSettings,
}

impl Loader {
    pub fn new(store: Arc<dyn WarehouseStore>, settings: LoaderSettings) -> Self {
        Self { store, settings }
    }

    /// Load every batch the capture currently holds.
    ///
    /// Safe to rerun: already-present messages are counted as duplicates and
    /// never overwritten.
    #[instrument(skip(self, capture))]
    pub async fn load(&self, capture: &dyn RawCapture) -> Result<LoadReport, LoadError> {
        let mut report = LoadReport::default();

        for handle in capture.batches() {
            let handle = handle?;
            report.batches += 1;

            let records = match read_records(capture, &handle) {
                Ok(records) => records,
                Err(reason) => {
                    warn!(batch = %handle.id, reason = %reason, "Skipping unreadable batch");
                    report.batches_failed += 1;
                    report.note(
                        self.settings.max_reported_rejections,
                        Rejection {
                            batch: handle.id.clone(),
                            index: None,
                            reason,
                        },
                    );
                    continue;
                }
            };

            self.load_batch(&handle, records, &mut report).await?;
        }

        info!(
            batches = report.batches,
            batches_failed = report.batches_failed,
            inserted = report.inserted,
            duplicates = report.duplicates,
            rejected = report.rejected,
            timed_out = report.timed_out,
            media_conflicts = report.media_conflicts,
            "Loading pass finished"
        );

        Ok(report)
    }

    async fn load_batch(
        &self,
        handle: &BatchHandle,
        records: Vec<Value>,
        report: &mut LoadReport,
    ) -> Result<(), LoadError> {
        let total = records.len();

        let mut outcomes: Vec<(usize, Result<RecordOutcome, StoreError>)> =
            stream::iter(records.into_iter().enumerate())
                .map(|(index, value)| async move { (index, self.load_record(&value).await) })
                .buffer_unordered(self.settings.concurrency)
                .collect()
                .await;
        outcomes.sort_by_key(|(index, _)| *index);

        let (mut inserted, mut duplicates, mut rejected) = (0u64, 0u64, 0u64);

        for (index, outcome) in outcomes {
            match outcome? {
                RecordOutcome::Inserted => {
                    inserted += 1;
                    report.inserted += 1;
                }
                RecordOutcome::InsertedOverDetections => {
                    inserted += 1;
                    report.inserted += 1;
                    report.media_conflicts += 1;
                }
                RecordOutcome::Duplicate => {
                    duplicates += 1;
                    report.duplicates += 1;
                }
                RecordOutcome::Rejected(reason) => {
                    debug!(batch = %handle.id, index, reason = %reason, "Rejected record");
                    rejected += 1;
                    report.rejected += 1;
                    report.note(
                        self.settings.max_reported_rejections,
                        Rejection {
                            batch: handle.id.clone(),
                            index: Some(index),
                            reason,
                        },
                    );
                }
                RecordOutcome::TimedOut => {
                    report.timed_out += 1;
                    report.note(
                        self.settings.max_reported_rejections,
                        Rejection {
                            batch: handle.id.clone(),
                            index: Some(index),
                            reason: format!(
                                "insert timed out after {:?}",
                                self.settings.record_timeout
                            ),
                        },
                    );
                }
            }
        }

        metrics::counter!("loader.records.inserted").increment(inserted);
        metrics::counter!("loader.records.duplicate").increment(duplicates);
        metrics::counter!("loader.records.rejected").increment(rejected);

        debug!(batch = %handle.id, records = total, inserted, duplicates, rejected, "Batch loaded");
        Ok(())
    }

    /// Only connectivity loss is returned as an error; everything else is an
    /// outcome local to the record.
    async fn load_record(&self, value: &Value) -> Result<RecordOutcome, StoreError> {
        let message = match parse_record(value) {
            Ok(message) => message,
            Err(err) => return Ok(RecordOutcome::Rejected(err.to_string())),
        };

        let insert = self.store.upsert_message_if_absent(&message);
        match tokio::time::timeout(self.settings.record_timeout, insert).await {
            Err(_) | Ok(Err(StoreError::Timeout(_))) => Ok(RecordOutcome::TimedOut),
            Ok(Ok(true)) if !message.has_media => self.check_no_media(&message).await,
            Ok(Ok(true)) => Ok(RecordOutcome::Inserted),
            Ok(Ok(false)) => Ok(RecordOutcome::Duplicate),
            Ok(Err(err)) if err.is_unavailable() => Err(err),
            Ok(Err(err)) => Ok(RecordOutcome::Rejected(err.to_string())),
        }
    }

    /// An enrichment pass may have run before this message was loaded, so a
    /// no-media message can land on top of detections for its id.
    async fn check_no_media(&self, message: &Message) -> Result<RecordOutcome, StoreError> {
        match self.store.has_detections(message.message_id).await {
            Ok(true) => {
                warn!(
                    message_id = message.message_id,
                    channel = %message.channel_name,
                    "Message without media already has detections"
                );
                metrics::counter!("loader.records.media_conflict").increment(1);
                Ok(RecordOutcome::InsertedOverDetections)
            }
            Ok(false) => Ok(RecordOutcome::Inserted),
            Err(err) if err.is_unavailable() => Err(err),
            Err(err) => {
                debug!(message_id = message.message_id, error = %err, "Detection check failed");
                Ok(RecordOutcome::Inserted)
            }
        }
    }
}

fn read_records(capture: &dyn RawCapture, handle: &BatchHandle) -> Result<Vec<Value>, String> {
    let bytes = capture.read_batch(handle).map_err(|e| e.to_string())?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Array(records)) => Ok(records),
        Ok(_) => Err("batch is not a JSON array".to_string()),
        Err(e) => Err(format!("batch is not valid JSON: {e}")),
    }
}

/// Normalize one raw record into a [`Message`].
pub fn parse_record(value: &Value) -> Result<Message, RecordError> {
    let object = value.as_object().ok_or(RecordError::NotAnObject)?;

    let message_id = match present(object, "message_id") {
        None => return Err(RecordError::MissingField("message_id")),
        Some(v) => v.as_i64().ok_or_else(|| invalid("message_id", "not an integer"))?,
    };

    let channel_name = match present(object, "channel_name") {
        None => return Err(RecordError::MissingField("channel_name")),
        Some(v) => v
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("channel_name", "not a non-empty string"))?
            .to_string(),
    };

    let message_date = match present(object, "message_date") {
        None => return Err(RecordError::MissingField("message_date")),
        Some(v) => v
            .as_str()
            .and_then(parse_timestamp)
            .ok_or_else(|| invalid("message_date", "not a recognised timestamp"))?,
    };

    let message_text = match present(object, "message_text") {
        None => String::new(),
        Some(v) => v
            .as_str()
            .ok_or_else(|| invalid("message_text", "not a string"))?
            .to_string(),
    };

    let views = counter(object, "views")?;
    let forwards = counter(object, "forwards")?;

    let image_path = match present(object, "image_path") {
        None => None,
        Some(v) => Some(
            v.as_str()
                .ok_or_else(|| invalid("image_path", "not a string"))?
                .to_string(),
        ),
    };

    let has_media = match present(object, "has_media") {
        None => image_path.is_some(),
        Some(v) => v.as_bool().ok_or_else(|| invalid("has_media", "not a boolean"))?,
    };

    Ok(Message {
        message_id,
        channel_name,
        message_date,
        message_text,
        views,
        forwards,
        has_media,
        image_path: if has_media { image_path } else { None },
    })
}

/// Parse RFC 3339 or a naive timestamp taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(ts.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// A field that is present and not null
fn present<'a>(object: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    object.get(field).filter(|v| !v.is_null())
}

fn counter(object: &Map<String, Value>, field: &'static str) -> Result<i64, RecordError> {
    match present(object, field) {
        None => Ok(0),
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => Ok(n),
            Some(_) => Err(invalid(field, "negative")),
            None => Err(invalid(field, "not an integer")),
        },
    }
}

fn invalid(field: &'static str, reason: &str) -> RecordError {
    RecordError::InvalidField {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_capture::MemoryCapture;
    use crate::test_support::FlakyStore;
    use chrono::TimeZone;
    use medgram_storage::InMemoryWarehouse;
    use serde_json::json;

    const SCENARIO_BATCH: &str = r#"[
        {"message_id": 1, "channel_name": "chan_a", "message_date": "2025-01-15T10:30:00",
         "message_text": "Paracetamol in stock", "views": 120, "forwards": 3,
         "has_media": false, "image_path": null},
        {"message_id": 2, "channel_name": "chan_a", "message_date": "2025-01-15T11:00:00",
         "message_text": "", "views": 80, "forwards": 1,
         "has_media": true, "image_path": "2.jpg"}
    ]"#;

    fn loader(store: Arc<InMemoryWarehouse>) -> Loader {
        Loader::new(store, LoaderSettings::default())
    }

    #[test]
    fn test_parse_full_record() {
        let message = parse_record(&json!({
            "message_id": 2,
            "channel_name": "chan_a",
            "message_date": "2025-01-15T11:00:00+00:00",
            "message_text": "Syringes",
            "views": 80,
            "forwards": 1,
            "has_media": true,
            "image_path": "2.jpg"
        }))
        .unwrap();

        assert_eq!(message.message_id, 2);
        assert_eq!(
            message.message_date,
            Utc.with_ymd_and_hms(2025, 1, 15, 11, 0, 0).unwrap()
        );
        assert_eq!(message.image_path.as_deref(), Some("2.jpg"));
    }

    #[test]
    fn test_parse_fills_optional_fields() {
        let message = parse_record(&json!({
            "message_id": 7,
            "channel_name": "chan_b",
            "message_date": "2025-01-15 08:00:00",
            "message_text": null
        }))
        .unwrap();

        assert_eq!(message.message_text, "");
        assert_eq!(message.views, 0);
        assert_eq!(message.forwards, 0);
        assert!(!message.has_media);
        assert_eq!(message.image_path, None);
    }

    #[test]
    fn test_has_media_inferred_and_enforced() {
        let inferred = parse_record(&json!({
            "message_id": 3, "channel_name": "c", "message_date": "2025-01-15T08:00:00Z",
            "image_path": "3.jpg"
        }))
        .unwrap();
        assert!(inferred.has_media);

        let no_media = parse_record(&json!({
            "message_id": 4, "channel_name": "c", "message_date": "2025-01-15T08:00:00Z",
            "has_media": false, "image_path": "4.jpg"
        }))
        .unwrap();
        assert_eq!(no_media.image_path, None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let base = json!({"message_id": 1, "channel_name": "c", "message_date": "2025-01-15T08:00:00"});

        let mut missing_id = base.clone();
        missing_id.as_object_mut().unwrap().remove("message_id");
        assert_eq!(
            parse_record(&missing_id),
            Err(RecordError::MissingField("message_id"))
        );

        let mut bad_date = base.clone();
        bad_date["message_date"] = json!("yesterday");
        assert!(matches!(
            parse_record(&bad_date),
            Err(RecordError::InvalidField { field: "message_date", .. })
        ));

        let mut empty_channel = base.clone();
        empty_channel["channel_name"] = json!("  ");
        assert!(parse_record(&empty_channel).is_err());

        let mut negative_views = base;
        negative_views["views"] = json!(-1);
        assert!(matches!(
            parse_record(&negative_views),
            Err(RecordError::InvalidField { field: "views", .. })
        ));

        assert_eq!(parse_record(&json!([1, 2])), Err(RecordError::NotAnObject));
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let expected = Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2025-01-15T10:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2025-01-15T12:30:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-01-15 10:30:00+00:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-01-15 10:30:00"), Some(expected));
        assert!(parse_timestamp("2025-01-15T10:30:00.250").is_some());
        assert_eq!(parse_timestamp("15/01/2025"), None);
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let store = Arc::new(InMemoryWarehouse::new());
        let capture = MemoryCapture::new().with_batch("2025-01-15/chan_a.json", SCENARIO_BATCH);
        let loader = loader(store.clone());

        let first = loader.load(&capture).await.unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(store.message_count(), 2);

        let second = loader.load(&capture).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(store.message_count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_record_does_not_abort_batch() {
        let store = Arc::new(InMemoryWarehouse::new());
        let capture = MemoryCapture::new().with_batch(
            "2025-01-15/chan_a.json",
            r#"[
                {"message_id": 1, "channel_name": "chan_a", "message_date": "2025-01-15T10:30:00"},
                {"channel_name": "chan_a", "message_date": "2025-01-15T10:31:00"},
                {"message_id": 3, "channel_name": "chan_a", "message_date": "2025-01-15T10:32:00"}
            ]"#,
        );

        let report = loader(store.clone()).load(&capture).await.unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.rejections[0].index, Some(1));
        assert_eq!(report.rejections[0].reason, "missing field message_id");
    }

    #[tokio::test]
    async fn test_broken_batch_is_reported_and_skipped() {
        let store = Arc::new(InMemoryWarehouse::new());
        let capture = MemoryCapture::new()
            .with_batch("2025-01-14/chan_a.json", "{not json")
            .with_batch("2025-01-15/chan_a.json", SCENARIO_BATCH);

        let report = loader(store.clone()).load(&capture).await.unwrap();

        assert_eq!(report.batches, 2);
        assert_eq!(report.batches_failed, 1);
        assert_eq!(report.rejections[0].index, None);
        assert_eq!(report.inserted, 2);
    }

    #[tokio::test]
    async fn test_store_outage_aborts_pass() {
        let store = Arc::new(InMemoryWarehouse::new());
        store.set_available(false);
        let capture = MemoryCapture::new().with_batch("2025-01-15/chan_a.json", SCENARIO_BATCH);

        let result = loader(store).load(&capture).await;

        assert!(matches!(result, Err(LoadError::Store(ref e)) if e.is_unavailable()));
    }

    #[tokio::test]
    async fn test_slow_insert_times_out_and_others_load() {
        let inner = Arc::new(InMemoryWarehouse::new());
        let store = Arc::new(FlakyStore::new(inner.clone()).stalling(2, Duration::from_millis(500)));
        let capture = MemoryCapture::new().with_batch(
            "2025-01-15/chan_a.json",
            r#"[
                {"message_id": 1, "channel_name": "chan_a", "message_date": "2025-01-15T10:30:00"},
                {"message_id": 2, "channel_name": "chan_a", "message_date": "2025-01-15T11:00:00"},
                {"message_id": 3, "channel_name": "chan_a", "message_date": "2025-01-15T11:30:00"}
            ]"#,
        );
        let settings = LoaderSettings {
            record_timeout: Duration::from_millis(50),
            ..LoaderSettings::default()
        };

        let report = Loader::new(store, settings).load(&capture).await.unwrap();

        assert_eq!(report.timed_out, 1);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.rejections[0].index, Some(1));
        assert!(report.rejections[0].reason.contains("timed out"));
        assert_eq!(inner.message_count(), 2);
    }

    #[tokio::test]
    async fn test_store_timeout_counts_as_timed_out() {
        let inner = Arc::new(InMemoryWarehouse::new());
        let store = Arc::new(FlakyStore::new(inner.clone()).timing_out(1));
        let capture = MemoryCapture::new().with_batch("2025-01-15/chan_a.json", SCENARIO_BATCH);

        let report = Loader::new(store, LoaderSettings::default())
            .load(&capture)
            .await
            .unwrap();

        assert_eq!(report.timed_out, 1);
        assert_eq!(report.inserted, 1);
        assert_eq!(inner.message_count(), 1);
    }

    #[tokio::test]
    async fn test_no_media_insert_over_detections_is_reported() {
        let store = Arc::new(InMemoryWarehouse::new());
        store
            .insert_detection(&medgram_storage::Detection {
                message_id: 1,
                channel_name: "chan_a".to_string(),
                detected_class: "syringe".to_string(),
                confidence_score: 0.9,
            })
            .await
            .unwrap();
        let capture = MemoryCapture::new().with_batch("2025-01-15/chan_a.json", SCENARIO_BATCH);

        let report = loader(store).load(&capture).await.unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.media_conflicts, 1);
    }
}
