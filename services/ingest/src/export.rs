//! Flat-file exchange of detection rows.
//!
//! The CSV layout is `message_id,channel_name,detected_class,confidence_score`,
//! the same file the detection step has always handed to the modelling
//! layer. Imports go through the claim-based enrichment write, so importing a
//! file twice records its rows once.

use medgram_storage::{Detection, Enrichment, EnrichmentOutcome, StoreError, WarehouseStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use thiserror::Error;
use tracing::{info, instrument, warn};

pub const DETECTION_CSV_HEADER: [&str; 4] =
    ["message_id", "channel_name", "detected_class", "confidence_score"];

/// Errors that can occur while exporting or importing detections.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Warehouse store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Deserialize)]
struct DetectionRecord {
    message_id: i64,
    channel_name: String,
    detected_class: String,
    confidence_score: f32,
}

/// Outcome of one import.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub rows: usize,
    pub rejected_rows: usize,
    pub messages_recorded: usize,
    pub detections_written: usize,
    pub skipped_existing: usize,
    pub skipped_no_media: usize,
}

/// Write every stored detection as CSV. The header is written even when
/// there are no rows.
#[instrument(skip(store, writer))]
pub async fn export_detections<W: Write>(
    store: &dyn WarehouseStore,
    writer: W,
) -> Result<usize, ExportError> {
    let detections = store.list_detections().await?;

    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(DETECTION_CSV_HEADER)?;

    for detection in &detections {
        writer.write_record(&[
            detection.message_id.to_string(),
            detection.channel_name.clone(),
            detection.detected_class.clone(),
            detection.confidence_score.to_string(),
        ])?;
    }

    writer.flush()?;

    info!(rows = detections.len(), "Detections exported");
    Ok(detections.len())
}

/// Record detections from a CSV file, one enrichment per message id.
///
/// Unparseable rows and rows whose confidence falls outside `[0, 1]` are
/// counted and skipped.
#[instrument(skip(store, reader))]
pub async fn import_detections<R: Read>(
    store: &dyn WarehouseStore,
    reader: R,
    model_version: &str,
) -> Result<ImportReport, ExportError> {
    let mut report = ImportReport::default();
    let mut grouped: BTreeMap<i64, Enrichment> = BTreeMap::new();

    let mut reader = csv::Reader::from_reader(reader);
    for (line, record) in reader.deserialize::<DetectionRecord>().enumerate() {
        report.rows += 1;

        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(line = line + 2, error = %err, "Skipping unreadable detection row");
                report.rejected_rows += 1;
                continue;
            }
        };

        let detection = Detection {
            message_id: record.message_id,
            channel_name: record.channel_name,
            detected_class: record.detected_class.trim().to_string(),
            confidence_score: record.confidence_score,
        };
        if let Err(reason) = detection.validate() {
            warn!(line = line + 2, reason = %reason, "Skipping invalid detection row");
            report.rejected_rows += 1;
            continue;
        }

        grouped
            .entry(detection.message_id)
            .or_insert_with(|| Enrichment {
                message_id: detection.message_id,
                channel_name: detection.channel_name.clone(),
                model_version: model_version.to_string(),
                detections: Vec::new(),
            })
            .detections
            .push(detection);
    }

    for enrichment in grouped.values() {
        match store.record_enrichment(enrichment).await? {
            EnrichmentOutcome::Recorded(written) => {
                report.messages_recorded += 1;
                report.detections_written += written;
            }
            EnrichmentOutcome::AlreadyEnriched => report.skipped_existing += 1,
            EnrichmentOutcome::MessageWithoutMedia => report.skipped_no_media += 1,
        }
    }

    info!(
        rows = report.rows,
        rejected = report.rejected_rows,
        written = report.detections_written,
        "Detections imported"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use medgram_storage::{InMemoryWarehouse, Message};

    async fn store_with_media(id: i64) -> InMemoryWarehouse {
        let store = InMemoryWarehouse::new();
        store
            .upsert_message_if_absent(&Message {
                message_id: id,
                channel_name: "chan_a".to_string(),
                message_date: Utc::now(),
                message_text: String::new(),
                views: 0,
                forwards: 0,
                has_media: true,
                image_path: Some(format!("{id}.jpg")),
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_export_empty_store_writes_header() {
        let store = InMemoryWarehouse::new();
        let mut out = Vec::new();

        let rows = export_detections(&store, &mut out).await.unwrap();

        assert_eq!(rows, 0);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "message_id,channel_name,detected_class,confidence_score\n"
        );
    }

    #[tokio::test]
    async fn test_import_then_export() {
        let store = store_with_media(2).await;
        let csv = "message_id,channel_name,detected_class,confidence_score\n\
                   2,chan_a,syringe,0.9\n\
                   2,chan_a,syringe,0.4\n\
                   2,chan_a,pill,1.7\n\
                   x,chan_a,pill,0.5\n";

        let report = import_detections(&store, csv.as_bytes(), "csv").await.unwrap();
        assert_eq!(report.rows, 4);
        assert_eq!(report.rejected_rows, 2);
        assert_eq!(report.detections_written, 2);

        // A second import of the same file is a no-op
        let again = import_detections(&store, csv.as_bytes(), "csv").await.unwrap();
        assert_eq!(again.skipped_existing, 1);
        assert_eq!(store.detection_count(), 2);

        let mut out = Vec::new();
        export_detections(&store, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], DETECTION_CSV_HEADER.join(","));
        assert!(lines[1..].iter().all(|l| l.starts_with("2,chan_a,syringe,")));
    }
}
