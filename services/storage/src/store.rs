//! The warehouse store contract shared by the loader, the enricher and the
//! reporting API.
//!
//! Implementations must make `upsert_message_if_absent` and
//! `record_enrichment` safe to call concurrently for the same key: the
//! uniqueness of `message_id` in the store is the only concurrency-control
//! mechanism the pipeline relies on.

use crate::error::{Result, StoreError};
use crate::models::{Detection, Enrichment, EnrichmentOutcome, Message, ProductMention, WarehouseSummary};
use async_trait::async_trait;

#[async_trait]
pub trait WarehouseStore: Send + Sync {
    /// Insert a message unless its `message_id` is already present.
    ///
    /// Returns `true` when a row was written, `false` for a duplicate. A
    /// duplicate is never an error and never overwrites the stored row.
    async fn upsert_message_if_absent(&self, message: &Message) -> Result<bool>;

    /// Fetch one message by id
    async fn get_message(&self, message_id: i64) -> Result<Option<Message>>;

    /// Whether any detection rows exist for the message
    async fn has_detections(&self, message_id: i64) -> Result<bool>;

    /// Append a single detection row without taking an enrichment claim
    async fn insert_detection(&self, detection: &Detection) -> Result<()>;

    /// Whether an enrichment pass has already processed this message's image
    async fn is_enriched(&self, message_id: i64) -> Result<bool>;

    /// Atomically claim the message for enrichment and write its detections.
    ///
    /// Exactly one of any number of concurrent callers for the same
    /// `message_id` observes `Recorded`; the rest observe `AlreadyEnriched`.
    async fn record_enrichment(&self, enrichment: &Enrichment) -> Result<EnrichmentOutcome>;

    /// Product mention counts ordered by count descending, then name ascending
    async fn query_top_products(&self, limit: i64) -> Result<Vec<ProductMention>>;

    /// Every stored detection, ordered by message id
    async fn list_detections(&self) -> Result<Vec<Detection>>;

    async fn summary(&self) -> Result<WarehouseSummary>;

    /// Cheap connectivity check
    async fn ping(&self) -> Result<()>;
}

/// Reject non-positive limits; they are a contract violation, never clamped
pub fn validate_limit(limit: i64) -> Result<i64> {
    if limit <= 0 {
        return Err(StoreError::invalid_limit(limit));
    }
    Ok(limit)
}

/// Check every detection of an enrichment against the row invariants
pub(crate) fn validate_enrichment(enrichment: &Enrichment) -> Result<()> {
    for detection in &enrichment.detections {
        if detection.message_id != enrichment.message_id {
            return Err(StoreError::InvalidRow {
                entity: "detection",
                reason: format!(
                    "message_id {} does not match enriched message {}",
                    detection.message_id, enrichment.message_id
                ),
            });
        }
        detection.validate().map_err(|reason| StoreError::InvalidRow {
            entity: "detection",
            reason,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_limit() {
        assert_eq!(validate_limit(1).unwrap(), 1);
        assert!(matches!(
            validate_limit(0),
            Err(StoreError::InvalidQueryParameter { name: "limit", .. })
        ));
        assert!(validate_limit(-5).is_err());
    }

    #[test]
    fn test_validate_enrichment_rejects_foreign_rows() {
        let enrichment = Enrichment {
            message_id: 2,
            channel_name: "chan_a".to_string(),
            model_version: "test".to_string(),
            detections: vec![Detection {
                message_id: 3,
                channel_name: "chan_a".to_string(),
                detected_class: "syringe".to_string(),
                confidence_score: 0.5,
            }],
        };

        assert!(matches!(
            validate_enrichment(&enrichment),
            Err(StoreError::InvalidRow { entity: "detection", .. })
        ));
    }
}
