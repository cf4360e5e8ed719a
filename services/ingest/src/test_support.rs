//! Store wrapper that misbehaves for chosen message ids.

use async_trait::async_trait;
use medgram_storage::error::Result;
use medgram_storage::{
    Detection, Enrichment, EnrichmentOutcome, InMemoryWarehouse, Message, ProductMention,
    StoreError, WarehouseStore, WarehouseSummary,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct FlakyStore {
    pub inner: Arc<InMemoryWarehouse>,
    timing_out: HashSet<i64>,
    stalled: HashSet<i64>,
    stall: Duration,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryWarehouse>) -> Self {
        Self {
            inner,
            timing_out: HashSet::new(),
            stalled: HashSet::new(),
            stall: Duration::ZERO,
        }
    }

    /// Every call about `message_id` fails with `StoreError::Timeout`
    pub fn timing_out(mut self, message_id: i64) -> Self {
        self.timing_out.insert(message_id);
        self
    }

    /// Every call about `message_id` sleeps for `delay` before running
    pub fn stalling(mut self, message_id: i64, delay: Duration) -> Self {
        self.stalled.insert(message_id);
        self.stall = delay;
        self
    }

    async fn gate(&self, message_id: i64) -> Result<()> {
        if self.timing_out.contains(&message_id) {
            return Err(StoreError::Timeout(Duration::from_secs(30)));
        }
        if self.stalled.contains(&message_id) {
            tokio::time::sleep(self.stall).await;
        }
        Ok(())
    }
}

#[async_trait]
impl WarehouseStore for FlakyStore {
    async fn upsert_message_if_absent(&self, message: &Message) -> Result<bool> {
        self.gate(message.message_id).await?;
        self.inner.upsert_message_if_absent(message).await
    }

    async fn get_message(&self, message_id: i64) -> Result<Option<Message>> {
        self.gate(message_id).await?;
        self.inner.get_message(message_id).await
    }

    async fn has_detections(&self, message_id: i64) -> Result<bool> {
        self.gate(message_id).await?;
        self.inner.has_detections(message_id).await
    }

    async fn insert_detection(&self, detection: &Detection) -> Result<()> {
        self.gate(detection.message_id).await?;
        self.inner.insert_detection(detection).await
    }

    async fn is_enriched(&self, message_id: i64) -> Result<bool> {
        self.gate(message_id).await?;
        self.inner.is_enriched(message_id).await
    }

    async fn record_enrichment(&self, enrichment: &Enrichment) -> Result<EnrichmentOutcome> {
        self.gate(enrichment.message_id).await?;
        self.inner.record_enrichment(enrichment).await
    }

    async fn query_top_products(&self, limit: i64) -> Result<Vec<ProductMention>> {
        self.inner.query_top_products(limit).await
    }

    async fn list_detections(&self) -> Result<Vec<Detection>> {
        self.inner.list_detections().await
    }

    async fn summary(&self) -> Result<WarehouseSummary> {
        self.inner.summary().await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}
