//! In-process warehouse store.
//!
//! Holds all state behind one mutex, so every trait operation is atomic with
//! respect to every other. Used by tests and by `--dry-run` pipeline passes.

use crate::error::{Result, StoreError};
use crate::models::{
    sort_mentions, Detection, Enrichment, EnrichmentOutcome, Message, ProductMention,
    WarehouseSummary,
};
use crate::store::{validate_enrichment, validate_limit, WarehouseStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
struct State {
    messages: BTreeMap<i64, Message>,
    detections: Vec<Detection>,
    /// message_id -> model version of the pass that claimed it
    enriched: BTreeMap<i64, String>,
    product_mentions: Vec<(i64, String)>,
}

pub struct InMemoryWarehouse {
    state: Mutex<State>,
    available: AtomicBool,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Land one resolved product fact, as the upstream mapping would
    pub fn record_product_mention(&self, message_id: i64, product_name: &str) {
        self.state
            .lock()
            .product_mentions
            .push((message_id, product_name.to_string()));
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn detection_count(&self) -> usize {
        self.state.lock().detections.len()
    }

    /// Detections currently stored for one message
    pub fn detections_for(&self, message_id: i64) -> Vec<Detection> {
        self.state
            .lock()
            .detections
            .iter()
            .filter(|d| d.message_id == message_id)
            .cloned()
            .collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "in-memory warehouse marked unavailable".to_string(),
            ))
        }
    }
}

impl Default for InMemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WarehouseStore for InMemoryWarehouse {
    async fn upsert_message_if_absent(&self, message: &Message) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        if state.messages.contains_key(&message.message_id) {
            return Ok(false);
        }
        state.messages.insert(message.message_id, message.clone());
        Ok(true)
    }

    async fn get_message(&self, message_id: i64) -> Result<Option<Message>> {
        self.check_available()?;
        Ok(self.state.lock().messages.get(&message_id).cloned())
    }

    async fn has_detections(&self, message_id: i64) -> Result<bool> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .detections
            .iter()
            .any(|d| d.message_id == message_id))
    }

    async fn insert_detection(&self, detection: &Detection) -> Result<()> {
        self.check_available()?;
        detection.validate().map_err(|reason| StoreError::InvalidRow {
            entity: "detection",
            reason,
        })?;

        let mut state = self.state.lock();
        if let Some(message) = state.messages.get(&detection.message_id) {
            if !message.has_media {
                return Err(StoreError::InvalidRow {
                    entity: "detection",
                    reason: format!("message {} has no media", detection.message_id),
                });
            }
        }
        state.detections.push(detection.clone());
        Ok(())
    }

    async fn is_enriched(&self, message_id: i64) -> Result<bool> {
        self.check_available()?;
        Ok(self.state.lock().enriched.contains_key(&message_id))
    }

    async fn record_enrichment(&self, enrichment: &Enrichment) -> Result<EnrichmentOutcome> {
        self.check_available()?;
        validate_enrichment(enrichment)?;

        let mut state = self.state.lock();
        if matches!(state.messages.get(&enrichment.message_id), Some(m) if !m.has_media) {
            return Ok(EnrichmentOutcome::MessageWithoutMedia);
        }
        if state.enriched.contains_key(&enrichment.message_id) {
            return Ok(EnrichmentOutcome::AlreadyEnriched);
        }

        state
            .enriched
            .insert(enrichment.message_id, enrichment.model_version.clone());
        state
            .detections
            .extend(enrichment.detections.iter().cloned());

        Ok(EnrichmentOutcome::Recorded(enrichment.detections.len()))
    }

    async fn query_top_products(&self, limit: i64) -> Result<Vec<ProductMention>> {
        let limit = validate_limit(limit)?;
        self.check_available()?;

        let state = self.state.lock();
        let mut counts: HashMap<&str, i64> = HashMap::new();
        for (_, product_name) in &state.product_mentions {
            *counts.entry(product_name.as_str()).or_default() += 1;
        }

        let mut mentions: Vec<ProductMention> = counts
            .into_iter()
            .map(|(product_name, mention_count)| ProductMention {
                product_name: product_name.to_string(),
                mention_count,
            })
            .collect();
        sort_mentions(&mut mentions);
        mentions.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

        Ok(mentions)
    }

    async fn list_detections(&self) -> Result<Vec<Detection>> {
        self.check_available()?;
        let mut detections = self.state.lock().detections.clone();
        // Stable: keeps insertion order within one message
        detections.sort_by_key(|d| d.message_id);
        Ok(detections)
    }

    async fn summary(&self) -> Result<WarehouseSummary> {
        self.check_available()?;
        let state = self.state.lock();
        let channels: BTreeSet<&str> = state
            .messages
            .values()
            .map(|m| m.channel_name.as_str())
            .collect();

        Ok(WarehouseSummary {
            total_messages: state.messages.len() as i64,
            messages_with_media: state.messages.values().filter(|m| m.has_media).count() as i64,
            total_detections: state.detections.len() as i64,
            enriched_images: state.enriched.len() as i64,
            channel_count: channels.len() as i64,
        })
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}
