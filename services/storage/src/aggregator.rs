use crate::error::Result;
use crate::models::{ProductMention, WarehouseSummary};
use crate::store::{validate_limit, WarehouseStore};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Read-only reporting over the warehouse store.
///
/// Owns no state: the store query is the single source of truth, so a cache
/// can later be layered here without touching callers.
#[derive(Clone)]
pub struct Aggregator {
    store: Arc<dyn WarehouseStore>,
    default_limit: i64,
}

impl Aggregator {
    pub fn new(store: Arc<dyn WarehouseStore>) -> Self {
        Self {
            store,
            default_limit: crate::config::default_report_limit(),
        }
    }

    pub fn with_default_limit(mut self, default_limit: i64) -> Self {
        self.default_limit = default_limit;
        self
    }

    /// Most-mentioned products, count descending then name ascending.
    ///
    /// `None` uses the default limit. Non-positive limits are rejected, never
    /// clamped; limits above the number of products return every product.
    #[instrument(skip(self))]
    pub async fn top_products(&self, limit: Option<i64>) -> Result<Vec<ProductMention>> {
        let limit = validate_limit(limit.unwrap_or(self.default_limit))?;
        let mentions = self.store.query_top_products(limit).await?;

        debug!(limit, rows = mentions.len(), "Top products computed");
        metrics::counter!("reports.top_products.served").increment(1);

        Ok(mentions)
    }

    pub async fn summary(&self) -> Result<WarehouseSummary> {
        self.store.summary().await
    }

    pub fn store(&self) -> &Arc<dyn WarehouseStore> {
        &self.store
    }
}
