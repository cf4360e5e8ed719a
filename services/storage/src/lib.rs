//! Medgram Storage
//!
//! Warehouse store and reporting API for the Medgram Telegram analytics
//! platform. Captured channel messages and the object detections found in
//! their images land in PostgreSQL; this crate owns that schema, the store
//! contract the ingest passes write through, and the read-only reports served
//! over HTTP.
//!
//! ## Architecture
//!
//! ```text
//!  medgram-ingest                PostgreSQL                 HTTP
//! ┌──────────────┐           ┌─────────────────────┐
//! │ Loader       │──────────▶│ raw.telegram_messages│
//! └──────────────┘           ├─────────────────────┤
//! ┌──────────────┐           │ raw.enriched_images │
//! │ Enricher     │──────────▶│ raw.image_detections│
//! └──────────────┘           ├─────────────────────┤      ┌──────────────┐
//!   upstream mapping ───────▶│ fct_messages_products│─────▶│ Aggregator   │
//!                            └─────────────────────┘      │ /reports/*   │
//!                                                         └──────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - `message_id` is unique; reloading a message is a silent no-op
//! - an image is enriched at most once (claim row in `raw.enriched_images`)
//! - detection confidence is always within `[0, 1]`
//! - messages without media never carry detections

pub mod aggregator;
pub mod api;
pub mod config;
pub mod error;
pub mod memory_store;
pub mod models;
pub mod pg_store;
pub mod store;

pub use aggregator::Aggregator;
pub use api::{create_router, start_api_server, AppState, ErrorResponse};
pub use config::{Config, ConfigError, DatabaseConfig};
pub use error::StoreError;
pub use memory_store::InMemoryWarehouse;
pub use models::{
    Detection, Enrichment, EnrichmentOutcome, Message, ProductMention, WarehouseSummary,
};
pub use pg_store::PgWarehouse;
pub use store::{validate_limit, WarehouseStore};
