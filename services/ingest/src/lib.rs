//! Batch passes that feed the medical channel warehouse.
//!
//! # Architecture
//!
//! ```text
//! raw/telegram_messages/<day>/*.json --> Loader ----> raw.telegram_messages
//! raw/images/<channel>/<id>.<ext> -----> Enricher --> raw.image_detections
//!                                           |
//!                                        Detector (YOLOv8 on ONNX Runtime)
//! ```
//!
//! Both passes read the capture store through [`RawCapture`] and write
//! through [`medgram_storage::WarehouseStore`]. Each is safe to rerun: the
//! loader relies on `message_id` uniqueness, the enricher on the store's
//! per-message enrichment claim.

pub mod config;
pub mod detector;
pub mod enricher;
pub mod export;
pub mod loader;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod preprocess;
pub mod raw_capture;
#[cfg(test)]
mod test_support;
pub mod yolo;

pub use config::IngestConfig;
pub use detector::{sanitize_detections, DetectionFailure, Detector, RawDetection};
pub use enricher::{ChannelImage, EnrichError, EnrichReport, Enricher, EnricherSettings};
pub use export::{export_detections, import_detections, ExportError, ImportReport};
pub use loader::{LoadError, LoadReport, Loader, LoaderSettings, RecordError};
#[cfg(feature = "onnx")]
pub use onnx::OnnxDetector;
pub use raw_capture::{BatchHandle, CaptureError, FsCapture, ImageHandle, MemoryCapture, RawCapture};
