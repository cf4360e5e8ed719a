//! Image enrichment pass.
//!
//! Runs the detector over captured images and records the detections of each
//! message through the store's claim-based conditional write, so a message
//! image is enriched at most once no matter how often the pass is rerun.

use crate::config::EnrichmentConfig;
use crate::detector::{sanitize_detections, DetectionFailure, Detector, RawDetection};
use crate::raw_capture::{CaptureError, ImageHandle, RawCapture};
use futures::stream::{self, StreamExt};
use medgram_storage::{Detection, Enrichment, EnrichmentOutcome, StoreError, WarehouseStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that abort an enrichment pass.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("Raw capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Warehouse store error: {0}")]
    Store(#[from] StoreError),
}

/// One image ready for detection
#[derive(Debug, Clone)]
pub struct ChannelImage {
    pub message_id: i64,
    pub channel_name: String,
    pub bytes: Vec<u8>,
}

/// One image that could not be enriched
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageFailure {
    pub image: String,
    pub message_id: Option<i64>,
    pub reason: String,
}

/// Outcome of one enrichment pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnrichReport {
    /// Images whose detections were written by this pass
    pub processed: usize,
    /// Images another pass had already enriched
    pub skipped_existing: usize,
    /// Images belonging to messages stored without media
    pub skipped_no_media: usize,
    pub detections_written: usize,
    pub failed: usize,
    /// First failures in full; `failed` counts all
    pub failures: Vec<ImageFailure>,
}

/// Runtime settings for the enricher.
#[derive(Debug, Clone)]
pub struct EnricherSettings {
    pub concurrency: usize,
    pub image_timeout: Duration,
    pub max_reported_failures: usize,
}

impl From<&EnrichmentConfig> for EnricherSettings {
    fn from(config: &EnrichmentConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            image_timeout: config.image_timeout(),
            max_reported_failures: config.max_reported_failures,
        }
    }
}

impl Default for EnricherSettings {
    fn default() -> Self {
        Self::from(&EnrichmentConfig::default())
    }
}

#[derive(Debug)]
enum ImageOutcome {
    Recorded(usize),
    AlreadyEnriched,
    WithoutMedia,
    Failed(String),
}

struct UnitResult {
    image: String,
    message_id: Option<i64>,
    outcome: ImageOutcome,
}

pub struct Enricher {
    store: Arc<dyn WarehouseStore>,
    detector: Arc<dyn Detector>,
    settings: EnricherSettings,
}

impl Enricher {
    pub fn new(
        store: Arc<dyn WarehouseStore>,
        detector: Arc<dyn Detector>,
        settings: EnricherSettings,
    ) -> Self {
        Self {
            store,
            detector,
            settings,
        }
    }

    /// Enrich images already held in memory.
    #[instrument(skip(self, images), fields(images = images.len()))]
    pub async fn enrich(&self, images: Vec<ChannelImage>) -> Result<EnrichReport, EnrichError> {
        let units = stream::iter(images).map(|image| async move {
            let label = format!("{}/{}", image.channel_name, image.message_id);
            let message_id = image.message_id;
            let outcome = self.enrich_image(image).await?;
            Ok::<_, EnrichError>(UnitResult {
                image: label,
                message_id: Some(message_id),
                outcome,
            })
        });

        self.drain(units).await
    }

    /// Enrich every image the capture holds, reading each one only when its
    /// unit of work starts.
    #[instrument(skip(self, capture))]
    pub async fn enrich_capture(&self, capture: &dyn RawCapture) -> Result<EnrichReport, EnrichError> {
        let units = stream::iter(capture.images()).map(|handle| async move {
            match handle {
                Ok(handle) => self.enrich_handle(capture, handle).await,
                Err(CaptureError::InvalidImageName { id }) => Ok(UnitResult {
                    image: id,
                    message_id: None,
                    outcome: ImageOutcome::Failed("file name is not a message id".to_string()),
                }),
                Err(err) => Err(err.into()),
            }
        });

        self.drain(units).await
    }

    async fn enrich_handle(
        &self,
        capture: &dyn RawCapture,
        handle: ImageHandle,
    ) -> Result<UnitResult, EnrichError> {
        let outcome = match capture.read_image(&handle) {
            Ok(bytes) => {
                self.enrich_image(ChannelImage {
                    message_id: handle.message_id,
                    channel_name: handle.channel_name,
                    bytes,
                })
                .await?
            }
            Err(err) => ImageOutcome::Failed(err.to_string()),
        };

        Ok(UnitResult {
            image: handle.id,
            message_id: Some(handle.message_id),
            outcome,
        })
    }

    /// Run units with bounded concurrency, stopping at the first fatal error
    async fn drain<S, F>(&self, units: S) -> Result<EnrichReport, EnrichError>
    where
        S: futures::Stream<Item = F>,
        F: std::future::Future<Output = Result<UnitResult, EnrichError>>,
    {
        let mut report = EnrichReport::default();
        let mut results = std::pin::pin!(units.buffer_unordered(self.settings.concurrency));

        while let Some(result) = results.next().await {
            let unit = result?;
            match unit.outcome {
                ImageOutcome::Recorded(written) => {
                    report.processed += 1;
                    report.detections_written += written;
                    metrics::counter!("enricher.images.processed").increment(1);
                    metrics::counter!("enricher.detections.written").increment(written as u64);
                }
                ImageOutcome::AlreadyEnriched => {
                    report.skipped_existing += 1;
                    metrics::counter!("enricher.images.skipped", "reason" => "enriched").increment(1);
                }
                ImageOutcome::WithoutMedia => {
                    report.skipped_no_media += 1;
                    metrics::counter!("enricher.images.skipped", "reason" => "no_media").increment(1);
                }
                ImageOutcome::Failed(reason) => {
                    warn!(image = %unit.image, reason = %reason, "Image enrichment failed");
                    report.failed += 1;
                    metrics::counter!("enricher.images.failed").increment(1);
                    if report.failures.len() < self.settings.max_reported_failures {
                        report.failures.push(ImageFailure {
                            image: unit.image,
                            message_id: unit.message_id,
                            reason,
                        });
                    }
                }
            }
        }

        info!(
            processed = report.processed,
            skipped_existing = report.skipped_existing,
            skipped_no_media = report.skipped_no_media,
            detections_written = report.detections_written,
            failed = report.failed,
            "Enrichment pass finished"
        );

        Ok(report)
    }

    /// Enrich one image. Only connectivity loss is returned as an error.
    async fn enrich_image(&self, image: ChannelImage) -> Result<ImageOutcome, StoreError> {
        let message_id = image.message_id;

        match self.store.is_enriched(message_id).await {
            Ok(true) => return Ok(ImageOutcome::AlreadyEnriched),
            Ok(false) => {}
            Err(err) => return local_or_fatal(err),
        }

        let raw = match self.detect(image.bytes).await {
            Ok(raw) => raw,
            Err(failure) => return Ok(ImageOutcome::Failed(failure.to_string())),
        };

        let enrichment = Enrichment {
            message_id,
            channel_name: image.channel_name.clone(),
            model_version: self.detector.model_version(),
            detections: sanitize_detections(raw)
                .into_iter()
                .map(|d| Detection {
                    message_id,
                    channel_name: image.channel_name.clone(),
                    detected_class: d.class,
                    confidence_score: d.confidence,
                })
                .collect(),
        };

        match self.store.record_enrichment(&enrichment).await {
            Ok(EnrichmentOutcome::Recorded(written)) => {
                debug!(message_id, channel = %image.channel_name, written, "Detections recorded");
                Ok(ImageOutcome::Recorded(written))
            }
            Ok(EnrichmentOutcome::AlreadyEnriched) => Ok(ImageOutcome::AlreadyEnriched),
            Ok(EnrichmentOutcome::MessageWithoutMedia) => Ok(ImageOutcome::WithoutMedia),
            Err(err) => local_or_fatal(err),
        }
    }

    /// Run the blocking detector off the async workers under the image timeout
    async fn detect(&self, bytes: Vec<u8>) -> Result<Vec<RawDetection>, DetectionFailure> {
        let detector = self.detector.clone();
        let task = tokio::task::spawn_blocking(move || detector.detect(&bytes));

        match tokio::time::timeout(self.settings.image_timeout, task).await {
            Err(_) => Err(DetectionFailure::Timeout(self.settings.image_timeout)),
            Ok(Err(join)) => Err(DetectionFailure::Aborted(join.to_string())),
            Ok(Ok(result)) => result,
        }
    }
}

fn local_or_fatal(err: StoreError) -> Result<ImageOutcome, StoreError> {
    if err.is_unavailable() {
        Err(err)
    } else {
        Ok(ImageOutcome::Failed(err.to_string()))
    }
}
