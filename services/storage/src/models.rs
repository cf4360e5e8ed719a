use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A captured Telegram post, keyed by its globally unique `message_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Message {
    /// Natural primary key, stable across reloads
    pub message_id: i64,
    /// Channel the post was captured from
    pub channel_name: String,
    /// Source-reported publication time
    pub message_date: DateTime<Utc>,
    /// Post body, empty for media-only posts
    pub message_text: String,
    pub views: i64,
    pub forwards: i64,
    pub has_media: bool,
    /// Relative path of the captured image; only set when `has_media`
    pub image_path: Option<String>,
}

/// One (class, confidence) fact produced for a message image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Detection {
    pub message_id: i64,
    /// Redundant copy of the message channel for query convenience
    pub channel_name: String,
    /// Label from the detector's label space (numeric codes are kept as text)
    pub detected_class: String,
    /// Always within `[0.0, 1.0]`
    pub confidence_score: f32,
}

impl Detection {
    /// Check the confidence range invariant
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(format!(
                "confidence_score {} outside [0, 1]",
                self.confidence_score
            ));
        }
        if self.detected_class.trim().is_empty() {
            return Err("detected_class is empty".to_string());
        }
        Ok(())
    }
}

/// All detections produced for one message image in one enrichment pass
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    pub message_id: i64,
    pub channel_name: String,
    /// Identifies the detector that produced the rows
    pub model_version: String,
    /// May be empty: "processed, nothing found" is still recorded
    pub detections: Vec<Detection>,
}

/// Result of a conditional enrichment write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentOutcome {
    /// Claim taken and this many detection rows written
    Recorded(usize),
    /// Another pass already enriched this message; nothing written
    AlreadyEnriched,
    /// The message is known to carry no media; nothing written
    MessageWithoutMedia,
}

/// Aggregated mention count for one product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ProductMention {
    pub product_name: String,
    pub mention_count: i64,
}

/// Warehouse-wide totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct WarehouseSummary {
    pub total_messages: i64,
    pub messages_with_media: i64,
    pub total_detections: i64,
    pub enriched_images: i64,
    pub channel_count: i64,
}

/// Sort mentions into the reporting order: count descending, then name ascending
pub fn sort_mentions(mentions: &mut [ProductMention]) {
    mentions.sort_by(|a, b| {
        b.mention_count
            .cmp(&a.mention_count)
            .then_with(|| a.product_name.cmp(&b.product_name))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mention(name: &str, count: i64) -> ProductMention {
        ProductMention {
            product_name: name.to_string(),
            mention_count: count,
        }
    }

    #[test]
    fn test_sort_mentions_breaks_ties_by_name() {
        let mut mentions = vec![
            mention("paracetamol", 50),
            mention("amoxicillin", 7),
            mention("ibuprofen", 50),
        ];

        sort_mentions(&mut mentions);

        let names: Vec<_> = mentions.iter().map(|m| m.product_name.as_str()).collect();
        assert_eq!(names, vec!["ibuprofen", "paracetamol", "amoxicillin"]);
    }

    #[test]
    fn test_detection_confidence_range() {
        let mut detection = Detection {
            message_id: 2,
            channel_name: "chan_a".to_string(),
            detected_class: "syringe".to_string(),
            confidence_score: 0.9,
        };
        assert!(detection.validate().is_ok());

        detection.confidence_score = 1.2;
        assert!(detection.validate().is_err());

        detection.confidence_score = -0.1;
        assert!(detection.validate().is_err());
    }
}
