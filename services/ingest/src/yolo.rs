//! Decoding of YOLOv8 detection heads.
//!
//! A YOLOv8 export emits one `[4 + C, N]` matrix per image: rows 0..4 hold the
//! box centre and size of each of the `N` candidates, the remaining `C` rows
//! hold per-class scores.

use crate::detector::RawDetection;
use ndarray::ArrayView2;
use std::cmp::Ordering;

/// Thresholds and labels applied to raw candidates
#[derive(Debug, Clone)]
pub struct DecodeSettings {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Label by class index; indices past the end keep their number
    pub class_names: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    class_id: usize,
    score: f32,
    /// x1, y1, x2, y2
    bbox: [f32; 4],
}

/// Turn a `[4 + C, N]` output into labelled detections, highest score first.
pub fn decode_output(output: ArrayView2<'_, f32>, settings: &DecodeSettings) -> Vec<RawDetection> {
    let rows = output.nrows();
    if rows <= 4 {
        return Vec::new();
    }

    let mut candidates: Vec<Candidate> = output
        .columns()
        .into_iter()
        .filter_map(|column| {
            let (class_id, score) = column
                .iter()
                .skip(4)
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))?;

            if score.is_nan() || score < settings.confidence_threshold {
                return None;
            }

            let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
            Some(Candidate {
                class_id,
                score,
                bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            })
        })
        .collect();

    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    non_max_suppression(candidates, settings.iou_threshold)
        .into_iter()
        .map(|c| RawDetection {
            class: settings
                .class_names
                .get(c.class_id)
                .cloned()
                .unwrap_or_else(|| c.class_id.to_string()),
            confidence: c.score,
        })
        .collect()
}

/// Greedy per-class suppression over candidates sorted by score
fn non_max_suppression(sorted: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in sorted {
        let overlaps = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && iou(&k.bbox, &candidate.bbox) > iou_threshold);
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let width = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let height = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let intersection = width * height;

    let area = |r: &[f32; 4]| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
    let union = area(a) + area(b) - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn settings(names: &[&str]) -> DecodeSettings {
        DecodeSettings {
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
            class_names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_iou() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert_eq!(iou(&a, &a), 1.0);
        assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
        let half = iou(&a, &[5.0, 0.0, 15.0, 10.0]);
        assert!((half - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_thresholds_and_suppresses() {
        // Columns: two overlapping syringes, one distant syringe, one weak pill
        let output = array![
            [50.0, 52.0, 300.0, 100.0], // cx
            [50.0, 50.0, 300.0, 100.0], // cy
            [20.0, 20.0, 20.0, 20.0],   // w
            [20.0, 20.0, 20.0, 20.0],   // h
            [0.05, 0.02, 0.01, 0.20],   // pill
            [0.90, 0.40, 0.40, 0.01],   // syringe
        ];

        let detections = decode_output(output.view(), &settings(&["pill", "syringe"]));

        assert_eq!(
            detections,
            vec![
                RawDetection::new("syringe", 0.9),
                RawDetection::new("syringe", 0.4),
            ]
        );
    }

    #[test]
    fn test_decode_keeps_numeric_class_without_names() {
        let output = array![[10.0], [10.0], [4.0], [4.0], [0.1], [0.7]];

        let detections = decode_output(output.view(), &settings(&[]));

        assert_eq!(detections, vec![RawDetection::new("1", 0.7)]);
    }

    #[test]
    fn test_overlapping_boxes_of_different_classes_both_kept() {
        let output = array![[10.0, 10.0], [10.0, 10.0], [4.0, 4.0], [4.0, 4.0], [0.8, 0.1], [0.1, 0.6]];

        let detections = decode_output(output.view(), &settings(&["pill", "syringe"]));

        assert_eq!(detections.len(), 2);
    }
}
