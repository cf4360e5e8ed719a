//! YOLOv8 detector running on ONNX Runtime.

use crate::config::DetectorConfig;
use crate::detector::{DetectionFailure, Detector, RawDetection};
use crate::preprocess;
use crate::yolo::{decode_output, DecodeSettings};
use ndarray::{Axis, Ix3};
use ort::session::Session;
use tracing::info;

pub struct OnnxDetector {
    session: Session,
    input_size: u32,
    decode: DecodeSettings,
    model_version: String,
}

impl OnnxDetector {
    /// Load the model named by `config.model_path`.
    pub fn new(config: &DetectorConfig) -> ort::Result<Self> {
        // Only the first call configures the global environment
        let _ = ort::init().with_name("medgram-detector").commit();

        let session = Session::builder()?
            .with_intra_threads(config.intra_threads)?
            .commit_from_file(&config.model_path)?;

        let model_version = config
            .model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());

        info!(
            model = %config.model_path.display(),
            model_version = %model_version,
            input_size = config.input_size,
            "Detector model loaded"
        );

        Ok(Self {
            session,
            input_size: config.input_size,
            decode: DecodeSettings {
                confidence_threshold: config.confidence_threshold,
                iou_threshold: config.iou_threshold,
                class_names: config.class_names.clone(),
            },
            model_version,
        })
    }
}

fn inference(err: impl std::fmt::Display) -> DetectionFailure {
    DetectionFailure::Inference(err.to_string())
}

impl Detector for OnnxDetector {
    fn detect(&self, image: &[u8]) -> Result<Vec<RawDetection>, DetectionFailure> {
        let image = preprocess::decode(image)?;
        let input = preprocess::letterbox(&image, self.input_size);

        let inputs = ort::inputs![input.view()].map_err(inference)?;
        let outputs = self.session.run(inputs).map_err(inference)?;

        let tensor = outputs[0].try_extract_tensor::<f32>().map_err(inference)?;
        let head = tensor.into_dimensionality::<Ix3>().map_err(inference)?;
        if head.len_of(Axis(0)) == 0 {
            return Ok(Vec::new());
        }

        Ok(decode_output(head.index_axis(Axis(0), 0), &self.decode))
    }

    fn model_version(&self) -> String {
        self.model_version.clone()
    }
}
