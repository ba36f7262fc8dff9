use crate::config::ModelConfig;
use crate::detection::{BoundingBox, Detection};
use crate::frame::Frame;
use opencv::{
    core::{self, Mat, Scalar, Size},
    dnn::{self, Net},
    prelude::*,
};
use std::path::PathBuf;
use thiserror::Error;
use tracing::instrument;

/// Values per SSD output row: image id, class id, confidence, then four normalized corners.
const SSD_ROW_LEN: usize = 7;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Model file not found: {0:?}")]
    MissingModelFile(PathBuf),
    #[error("Failed to load model: {0}")]
    ModelLoad(opencv::Error),
    #[error("Model loaded from {0:?} has no layers")]
    EmptyNetwork(PathBuf),
    #[error("Inference failed: {0}")]
    Inference(opencv::Error),
    #[error("Unexpected output shape: {0} values")]
    MalformedOutput(usize),
}

pub trait PersonDetector {
    /// Runs the model on one frame, returning detections in model order.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError>;
}

/// Preprocessing constants applied before every forward pass.
#[derive(Debug, Clone)]
struct BlobParams {
    scale_factor: f64,
    input_size: Size,
    mean: Scalar,
    swap_rb: bool,
}

/// MobileNet-SSD (Caffe) run through the OpenCV DNN module.
pub struct SsdDetector {
    net: Net,
    params: BlobParams,
}

impl SsdDetector {
    pub fn load(model_config: &ModelConfig) -> Result<Self, DetectorError> {
        let topology = model_config.get_topology_path();
        let weights = model_config.get_weights_path();
        for path in [&topology, &weights] {
            if !path.exists() {
                return Err(DetectorError::MissingModelFile(path.clone()));
            }
        }

        let mut net = dnn::read_net_from_caffe(
            &topology.to_string_lossy(),
            &weights.to_string_lossy(),
        )
        .map_err(DetectorError::ModelLoad)?;

        if net.empty().map_err(DetectorError::ModelLoad)? {
            return Err(DetectorError::EmptyNetwork(weights));
        }

        net.set_preferable_backend(dnn::DNN_BACKEND_OPENCV)
            .map_err(DetectorError::ModelLoad)?;
        net.set_preferable_target(dnn::DNN_TARGET_CPU)
            .map_err(DetectorError::ModelLoad)?;

        let [b, g, r] = model_config.mean;
        let params = BlobParams {
            scale_factor: model_config.scale_factor,
            input_size: Size::new(
                model_config.input_width as i32,
                model_config.input_height as i32,
            ),
            mean: Scalar::new(b, g, r, 0.0),
            swap_rb: model_config.swap_rb,
        };

        tracing::info!(
            "Loaded detection model {:?} (input {}x{}, swap_rb={})",
            weights,
            params.input_size.width,
            params.input_size.height,
            params.swap_rb
        );

        Ok(Self { net, params })
    }

    fn forward(&mut self, frame: &Frame) -> Result<Mat, opencv::Error> {
        let blob = dnn::blob_from_image(
            frame.as_mat(),
            self.params.scale_factor,
            self.params.input_size,
            self.params.mean,
            self.params.swap_rb,
            false,
            core::CV_32F,
        )?;

        self.net.set_input(&blob, "", 1.0, Scalar::default())?;
        self.net.forward_single("")
    }
}

impl PersonDetector for SsdDetector {
    #[instrument(skip_all)]
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        let output = self.forward(frame).map_err(DetectorError::Inference)?;
        let raw = output.data_typed::<f32>().map_err(DetectorError::Inference)?;
        let detections = parse_ssd_output(raw, frame.width(), frame.height())?;

        tracing::debug!("Model returned {} detections", detections.len());
        Ok(detections)
    }
}

/// Converts the flat `[1, 1, N, 7]` SSD output into pixel-space detections.
fn parse_ssd_output(
    raw: &[f32],
    frame_width: u32,
    frame_height: u32,
) -> Result<Vec<Detection>, DetectorError> {
    if raw.len() % SSD_ROW_LEN != 0 {
        return Err(DetectorError::MalformedOutput(raw.len()));
    }

    let (w, h) = (frame_width as f32, frame_height as f32);
    let detections = raw
        .chunks_exact(SSD_ROW_LEN)
        .map(|row| {
            let bbox = BoundingBox::new(
                (row[3] * w) as i32,
                (row[4] * h) as i32,
                (row[5] * w) as i32,
                (row[6] * h) as i32,
            );
            Detection::new(row[1] as i32, row[2], bbox)
        })
        .collect();

    Ok(detections)
}
