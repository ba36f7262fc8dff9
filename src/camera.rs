use crate::config::CameraConfig;
use crate::frame::{Frame, FrameError};
use opencv::{core::Mat, prelude::*, videoio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Failed to open camera: {0}")]
    OpenCameraFailed(opencv::Error),
    #[error("Camera {0} could not be opened")]
    NotOpened(String),
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(opencv::Error),
    #[error("Camera returned no frame")]
    NoFrame,
    #[error("Camera is closed")]
    Closed,
    #[error("Invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),
    #[error("OpenCV error: {0}")]
    OpenCvError(opencv::Error),
}

impl From<opencv::Error> for DeviceError {
    fn from(err: opencv::Error) -> Self {
        DeviceError::OpenCvError(err)
    }
}

/// Anything that can hand out one fresh frame per control cycle.
pub trait FrameSource {
    /// Blocks until the next frame is available.
    fn capture(&mut self) -> Result<Frame, DeviceError>;
    fn close(&mut self) -> Result<(), DeviceError>;
    fn is_open(&self) -> bool;
}

pub struct Camera {
    capture: Option<videoio::VideoCapture>,
    description: String,
}

impl Camera {
    pub fn open(config: &CameraConfig) -> Result<Self, DeviceError> {
        let (mut capture, description) = match &config.pipeline {
            Some(pipeline) => (
                videoio::VideoCapture::from_file(pipeline, videoio::CAP_GSTREAMER)
                    .map_err(DeviceError::OpenCameraFailed)?,
                pipeline.clone(),
            ),
            None => (
                videoio::VideoCapture::new(config.device_index, videoio::CAP_ANY)
                    .map_err(DeviceError::OpenCameraFailed)?,
                format!("device {}", config.device_index),
            ),
        };

        if !capture.is_opened()? {
            return Err(DeviceError::NotOpened(description));
        }

        // Drivers may silently pick the nearest supported mode
        capture.set(videoio::CAP_PROP_FRAME_WIDTH, config.width as f64)?;
        capture.set(videoio::CAP_PROP_FRAME_HEIGHT, config.height as f64)?;

        tracing::info!(
            "Opened camera {} at {}x{}",
            description,
            config.width,
            config.height
        );

        Ok(Self {
            capture: Some(capture),
            description,
        })
    }
}

impl FrameSource for Camera {
    fn capture(&mut self) -> Result<Frame, DeviceError> {
        let cam = self.capture.as_mut().ok_or(DeviceError::Closed)?;
        let mut mat = Mat::default();
        if !cam.read(&mut mat).map_err(DeviceError::ReadFrameFailed)? || mat.empty() {
            return Err(DeviceError::NoFrame);
        }
        Ok(Frame::from_mat(mat)?)
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if let Some(mut cam) = self.capture.take() {
            cam.release()?;
            tracing::info!("Released camera {}", self.description);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.capture.is_some()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!("Failed to release camera {}: {}", self.description, e);
        }
    }
}
