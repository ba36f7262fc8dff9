use crate::detection::Detection;
use crate::policy::Command;
use opencv::{
    core::{Mat, Point, Rect, Scalar},
    imgproc,
    prelude::*,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Unsupported channel count: {0}")]
    UnsupportedChannels(i32),
    #[error("Empty frame")]
    Empty,
    #[error("Failed to convert frame: {0}")]
    ConvertFailed(opencv::Error),
    #[error("OpenCV error: {0}")]
    OpenCvError(opencv::Error),
}

impl From<opencv::Error> for FrameError {
    fn from(err: opencv::Error) -> Self {
        FrameError::OpenCvError(err)
    }
}

/// A captured image, always stored as 8-bit BGR.
pub struct Frame {
    mat: Mat,
}

impl Frame {
    pub const CHANNEL_ORDER: &'static str = "BGR";

    /// Normalizes whatever the sensor produced into three BGR channels.
    pub fn from_mat(mat: Mat) -> Result<Self, FrameError> {
        if mat.empty() {
            return Err(FrameError::Empty);
        }

        let code = match mat.channels() {
            3 => return Ok(Self { mat }),
            4 => imgproc::COLOR_BGRA2BGR,
            1 => imgproc::COLOR_GRAY2BGR,
            other => return Err(FrameError::UnsupportedChannels(other)),
        };

        let mut bgr = Mat::default();
        imgproc::cvt_color_def(&mat, &mut bgr, code).map_err(FrameError::ConvertFailed)?;
        Ok(Self { mat: bgr })
    }

    pub fn width(&self) -> u32 {
        self.mat.cols().max(0) as u32
    }

    pub fn height(&self) -> u32 {
        self.mat.rows().max(0) as u32
    }

    pub fn channels(&self) -> i32 {
        self.mat.channels()
    }

    pub fn as_mat(&self) -> &Mat {
        &self.mat
    }

    /// Copy of the frame with detections and the chosen command drawn on it.
    pub fn annotated(
        &self,
        detections: &[Detection],
        target_class: i32,
        command: Command,
    ) -> Result<Mat, FrameError> {
        let mut canvas = self.mat.try_clone()?;

        for detection in detections {
            let bbox = detection.bbox;
            // Green for the tracked class, blue for anything else
            let color = if detection.class_id == target_class {
                Scalar::new(0.0, 255.0, 0.0, 0.0)
            } else {
                Scalar::new(255.0, 0.0, 0.0, 0.0)
            };
            let label = format!("{}: {:.2}", detection.class_id, detection.confidence);

            imgproc::rectangle(
                &mut canvas,
                Rect::new(bbox.x_min, bbox.y_min, bbox.width(), bbox.height()),
                color,
                2,
                imgproc::LINE_8,
                0,
            )?;

            imgproc::put_text(
                &mut canvas,
                &label,
                Point::new(bbox.x_min, bbox.y_min - 5),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.5,
                color,
                1,
                imgproc::LINE_AA,
                false,
            )?;
        }

        imgproc::put_text(
            &mut canvas,
            &command.to_string(),
            Point::new(10, 25),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.8,
            Scalar::new(0.0, 0.0, 255.0, 0.0),
            2,
            imgproc::LINE_AA,
            false,
        )?;

        Ok(canvas)
    }
}

#[cfg(test)]
pub(crate) fn blank_mat(width: i32, height: i32, typ: i32) -> Mat {
    Mat::new_rows_cols_with_default(height, width, typ, Scalar::all(0.0)).unwrap()
}
