use crate::config::DisplayConfig;
use crate::detection::Detection;
use crate::frame::{Frame, FrameError};
use crate::policy::Command;
use opencv::highgui;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ViewerError {
    #[error("Failed to annotate frame: {0}")]
    Annotate(#[from] FrameError),
    #[error("Display error: {0}")]
    Display(#[from] opencv::Error),
}

/// Optional live view of what the loop sees and decides.
pub trait Viewer {
    /// Shows one cycle's result. Returns `true` when the operator asked to quit.
    fn show(
        &mut self,
        frame: &Frame,
        detections: &[Detection],
        command: Command,
    ) -> Result<bool, ViewerError>;

    fn close(&mut self) -> Result<(), ViewerError>;
}

/// Used when running without a display attached.
#[derive(Debug, Default)]
pub struct Headless;

impl Viewer for Headless {
    fn show(&mut self, _: &Frame, _: &[Detection], _: Command) -> Result<bool, ViewerError> {
        Ok(false)
    }

    fn close(&mut self) -> Result<(), ViewerError> {
        Ok(())
    }
}

pub struct PreviewWindow {
    window_name: String,
    quit_key: i32,
    target_class: i32,
    open: bool,
}

impl PreviewWindow {
    pub fn open(config: &DisplayConfig, target_class: i32) -> Result<Self, ViewerError> {
        highgui::named_window(&config.window_name, highgui::WINDOW_AUTOSIZE)?;
        Ok(Self {
            window_name: config.window_name.clone(),
            quit_key: config.quit_key as i32,
            target_class,
            open: true,
        })
    }
}

impl Viewer for PreviewWindow {
    fn show(
        &mut self,
        frame: &Frame,
        detections: &[Detection],
        command: Command,
    ) -> Result<bool, ViewerError> {
        if !self.open {
            return Ok(false);
        }
        let canvas = frame.annotated(detections, self.target_class, command)?;
        highgui::imshow(&self.window_name, &canvas)?;
        let key = highgui::wait_key(1)?;
        Ok(key >= 0 && (key & 0xFF) == self.quit_key)
    }

    fn close(&mut self) -> Result<(), ViewerError> {
        if std::mem::take(&mut self.open) {
            highgui::destroy_all_windows()?;
        }
        Ok(())
    }
}

impl Drop for PreviewWindow {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!("Failed to close preview window: {}", e);
        }
    }
}

/// Picks the preview window or the headless viewer from configuration.
pub enum AnyViewer {
    Headless(Headless),
    Window(PreviewWindow),
}

impl AnyViewer {
    pub fn from_config(config: &DisplayConfig, target_class: i32) -> Result<Self, ViewerError> {
        if config.enabled {
            Ok(Self::Window(PreviewWindow::open(config, target_class)?))
        } else {
            Ok(Self::Headless(Headless))
        }
    }
}

impl Viewer for AnyViewer {
    fn show(
        &mut self,
        frame: &Frame,
        detections: &[Detection],
        command: Command,
    ) -> Result<bool, ViewerError> {
        match self {
            Self::Headless(v) => v.show(frame, detections, command),
            Self::Window(v) => v.show(frame, detections, command),
        }
    }

    fn close(&mut self) -> Result<(), ViewerError> {
        match self {
            Self::Headless(v) => v.close(),
            Self::Window(v) => v.close(),
        }
    }
}
