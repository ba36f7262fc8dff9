use crate::camera::{DeviceError, FrameSource};
use crate::config::Config;
use crate::detector::{DetectorError, PersonDetector};
use crate::link::{LinkError, MotorLink, Transport};
use crate::policy::{decide, Command};
use crate::viewer::{Viewer, ViewerError};
use std::time::Duration;
use thiserror::Error;
use tokio::{sync::broadcast, time::sleep};
use tracing::instrument;

/// Bounds the time spent logging controller output within one cycle.
const MAX_DIAGNOSTIC_LINES_PER_CYCLE: usize = 32;

#[derive(Error, Debug)]
pub enum FollowerError {
    #[error("Camera error: {0}")]
    Camera(#[from] DeviceError),
    #[error("Detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("Motor link error: {0}")]
    Link(#[from] LinkError),
    #[error("Viewer error: {0}")]
    Viewer(#[from] ViewerError),
}

impl FollowerError {
    /// Without a working link there is no way to actuate, so those errors always end the run.
    fn is_recoverable(&self) -> bool {
        !matches!(self, FollowerError::Link(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    Interrupted,
    QuitKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub cause: TerminationCause,
}

#[derive(Debug, Clone)]
pub struct FollowerSettings {
    pub confidence_threshold: f32,
    pub target_class: i32,
    pub cycle_delay: Duration,
    pub max_consecutive_failures: u32,
}

impl FollowerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            confidence_threshold: config.model.confidence_threshold,
            target_class: config.model.target_class,
            cycle_delay: config.control.get_cycle_delay(),
            max_consecutive_failures: config.control.max_consecutive_failures,
        }
    }
}

enum CycleOutcome {
    Continue,
    QuitRequested,
}

/// Capture → detect → decide → send, once per cycle, until told to stop.
pub struct Follower<S, D, T, V>
where
    S: FrameSource,
    D: PersonDetector,
    T: Transport,
    V: Viewer,
{
    source: S,
    detector: D,
    link: MotorLink<T>,
    viewer: V,
    settings: FollowerSettings,
}

impl<S, D, T, V> Follower<S, D, T, V>
where
    S: FrameSource,
    D: PersonDetector,
    T: Transport,
    V: Viewer,
{
    pub fn new(
        source: S,
        detector: D,
        link: MotorLink<T>,
        viewer: V,
        settings: FollowerSettings,
    ) -> Self {
        Self {
            source,
            detector,
            link,
            viewer,
            settings,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn link(&self) -> &MotorLink<T> {
        &self.link
    }

    /// Runs until a shutdown message, the quit key, or a fatal error.
    ///
    /// Whatever ends the loop, motors are stopped and every resource is released before
    /// returning. A closed shutdown channel counts as a shutdown request.
    pub async fn run(
        &mut self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<RunSummary, FollowerError> {
        tracing::info!("Follower loop started");
        let result = self.drive(&mut shutdown_rx).await;

        match &result {
            Ok(summary) => tracing::info!(
                "Follower loop ended after {} cycles: {:?}",
                summary.cycles,
                summary.cause
            ),
            Err(e) => tracing::error!("Follower loop aborted: {}", e),
        }

        self.shutdown();
        result
    }

    async fn drive(
        &mut self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<RunSummary, FollowerError> {
        let mut cycles = 0;
        let mut consecutive_failures = 0;

        loop {
            cycles += 1;
            match self.cycle() {
                Ok(CycleOutcome::Continue) => consecutive_failures = 0,
                Ok(CycleOutcome::QuitRequested) => {
                    tracing::info!("Quit key pressed");
                    return Ok(RunSummary {
                        cycles,
                        cause: TerminationCause::QuitKey,
                    });
                }
                Err(err)
                    if err.is_recoverable()
                        && consecutive_failures + 1 < self.settings.max_consecutive_failures =>
                {
                    consecutive_failures += 1;
                    tracing::warn!(
                        "Cycle {} failed ({}/{} consecutive failures): {}",
                        cycles,
                        consecutive_failures,
                        self.settings.max_consecutive_failures,
                        err
                    );
                    self.link.send(Command::Stop)?;
                }
                Err(err) => return Err(err),
            }

            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    tracing::info!("Follower received shutdown signal");
                    return Ok(RunSummary {
                        cycles,
                        cause: TerminationCause::Interrupted,
                    });
                }
                _ = sleep(self.settings.cycle_delay) => {}
            }
        }
    }

    /// One blocking pass; capture and inference run to completion.
    #[instrument(skip(self))]
    fn cycle(&mut self) -> Result<CycleOutcome, FollowerError> {
        let frame = self.source.capture()?;
        let detections = self.detector.detect(&frame)?;
        let command = decide(
            &detections,
            frame.width(),
            self.settings.confidence_threshold,
            self.settings.target_class,
        );
        self.link.send(command)?;
        tracing::debug!(
            "{} detections in {}x{} frame -> {}",
            detections.len(),
            frame.width(),
            frame.height(),
            command
        );

        for _ in 0..MAX_DIAGNOSTIC_LINES_PER_CYCLE {
            let Some(line) = self.link.poll_diagnostics() else {
                break;
            };
            tracing::info!(target: "motor_controller", "{}", line);
        }

        if self.viewer.show(&frame, &detections, command)? {
            return Ok(CycleOutcome::QuitRequested);
        }
        Ok(CycleOutcome::Continue)
    }

    /// Best-effort teardown; every step runs regardless of earlier failures.
    fn shutdown(&mut self) {
        if let Err(e) = self.link.send(Command::Stop) {
            tracing::warn!("Could not send stop command: {}", e);
        }
        if let Err(e) = self.source.close() {
            tracing::error!("Failed to close camera: {}", e);
        }
        if let Err(e) = self.link.close() {
            tracing::error!("Failed to close motor link: {}", e);
        }
        if let Err(e) = self.viewer.close() {
            tracing::error!("Failed to close viewer: {}", e);
        }
        tracing::info!("Program ended, motors stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BoundingBox, Detection};
    use crate::frame::{blank_mat, Frame};
    use crate::link::testing::MockTransport;
    use crate::viewer::Headless;
    use opencv::core;
    use std::collections::VecDeque;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    const PERSON: i32 = 15;

    struct MockCamera {
        captures: u64,
        open: Arc<AtomicBool>,
        shutdown_after: Option<(u64, broadcast::Sender<()>)>,
    }

    impl MockCamera {
        fn new() -> Self {
            Self {
                captures: 0,
                open: Arc::new(AtomicBool::new(true)),
                shutdown_after: None,
            }
        }

        fn shutdown_after(mut self, captures: u64, tx: broadcast::Sender<()>) -> Self {
            self.shutdown_after = Some((captures, tx));
            self
        }
    }

    impl FrameSource for MockCamera {
        fn capture(&mut self) -> Result<Frame, DeviceError> {
            if !self.is_open() {
                return Err(DeviceError::Closed);
            }
            self.captures += 1;
            if let Some((after, tx)) = &self.shutdown_after {
                if *after == self.captures {
                    tx.send(()).unwrap();
                }
            }
            Ok(Frame::from_mat(blank_mat(640, 480, core::CV_8UC3))?)
        }

        fn close(&mut self) -> Result<(), DeviceError> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    /// Replays scripted results, then keeps returning `fallback`.
    struct MockDetector {
        script: VecDeque<Option<Vec<Detection>>>,
        fallback: Vec<Detection>,
    }

    impl MockDetector {
        fn always(detections: Vec<Detection>) -> Self {
            Self {
                script: VecDeque::new(),
                fallback: detections,
            }
        }

        fn scripted(script: Vec<Option<Vec<Detection>>>, fallback: Vec<Detection>) -> Self {
            Self {
                script: script.into(),
                fallback,
            }
        }
    }

    impl PersonDetector for MockDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
            match self.script.pop_front() {
                Some(Some(detections)) => Ok(detections),
                Some(None) => Err(DetectorError::MalformedOutput(0)),
                None => Ok(self.fallback.clone()),
            }
        }
    }

    struct QuitAfter {
        remaining: u32,
        closed: bool,
    }

    impl Viewer for QuitAfter {
        fn show(&mut self, _: &Frame, _: &[Detection], _: Command) -> Result<bool, ViewerError> {
            self.remaining -= 1;
            Ok(self.remaining == 0)
        }

        fn close(&mut self) -> Result<(), ViewerError> {
            self.closed = true;
            Ok(())
        }
    }

    fn person_at(center_x: i32) -> Detection {
        Detection::new(
            PERSON,
            0.5,
            BoundingBox::new(center_x - 40, 50, center_x + 40, 400),
        )
    }

    fn settings(max_consecutive_failures: u32) -> FollowerSettings {
        FollowerSettings {
            confidence_threshold: 0.30,
            target_class: PERSON,
            cycle_delay: Duration::from_millis(1),
            max_consecutive_failures,
        }
    }

    fn link() -> (MotorLink<MockTransport>, MockTransport) {
        let transport = MockTransport::default();
        let link = MotorLink::from_transport(transport.clone(), "mock", Duration::ZERO);
        (link, transport)
    }

    #[tokio::test]
    async fn test_shutdown_mid_loop_stops_and_closes_everything() {
        let (tx, rx) = broadcast::channel(1);
        let (link, transport) = link();
        let camera = MockCamera::new().shutdown_after(3, tx.clone());
        let detector = MockDetector::always(vec![person_at(100)]);
        let mut follower = Follower::new(camera, detector, link, Headless, settings(1));

        let summary = follower.run(rx).await.unwrap();

        assert_eq!(
            summary,
            RunSummary {
                cycles: 3,
                cause: TerminationCause::Interrupted
            }
        );
        assert_eq!(
            transport.sent_commands(),
            vec![
                Command::Left,
                Command::Left,
                Command::Left,
                Command::Stop,
                Command::Stop
            ]
        );
        assert!(!follower.source().is_open());
        assert!(!follower.link().is_open());
    }

    #[tokio::test]
    async fn test_shutdown_after_failed_detection_still_stops() {
        let (tx, rx) = broadcast::channel(1);
        let (link, transport) = link();
        let camera = MockCamera::new().shutdown_after(2, tx.clone());
        let detector = MockDetector::scripted(vec![None], vec![person_at(320)]);
        let mut follower = Follower::new(camera, detector, link, Headless, settings(2));

        let summary = follower.run(rx).await.unwrap();

        assert_eq!(summary.cause, TerminationCause::Interrupted);
        assert_eq!(
            transport.sent_commands(),
            vec![
                Command::Stop,
                Command::Forward,
                Command::Stop,
                Command::Stop
            ]
        );
        assert!(!follower.source().is_open());
        assert!(!follower.link().is_open());
    }

    #[tokio::test]
    async fn test_detection_failure_is_fatal_by_default() {
        let (_tx, rx) = broadcast::channel(1);
        let (link, transport) = link();
        let detector = MockDetector::scripted(vec![Some(vec![person_at(600)]), None], vec![]);
        let mut follower = Follower::new(MockCamera::new(), detector, link, Headless, settings(1));

        let result = follower.run(rx).await;

        assert!(matches!(result, Err(FollowerError::Detector(_))));
        assert_eq!(
            transport.sent_commands(),
            vec![Command::Right, Command::Stop, Command::Stop]
        );
        assert!(!follower.source().is_open());
        assert!(!follower.link().is_open());
    }

    #[tokio::test]
    async fn test_consecutive_failures_exhaust_budget() {
        let (_tx, rx) = broadcast::channel(1);
        let (link, _transport) = link();
        let detector = MockDetector::scripted(vec![None, None, None], vec![]);
        let mut follower = Follower::new(MockCamera::new(), detector, link, Headless, settings(3));

        let result = follower.run(rx).await;

        assert!(matches!(result, Err(FollowerError::Detector(_))));
        assert!(!follower.link().is_open());
    }

    #[tokio::test]
    async fn test_link_failure_is_always_fatal() {
        let (_tx, rx) = broadcast::channel(1);
        let (link, transport) = link();
        transport.fail_writes();
        let detector = MockDetector::always(vec![person_at(320)]);
        let mut follower = Follower::new(MockCamera::new(), detector, link, Headless, settings(5));

        let result = follower.run(rx).await;

        assert!(matches!(
            result,
            Err(FollowerError::Link(LinkError::Write(Command::Forward, _)))
        ));
        assert!(!follower.source().is_open());
        assert!(!follower.link().is_open());
    }

    #[tokio::test]
    async fn test_quit_key_ends_loop() {
        let (_tx, rx) = broadcast::channel(1);
        let (link, transport) = link();
        let viewer = QuitAfter {
            remaining: 2,
            closed: false,
        };
        let mut follower = Follower::new(
            MockCamera::new(),
            MockDetector::always(vec![]),
            link,
            viewer,
            settings(1),
        );

        let summary = follower.run(rx).await.unwrap();

        assert_eq!(
            summary,
            RunSummary {
                cycles: 2,
                cause: TerminationCause::QuitKey
            }
        );
        assert!(follower.viewer.closed);
        assert_eq!(transport.sent_commands(), vec![Command::Stop; 4]);
    }

    #[tokio::test]
    async fn test_dropped_shutdown_sender_terminates() {
        let (tx, rx) = broadcast::channel::<()>(1);
        drop(tx);
        let (link, _transport) = link();
        let mut follower = Follower::new(
            MockCamera::new(),
            MockDetector::always(vec![]),
            link,
            Headless,
            settings(1),
        );

        let summary = follower.run(rx).await.unwrap();

        assert_eq!(summary.cycles, 1);
        assert_eq!(summary.cause, TerminationCause::Interrupted);
    }
}
