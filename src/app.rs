use crate::camera::Camera;
use crate::config::Config;
use crate::detector::SsdDetector;
use crate::follower::{Follower, FollowerSettings};
use crate::link::MotorLink;
use crate::viewer::AnyViewer;

use anyhow::Context;
use tokio::{signal, sync::broadcast};

/// Opens every component, runs the follower loop and tears everything down.
///
/// Components are opened link first so that a later startup failure still drops an open
/// link, which stops the motors.
pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let link = match MotorLink::open(&config.serial) {
        Ok(link) => link,
        Err(e) => {
            tracing::error!("Failed to open motor link: {:?}", e);
            return Err(e).context("motor link unavailable");
        }
    };

    let detector = match SsdDetector::load(&config.model) {
        Ok(detector) => detector,
        Err(e) => {
            tracing::error!("Failed to load detection model: {:?}", e);
            return Err(e).context("detection model unavailable");
        }
    };

    let camera = match Camera::open(&config.camera) {
        Ok(camera) => camera,
        Err(e) => {
            tracing::error!("Failed to initialize camera: {:?}", e);
            return Err(e).context("camera unavailable");
        }
    };

    let viewer = AnyViewer::from_config(&config.display, config.model.target_class)
        .context("preview window unavailable")?;

    let mut follower = Follower::new(
        camera,
        detector,
        link,
        viewer,
        FollowerSettings::from_config(&config),
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received, stopping follower.");
        let _ = shutdown_tx.send(());
    });

    let summary = follower.run(shutdown_rx).await?;
    tracing::info!(
        "Stopped after {} cycles ({:?})",
        summary.cycles,
        summary.cause
    );

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
