//! navit-daemon: fuses IMU + GPS into a gpsd-compatible NMEA heading feed.
//!
//! Wiring only lives here: build the configured source adapters, wrap the
//! IMU side in the calibrated-source adapter, hand everything to the
//! fusion engine, and spawn the TCP servers. See the module-level docs on
//! `fusion`, `calibration` and `broadcast` for the actual behavior.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod ahrs;
mod broadcast;
mod calibration;
mod config;
mod fusion;
mod nmea;
mod sensors;
mod types;

use ahrs::AhrsState;
use broadcast::NmeaBroadcaster;
use calibration::{CalibratedSource, CalibrationManager};
use config::{Config, Source};
use fusion::FusionEngine;
use sensors::{
    FallbackGpsSource, FallbackImuSource, GpsSource, ImuSource, LocalGpsReader, LocalImuReader,
    RemoteIngestServer,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "navit_daemon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::parse();
    info!(source = ?config.source, imu_rate_hz = config.imu_rate_hz, output_rate_hz = config.output_rate_hz, "starting navit-daemon");

    let sample_period_s = 1.0 / config.imu_rate_hz.max(1) as f64;
    let ahrs = AhrsState::new(sample_period_s, config.fusion_gain)
        .context("AHRS backend unavailable at startup")?;

    let calibration_file = config.calibration_file.as_ref().map(PathBuf::from);
    let calibration_manager = CalibrationManager::new(calibration_file, config.imu_rate_hz);

    let (imu_source, gps_source, remote_server) = build_sources(&config);
    let calibrated_imu: Box<dyn ImuSource> =
        Box::new(CalibratedSource::new(imu_source, calibration_manager.clone()));

    let engine = FusionEngine::new(ahrs);
    let broadcaster = NmeaBroadcaster::new(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let imu_handle = engine.spawn_imu_loop(calibrated_imu, config.imu_rate_hz, shutdown_rx.clone());
    let gps_handle = engine.spawn_gps_loop(gps_source, shutdown_rx.clone());
    let emit_handle =
        engine.spawn_emit_loop(broadcaster.clone(), config.output_rate_hz, shutdown_rx.clone());

    let broadcast_handle = {
        let broadcaster = broadcaster.clone();
        let bind = config.nmea_bind.clone();
        let port = config.nmea_port;
        tokio::spawn(async move {
            if let Err(err) = broadcaster.serve(&bind, port).await {
                error!(%err, "NMEA broadcast server failed");
            }
        })
    };

    let remote_handle = remote_server.map(|remote| {
        let bind = config.remote_bind.clone();
        let port = config.remote_port;
        tokio::spawn(async move {
            if let Err(err) = remote.serve(&bind, port).await {
                error!(%err, "remote ingest server failed");
            }
        })
    });

    let calibration_handle = (config.calibration_port != 0).then(|| {
        let manager = calibration_manager.clone();
        let bind = config.calibration_bind.clone();
        let port = config.calibration_port;
        tokio::spawn(async move {
            if let Err(err) = calibration::server::serve(&bind, port, manager).await {
                error!(%err, "calibration control server failed");
            }
        })
    });

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received, stopping loops");

    let _ = shutdown_tx.send(true);
    calibration_manager.abandon_run();

    let _ = tokio::join!(imu_handle, gps_handle, emit_handle);
    broadcast_handle.abort();
    if let Some(handle) = remote_handle {
        handle.abort();
    }
    if let Some(handle) = calibration_handle {
        handle.abort();
    }

    info!("shutdown complete");
    Ok(())
}

#[allow(clippy::type_complexity)]
fn build_sources(
    config: &Config,
) -> (Box<dyn ImuSource>, Box<dyn GpsSource>, Option<Arc<RemoteIngestServer>>) {
    match config.source {
        Source::Linux => {
            let imu: Box<dyn ImuSource> = Box::new(LocalImuReader::from_config(config));
            let gps: Box<dyn GpsSource> =
                Box::new(LocalGpsReader::new(config.gpsd_host.clone(), config.gpsd_port));
            (imu, gps, None)
        }
        Source::Remote => {
            let remote = Arc::new(RemoteIngestServer::new());
            let imu: Box<dyn ImuSource> = Box::new(remote.imu_source());
            let gps: Box<dyn GpsSource> = Box::new(remote.gps_source());
            (imu, gps, Some(remote))
        }
        Source::Auto => {
            let remote = Arc::new(RemoteIngestServer::new());
            let local_imu: Box<dyn ImuSource> = Box::new(LocalImuReader::from_config(config));
            let local_gps: Box<dyn GpsSource> =
                Box::new(LocalGpsReader::new(config.gpsd_host.clone(), config.gpsd_port));
            let imu: Box<dyn ImuSource> =
                Box::new(FallbackImuSource::new(local_imu, Box::new(remote.imu_source())));
            let gps: Box<dyn GpsSource> =
                Box::new(FallbackGpsSource::new(local_gps, Box::new(remote.gps_source())));
            (imu, gps, Some(remote))
        }
    }
}
