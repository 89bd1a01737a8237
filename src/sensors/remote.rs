//! Remote IMU+GPS ingest server
//!
//! Accepts TCP connections on a bound address (default port 2949) and
//! folds newline-delimited JSON objects into the latest-known IMU sample
//! and GPS fix. Every coercion failure is contained to the field or line
//! that caused it — a malformed line never takes the listener down, and
//! never disturbs state from a previous, well-formed line.

use crate::sensors::{GpsSource, ImuSource};
use crate::types::{coerce_f64, vec3_from_json, GpsFix, ImuSample, Vec3};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[derive(Default)]
struct RemoteState {
    imu: Option<ImuSample>,
    imu_fresh: bool,
    last_magnetometer: Option<Vec3>,
    gps: Option<GpsFix>,
    gps_fresh: bool,
}

/// Owns the shared latest-IMU/GPS state; hand out [`RemoteImuSource`] and
/// [`RemoteGpsSource`] views to wire into the fusion engine, then call
/// [`serve`](Self::serve) to start accepting connections.
pub struct RemoteIngestServer {
    state: Arc<Mutex<RemoteState>>,
}

impl Default for RemoteIngestServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteIngestServer {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(RemoteState::default())) }
    }

    pub fn imu_source(&self) -> RemoteImuSource {
        RemoteImuSource(self.state.clone())
    }

    pub fn gps_source(&self) -> RemoteGpsSource {
        RemoteGpsSource(self.state.clone())
    }

    /// Runs the accept loop until the listener itself errors (a distinct,
    /// fatal condition from any per-connection error). Each connection is
    /// handled on its own task so one slow or stuck client never blocks
    /// another.
    pub async fn serve(&self, bind: &str, port: u16) -> Result<()> {
        let listener = TcpListener::bind((bind, port))
            .await
            .with_context(|| format!("binding remote ingest listener on {bind}:{port}"))?;
        tracing::info!(bind, port, "remote ingest server listening");

        loop {
            let (socket, peer) = listener.accept().await?;
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(socket, state).await {
                    tracing::debug!(%peer, %err, "remote ingest connection closed");
                }
            });
        }
    }
}

async fn handle_connection(socket: TcpStream, state: Arc<Mutex<RemoteState>>) -> Result<()> {
    let mut lines = BufReader::new(socket).lines();
    while let Some(line) = lines.next_line().await? {
        apply_line(&line, &state);
    }
    Ok(())
}

fn apply_line(line: &str, state: &Mutex<RemoteState>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return;
    };
    let Some(obj) = value.as_object() else {
        return;
    };

    if let (Some(accel_v), Some(gyro_v)) = (obj.get("accel"), obj.get("gyro")) {
        if let (Some(accel), Some(gyro)) = (vec3_from_json(accel_v), vec3_from_json(gyro_v)) {
            let mut guard = state.lock();
            if let Some(m) = obj.get("magnetometer").and_then(vec3_from_json) {
                guard.last_magnetometer = Some(m);
            }
            let magnetometer = guard.last_magnetometer;
            guard.imu = Some(ImuSample { accel, gyro, magnetometer });
            guard.imu_fresh = true;
        }
        // Any element failing numeric coercion discards the whole IMU
        // update for this line; the previous state is left untouched.
    }

    if let (Some(lat_v), Some(lon_v)) = (obj.get("lat"), obj.get("lon")) {
        if let (Some(lat), Some(lon)) = (coerce_f64(lat_v), coerce_f64(lon_v)) {
            let alt = obj.get("alt").and_then(coerce_f64).unwrap_or(0.0);
            let speed_ms = obj.get("speed_ms").and_then(coerce_f64).unwrap_or(0.0);
            let track = obj.get("track").and_then(coerce_f64).unwrap_or(0.0);
            let time_iso = obj.get("time_iso").and_then(|v| v.as_str()).map(String::from);
            let fix = GpsFix::new(lat, lon, alt, speed_ms, track, time_iso, true, 1, 0, 0.0);
            let mut guard = state.lock();
            guard.gps = Some(fix);
            guard.gps_fresh = true;
        }
    }
}

pub struct RemoteImuSource(Arc<Mutex<RemoteState>>);

impl ImuSource for RemoteImuSource {
    fn read_imu(&mut self) -> Option<ImuSample> {
        let mut guard = self.0.lock();
        if guard.imu_fresh {
            guard.imu_fresh = false;
            guard.imu
        } else {
            None
        }
    }
}

pub struct RemoteGpsSource(Arc<Mutex<RemoteState>>);

impl GpsSource for RemoteGpsSource {
    fn read_fix(&mut self) -> Option<GpsFix> {
        let mut guard = self.0.lock();
        if guard.gps_fresh {
            guard.gps_fresh = false;
            guard.gps.clone()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_state() -> Arc<Mutex<RemoteState>> {
        Arc::new(Mutex::new(RemoteState::default()))
    }

    #[test]
    fn malformed_lines_never_change_state() {
        let state = fresh_state();
        for line in [
            "",
            "not json",
            "0",
            "[]",
            "{\"accel\":[1,2]}",
            "{\"accel\":[1,2,\"x\"],\"gyro\":[0,0,0]}",
        ] {
            apply_line(line, &state);
        }
        let guard = state.lock();
        assert!(guard.imu.is_none());
        assert!(!guard.imu_fresh);
        assert!(guard.gps.is_none());
        assert!(!guard.gps_fresh);
    }

    #[test]
    fn well_formed_imu_line_is_accepted() {
        let state = fresh_state();
        apply_line(r#"{"accel":[1,2,9.8],"gyro":[0.1,0.2,0.3]}"#, &state);
        let guard = state.lock();
        assert!(guard.imu_fresh);
        assert_eq!(guard.imu.unwrap().accel, Vec3::new(1.0, 2.0, 9.8));
        assert!(guard.imu.unwrap().magnetometer.is_none());
    }

    #[test]
    fn magnetometer_persists_across_imu_only_updates() {
        let state = fresh_state();
        apply_line(
            r#"{"accel":[0,0,9.8],"gyro":[0,0,0],"magnetometer":[10,20,30]}"#,
            &state,
        );
        apply_line(r#"{"accel":[0,0,9.8],"gyro":[1,1,1]}"#, &state);
        let guard = state.lock();
        assert_eq!(guard.imu.unwrap().magnetometer, Some(Vec3::new(10.0, 20.0, 30.0)));
    }

    #[test]
    fn numeric_strings_coerce_for_gps_fields() {
        let state = fresh_state();
        apply_line(r#"{"lat":"12.5","lon":"-45.25","speed_ms":"3.0"}"#, &state);
        let guard = state.lock();
        let fix = guard.gps.clone().unwrap();
        assert_eq!(fix.lat, 12.5);
        assert_eq!(fix.lon, -45.25);
        assert_eq!(fix.speed_ms, 3.0);
    }

    #[test]
    fn read_imu_consumes_freshness_once() {
        let state = fresh_state();
        apply_line(r#"{"accel":[0,0,9.8],"gyro":[0,0,0]}"#, &state);
        let mut source = RemoteImuSource(state);
        assert!(source.read_imu().is_some());
        assert!(source.read_imu().is_none());
    }
}
