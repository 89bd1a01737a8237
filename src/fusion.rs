//! Fusion engine: the three cooperating loops (IMU, GPS, emit) and the
//! heading-selection policy that picks between AHRS-derived yaw and GPS
//! course over ground.
//!
//! This is the one place that owns `AhrsState` and `last_fix` — both are
//! shared only as `Arc<parking_lot::Mutex<_>>` snapshots, one writer loop
//! each, so the ordering guarantees in the data model fall out of who is
//! allowed to lock for writing.

use crate::ahrs::AhrsState;
use crate::broadcast::NmeaBroadcaster;
use crate::nmea::{build_gga, build_rmc};
use crate::sensors::{GpsSource, ImuSource};
use crate::types::GpsFix;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// GPS course over ground is only trusted above this speed; below it, a
/// stationary or slow-moving receiver's track is too noisy to steer by.
const MIN_SPEED_FOR_GPS_HEADING_MS: f64 = 0.5;
/// The GPS loop itself never blocks (sources that need blocking I/O do it
/// on their own background thread), so it can poll faster than any real
/// GPS receiver updates without wasting much.
const GPS_POLL_PERIOD: Duration = Duration::from_millis(200);

pub struct FusionEngine {
    ahrs: Arc<Mutex<AhrsState>>,
    last_fix: Arc<Mutex<Option<GpsFix>>>,
}

impl FusionEngine {
    pub fn new(ahrs: AhrsState) -> Self {
        Self { ahrs: Arc::new(Mutex::new(ahrs)), last_fix: Arc::new(Mutex::new(None)) }
    }

    pub fn spawn_imu_loop(
        &self,
        source: Box<dyn ImuSource>,
        imu_rate_hz: u32,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let ahrs = self.ahrs.clone();
        tokio::spawn(run_imu_loop(source, ahrs, imu_rate_hz, shutdown))
    }

    pub fn spawn_gps_loop(
        &self,
        source: Box<dyn GpsSource>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let last_fix = self.last_fix.clone();
        tokio::spawn(run_gps_loop(source, last_fix, shutdown))
    }

    pub fn spawn_emit_loop(
        &self,
        broadcaster: Arc<NmeaBroadcaster>,
        output_rate_hz: u32,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let ahrs = self.ahrs.clone();
        let last_fix = self.last_fix.clone();
        tokio::spawn(run_emit_loop(ahrs, last_fix, broadcaster, output_rate_hz, shutdown))
    }
}

async fn run_imu_loop(
    mut source: Box<dyn ImuSource>,
    ahrs: Arc<Mutex<AhrsState>>,
    imu_rate_hz: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let hz = imu_rate_hz.max(1);
    let dt = 1.0 / hz as f64;
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(dt));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(sample) = source.read_imu() {
                    let mut guard = ahrs.lock();
                    guard.update(sample.gyro, sample.accel, sample.magnetometer, dt);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_gps_loop(
    mut source: Box<dyn GpsSource>,
    last_fix: Arc<Mutex<Option<GpsFix>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(GPS_POLL_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(fix) = source.read_fix() {
                    *last_fix.lock() = Some(fix);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_emit_loop(
    ahrs: Arc<Mutex<AhrsState>>,
    last_fix: Arc<Mutex<Option<GpsFix>>>,
    broadcaster: Arc<NmeaBroadcaster>,
    output_rate_hz: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = Duration::from_secs_f64(1.0 / output_rate_hz.max(1) as f64);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => emit_tick(&ahrs, &last_fix, &broadcaster),
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn emit_tick(ahrs: &Mutex<AhrsState>, last_fix: &Mutex<Option<GpsFix>>, broadcaster: &NmeaBroadcaster) {
    let fix = last_fix.lock().clone();
    let Some(fix) = fix else { return };
    if !fix.valid || !fix.lat.is_finite() || !fix.lon.is_finite() {
        return;
    }

    let heading = select_heading(&fix, &ahrs.lock());
    broadcaster.broadcast(build_gga(&fix));
    broadcaster.broadcast(build_rmc(&fix, heading));
}

/// Favor GPS course over ground while moving fast enough for it to be
/// reliable; otherwise prefer AHRS yaw once it has a first fix on
/// orientation, falling back to the (possibly stale or zero) GPS track.
fn select_heading(fix: &GpsFix, ahrs: &AhrsState) -> f64 {
    if fix.speed_ms > MIN_SPEED_FOR_GPS_HEADING_MS {
        fix.track
    } else if ahrs.initialized() {
        ahrs.yaw_deg()
    } else {
        fix.track
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix_with(speed_ms: f64, track: f64) -> GpsFix {
        GpsFix::new(0.0, 0.0, 0.0, speed_ms, track, None, true, 1, 5, 1.0)
    }

    #[test]
    fn slow_speed_prefers_initialized_ahrs_yaw() {
        let mut ahrs = AhrsState::new(0.01, 0.5).unwrap();
        ahrs.update(crate::types::Vec3::new(0.0, 0.0, 0.01), crate::types::Vec3::new(0.0, 0.0, 9.81), None, 0.01);
        let fix = fix_with(0.1, 45.0);
        let heading = select_heading(&fix, &ahrs);
        assert!(ahrs.initialized());
        assert_eq!(heading, ahrs.yaw_deg());
    }

    #[test]
    fn fast_speed_prefers_gps_track_even_when_ahrs_initialized() {
        let mut ahrs = AhrsState::new(0.01, 0.5).unwrap();
        ahrs.update(crate::types::Vec3::new(0.0, 0.0, 0.01), crate::types::Vec3::new(0.0, 0.0, 9.81), None, 0.01);
        let fix = fix_with(2.0, 45.0);
        assert_eq!(select_heading(&fix, &ahrs), 45.0);
    }

    #[test]
    fn slow_speed_falls_back_to_gps_track_before_ahrs_initializes() {
        let ahrs = AhrsState::new(0.01, 0.5).unwrap();
        let fix = fix_with(0.0, 45.0);
        assert!(!ahrs.initialized());
        assert_eq!(select_heading(&fix, &ahrs), 45.0);
    }
}
